//! Comet photo object store.
//!
//! Objects live in a single bucket and are addressed by key. `FsPhotoStore`
//! keeps the bucket as a directory and hands out public URLs of the form
//! `<public_base>/<bucket>/<key>`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Error)]
pub enum PhotoError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PhotoError> for AppError {
    fn from(e: PhotoError) -> Self {
        match e {
            PhotoError::InvalidKey(k) => AppError::user("invalid_photo".to_string(), format!("invalid object key: {}", k)),
            PhotoError::Io(err) => AppError::io("object_store".to_string(), err.to_string()),
        }
    }
}

#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Store `bytes` under `key` and return the object's public URL.
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<String, PhotoError>;
    /// Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), PhotoError>;
    /// Reverse of the URL returned by `put`.
    fn key_from_url(&self, url: &str) -> Option<String> {
        url.rsplit('/').next().filter(|k| !k.is_empty()).map(|k| k.to_string())
    }
}

/// Lowercase ASCII letters and digits of `s`; everything else is dropped.
fn to_latin(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Object key for an uploaded file name: `comet-<latin base><ext>`.
pub fn photo_object_key(filename: &str) -> String {
    let name = Path::new(filename).file_name().and_then(|n| n.to_str()).unwrap_or("");
    let (base, ext) = match name.rfind('.') {
        Some(idx) if idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };
    format!("comet-{}{}", to_latin(base), ext)
}

fn check_key(key: &str) -> Result<(), PhotoError> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.starts_with('.') {
        return Err(PhotoError::InvalidKey(key.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct FsPhotoStore {
    bucket_dir: PathBuf,
    bucket: String,
    public_base: String,
}

impl FsPhotoStore {
    /// Create the bucket directory if it does not exist yet.
    pub async fn open(root: impl AsRef<Path>, bucket: &str, public_base: &str) -> Result<Self, PhotoError> {
        let bucket_dir = root.as_ref().join(bucket);
        tokio::fs::create_dir_all(&bucket_dir).await?;
        Ok(Self { bucket_dir, bucket: bucket.to_string(), public_base: public_base.trim_end_matches('/').to_string() })
    }

    pub fn object_path(&self, key: &str) -> PathBuf { self.bucket_dir.join(key) }

    /// Staging file for `key`. Keys that differ only in extension get distinct files.
    fn upload_path(&self, key: &str) -> PathBuf { self.bucket_dir.join(format!("{}.upload.tmp", key)) }
}

#[async_trait]
impl PhotoStore for FsPhotoStore {
    async fn put(&self, key: &str, content_type: &str, bytes: &[u8]) -> Result<String, PhotoError> {
        check_key(key)?;
        let path = self.object_path(key);
        let tmp = self.upload_path(key);
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(target: "photos", key, content_type, size = bytes.len(), "object stored");
        Ok(format!("{}/{}/{}", self.public_base, self.bucket, key))
    }

    async fn delete(&self, key: &str) -> Result<(), PhotoError> {
        check_key(key)?;
        match tokio::fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_are_latinized() {
        assert_eq!(photo_object_key("Halley 1986.JPG"), "comet-halley1986.JPG");
        assert_eq!(photo_object_key("Комета-C2023.png"), "comet-c2023.png");
        assert_eq!(photo_object_key("noext"), "comet-noext");
        assert_eq!(photo_object_key("../../etc/passwd"), "comet-passwd");
        assert_eq!(photo_object_key(".hidden"), "comet-hidden");
    }

    #[tokio::test]
    async fn put_and_delete_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsPhotoStore::open(tmp.path(), "comets", "http://minio:9000/").await.unwrap();
        let url = store.put("comet-x.png", "image/png", b"\x89PNG").await.unwrap();
        assert_eq!(url, "http://minio:9000/comets/comet-x.png");
        assert!(store.object_path("comet-x.png").exists());
        assert_eq!(store.key_from_url(&url).as_deref(), Some("comet-x.png"));
        store.delete("comet-x.png").await.unwrap();
        assert!(!store.object_path("comet-x.png").exists());
        // second delete is a no-op
        store.delete("comet-x.png").await.unwrap();
    }

    #[tokio::test]
    async fn keys_differing_in_extension_do_not_share_staging_files() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsPhotoStore::open(tmp.path(), "comets", "http://minio:9000").await.unwrap();
        assert_ne!(store.upload_path("comet-x.png"), store.upload_path("comet-x.jpg"));

        let png = vec![b'p'; 256 * 1024];
        let jpg = vec![b'j'; 256 * 1024];
        let (a, b) = tokio::join!(
            store.put("comet-x.png", "image/png", &png),
            store.put("comet-x.jpg", "image/jpeg", &jpg),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(std::fs::read(store.object_path("comet-x.png")).unwrap(), png);
        assert_eq!(std::fs::read(store.object_path("comet-x.jpg")).unwrap(), jpg);
    }

    #[tokio::test]
    async fn path_like_keys_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsPhotoStore::open(tmp.path(), "comets", "http://minio:9000").await.unwrap();
        assert!(matches!(store.put("../x", "image/png", b"x").await, Err(PhotoError::InvalidKey(_))));
    }
}
