//! Client for the external orbit-determination service.
//!
//! The service takes `{observations: [{ra, dec, time}]}` and answers with the
//! classical orbital elements. It reports its own failures as HTTP 200 with an
//! `{"error": ...}` body, which is treated the same as a non-2xx answer.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::OrbitConfig;
use crate::error::AppError;
use crate::storage::OrbitUpdate;

/// The fit needs at least this many observations.
pub const MIN_OBSERVATIONS: usize = 5;

#[derive(Debug, Error)]
pub enum OrbitError {
    #[error("orbit service request failed: {0}")]
    Request(String),
    #[error("orbit service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("orbit service error: {0}")]
    Service(String),
    #[error("unreadable orbit service response: {0}")]
    Decode(String),
}

impl From<OrbitError> for AppError {
    fn from(e: OrbitError) -> Self { AppError::upstream("orbit_service".to_string(), e.to_string()) }
}

impl From<reqwest::Error> for OrbitError {
    fn from(e: reqwest::Error) -> Self { OrbitError::Request(e.to_string()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationReq {
    /// Right ascension (deg).
    pub ra: f64,
    /// Declination (deg).
    pub dec: f64,
    pub time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrbitElements {
    pub a: f64,
    pub eccentricity: f64,
    pub inclination: f64,
    pub longitude_of_ascending_node: f64,
    pub argument_of_perihelion: f64,
    pub time_of_perihelion: String,
}

impl OrbitElements {
    /// `None` when the perihelion time cannot be parsed.
    pub fn to_update(&self) -> Option<OrbitUpdate> {
        Some(OrbitUpdate {
            a: self.a,
            e: self.eccentricity,
            i: self.inclination,
            node: self.longitude_of_ascending_node,
            arg_peri: self.argument_of_perihelion,
            t: parse_time(&self.time_of_perihelion)?,
        })
    }
}

/// Accepts RFC 3339 and the naive ISO forms (`T` or space separated), read as UTC.
pub fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct OrbitClient {
    http: reqwest::Client,
    url: String,
}

impl OrbitClient {
    pub fn new(cfg: &OrbitConfig) -> Result<Self, OrbitError> {
        let http = reqwest::Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { http, url: cfg.url.clone() })
    }

    pub fn url(&self) -> &str { &self.url }

    pub async fn calculate(&self, observations: &[ObservationReq]) -> Result<OrbitElements, OrbitError> {
        let payload = serde_json::json!({ "observations": observations });
        debug!(target: "orbit", url = %self.url, count = observations.len(), "requesting orbit determination");
        let resp = self.http.post(&self.url).json(&payload).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            warn!(target: "orbit", status = status.as_u16(), "orbit service returned an error status");
            return Err(OrbitError::Status { status: status.as_u16(), body });
        }
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|e| OrbitError::Decode(e.to_string()))?;
        if let Some(msg) = value.get("error") {
            let msg = msg.as_str().map(str::to_string).unwrap_or_else(|| msg.to_string());
            return Err(OrbitError::Service(msg));
        }
        serde_json::from_value(value).map_err(|e| OrbitError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_service_and_client_time_formats() {
        let t = parse_time("2025-03-14 06:30:00.000").unwrap();
        assert_eq!((t.year(), t.month(), t.day(), t.hour(), t.minute()), (2025, 3, 14, 6, 30));
        assert!(parse_time("2025-03-14T06:30:00Z").is_some());
        assert!(parse_time("2025-03-14T06:30:00").is_some());
        assert!(parse_time("2025-03-14T06:30").is_some());
        assert!(parse_time("yesterday").is_none());
    }

    #[test]
    fn elements_map_onto_comet_columns() {
        let el = OrbitElements {
            a: 17.8,
            eccentricity: 0.967,
            inclination: 162.3,
            longitude_of_ascending_node: 58.4,
            argument_of_perihelion: 111.3,
            time_of_perihelion: "1986-02-09 00:00:00.000".into(),
        };
        let up = el.to_update().unwrap();
        assert_eq!(up.e, 0.967);
        assert_eq!(up.node, 58.4);
        assert_eq!(up.t.year(), 1986);
        let bad = OrbitElements { time_of_perihelion: "soon".into(), ..el };
        assert!(bad.to_update().is_none());
    }
}
