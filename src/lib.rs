pub mod config;
pub mod error;
pub mod identity;
pub mod orbit;
pub mod security;
pub mod server;
pub mod storage;
