//! HTTP API Module
//!
//! Provides a read-only status API on the directory.

mod http;

pub use http::{HealthResponse, StatusResponse, StatusServer};
