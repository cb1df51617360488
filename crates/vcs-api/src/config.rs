//! Gateway and client configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::MAX_PAYLOAD_BYTES;

/// Default upload limit: 4 GiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Largest accepted frame payload
    pub max_upload_bytes: u64,
    /// Interval between expiry sweeps
    pub sweep_interval: Duration,
    /// Prometheus listener; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Directory clients may name inputs from via `parameters.source`;
    /// server-side inputs are refused when unset
    pub media_root: Option<PathBuf>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            sweep_interval: Duration::from_secs(30),
            metrics_addr: None,
            media_root: None,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(9000),
            max_upload_bytes: std::env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES)
                .min(MAX_PAYLOAD_BYTES),
            sweep_interval: Duration::from_secs(
                std::env::var("SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(30),
            ),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
            media_root: std::env::var("MEDIA_ROOT")
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
        }
    }

    /// Address the gateway listens on.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Client polling configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Delay between status requests
    pub check_interval: Duration,
    /// Give up waiting after this long
    pub max_wait: Duration,
    /// Largest payload the client accepts in a response
    pub max_download_bytes: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_wait: Duration::from_secs(3600),
            max_download_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}

impl ClientConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            check_interval: Duration::from_secs(
                std::env::var("CLIENT_CHECK_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            max_wait: Duration::from_secs(
                std::env::var("CLIENT_MAX_WAIT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
            max_download_bytes: MAX_PAYLOAD_BYTES,
        }
    }
}
