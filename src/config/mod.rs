//! Process configuration.
//!
//! [`Config`] is what the binary parses from flags and environment
//! variables. [`ServerConfig`] is the subset the library actually consumes;
//! tests build it directly.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use crate::security::CorsPolicy;

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("request timeout must be at least one second")]
    ZeroTimeout,

    #[error("maximum body size must be greater than zero")]
    ZeroBodyLimit,
}

/// Command-line and environment configuration for the `handwire` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "handwire", version, about = "Hand-built HTTP/1.1 server", long_about = None)]
pub struct Config {
    /// Port to listen on; the next free port up to 100 above is used if taken
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Interface to bind
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Directory holding index.html
    #[arg(long, env = "PUBLIC_DIR", default_value = "public")]
    pub public_dir: PathBuf,

    /// Directory served under /static/ and for asset extensions
    #[arg(long, env = "STATIC_DIR", default_value = "static")]
    pub static_dir: PathBuf,

    /// Directory uploaded files are written to
    #[arg(long, env = "UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Largest accepted request body in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = DEFAULT_MAX_BODY_BYTES)]
    pub max_body_bytes: usize,

    /// Seconds a request may take before it is answered with 408
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::ZeroBodyLimit);
        }
        Ok(())
    }

    /// Builds the library-side configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            public_dir: self.public_dir.clone(),
            static_dir: self.static_dir.clone(),
            uploads_dir: self.uploads_dir.clone(),
            max_body_bytes: self.max_body_bytes,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            cors: CorsPolicy::default(),
        }
    }
}

/// Settings consumed by [`crate::server::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub public_dir: PathBuf,
    pub static_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub max_body_bytes: usize,
    /// Per-request window, measured from the first byte of the request head.
    pub request_timeout: Duration,
    pub cors: CorsPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            public_dir: PathBuf::from("public"),
            static_dir: PathBuf::from("static"),
            uploads_dir: PathBuf::from("uploads"),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            cors: CorsPolicy::default(),
        }
    }
}
