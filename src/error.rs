//! Error types for node-sieve

use thiserror::Error;

/// Failures of fallible operations. Validation rejections are not errors,
/// see [`crate::validate::Rejection`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("proxy runtime failed to launch: {0}")]
    Launch(String),

    #[error("control plane error: {0}")]
    ControlPlane(String),

    #[error("egress probe failed: {0}")]
    Probe(String),

    #[error("GeoIP database error: {0}")]
    GeoDb(String),

    #[error("no free port pair left in {0}..{1}")]
    PortsExhausted(u16, u16),
}

pub type Result<T> = std::result::Result<T, Error>;
