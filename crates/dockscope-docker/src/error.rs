//! Error types for the docker client.

use thiserror::Error;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by container and log sources.
#[derive(Debug, Error)]
pub enum Error {
    /// No container with the given id on this host.
    #[error("container not found: {0}")]
    NotFound(String),

    /// Engine API failure.
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// The engine returned a container we could not make sense of.
    #[error("invalid container: {0}")]
    InvalidContainer(String),

    /// A log stream broke for a reason other than the engine API.
    #[error("log stream error: {0}")]
    Stream(String),
}
