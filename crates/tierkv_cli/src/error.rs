//! Error types for the shell.

use thiserror::Error;
use tierkv_client::ClientError;
use tierkv_server::ServerError;

/// Result type for shell operations.
pub type CliResult<T> = Result<T, CliError>;

/// Errors that end the shell.
#[derive(Error, Debug)]
pub enum CliError {
    /// Reading input or the configuration file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for a cluster.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_yaml::Error),

    /// The local cluster failed to start.
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// The client could not issue or await a request.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// A response could not be rendered as JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
