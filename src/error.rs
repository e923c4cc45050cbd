use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} required")]
    MissingField(&'static str),

    #[error("threshold must be at least 1")]
    InvalidThreshold,

    #[error("config parse: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("config read ({path}): {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Failure reported by a downstream stream client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("throttled: {0}")]
    Throttled(String),

    #[error("rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("service error ({status}): {message}")]
    Service { status: u16, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FlushError {
    #[error("batch serialization: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("put record to stream {stream}: {source}")]
    Client {
        stream: String,
        #[source]
        source: ClientError,
    },
}
