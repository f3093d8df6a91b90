//! Error types for config loading, transport, transfer and task execution

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors — raised before any network activity
    #[error("task '{0}' not found")]
    UnknownTask(String),

    #[error("server '{0}' not found")]
    UnknownServer(String),

    #[error("server '{0}' has no host address")]
    NoHost(String),

    #[error("invalid upload step '{0}': expected 'local:remote'")]
    UploadSpec(String),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Key read/parse, dial or authentication failure
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// Remote command exited non-zero
    #[error("remote command exited with status {status}: {stderr}")]
    RemoteExec { status: i32, stderr: String },

    /// Local shell command exited non-zero
    #[error("local command exited with status {status}: {stderr}")]
    LocalExec { status: i32, stderr: String },

    /// File transfer rejected by the remote side
    #[error("transfer to {path} failed: {detail}")]
    Transfer { path: String, detail: String },

    /// Post-upload digest mismatch; never retried or ignored
    #[error("checksum mismatch for {path}: local {local}, remote {remote}")]
    Integrity {
        path: String,
        local: String,
        remote: String,
    },

    /// Any of the above, tagged with the host it happened on
    #[error("[{host}] {source}")]
    Host {
        host: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] ssh2::Error),
}

impl Error {
    /// Tag an error with the server name it occurred on
    pub fn on_host(self, host: &str) -> Self {
        match self {
            // Already tagged — keep the innermost host
            Error::Host { .. } => self,
            other => Error::Host {
                host: host.to_string(),
                source: Box::new(other),
            },
        }
    }
}
