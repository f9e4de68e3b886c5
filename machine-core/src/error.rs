use thiserror::Error;

/// Error types for the machine-core crate
#[derive(Error, Debug)]
pub enum MachineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("KV store not initialized")]
    Uninitialized,

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Host does not exist: \"{0}\"")]
    HostNotFound(String),

    #[error("KV backend error during {op} of {key}: {message}")]
    Backend {
        op: &'static str,
        key: String,
        message: String,
    },

    #[error("IO error during {op} of {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Generating {artifact} failed: {source}")]
    Bootstrap {
        artifact: &'static str,
        #[source]
        source: Box<MachineError>,
    },

    #[error("Failed to reach remote CA: {0}")]
    Transport(String),

    #[error("Remote CA returned HTTP {status}: {body}")]
    RemoteStatus { status: u16, body: String },

    #[error("Remote CA returned an empty result from {endpoint}")]
    EmptyResult { endpoint: String },

    #[error("Invalid response from remote CA: {0}")]
    Protocol(String),

    #[error("SSH key error: {0}")]
    SshKey(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl MachineError {
    /// Attach the operation and path to an IO error
    pub fn io(op: &'static str, path: impl Into<String>, source: std::io::Error) -> Self {
        MachineError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn backend(op: &'static str, key: impl Into<String>, message: impl ToString) -> Self {
        MachineError::Backend {
            op,
            key: key.into(),
            message: message.to_string(),
        }
    }

    /// Wrap a failure of one bootstrap step
    pub fn bootstrap(artifact: &'static str, source: MachineError) -> Self {
        MachineError::Bootstrap {
            artifact,
            source: Box::new(source),
        }
    }

    /// True for "absent" errors as opposed to backend or IO failures
    pub fn is_not_found(&self) -> bool {
        match self {
            MachineError::KeyNotFound(_) | MachineError::HostNotFound(_) => true,
            MachineError::Bootstrap { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<openssl::error::ErrorStack> for MachineError {
    fn from(err: openssl::error::ErrorStack) -> Self {
        MachineError::Certificate(format!("OpenSSL error: {err}"))
    }
}

impl From<serde_json::Error> for MachineError {
    fn from(err: serde_json::Error) -> Self {
        MachineError::Serialization(err.to_string())
    }
}

/// Result type for machine-core operations
pub type Result<T> = std::result::Result<T, MachineError>;
