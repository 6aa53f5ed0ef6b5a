use thiserror::Error;

/// vinfra error types
#[derive(Error, Debug)]
pub enum SimError {
    /// Workload trace could not be loaded
    #[error("Trace load failed: {path}: {message}")]
    TraceLoad { path: String, message: String },

    /// Appliance registration failed and no obsolete appliance was evictable
    #[error("Appliance storage exhausted while registering kind '{0}'")]
    StorageExhausted(String),

    /// The cloud failed a VM request or destruction
    #[error("VM management failure: {0}")]
    VmManagement(String),

    /// Network failure during dispatch
    #[error("Network failure: {0}")]
    Network(String),

    /// Utilization query on a stopped monitor
    #[error("Utilization monitor is no longer active")]
    MonitorInactive,

    /// Second initialization of the progress total
    #[error("Progress total already initialized")]
    AlreadyInitialized,

    /// Configuration precondition failure
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for SimError {
    fn from(err: serde_json::Error) -> Self {
        SimError::Config(err.to_string())
    }
}

impl From<serde_yaml::Error> for SimError {
    fn from(err: serde_yaml::Error) -> Self {
        SimError::Config(err.to_string())
    }
}

/// Result type alias for vinfra operations
pub type Result<T> = std::result::Result<T, SimError>;
