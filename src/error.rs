//! Error types for kola

use thiserror::Error;

/// Result type alias using kola Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in kola operations
#[derive(Error, Debug)]
pub enum Error {
    /// Test registration errors (duplicate names, bad version ranges).
    /// These are programming mistakes in test authorship and abort startup.
    #[error("Registration error: {0}")]
    Registration(String),

    /// Invalid test selection pattern
    #[error("Invalid pattern {pattern:?}: {reason}")]
    Pattern { pattern: String, reason: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// User data could not be parsed or rendered
    #[error("Render error: {0}")]
    Render(String),

    /// Platform failed to create or reach a machine
    #[error("Provision error: {0}")]
    Provision(String),

    /// A remote command exited unsuccessfully
    #[error("ssh: {command:?} exited with {exit_code}: {stderr}")]
    Ssh {
        command: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Timeout waiting for remote state
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Operation not supported by the platform backend
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Native function lookup or execution errors
    #[error("Native function error: {0}")]
    NativeFunc(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Dispatcher bookkeeping failed (e.g. a worker task was lost)
    #[error("Harness error: {0}")]
    Harness(String),

    /// No test matched the selection
    #[error("harness: no tests to run")]
    SuiteEmpty,

    /// At least one selected test failed
    #[error("harness: test suite failed")]
    SuiteFailed,
}

impl Error {
    /// Build an [`Error::Ssh`] from a finished command.
    pub fn ssh(command: impl Into<String>, output: &crate::ExecOutput) -> Self {
        Error::Ssh {
            command: command.into(),
            exit_code: output.exit_code,
            stdout: output.stdout_str(),
            stderr: output.stderr_str().trim().to_string(),
        }
    }
}
