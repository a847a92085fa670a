use std::fmt;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// ExitError reports a command that ran to completion with a non-zero status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitError {
    pub exit_code: i64,
    /// Standard error of the command, filled in by `Execution::output` when
    /// the caller did not bind stderr themselves.
    pub stderr: Vec<u8>,
}

impl ExitError {
    pub fn new(exit_code: i64) -> Self {
        Self {
            exit_code,
            stderr: Vec::new(),
        }
    }
}

impl fmt::Display for ExitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution exited with status {}", self.exit_code)
    }
}

impl std::error::Error for ExitError {}

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Engine {op} failed for {target}: {source}")]
    Engine {
        op: &'static str,
        target: String,
        #[source]
        source: BoxError,
    },

    #[error("Hijack error {context}: {source}")]
    Hijack {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exit(#[from] ExitError),

    #[error("Resource exhausted: requested {requested} GPU leases, {available} available")]
    ResourceExhausted { requested: usize, available: usize },

    #[error("No GPU devices detected")]
    NoGpuDevices,

    #[error("Container deadline exceeded")]
    DeadlineExceeded,

    #[error("Execution cancelled: container stopped")]
    Cancelled,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("{0} already set")]
    StreamAlreadySet(&'static str),

    #[error("Not a terminal")]
    NotATerminal,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HarnessError {
    pub fn engine(op: &'static str, target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        HarnessError::Engine {
            op,
            target: target.into(),
            source: source.into(),
        }
    }

    /// Returns the exit error when the command ran and failed.
    pub fn as_exit(&self) -> Option<&ExitError> {
        match self {
            HarnessError::Exit(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
