use std::fmt;

use thiserror::Error;

use crate::config::ConfigError;
use crate::kafka::client::ClientError;
use crate::pipeline::tolerance::Stage;

/// Failures a [`crate::sink::SinkTask`] reports back to the runtime.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The batch may succeed if delivered again later.
    #[error("retriable sink failure")]
    Retriable(#[source] anyhow::Error),
    #[error("sink failure")]
    Fatal(#[source] anyhow::Error),
}

impl SinkError {
    pub fn retriable(error: impl Into<anyhow::Error>) -> Self {
        SinkError::Retriable(error.into())
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        SinkError::Fatal(error.into())
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self, SinkError::Retriable(_))
    }
}

/// Errors that end a task iteration.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Exiting sink task due to unrecoverable exception")]
    Unrecoverable(#[source] SinkError),
    #[error("sink task failed during {operation}")]
    SinkCall {
        operation: &'static str,
        #[source]
        source: SinkError,
    },
    #[error("tolerance exceeded in {stage} stage")]
    ToleranceExceeded {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("invalid task configuration")]
    Config(#[from] ConfigError),
}

impl TaskError {
    pub fn is_wakeup(&self) -> bool {
        matches!(self, TaskError::Client(ClientError::Wakeup))
    }
}

/// The terminal error of [`crate::task::WorkerSinkTask::execute`].
///
/// `cause` is the first failure; anything that went wrong while closing
/// partitions afterwards is kept in `suppressed` rather than replacing it.
#[derive(Debug)]
pub struct TaskFailure {
    pub cause: TaskError,
    pub suppressed: Vec<TaskError>,
}

impl TaskFailure {
    pub fn new(cause: TaskError) -> Self {
        Self {
            cause,
            suppressed: Vec::new(),
        }
    }

    pub fn suppress(&mut self, error: TaskError) {
        self.suppressed.push(error);
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)?;
        if !self.suppressed.is_empty() {
            write!(f, " ({} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl std::error::Error for TaskFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl From<TaskError> for TaskFailure {
    fn from(cause: TaskError) -> Self {
        TaskFailure::new(cause)
    }
}
