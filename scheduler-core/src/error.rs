use rusqlite::Error as SqlError;

/// The error type shared by every component in this crate.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("dispatch handler error: {0}")]
    Handler(String),

    #[error("{0}")]
    Other(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl From<SqlError> for SchedulerError {
    fn from(error: SqlError) -> Self {
        SchedulerError::Sql(error.to_string())
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(error: serde_json::Error) -> Self {
        SchedulerError::Serde(error.to_string())
    }
}

impl From<reqwest::Error> for SchedulerError {
    fn from(error: reqwest::Error) -> Self {
        SchedulerError::Handler(error.to_string())
    }
}
