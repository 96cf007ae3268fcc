use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Invalid Source - {0}")]
    InvalidSource(String),

    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Store Error - {0}")]
    Store(String),

    #[error("Stream Error - {0}")]
    Stream(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Lease on partition {0} was lost")]
    LeaseLost(u16),

    #[error("Task Error - {0}")]
    Task(String),
}

impl Error {
    /// Errors that no amount of restarting will fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::InvalidSource(_))
    }
}

impl From<mappy_jetstream::Error> for Error {
    fn from(value: mappy_jetstream::Error) -> Self {
        Error::Stream(value.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Error::Store(value.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(value: tokio::task::JoinError) -> Self {
        Error::Task(value.to_string())
    }
}
