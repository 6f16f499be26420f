use crate::broker::BrokerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The writer batch is at capacity; flush before sending again.
    #[error("Writer buffer is full")]
    WriterBufferFull,

    /// The reader batch is at capacity; commit before storing again.
    #[error("Reader buffer is full")]
    ReaderBufferFull,

    #[error("Failed to {operation}: {source}")]
    Broker {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Timeout: {0}")]
    Timeout(&'static str),

    #[error("{0} is closed")]
    Closed(&'static str),

    #[error("Output channel closed by receiver")]
    OutputClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{first}; {second}")]
    Combined {
        first: Box<Error>,
        second: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn broker(operation: &'static str, source: BrokerError) -> Self {
        if matches!(source, BrokerError::Cancelled) {
            return Error::Cancelled;
        }
        Error::Broker { operation, source }
    }

    /// Merge two optional errors, keeping both when both are present.
    pub fn combine(first: Option<Error>, second: Option<Error>) -> Option<Error> {
        match (first, second) {
            (Some(first), Some(second)) => Some(Error::Combined {
                first: Box::new(first),
                second: Box::new(second),
            }),
            (Some(e), None) | (None, Some(e)) => Some(e),
            (None, None) => None,
        }
    }

    /// True when the error (or every part of a combined error) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Combined { first, second } => first.is_cancelled() && second.is_cancelled(),
            _ => false,
        }
    }

    /// True for the buffer-full signals, which never indicate data loss.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::WriterBufferFull | Error::ReaderBufferFull)
    }
}
