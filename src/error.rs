use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Hardware read/write failure. Ends the polling thread of the affected line.
    #[error("device I/O error: {0}")]
    DeviceIo(String),

    /// The FSK modem subprocess failed or left no usable output.
    #[error("external process error: {0}")]
    ExternalProcess(String),

    /// A dialer rule is malformed. Detected when the rule is first used.
    #[error("invalid configuration for dialer '{dialer}': {reason}")]
    Config { dialer: String, reason: String },

    #[error("unable to load configuration: {0}")]
    ConfigLoad(String),

    /// A call could not be routed to a client.
    #[error("routing failed: {0}")]
    Routing(String),

    /// A control-plane request failed validation.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("audio error: {0}")]
    Audio(String),

    /// The control server could not listen.
    #[error("control server error: {0}")]
    Server(String),
}

impl From<hidapi::HidError> for Error {
    fn from(err: hidapi::HidError) -> Self {
        Error::DeviceIo(err.to_string())
    }
}

impl From<hound::Error> for Error {
    fn from(err: hound::Error) -> Self {
        Error::ExternalProcess(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Rejected(err.to_string())
    }
}

/// Locks a mutex, carrying on with the inner value if a previous holder panicked.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
