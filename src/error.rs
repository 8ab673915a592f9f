use std::io;

/// Errors raised while configuring, running or tearing down an acquisition.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid channel or clock parameters, or a configuration call the
    /// driver refused.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A call into the driver failed at runtime.
    #[error("driver error {code}: {message}")]
    Driver { code: i32, message: String },

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// The backend status code, if this error came from the driver.
    pub fn status(&self) -> Option<i32> {
        match self {
            Error::Driver { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
