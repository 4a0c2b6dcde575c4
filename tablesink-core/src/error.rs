use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Decode Error - {0}")]
    Decode(String),

    #[error("Not Found - {0}")]
    NotFound(String),

    #[error("Lookup Error - {0}")]
    Lookup(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Storage Error - {0}")]
    Storage(String),

    #[error("Buffer Error - destination {0} is closed")]
    BufferClosed(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("Status Error - {0}")]
    Status(String),

    #[error("{0}")]
    Panic(String),
}

impl Error {
    /// Whether a message that failed with this error should be consumed instead of redelivered.
    /// Storage, transport and closed-buffer errors are worth retrying. Everything else,
    /// metadata lookup failures included, is not.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Error::Storage(_) | Error::BufferClosed(_) | Error::Transport(_)
        )
    }
}

/// Default terminal-vs-transient classifier for the message finalizer.
pub fn default_is_terminal(err: &Error) -> bool {
    err.is_terminal()
}

/// Like [default_is_terminal], but an unreachable metadata backend is retried as well.
pub fn retry_lookup_is_terminal(err: &Error) -> bool {
    !matches!(err, Error::Lookup(_)) && err.is_terminal()
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Decode(value.to_string())
    }
}
