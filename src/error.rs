use std::fmt;
use std::io;

/// Errors returned by the selector core.
#[derive(Debug)]
pub enum Error {
    /// An I/O operation on the multiplexer or a channel failed.
    Io(io::Error),
    /// The multiplexer has been closed (the loop is stopping or stopped).
    Closed,
    /// The registration key no longer exists (cancelled or already removed).
    StaleKey,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Closed => write!(f, "selector closed"),
            Error::StaleKey => write!(f, "stale registration key"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
