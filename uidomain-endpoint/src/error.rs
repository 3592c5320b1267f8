use std::fmt;

/// Errors surfaced by the endpoint, shaped around the POSIX error codes
/// named in the protocol rather than a generic catch-all.
#[derive(Debug)]
pub enum Error {
    /// Unknown channel id, or unknown channel reference in `PushChannelHandle`.
    Invalid,
    /// Reply attempted on a channel that has already been closed.
    BadFd,
    /// `CheckChannel` is unimplemented.
    Fault,
    /// Non-blocking receive found no ready event.
    TimedOut,
    /// Cancellation, or the peer closed the connection while a header was
    /// being read.
    Shutdown,
    /// Any other socket I/O or readiness-set failure, propagated verbatim.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => write!(f, "invalid channel id or reference (EINVAL)"),
            Self::BadFd => write!(f, "channel is already closed (EBADF)"),
            Self::Fault => write!(f, "operation not implemented (EFAULT)"),
            Self::TimedOut => write!(f, "non-blocking receive timed out (ETIMEDOUT)"),
            Self::Shutdown => write!(f, "endpoint is shutting down (ESHUTDOWN)"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::UnexpectedEof => Error::Shutdown,
            std::io::ErrorKind::NotConnected | std::io::ErrorKind::BrokenPipe => Error::Shutdown,
            _ => Error::Io(e),
        }
    }
}

impl From<rustix::io::Errno> for Error {
    fn from(e: rustix::io::Errno) -> Self {
        Error::Io(std::io::Error::from(e))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
