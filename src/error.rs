//! Daemon errors and errno translation.

use nix::errno::Errno;
use std::io;

/// Daemon result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors reported by the daemon.
///
/// Every kernel-store and system-call failure is translated into one of
/// these kinds before it crosses a module boundary.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested entity is not known.
    #[error("{0} not found")]
    NotFound(String),
    /// The operation is not supported by the kernel or this build.
    #[error("not supported: {0}")]
    NotSupported(String),
    /// A file could not be opened.
    #[error("file open failed: {0}")]
    FileOpenFailed(String),
    /// A value is outside its domain.
    #[error("bad value: {0}")]
    BadValue(String),
    /// Memory exhausted.
    #[error("out of memory")]
    NoMem,
    /// An input line exceeds the fixed limit.
    #[error("line too long")]
    LineTooLong,
    /// An argument violates the call contract.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    /// A composed path exceeds the system limit.
    #[error("path too long")]
    PathTooLong,
    /// A required key is missing.
    #[error("{0} not defined")]
    NotDefined(String),
    /// The entity already exists or is still referenced.
    #[error("{0}")]
    Exist(String),
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Process report code for startup failures.
    pub fn report_code(&self) -> i32 {
        match self {
            Self::NotFound(_) => -1,
            Self::NotSupported(_) => -2,
            Self::FileOpenFailed(_) => -4,
            Self::BadValue(_) => -5,
            Self::NoMem => -6,
            Self::LineTooLong => -7,
            Self::InvalidParam(_) => -8,
            Self::PathTooLong => -9,
            Self::NotDefined(_) => -10,
            Self::Exist(_) => -11,
            Self::Other(_) => -99,
        }
    }

    /// Translate an OS error number with the given context message.
    pub fn from_errno(errno: Errno, context: impl AsRef<str>) -> Self {
        let msg = format!("{}: {}", context.as_ref(), errno.desc());
        match errno {
            Errno::ENOTSUP => Self::NotSupported(msg),
            Errno::ENOMEM => Self::NoMem,
            Errno::EINVAL => Self::InvalidParam(msg),
            Errno::EDQUOT | Errno::EACCES | Errno::ENOENT => Self::FileOpenFailed(msg),
            _ => Self::Other(msg),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => match Errno::from_raw(code) {
                Errno::ENOTSUP => Self::NotSupported(err.to_string()),
                Errno::ENOMEM => Self::NoMem,
                Errno::EINVAL => Self::InvalidParam(err.to_string()),
                Errno::EDQUOT | Errno::EACCES | Errno::ENOENT => Self::FileOpenFailed(err.to_string()),
                _ => Self::Other(err.to_string()),
            },
            None => Self::Other(err.to_string()),
        }
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Self::from_errno(errno, "system call failed")
    }
}

impl From<Error> for zbus::fdo::Error {
    fn from(err: Error) -> Self {
        zbus::fdo::Error::Failed(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_translation() {
        assert!(matches!(Error::from_errno(Errno::ENOTSUP, "x"), Error::NotSupported(_)));
        assert!(matches!(Error::from_errno(Errno::ENOMEM, "x"), Error::NoMem));
        assert!(matches!(Error::from_errno(Errno::EINVAL, "x"), Error::InvalidParam(_)));
        assert!(matches!(Error::from_errno(Errno::EDQUOT, "x"), Error::FileOpenFailed(_)));
        assert!(matches!(Error::from_errno(Errno::EACCES, "x"), Error::FileOpenFailed(_)));
        assert!(matches!(Error::from_errno(Errno::ENOENT, "x"), Error::FileOpenFailed(_)));
        assert!(matches!(Error::from_errno(Errno::EIO, "x"), Error::Other(_)));
    }

    #[test]
    fn io_translation() {
        let err = io::Error::from_raw_os_error(Errno::ENOENT as i32);
        assert!(matches!(Error::from(err), Error::FileOpenFailed(_)));

        let err = io::Error::new(io::ErrorKind::Other, "no errno attached");
        assert!(matches!(Error::from(err), Error::Other(_)));
    }

    #[test]
    fn report_codes() {
        assert_eq!(Error::BadValue("v".into()).report_code(), -5);
        assert_eq!(Error::FileOpenFailed("f".into()).report_code(), -4);
        assert_eq!(Error::InvalidParam("p".into()).report_code(), -8);
        assert_eq!(Error::Other("o".into()).report_code(), -99);
    }
}
