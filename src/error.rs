use std::path::PathBuf;

use crate::Hash;

/// error type for ori operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("object not found: {0}")]
    ObjectNotFound(Hash),

    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    PathExists(String),

    #[error("wrong object type: expected {expected}, found {found}")]
    WrongType {
        expected: &'static str,
        found: &'static str,
    },

    #[error("malformed object: {0}")]
    Malformed(String),

    #[error("integrity error: hash mismatch for {0}")]
    IntegrityError(Hash),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("reference graph inconsistency: {0}")]
    Corrupted(String),

    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("lock contention on repository")]
    LockContention,

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("dirstate encode error: {0}")]
    DirstateEncode(#[from] ciborium::ser::Error<std::io::Error>),

    #[error("dirstate decode error: {0}")]
    DirstateDecode(#[from] ciborium::de::Error<std::io::Error>),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// translate to a POSIX errno for the mount adapter edge.
    ///
    /// this is the only place errors become numeric; internal callers
    /// match on variants.
    pub fn errno(&self) -> i32 {
        match self {
            Error::ObjectNotFound(_)
            | Error::PathNotFound(_)
            | Error::SnapshotNotFound(_)
            | Error::NoRepo(_) => libc::ENOENT,
            Error::PathExists(_) | Error::RepoExists(_) => libc::EEXIST,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::AccessDenied(_) => libc::EACCES,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::Io { source, .. } => source.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// true when the failure came from the operating system or the wire
    pub fn is_io(&self) -> bool {
        matches!(self, Error::Io { .. } | Error::Transport { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::PathNotFound("/x".into()).errno(), libc::ENOENT);
        assert_eq!(Error::PathExists("/x".into()).errno(), libc::EEXIST);
        assert_eq!(Error::NotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(Error::AccessDenied("/s".into()).errno(), libc::EACCES);
        assert_eq!(
            Error::InvalidArgument("directory rename".into()).errno(),
            libc::EINVAL
        );
    }

    #[test]
    fn test_errno_io_passthrough() {
        let err = Error::Io {
            path: "/tmp/x".into(),
            source: std::io::Error::from_raw_os_error(libc::ENOSPC),
        };
        assert_eq!(err.errno(), libc::ENOSPC);
        assert!(err.is_io());
    }
}
