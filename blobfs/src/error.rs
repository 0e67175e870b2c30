//! Error types shared by every layer of BlobFS.
//!
//! `StoreError` is what a blob store backend reports; `FsError` is the typed failure the
//! resolver, caches, streams and the filesystem service return. The FUSE boundary turns an
//! `FsError` into an errno with [`FsError::errno`].

use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Default)]
pub struct PathHint(Option<String>);

impl PathHint {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn some(path: impl Into<String>) -> Self {
        Self(Some(path.into()))
    }
}

impl fmt::Display for PathHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(path) if !path.is_empty() => write!(f, ": {path}"),
            _ => Ok(()),
        }
    }
}

impl From<String> for PathHint {
    fn from(value: String) -> Self {
        Self::some(value)
    }
}

impl From<&String> for PathHint {
    fn from(value: &String) -> Self {
        Self::some(value.clone())
    }
}

impl From<&str> for PathHint {
    fn from(value: &str) -> Self {
        Self::some(value)
    }
}

/// Failures reported by a blob store backend.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    /// The object is leased by someone else, or the supplied lease is not the active one.
    #[error("lease conflict{path}")]
    LeaseConflict { path: PathHint },

    #[error("{op} failed: {message}")]
    Backend { op: &'static str, message: String },
}

impl StoreError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        StoreError::NotFound { path: path.into() }
    }

    pub fn backend(op: &'static str, message: impl fmt::Display) -> Self {
        StoreError::Backend {
            op,
            message: message.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, StoreError::LeaseConflict { .. })
    }
}

#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found{path}")]
    NotFound { path: PathHint },

    #[error("already exists{path}")]
    AlreadyExists { path: PathHint },

    #[error("not a directory{path}")]
    NotADirectory { path: PathHint },

    #[error("is a directory{path}")]
    IsADirectory { path: PathHint },

    #[error("permission denied{path}")]
    PermissionDenied { path: PathHint },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file too large{path}: {reason}")]
    FileTooLarge { path: PathHint, reason: String },

    #[error("too many open files")]
    TooManyOpenHandles,

    #[error("{cache} cache is full (capacity {capacity})")]
    CacheFull {
        cache: &'static str,
        capacity: usize,
    },

    #[error("stale or missing lease{path}")]
    StaleOrMissingLease { path: PathHint },

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("{op} failed{path}: {source}")]
    BackendIOFailure {
        op: &'static str,
        path: PathHint,
        #[source]
        source: StoreError,
    },

    #[error("{op} left {} object(s) behind{path}", failed.len())]
    BatchIncomplete {
        op: &'static str,
        path: PathHint,
        failed: Vec<String>,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn not_found(path: impl Into<PathHint>) -> Self {
        FsError::NotFound { path: path.into() }
    }

    pub fn already_exists(path: impl Into<PathHint>) -> Self {
        FsError::AlreadyExists { path: path.into() }
    }

    /// Wraps a backend failure with the operation and path it happened on:
    /// `store.delete_blob(..).await.map_err(FsError::io("delete", &path))?`.
    pub fn io(op: &'static str, path: impl Into<PathHint>) -> impl FnOnce(StoreError) -> FsError {
        let path = path.into();
        move |source| match source {
            StoreError::LeaseConflict { path } => FsError::StaleOrMissingLease { path },
            source => FsError::BackendIOFailure { op, path, source },
        }
    }

    /// Nearest POSIX status for this failure.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound { .. } => libc::ENOENT,
            FsError::AlreadyExists { .. } => libc::EEXIST,
            FsError::NotADirectory { .. } => libc::ENOTDIR,
            FsError::IsADirectory { .. } => libc::EISDIR,
            FsError::PermissionDenied { .. } => libc::EACCES,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::FileTooLarge { .. } => libc::EFBIG,
            FsError::TooManyOpenHandles => libc::EMFILE,
            FsError::CacheFull { .. } => libc::ENOSPC,
            FsError::StaleOrMissingLease { .. } => libc::EBUSY,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::BackendIOFailure { source, .. } if source.is_not_found() => libc::ENOENT,
            FsError::BackendIOFailure { .. } => libc::EIO,
            FsError::BatchIncomplete { .. } => libc::EIO,
            FsError::Unsupported(_) => libc::ENOTSUP,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_hint_formatting() {
        let e = FsError::not_found("/c/a.txt");
        assert_eq!(e.to_string(), "not found: /c/a.txt");
        let e = FsError::NotFound {
            path: PathHint::none(),
        };
        assert_eq!(e.to_string(), "not found");
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::not_found("/x").errno(), libc::ENOENT);
        assert_eq!(FsError::already_exists("/x").errno(), libc::EEXIST);
        assert_eq!(FsError::TooManyOpenHandles.errno(), libc::EMFILE);
        assert_eq!(FsError::InvalidArgument("flags".into()).errno(), libc::EINVAL);

        let wrap = FsError::io("download", "/c/k");
        assert_eq!(wrap(StoreError::backend("get", "boom")).errno(), libc::EIO);
        let wrap = FsError::io("download", "/c/k");
        assert_eq!(wrap(StoreError::not_found("/c/k")).errno(), libc::ENOENT);
        let wrap = FsError::io("renew", "/c/k");
        assert!(matches!(
            wrap(StoreError::LeaseConflict {
                path: PathHint::none()
            }),
            FsError::StaleOrMissingLease { .. }
        ));
    }
}
