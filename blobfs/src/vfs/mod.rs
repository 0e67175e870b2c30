//! VFS layer (virtual filesystem)
//!
//! Responsibilities:
//! - Map mount paths onto containers and object keys and classify them, reading through
//!   the files-attribute cache.
//! - Implement POSIX semantics over the blob store: open files, buffered streams, rename
//!   by server-side copy, directories emulated with marker objects.
//! - Keep caches coherent by invalidating every path an operation touched.
//!
//! Submodules:
//! - `path`: path normalization, classification and directory listing
//! - `handles`: open flags and the open-file table
//! - `transfer`: object copy/move/delete, directory batches, resize and append conversion
//! - `fs`: `FsContext` and the `FilesystemService` operations
pub mod fs;
pub mod handles;
pub mod path;
pub mod transfer;

pub use fs::{FileAttr, FileType, FilesystemService, FsContext};
pub use path::{DirEntry, FsPath, PathInfo, PathKind};
