//! 打开文件表：句柄 id -> 读写流。

use crate::cache::TtlCache;
use crate::config::CacheSettings;
use crate::error::{FsError, FsResult};
use crate::stream::{ReadStream, WriteStream};
use crate::vfs::path::FsPath;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

/// The subset of `open(2)` flags the filesystem acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub mode: AccessMode,
    pub append: bool,
    pub truncate: bool,
    pub exclusive: bool,
}

impl OpenFlags {
    pub fn from_raw(flags: i32) -> FsResult<Self> {
        let wronly = flags & libc::O_WRONLY != 0;
        let rdwr = flags & libc::O_RDWR != 0;
        let mode = match (wronly, rdwr) {
            (true, true) => {
                return Err(FsError::InvalidArgument(format!(
                    "O_WRONLY and O_RDWR both set in {flags:#o}"
                )));
            }
            (true, false) => AccessMode::Write,
            (false, true) => AccessMode::ReadWrite,
            (false, false) => AccessMode::Read,
        };
        Ok(Self {
            mode,
            append: flags & libc::O_APPEND != 0,
            truncate: flags & libc::O_TRUNC != 0,
            exclusive: flags & libc::O_EXCL != 0,
        })
    }

    pub fn writes(&self) -> bool {
        self.mode != AccessMode::Read
    }

    pub fn reads(&self) -> bool {
        self.mode != AccessMode::Write
    }
}

/// One live handle. The lease id is present exactly when a writer is.
pub struct OpenFile {
    pub id: u64,
    pub path: FsPath,
    pub reader: Option<Arc<ReadStream>>,
    pub writer: Option<Arc<WriteStream>>,
}

impl OpenFile {
    pub fn lease_id(&self) -> Option<&str> {
        self.writer.as_deref().map(WriteStream::lease_id)
    }
}

/// Capacity-bounded, non-expiring handle table. Ids start at 1 and are never reused.
pub struct OpenFileTable {
    entries: TtlCache<Arc<OpenFile>>,
    next_id: AtomicU64,
}

impl OpenFileTable {
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            entries: TtlCache::from_settings("handles", settings),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn insert(
        &self,
        path: FsPath,
        reader: Option<Arc<ReadStream>>,
        writer: Option<Arc<WriteStream>>,
    ) -> FsResult<Arc<OpenFile>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let file = Arc::new(OpenFile {
            id,
            path,
            reader,
            writer,
        });
        match self.entries.put(id.to_string(), file.clone()) {
            Ok(()) => {
                debug!(fh = id, path = file.path.full(), "handle opened");
                Ok(file)
            }
            Err(FsError::CacheFull { .. }) => Err(FsError::TooManyOpenHandles),
            Err(e) => Err(e),
        }
    }

    pub fn get(&self, id: u64) -> FsResult<Arc<OpenFile>> {
        self.entries
            .get(&id.to_string())
            .ok_or(FsError::BadHandle(id))
    }

    pub fn remove(&self, id: u64) -> Option<Arc<OpenFile>> {
        self.entries.delete(&id.to_string())
    }

    /// Writers of every live handle, for the lease renewer.
    pub fn writers(&self) -> Vec<Arc<WriteStream>> {
        self.entries
            .snapshot()
            .into_iter()
            .filter_map(|(_, file)| file.writer.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let rw = OpenFlags::from_raw(libc::O_RDWR | libc::O_APPEND).unwrap();
        assert_eq!(rw.mode, AccessMode::ReadWrite);
        assert!(rw.append && rw.reads() && rw.writes());
        let w = OpenFlags::from_raw(libc::O_WRONLY).unwrap();
        assert!(w.writes() && !w.reads());
        assert_eq!(
            OpenFlags::from_raw(libc::O_RDONLY).unwrap().mode,
            AccessMode::Read
        );
        assert!(matches!(
            OpenFlags::from_raw(libc::O_WRONLY | libc::O_RDWR),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_ids_are_monotonic_and_bounded() {
        let table = OpenFileTable::new(CacheSettings::new(2, None));
        let p = FsPath::new("", "/c/f");
        let a = table.insert(p.clone(), None, None).unwrap();
        let b = table.insert(p.clone(), None, None).unwrap();
        assert_eq!((a.id, b.id), (1, 2));
        assert!(a.lease_id().is_none());
        assert!(matches!(
            table.insert(p.clone(), None, None),
            Err(FsError::TooManyOpenHandles)
        ));
        assert!(table.remove(1).is_some());
        let c = table.insert(p, None, None).unwrap();
        assert_eq!(c.id, 4);
        assert!(matches!(table.get(1), Err(FsError::BadHandle(1))));
        assert_eq!(table.get(4).unwrap().path.full(), "/c/f");
        assert_eq!(table.len(), 2);
        assert!(table.writers().is_empty());
    }
}
