//! 基于路径的 POSIX 语义：把每个文件系统调用翻译成对象存储操作。

use crate::bus::MessageBus;
use crate::cache::{Invalidator, TtlCache};
use crate::cadapter::{BlobKind, BlobStore, META_GID, META_IS_LINK, META_UID};
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::stream::{ReadStream, WriteStream};
use crate::vfs::handles::{AccessMode, OpenFile, OpenFileTable, OpenFlags};
use crate::vfs::path::{DirEntry, FsPath, PathInfo, PathKind, PathResolver};
use crate::vfs::transfer::{BlobTransfer, CopyMode};
use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Directory,
    RegularFile,
    Symlink,
}

#[derive(Clone, Debug)]
pub struct FileAttr {
    pub kind: FileType,
    pub size: u64,
    pub blocks: u64,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub crtime: SystemTime,
}

/// Everything one mounted filesystem shares: configuration, backends, caches, handles.
/// Built once and handed to the service, the FUSE adapter and the background workers.
pub struct FsContext {
    pub config: FsConfig,
    pub store: Arc<dyn BlobStore>,
    pub bus: Arc<dyn MessageBus>,
    pub resolver: PathResolver,
    pub handles: OpenFileTable,
    pub invalidator: Invalidator,
    pub transfer: BlobTransfer,
}

impl FsContext {
    pub fn new(config: FsConfig, store: Arc<dyn BlobStore>, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let files = Arc::new(TtlCache::from_settings("files", config.files_cache));
        let readers = Arc::new(TtlCache::from_settings("readers", config.reader_cache));
        Arc::new(Self {
            resolver: PathResolver::new(store.clone(), &config.prefix, files.clone()),
            handles: OpenFileTable::new(config.handle_table),
            invalidator: Invalidator::new(files, readers, bus.clone(), config.cluster),
            transfer: BlobTransfer::new(store.clone(), config.transfer, config.batch),
            config,
            store,
            bus,
        })
    }
}

/// POSIX-shaped operations over paths and handle ids.
pub struct FilesystemService {
    ctx: Arc<FsContext>,
}

impl FilesystemService {
    pub fn new(ctx: Arc<FsContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<FsContext> {
        &self.ctx
    }

    fn parse(&self, raw: &str) -> FsPath {
        self.ctx.resolver.parse(raw)
    }

    async fn resolve_existing(&self, path: &FsPath) -> FsResult<PathInfo> {
        let info = self.ctx.resolver.resolve(path).await?;
        if info.kind == PathKind::Invalid {
            return Err(FsError::not_found(path.full()));
        }
        Ok(info)
    }

    fn attr_of(&self, info: &PathInfo) -> FileAttr {
        let (kind, perm, nlink) = match info.kind {
            PathKind::Root | PathKind::Container | PathKind::VirtualDirectory | PathKind::Invalid => {
                (FileType::Directory, 0o755, 2)
            }
            PathKind::Symlink => (FileType::Symlink, 0o755, 1),
            PathKind::File => match info.blob_kind {
                Some(BlobKind::Append) => (FileType::RegularFile, 0o666, 1),
                _ => (FileType::RegularFile, 0o444, 1),
            },
        };
        FileAttr {
            kind,
            size: info.size,
            blocks: info.size.div_ceil(512),
            perm,
            nlink,
            uid: self.ctx.config.uid,
            gid: self.ctx.config.gid,
            atime: info.modified,
            mtime: info.modified,
            ctime: info.modified,
            crtime: info.created,
        }
    }

    /// 获取路径属性（经过属性缓存）。
    pub async fn getattr(&self, raw: &str) -> FsResult<FileAttr> {
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        Ok(self.attr_of(&info))
    }

    pub async fn readdir(&self, raw: &str) -> FsResult<Vec<DirEntry>> {
        self.ctx.resolver.readdir(&self.parse(raw)).await
    }

    /// Opens an existing file and returns the handle id.
    pub async fn open(&self, raw: &str, flags: i32) -> FsResult<u64> {
        let flags = OpenFlags::from_raw(flags)?;
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        self.open_file(path, info, flags).await
    }

    async fn open_file(&self, path: FsPath, info: PathInfo, flags: OpenFlags) -> FsResult<u64> {
        if info.kind.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.full().into(),
            });
        }
        let blob = path.blob_ref();
        let mut kind = info.blob_kind.unwrap_or(BlobKind::Block);

        if flags.writes() && flags.append && kind == BlobKind::Block {
            if !self.ctx.config.auto_convert_to_append {
                return Err(FsError::PermissionDenied {
                    path: path.full().into(),
                });
            }
            self.ctx.transfer.convert_to_append(&blob).await?;
            self.ctx.invalidator.invalidate(&path, PathKind::File).await;
            kind = BlobKind::Append;
        }
        if flags.writes() && flags.truncate && info.size > 0 {
            self.ctx.transfer.resize(&blob, 0).await?;
            self.ctx.invalidator.invalidate(&path, PathKind::File).await;
        }

        let chunk = self.ctx.config.transfer.download_chunk;
        let reader = match flags.mode {
            AccessMode::Read => Some(self.shared_reader(&path, chunk).await?),
            AccessMode::ReadWrite => Some(Arc::new(
                ReadStream::open(self.ctx.store.clone(), blob.clone(), chunk).await?,
            )),
            AccessMode::Write => None,
        };
        let writer = if flags.writes() {
            Some(Arc::new(
                WriteStream::open(self.ctx.store.clone(), blob, kind, self.ctx.config.transfer).await?,
            ))
        } else {
            None
        };

        match self.ctx.handles.insert(path, reader, writer.clone()) {
            Ok(file) => Ok(file.id),
            Err(e) => {
                if let Some(writer) = writer {
                    let _ = writer.close().await;
                }
                warn!(error = %e, "open rejected");
                Err(e)
            }
        }
    }

    /// Read-only handles on the same path share one reader slot until it expires or the
    /// path is invalidated.
    async fn shared_reader(&self, path: &FsPath, chunk: usize) -> FsResult<Arc<ReadStream>> {
        let readers = self.ctx.invalidator.readers();
        if let Some(reader) = readers.get(path.full()) {
            return Ok(reader);
        }
        let reader = Arc::new(ReadStream::open(self.ctx.store.clone(), path.blob_ref(), chunk).await?);
        if let Err(e) = readers.put(path.full(), reader.clone()) {
            trace!(path = path.full(), error = %e, "reader slot not cached");
        }
        Ok(reader)
    }

    /// Creates an empty file if it does not exist yet and opens it for writing.
    pub async fn create(&self, raw: &str, flags: i32) -> FsResult<u64> {
        let mut flags = OpenFlags::from_raw(flags)?;
        if flags.mode == AccessMode::Read {
            flags.mode = AccessMode::Write;
        }
        let path = self.parse(raw);
        let info = self.ctx.resolver.resolve(&path).await?;
        match info.kind {
            PathKind::Invalid => {}
            k if k.is_dir() => {
                return Err(FsError::IsADirectory {
                    path: path.full().into(),
                });
            }
            _ if flags.exclusive => return Err(FsError::already_exists(path.full())),
            _ => return self.open_file(path, info, flags).await,
        }

        self.ensure_parent_dir(&path).await?;
        let kind = if flags.append {
            BlobKind::Append
        } else {
            BlobKind::Block
        };
        let blob = path.blob_ref();
        self.ctx
            .store
            .create_blob(&blob, kind, Bytes::new(), None)
            .await
            .map_err(FsError::io("create_blob", path.full()))?;
        self.set_owner(&path).await?;
        self.ctx.invalidator.invalidate(&path, PathKind::File).await;
        debug!(path = path.full(), %kind, "file created");

        let info = self.resolve_existing(&path).await?;
        self.open_file(path, info, flags).await
    }

    async fn ensure_parent_dir(&self, path: &FsPath) -> FsResult<()> {
        if path.depth() < 2 {
            return Err(FsError::PermissionDenied {
                path: path.full().into(),
            });
        }
        let parent = path.parent().unwrap_or_else(|| self.parse("/"));
        let info = self.ctx.resolver.resolve(&parent).await?;
        if !info.kind.is_dir() {
            return Err(FsError::not_found(parent.full()));
        }
        Ok(())
    }

    async fn set_owner(&self, path: &FsPath) -> FsResult<()> {
        let blob = path.blob_ref();
        for (key, value) in [(META_UID, self.ctx.config.uid), (META_GID, self.ctx.config.gid)] {
            self.ctx
                .store
                .set_metadata(&blob, key, &value.to_string(), None)
                .await
                .map_err(FsError::io("set_metadata", path.full()))?;
        }
        Ok(())
    }

    fn handle(&self, fh: u64) -> FsResult<Arc<OpenFile>> {
        self.ctx.handles.get(fh)
    }

    /// Empty result means end of file.
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Bytes> {
        let file = self.handle(fh)?;
        let reader = file.reader.as_ref().ok_or(FsError::BadHandle(fh))?;
        Ok(reader
            .read(offset, size as usize)
            .await?
            .unwrap_or_default())
    }

    /// Writes go to the end of the object; the offset is only checked for logging.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let file = self.handle(fh)?;
        let writer = file.writer.as_ref().ok_or(FsError::BadHandle(fh))?;
        trace!(fh, offset, len = data.len(), "write");
        let n = writer.write(data, 0, data.len()).await?;
        Ok(n as u32)
    }

    pub async fn flush(&self, fh: u64) -> FsResult<()> {
        let file = self.handle(fh)?;
        match &file.writer {
            Some(writer) => writer.flush().await,
            None => Ok(()),
        }
    }

    /// Closes the handle's writer, removes the entry and invalidates the path when it was
    /// written through.
    pub async fn release(&self, fh: u64) -> FsResult<()> {
        let file = self.ctx.handles.remove(fh).ok_or(FsError::BadHandle(fh))?;
        let Some(writer) = &file.writer else {
            trace!(fh, "read handle released");
            return Ok(());
        };
        let closed = writer.close().await;
        self.ctx
            .invalidator
            .invalidate(&file.path, PathKind::File)
            .await;
        if let Err(e) = &closed {
            warn!(fh, path = file.path.full(), error = %e, "closing writer failed");
        }
        closed
    }

    /// Commits everything written through the handle. The writer is closed afterwards.
    pub async fn fsync(&self, fh: u64) -> FsResult<()> {
        let file = self.handle(fh)?;
        let closed = match &file.writer {
            Some(writer) => writer.close().await,
            None => Ok(()),
        };
        self.ctx
            .invalidator
            .invalidate(&file.path, PathKind::File)
            .await;
        closed
    }

    pub async fn mkdir(&self, raw: &str) -> FsResult<()> {
        let path = self.parse(raw);
        let info = self.ctx.resolver.resolve(&path).await?;
        if info.kind != PathKind::Invalid {
            return Err(FsError::already_exists(path.full()));
        }
        if path.depth() == 1 {
            self.ctx
                .store
                .create_container(path.container())
                .await
                .map_err(FsError::io("create_container", path.full()))?;
            self.ctx
                .invalidator
                .invalidate(&path, PathKind::Container)
                .await;
            info!(container = path.container(), "container created");
            return Ok(());
        }

        let exists = self
            .ctx
            .store
            .container_exists(path.container())
            .await
            .map_err(FsError::io("container_exists", path.full()))?;
        if !exists {
            return Err(FsError::not_found(format!("/{}", path.container())));
        }
        self.ensure_parent_dir(&path).await?;
        self.ctx
            .store
            .create_blob(&path.marker_ref(), BlobKind::Block, Bytes::new(), None)
            .await
            .map_err(FsError::io("create_marker", path.full()))?;
        self.ctx
            .invalidator
            .invalidate(&path, PathKind::VirtualDirectory)
            .await;
        debug!(path = path.full(), "directory created");
        Ok(())
    }

    pub async fn rmdir(&self, raw: &str) -> FsResult<()> {
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        match info.kind {
            PathKind::Container => {
                self.ctx
                    .store
                    .delete_container(path.container())
                    .await
                    .map_err(FsError::io("delete_container", path.full()))?;
                info!(container = path.container(), "container deleted");
            }
            PathKind::VirtualDirectory => {
                let outcome = self.ctx.transfer.delete_directory(&path).await?;
                self.ctx.invalidator.invalidate(&path, info.kind).await;
                return outcome.into_result("rmdir", path.full());
            }
            PathKind::Root => {
                return Err(FsError::PermissionDenied {
                    path: path.full().into(),
                });
            }
            _ => {
                return Err(FsError::NotADirectory {
                    path: path.full().into(),
                });
            }
        }
        self.ctx.invalidator.invalidate(&path, info.kind).await;
        Ok(())
    }

    pub async fn unlink(&self, raw: &str) -> FsResult<()> {
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        if info.kind.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.full().into(),
            });
        }
        self.ctx.transfer.delete_blob(&path.blob_ref(), None).await?;
        self.ctx.invalidator.invalidate(&path, info.kind).await;
        Ok(())
    }

    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let src = self.parse(from);
        let dst = self.parse(to);
        let info = self.resolve_existing(&src).await?;
        match info.kind {
            PathKind::Root | PathKind::Invalid => Err(FsError::NotADirectory {
                path: src.full().into(),
            }),
            PathKind::Container | PathKind::VirtualDirectory => {
                self.rename_directory(&src, info.kind, &dst).await
            }
            PathKind::File | PathKind::Symlink => {
                if dst.depth() < 2 {
                    return Err(FsError::PermissionDenied {
                        path: dst.full().into(),
                    });
                }
                let target = self.ctx.resolver.resolve(&dst).await?;
                if target.kind.is_dir() {
                    return Err(FsError::IsADirectory {
                        path: dst.full().into(),
                    });
                }
                if target.kind == PathKind::Invalid {
                    self.ensure_parent_dir(&dst).await?;
                }
                self.ctx
                    .transfer
                    .copy_or_move_blob(&src.blob_ref(), &dst.blob_ref(), CopyMode::Move)
                    .await?;
                self.ctx.invalidator.invalidate(&src, info.kind).await;
                self.ctx.invalidator.invalidate(&dst, info.kind).await;
                Ok(())
            }
        }
    }

    async fn rename_directory(&self, src: &FsPath, kind: PathKind, dst: &FsPath) -> FsResult<()> {
        if dst.full().starts_with(&format!("{}/", src.full())) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself",
                src.full()
            )));
        }
        let target = self.ctx.resolver.resolve(dst).await?;
        if target.kind != PathKind::Invalid {
            return Err(FsError::already_exists(dst.full()));
        }
        if dst.depth() == 1 {
            self.ctx
                .store
                .create_container(dst.container())
                .await
                .map_err(FsError::io("create_container", dst.full()))?;
        } else {
            self.ensure_parent_dir(dst).await?;
        }

        let outcome = self
            .ctx
            .transfer
            .copy_or_move_directory(src, dst, CopyMode::Move)
            .await?;
        if kind == PathKind::Container && outcome.is_complete() {
            self.ctx
                .store
                .delete_container(src.container())
                .await
                .map_err(FsError::io("delete_container", src.full()))?;
        }
        self.ctx.invalidator.invalidate(src, kind).await;
        let dst_kind = if dst.depth() == 1 {
            PathKind::Container
        } else {
            PathKind::VirtualDirectory
        };
        self.ctx.invalidator.invalidate(dst, dst_kind).await;
        outcome.into_result("rename", src.full())
    }

    pub async fn truncate(&self, raw: &str, size: u64) -> FsResult<()> {
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        if info.kind.is_dir() {
            return Err(FsError::IsADirectory {
                path: path.full().into(),
            });
        }
        self.ctx.transfer.resize(&path.blob_ref(), size).await?;
        self.ctx.invalidator.invalidate(&path, info.kind).await;
        Ok(())
    }

    /// Hard links are not supported by the store; accepted and ignored.
    pub async fn link(&self, _from: &str, _to: &str) -> FsResult<()> {
        Ok(())
    }

    /// Creates `link` as an object whose content is `target`.
    pub async fn symlink(&self, target: &str, link: &str) -> FsResult<()> {
        let path = self.parse(link);
        let info = self.ctx.resolver.resolve(&path).await?;
        if info.kind != PathKind::Invalid {
            return Err(FsError::already_exists(path.full()));
        }
        self.ensure_parent_dir(&path).await?;
        let blob = path.blob_ref();
        self.ctx
            .store
            .create_blob(
                &blob,
                BlobKind::Block,
                Bytes::copy_from_slice(target.as_bytes()),
                None,
            )
            .await
            .map_err(FsError::io("create_blob", path.full()))?;
        self.ctx
            .store
            .set_metadata(&blob, META_IS_LINK, "1", None)
            .await
            .map_err(FsError::io("set_metadata", path.full()))?;
        self.set_owner(&path).await?;
        self.ctx
            .invalidator
            .invalidate(&path, PathKind::Symlink)
            .await;
        Ok(())
    }

    pub async fn readlink(&self, raw: &str) -> FsResult<String> {
        let path = self.parse(raw);
        let info = self.resolve_existing(&path).await?;
        if info.kind != PathKind::Symlink {
            return Err(FsError::InvalidArgument(format!(
                "{} is not a symbolic link",
                path.full()
            )));
        }
        let blob = path.blob_ref();
        let props = self
            .ctx
            .store
            .blob_properties(&blob)
            .await
            .map_err(FsError::io("blob_properties", path.full()))?;
        let data = self
            .ctx
            .store
            .download_range(&blob, 0, props.length)
            .await
            .map_err(FsError::io("download_range", path.full()))?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    pub async fn setxattr(&self, _raw: &str, _name: &str, _value: &[u8]) -> FsResult<()> {
        Ok(())
    }

    pub async fn getxattr(&self, _raw: &str, _name: &str) -> FsResult<Vec<u8>> {
        Ok(Vec::new())
    }

    pub async fn removexattr(&self, _raw: &str, _name: &str) -> FsResult<()> {
        Ok(())
    }

    pub async fn utimens(&self, _raw: &str) -> FsResult<()> {
        Ok(())
    }

    pub async fn chmod(&self, _raw: &str, _mode: u32) -> FsResult<()> {
        Ok(())
    }

    pub async fn chown(&self, _raw: &str, _uid: u32, _gid: u32) -> FsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::cadapter::{BlobRef, InMemoryBlobStore, META_LEASE_ID};
    use crate::config::{BatchSettings, INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION};
    use std::time::Duration;

    fn quick_config() -> FsConfig {
        FsConfig::default().with_batch(BatchSettings {
            retries: 3,
            backoff: Duration::from_millis(1),
            copy_poll_interval: Duration::from_millis(1),
            copy_renew_every: 10,
        })
    }

    async fn service_with(config: FsConfig) -> (Arc<InMemoryBlobStore>, Arc<LocalBus>, FilesystemService) {
        let store = Arc::new(InMemoryBlobStore::new());
        store.create_container("c").await.unwrap();
        let bus = Arc::new(LocalBus::new());
        bus.subscribe(INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION);
        let ctx = FsContext::new(config, store.clone(), bus.clone());
        (store, bus, FilesystemService::new(ctx))
    }

    async fn service() -> (Arc<InMemoryBlobStore>, FilesystemService) {
        let (store, _, fs) = service_with(quick_config()).await;
        (store, fs)
    }

    async fn write_file(fs: &FilesystemService, path: &str, data: &[u8]) {
        let fh = fs.create(path, libc::O_WRONLY).await.unwrap();
        fs.write(fh, 0, data).await.unwrap();
        fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_mkdir_rules() {
        let (store, fs) = service().await;
        assert!(matches!(
            fs.mkdir("/nope/d").await,
            Err(FsError::NotFound { .. })
        ));
        fs.mkdir("/c/d").await.unwrap();
        assert!(store.blob_exists(&BlobRef::new("c", "d/$.$$")).await.unwrap());
        assert!(matches!(
            fs.mkdir("/c/d").await,
            Err(FsError::AlreadyExists { .. })
        ));
        assert!(matches!(
            fs.mkdir("/c").await,
            Err(FsError::AlreadyExists { .. })
        ));
        assert!(matches!(
            fs.mkdir("/c/x/y").await,
            Err(FsError::NotFound { .. })
        ));
        fs.mkdir("/k").await.unwrap();
        assert!(store.container_exists("k").await.unwrap());
        assert_eq!(fs.getattr("/c/d").await.unwrap().kind, FileType::Directory);
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let (store, fs) = service().await;
        write_file(&fs, "/c/hello.txt", b"hello world").await;
        let attr = fs.getattr("/c/hello.txt").await.unwrap();
        assert_eq!(attr.size, 11);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o444);
        let props = store
            .blob_properties(&BlobRef::new("c", "hello.txt"))
            .await
            .unwrap();
        assert_eq!(props.metadata_value(META_UID), Some("0"));
        assert!(props.metadata_value(META_LEASE_ID).is_none());

        let fh = fs.open("/c/hello.txt", libc::O_RDONLY).await.unwrap();
        assert_eq!(&fs.read(fh, 0, 5).await.unwrap()[..], b"hello");
        assert_eq!(&fs.read(fh, 5, 100).await.unwrap()[..], b" world");
        assert!(fs.read(fh, 11, 100).await.unwrap().is_empty());
        assert!(matches!(fs.write(fh, 0, b"x").await, Err(FsError::BadHandle(_))));
        fs.release(fh).await.unwrap();
        assert!(matches!(fs.release(fh).await, Err(FsError::BadHandle(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_handles_on_different_paths() {
        let (store, fs) = service().await;
        let fs = Arc::new(fs);
        let mut tasks = Vec::new();
        for i in 0..4u8 {
            let fs = fs.clone();
            tasks.push(tokio::spawn(async move {
                let path = format!("/c/p{i}");
                let data = vec![i; 10_000 + i as usize];
                let fh = fs.create(&path, libc::O_WRONLY).await.unwrap();
                for piece in data.chunks(777) {
                    fs.write(fh, 0, piece).await.unwrap();
                    tokio::task::yield_now().await;
                }
                fs.release(fh).await.unwrap();

                let fh = fs.open(&path, libc::O_RDONLY).await.unwrap();
                let mut read = Vec::new();
                loop {
                    let chunk = fs.read(fh, read.len() as u64, 1024).await.unwrap();
                    if chunk.is_empty() {
                        break;
                    }
                    read.extend_from_slice(&chunk);
                }
                fs.release(fh).await.unwrap();
                assert_eq!(read, data);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for i in 0..4u8 {
            let blob = BlobRef::new("c", format!("p{i}"));
            assert_eq!(store.contents(&blob).unwrap().len(), 10_000 + i as usize);
            assert!(store.lease_of(&blob).is_none());
        }
        assert!(fs.ctx.handles.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_interleaved_readers_share_slot() {
        let (_, fs) = service().await;
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        write_file(&fs, "/c/shared", &data).await;
        let fs = Arc::new(fs);
        let data = Arc::new(data);

        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(fs.open("/c/shared", libc::O_RDONLY).await.unwrap());
        }
        // 同一路径的只读句柄共用一个 reader
        assert_eq!(fs.ctx.invalidator.readers().len(), 1);

        let mut tasks = Vec::new();
        for (n, fh) in handles.iter().copied().enumerate() {
            let fs = fs.clone();
            let data = data.clone();
            tasks.push(tokio::spawn(async move {
                // 每个任务从不同位置开始，步长不同，迫使共享 reader 前后跳转
                let step = 1_000 + n as u64 * 700;
                let mut offset = n as u64 * 9_000;
                while offset < data.len() as u64 {
                    let chunk = fs.read(fh, offset, 500).await.unwrap();
                    let start = offset as usize;
                    let end = (start + 500).min(data.len());
                    assert_eq!(&chunk[..], &data[start..end]);
                    offset += step;
                    tokio::task::yield_now().await;
                }
                assert!(fs.read(fh, data.len() as u64, 10).await.unwrap().is_empty());
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        for fh in handles {
            fs.release(fh).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_release_refreshes_cached_size() {
        let (_, fs) = service().await;
        let fh = fs
            .create("/c/log", libc::O_WRONLY | libc::O_APPEND)
            .await
            .unwrap();
        assert_eq!(fs.getattr("/c/log").await.unwrap().size, 0);
        assert_eq!(fs.getattr("/c/log").await.unwrap().perm, 0o666);
        fs.write(fh, 0, b"line\r\n").await.unwrap();
        fs.release(fh).await.unwrap();
        assert_eq!(fs.getattr("/c/log").await.unwrap().size, 6);

        let fh = fs.open("/c/log", libc::O_WRONLY | libc::O_APPEND).await.unwrap();
        fs.write(fh, 6, b"more").await.unwrap();
        fs.fsync(fh).await.unwrap();
        assert_eq!(fs.getattr("/c/log").await.unwrap().size, 10);
        fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_open_flag_errors() {
        let (_, fs) = service().await;
        write_file(&fs, "/c/f", b"abc").await;
        assert!(matches!(
            fs.open("/c/f", libc::O_WRONLY | libc::O_RDWR).await,
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.open("/c/f", libc::O_WRONLY | libc::O_APPEND).await,
            Err(FsError::PermissionDenied { .. })
        ));
        assert!(matches!(
            fs.open("/c/missing", libc::O_RDONLY).await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.open("/c", libc::O_RDONLY).await,
            Err(FsError::IsADirectory { .. })
        ));
        assert!(matches!(
            fs.create("/c/f", libc::O_WRONLY | libc::O_EXCL).await,
            Err(FsError::AlreadyExists { .. })
        ));
        // 第二个写者拿不到租约
        let fh = fs.open("/c/f", libc::O_WRONLY).await.unwrap();
        assert!(matches!(
            fs.open("/c/f", libc::O_RDWR).await,
            Err(FsError::StaleOrMissingLease { .. })
        ));
        fs.release(fh).await.unwrap();
    }

    #[tokio::test]
    async fn test_append_open_converts_when_enabled() {
        let (store, _, fs) = service_with(quick_config().with_auto_convert_to_append(true)).await;
        write_file(&fs, "/c/f", b"abc").await;
        let fh = fs.open("/c/f", libc::O_WRONLY | libc::O_APPEND).await.unwrap();
        fs.write(fh, 3, b"def").await.unwrap();
        fs.release(fh).await.unwrap();
        let blob = BlobRef::new("c", "f");
        assert_eq!(store.contents(&blob).unwrap(), Bytes::from_static(b"abcdef"));
        assert_eq!(store.blob_properties(&blob).await.unwrap().kind, BlobKind::Append);
    }

    #[tokio::test]
    async fn test_handle_table_limit() {
        let (_, _, fs) = service_with(quick_config().with_handle_capacity(1)).await;
        write_file(&fs, "/c/a", b"1").await;
        let fh = fs.open("/c/a", libc::O_RDONLY).await.unwrap();
        assert!(matches!(
            fs.open("/c/a", libc::O_RDONLY).await,
            Err(FsError::TooManyOpenHandles)
        ));
        fs.release(fh).await.unwrap();
        let again = fs.open("/c/a", libc::O_RDONLY).await.unwrap();
        assert!(again > fh);
    }

    #[tokio::test]
    async fn test_rename_file_and_directory() {
        let (store, fs) = service().await;
        fs.mkdir("/c/d").await.unwrap();
        write_file(&fs, "/c/d/a", b"A").await;
        write_file(&fs, "/c/d/b", b"B").await;

        fs.rename("/c/d/a", "/c/d/a2").await.unwrap();
        assert!(matches!(fs.getattr("/c/d/a").await, Err(FsError::NotFound { .. })));
        assert_eq!(fs.getattr("/c/d/a2").await.unwrap().size, 1);

        fs.rename("/c/d", "/c/e").await.unwrap();
        assert!(matches!(fs.getattr("/c/d").await, Err(FsError::NotFound { .. })));
        assert_eq!(fs.getattr("/c/e").await.unwrap().kind, FileType::Directory);
        assert_eq!(store.contents(&BlobRef::new("c", "e/b")).unwrap(), Bytes::from_static(b"B"));

        fs.mkdir("/c/x").await.unwrap();
        assert!(matches!(
            fs.rename("/c/e", "/c/x").await,
            Err(FsError::AlreadyExists { .. })
        ));
        assert!(matches!(
            fs.rename("/c/nope", "/c/y").await,
            Err(FsError::NotFound { .. })
        ));
        assert!(matches!(
            fs.rename("/", "/z").await,
            Err(FsError::NotADirectory { .. })
        ));

        fs.rename("/c", "/k").await.unwrap();
        assert!(!store.container_exists("c").await.unwrap());
        assert_eq!(store.contents(&BlobRef::new("k", "e/a2")).unwrap(), Bytes::from_static(b"A"));
    }

    #[tokio::test]
    async fn test_unlink_rmdir() {
        let (store, fs) = service().await;
        fs.mkdir("/c/d").await.unwrap();
        write_file(&fs, "/c/d/a", b"A").await;
        assert!(matches!(fs.unlink("/c/d").await, Err(FsError::IsADirectory { .. })));
        assert!(matches!(fs.rmdir("/c/d/a").await, Err(FsError::NotADirectory { .. })));
        fs.unlink("/c/d/a").await.unwrap();
        assert!(matches!(fs.unlink("/c/d/a").await, Err(FsError::NotFound { .. })));

        write_file(&fs, "/c/d/b", b"B").await;
        store.fail_deletes_of(&BlobRef::new("c", "d/b"));
        let err = fs.rmdir("/c/d").await.unwrap_err();
        assert!(matches!(&err, FsError::BatchIncomplete { failed, .. } if failed == &vec!["/c/d/b".to_string()]));
        assert_eq!(err.errno(), libc::EIO);
        store.clear_faults();
        fs.rmdir("/c/d").await.unwrap();
        assert!(matches!(fs.getattr("/c/d").await, Err(FsError::NotFound { .. })));

        fs.rmdir("/c").await.unwrap();
        assert!(!store.container_exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_truncate_symlink_and_noops() {
        let (_, fs) = service().await;
        write_file(&fs, "/c/f", b"0123456789").await;
        fs.truncate("/c/f", 4).await.unwrap();
        assert_eq!(fs.getattr("/c/f").await.unwrap().size, 4);

        fs.symlink("/c/f", "/c/l").await.unwrap();
        let attr = fs.getattr("/c/l").await.unwrap();
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.size, 4);
        assert_eq!(fs.readlink("/c/l").await.unwrap(), "/c/f");
        assert!(matches!(
            fs.symlink("/c/f", "/c/l").await,
            Err(FsError::AlreadyExists { .. })
        ));
        assert!(matches!(fs.readlink("/c/f").await, Err(FsError::InvalidArgument(_))));

        fs.link("/c/f", "/c/h").await.unwrap();
        fs.chmod("/c/f", 0o600).await.unwrap();
        fs.chown("/c/f", 1, 1).await.unwrap();
        fs.utimens("/c/f").await.unwrap();
        fs.setxattr("/c/f", "user.a", b"1").await.unwrap();
        assert!(fs.getxattr("/c/f", "user.a").await.unwrap().is_empty());
        fs.removexattr("/c/f", "user.a").await.unwrap();
        assert!(matches!(fs.getattr("/c/h").await, Err(FsError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_cluster_mode_publishes_mount_paths() {
        let (_, bus, fs) = service_with(quick_config().with_cluster(true)).await;
        fs.mkdir("/c/d").await.unwrap();
        let mut seen = Vec::new();
        while let Some(msg) = bus.receive(INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION).await.unwrap() {
            seen.push(msg);
        }
        assert_eq!(seen, vec!["/c/d".to_string()]);
    }

    #[tokio::test]
    async fn test_readdir_lists_created_entries() {
        let (_, fs) = service().await;
        fs.mkdir("/c/d").await.unwrap();
        write_file(&fs, "/c/f", b"x").await;
        let names: Vec<String> = fs
            .readdir("/c")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec![".", "..", "d", "f"]);
    }
}
