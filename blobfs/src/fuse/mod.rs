//! FUSE adapter
//!
//! Exposes a `FilesystemService` to the kernel through rfuse3's raw `Filesystem` trait.
//!
//! Main components:
//! - `inode`: stable inode numbers for mount paths, since the store only knows paths.
//! - `mount`: mounting helpers over rfuse3 sessions.
//! - `BlobFuse`: translates inode-addressed requests into path operations and maps `FsError`
//!   onto errno values.
pub mod inode;
pub mod mount;

use crate::error::FsError;
use crate::vfs::{FileAttr as VfsFileAttr, FileType as VfsFileType, FilesystemService};
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use inode::{InodeTable, ROOT_INO};
use rfuse3::Errno;
use rfuse3::Result as FuseResult;
use rfuse3::raw::Filesystem;
use rfuse3::raw::Request;
use rfuse3::raw::reply::{
    DirectoryEntry, DirectoryEntryPlus, ReplyAttr, ReplyCreated, ReplyData, ReplyDirectory,
    ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs, ReplyWrite, ReplyXAttr,
};
use rfuse3::{FileType as FuseFileType, SetAttr, Timestamp};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

const TTL: Duration = Duration::from_secs(1);
const NAME_MAX: usize = 255;
const MAX_WRITE: NonZeroU32 = match NonZeroU32::new(1024 * 1024) {
    Some(v) => v,
    None => NonZeroU32::MIN,
};

impl From<FsError> for Errno {
    fn from(val: FsError) -> Self {
        let code = val.errno();
        if code == libc::EIO {
            warn!(error = %val, "fuse request failed");
        } else {
            debug!(error = %val, errno = code, "fuse request rejected");
        }
        Errno::from(code)
    }
}

/// The mounted filesystem: path-based service plus the inode table the kernel needs.
pub struct BlobFuse {
    service: FilesystemService,
    inodes: InodeTable,
}

impl BlobFuse {
    pub fn new(service: FilesystemService) -> Self {
        Self {
            service,
            inodes: InodeTable::new(),
        }
    }

    pub fn service(&self) -> &FilesystemService {
        &self.service
    }

    fn path_of(&self, ino: u64) -> FuseResult<String> {
        self.inodes
            .path_of(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> FuseResult<String> {
        let name = name.to_string_lossy();
        if name.is_empty() || name.contains('/') {
            return Err(libc::EINVAL.into());
        }
        if name.len() > NAME_MAX {
            return Err(libc::ENAMETOOLONG.into());
        }
        let mut path = self.path_of(parent)?;
        if path != "/" {
            path.push('/');
        }
        path.push_str(&name);
        Ok(path)
    }

    /// getattr + inode allocation for a path that is known to exist.
    async fn entry_of(&self, path: &str) -> FuseResult<ReplyEntry> {
        let vattr = self.service.getattr(path).await?;
        let ino = self.inodes.ino_of(path);
        Ok(ReplyEntry {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &vattr),
            generation: 0,
        })
    }

    /// Children of a directory without `.`/`..`, with their inode numbers.
    async fn children(&self, ino: u64) -> FuseResult<(String, Vec<(u64, String, bool)>)> {
        let path = self.path_of(ino)?;
        let entries = self.service.readdir(&path).await?;
        let base = if path == "/" { String::new() } else { path.clone() };
        let children = entries
            .into_iter()
            .filter(|e| e.name != "." && e.name != "..")
            .map(|e| {
                let child = format!("{base}/{}", e.name);
                (self.inodes.ino_of(&child), e.name, e.is_dir)
            })
            .collect();
        Ok((path, children))
    }

    fn parent_ino(&self, path: &str) -> u64 {
        match path.rfind('/') {
            Some(0) | None => ROOT_INO,
            Some(n) => self.inodes.ino_of(&path[..n]),
        }
    }
}

impl Filesystem for BlobFuse {
    // GAT：目录条目流（readdir）
    type DirEntryStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntry>> + Send + 'a>>
    where
        Self: 'a;

    // GAT：目录条目（plus）流（readdirplus）
    type DirEntryPlusStream<'a>
        = Pin<Box<dyn Stream<Item = FuseResult<DirectoryEntryPlus>> + Send + 'a>>
    where
        Self: 'a;

    async fn init(&self, _req: Request) -> FuseResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: MAX_WRITE,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.entry_of(&path).await
    }

    async fn forget(&self, _req: Request, _inode: u64, _nlookup: u64) {}

    async fn batch_forget(&self, _req: Request, _inodes: &[(u64, u64)]) {}

    async fn getattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        let vattr = self.service.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &vattr),
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        ino: u64,
        _fh: Option<u64>,
        set_attr: SetAttr,
    ) -> FuseResult<ReplyAttr> {
        let path = self.path_of(ino)?;
        if let Some(size) = set_attr.size {
            self.service.truncate(&path, size).await?;
        }
        if let Some(mode) = set_attr.mode {
            self.service.chmod(&path, mode).await?;
        }
        if set_attr.uid.is_some() || set_attr.gid.is_some() {
            self.service
                .chown(
                    &path,
                    set_attr.uid.unwrap_or(u32::MAX),
                    set_attr.gid.unwrap_or(u32::MAX),
                )
                .await?;
        }
        if set_attr.atime.is_some() || set_attr.mtime.is_some() {
            self.service.utimens(&path).await?;
        }
        let vattr = self.service.getattr(&path).await?;
        Ok(ReplyAttr {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &vattr),
        })
    }

    async fn readlink(&self, _req: Request, ino: u64) -> FuseResult<ReplyData> {
        let path = self.path_of(ino)?;
        let target = self.service.readlink(&path).await?;
        Ok(ReplyData {
            data: Bytes::from(target.into_bytes()),
        })
    }

    async fn symlink(
        &self,
        req: Request,
        parent: u64,
        name: &OsStr,
        link: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        let target = link.to_string_lossy();
        debug!(unique = req.unique, path, target = %target, "fuse.symlink");
        self.service.symlink(&target, &path).await?;
        self.entry_of(&path).await
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
    ) -> FuseResult<ReplyEntry> {
        let path = self.child_path(parent, name)?;
        self.service.mkdir(&path).await?;
        self.entry_of(&path).await
    }

    async fn unlink(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.service.unlink(&path).await?;
        self.inodes.forget(&path);
        Ok(())
    }

    async fn rmdir(&self, _req: Request, parent: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.child_path(parent, name)?;
        self.service.rmdir(&path).await?;
        self.inodes.forget(&path);
        Ok(())
    }

    async fn rename(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<()> {
        let from = self.child_path(parent, name)?;
        let to = self.child_path(new_parent, new_name)?;
        self.service.rename(&from, &to).await?;
        self.inodes.rename(&from, &to);
        Ok(())
    }

    // 对象存储没有硬链接：服务层接受并忽略，这里回复源文件的属性
    async fn link(
        &self,
        _req: Request,
        ino: u64,
        new_parent: u64,
        new_name: &OsStr,
    ) -> FuseResult<ReplyEntry> {
        let from = self.path_of(ino)?;
        let to = self.child_path(new_parent, new_name)?;
        self.service.link(&from, &to).await?;
        let vattr = self.service.getattr(&from).await?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &vattr),
            generation: 0,
        })
    }

    async fn open(&self, _req: Request, ino: u64, flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let fh = self.service.open(&path, flags as i32).await?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> FuseResult<ReplyData> {
        let data = self.service.read(fh, offset, size).await?;
        Ok(ReplyData { data })
    }

    async fn write(
        &self,
        _req: Request,
        _ino: u64,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> FuseResult<ReplyWrite> {
        let written = self.service.write(fh, offset, data).await?;
        Ok(ReplyWrite { written })
    }

    async fn statfs(&self, _req: Request, _ino: u64) -> FuseResult<ReplyStatFs> {
        // 对象存储没有容量概念，返回保守常量
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: 0,
            ffree: u64::MAX,
            bsize: 4096,
            namelen: NAME_MAX as u32,
            frsize: 4096,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FuseResult<()> {
        self.service.release(fh).await.map_err(Errno::from)
    }

    async fn fsync(&self, _req: Request, _inode: u64, fh: u64, _datasync: bool) -> FuseResult<()> {
        self.service.fsync(fh).await.map_err(Errno::from)
    }

    async fn setxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        value: &[u8],
        _flags: u32,
        position: u32,
    ) -> FuseResult<()> {
        if position != 0 {
            return Err(libc::EINVAL.into());
        }
        let path = self.path_of(inode)?;
        self.service
            .setxattr(&path, &name.to_string_lossy(), value)
            .await
            .map_err(Errno::from)
    }

    async fn getxattr(
        &self,
        _req: Request,
        inode: u64,
        name: &OsStr,
        size: u32,
    ) -> FuseResult<ReplyXAttr> {
        let path = self.path_of(inode)?;
        let value = self
            .service
            .getxattr(&path, &name.to_string_lossy())
            .await?;
        if size == 0 {
            return Ok(ReplyXAttr::Size(value.len() as u32));
        }
        if (size as usize) < value.len() {
            return Err(libc::ERANGE.into());
        }
        Ok(ReplyXAttr::Data(Bytes::from(value)))
    }

    async fn removexattr(&self, _req: Request, inode: u64, name: &OsStr) -> FuseResult<()> {
        let path = self.path_of(inode)?;
        self.service
            .removexattr(&path, &name.to_string_lossy())
            .await
            .map_err(Errno::from)
    }

    async fn flush(&self, _req: Request, _inode: u64, fh: u64, _lock_owner: u64) -> FuseResult<()> {
        self.service.flush(fh).await.map_err(Errno::from)
    }

    async fn opendir(&self, _req: Request, ino: u64, _flags: u32) -> FuseResult<ReplyOpen> {
        let path = self.path_of(ino)?;
        let vattr = self.service.getattr(&path).await?;
        if vattr.kind != VfsFileType::Directory {
            return Err(libc::ENOTDIR.into());
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: i64,
    ) -> FuseResult<ReplyDirectory<Self::DirEntryStream<'a>>> {
        let (path, children) = self.children(ino).await?;

        // offset 为上一个 entry 的偏移，从 offset+1 开始输出
        let mut all: Vec<DirectoryEntry> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntry {
            inode: ino,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
        });
        all.push(DirectoryEntry {
            inode: self.parent_ino(&path),
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
        });
        for (i, (child_ino, name, is_dir)) in children.into_iter().enumerate() {
            all.push(DirectoryEntry {
                inode: child_ino,
                kind: if is_dir {
                    FuseFileType::Directory
                } else {
                    FuseFileType::RegularFile
                },
                name: OsString::from(name),
                offset: (i as i64) + 3,
            });
        }

        let start = if offset <= 0 { 0 } else { offset as usize };
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all.split_off(start)
        };
        let boxed: Self::DirEntryStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectory { entries: boxed })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> FuseResult<()> {
        Ok(())
    }

    async fn fsyncdir(&self, _req: Request, _inode: u64, _fh: u64, _datasync: bool) -> FuseResult<()> {
        Ok(())
    }

    async fn create(
        &self,
        _req: Request,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        flags: u32,
    ) -> FuseResult<ReplyCreated> {
        let path = self.child_path(parent, name)?;
        let fh = self.service.create(&path, flags as i32).await?;
        let vattr = self.service.getattr(&path).await?;
        let ino = self.inodes.ino_of(&path);
        Ok(ReplyCreated {
            ttl: TTL,
            attr: vfs_to_fuse_attr(ino, &vattr),
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn interrupt(&self, _req: Request, _unique: u64) -> FuseResult<()> {
        Ok(())
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        ino: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FuseResult<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
        let (path, children) = self.children(ino).await?;
        let dir_attr = self.service.getattr(&path).await?;
        let parent_ino = self.parent_ino(&path);
        let parent_path = self.inodes.path_of(parent_ino).unwrap_or_else(|| "/".into());
        let parent_attr = self.service.getattr(&parent_path).await?;

        let mut all: Vec<DirectoryEntryPlus> = Vec::with_capacity(children.len() + 2);
        all.push(DirectoryEntryPlus {
            inode: ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from("."),
            offset: 1,
            attr: vfs_to_fuse_attr(ino, &dir_attr),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        all.push(DirectoryEntryPlus {
            inode: parent_ino,
            generation: 0,
            kind: FuseFileType::Directory,
            name: OsString::from(".."),
            offset: 2,
            attr: vfs_to_fuse_attr(parent_ino, &parent_attr),
            entry_ttl: TTL,
            attr_ttl: TTL,
        });
        let base = if path == "/" { "" } else { path.as_str() };
        for (i, (child_ino, name, _)) in children.into_iter().enumerate() {
            // 列举与 stat 之间被删掉的条目直接跳过
            let Ok(cattr) = self.service.getattr(&format!("{base}/{name}")).await else {
                continue;
            };
            all.push(DirectoryEntryPlus {
                inode: child_ino,
                generation: 0,
                kind: vfs_kind_to_fuse(cattr.kind),
                name: OsString::from(name),
                offset: (i as i64) + 3,
                attr: vfs_to_fuse_attr(child_ino, &cattr),
                entry_ttl: TTL,
                attr_ttl: TTL,
            });
        }

        let start = offset as usize;
        let slice = if start >= all.len() {
            Vec::new()
        } else {
            all.split_off(start)
        };
        let boxed: Self::DirEntryPlusStream<'a> = Box::pin(stream::iter(slice.into_iter().map(Ok)));
        Ok(ReplyDirectoryPlus { entries: boxed })
    }
}

// =============== helpers ===============
fn vfs_kind_to_fuse(k: VfsFileType) -> FuseFileType {
    match k {
        VfsFileType::Directory => FuseFileType::Directory,
        VfsFileType::RegularFile => FuseFileType::RegularFile,
        VfsFileType::Symlink => FuseFileType::Symlink,
    }
}

fn vfs_to_fuse_attr(ino: u64, v: &VfsFileAttr) -> rfuse3::raw::reply::FileAttr {
    rfuse3::raw::reply::FileAttr {
        ino,
        size: v.size,
        blocks: v.blocks,
        atime: Timestamp::from(v.atime),
        mtime: Timestamp::from(v.mtime),
        ctime: Timestamp::from(v.ctime),
        #[cfg(target_os = "macos")]
        crtime: Timestamp::from(v.crtime),
        kind: vfs_kind_to_fuse(v.kind),
        perm: v.perm,
        nlink: v.nlink,
        uid: v.uid,
        gid: v.gid,
        rdev: 0,
        #[cfg(target_os = "macos")]
        flags: 0,
        blksize: 4096,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    #[test]
    fn test_attr_conversion() {
        let now = SystemTime::now();
        let v = VfsFileAttr {
            kind: VfsFileType::Symlink,
            size: 1025,
            blocks: 3,
            perm: 0o755,
            nlink: 1,
            uid: 7,
            gid: 8,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
        };
        let attr = vfs_to_fuse_attr(42, &v);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.perm, 0o755);
        assert_eq!((attr.uid, attr.gid), (7, 8));
        assert!(matches!(attr.kind, FuseFileType::Symlink));
    }

    #[test]
    fn test_errno_from_fs_error() {
        let e: Errno = FsError::not_found("/c/x").into();
        assert_eq!(e, Errno::from(libc::ENOENT));
        let e: Errno = FsError::TooManyOpenHandles.into();
        assert_eq!(e, Errno::from(libc::EMFILE));
    }
}
