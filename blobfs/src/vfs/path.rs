//! 路径解析：把挂载点内的路径映射为 container + key，并判定其类型。

use crate::cache::TtlCache;
use crate::cadapter::{BlobKind, BlobRef, BlobStore};
use crate::error::{FsError, FsResult};
use bytes::Bytes;
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

/// Zero-byte object that keeps an otherwise empty virtual directory alive.
pub const DIR_MARKER: &str = "$.$$";

/// A normalized path, both as seen through the mount (`mount`) and with the configured
/// prefix applied (`full`). `full` is what maps onto container and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPath {
    mount: String,
    full: String,
}

fn norm_path(p: &str) -> String {
    let parts: Vec<&str> = p.split('/').filter(|s| !s.is_empty()).collect();
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}

fn split_dir_file(path: &str) -> (&str, &str) {
    let n = path.rfind('/').unwrap_or(0);
    if n == 0 {
        ("/", &path[1..])
    } else {
        (&path[..n], &path[n + 1..])
    }
}

impl FsPath {
    pub fn new(prefix: &str, raw: &str) -> Self {
        let mount = norm_path(raw);
        let full = norm_path(&format!("{prefix}/{mount}"));
        Self { mount, full }
    }

    /// Path relative to the mount point, as published to peers.
    pub fn mount_path(&self) -> &str {
        &self.mount
    }

    /// Path with the prefix applied; used as the cache key.
    pub fn full(&self) -> &str {
        &self.full
    }

    pub fn is_root(&self) -> bool {
        self.full == "/"
    }

    pub fn container(&self) -> &str {
        self.full[1..].split('/').next().unwrap_or("")
    }

    /// Object key inside the container; empty for the root and for a bare container.
    pub fn key(&self) -> &str {
        match self.full[1..].find('/') {
            Some(i) => &self.full[i + 2..],
            None => "",
        }
    }

    /// Number of segments of the full path: 0 for the root, 1 for a container.
    pub fn depth(&self) -> usize {
        self.full.split('/').filter(|s| !s.is_empty()).count()
    }

    /// Last segment, `/` for the root.
    pub fn name(&self) -> &str {
        if self.is_root() {
            return "/";
        }
        split_dir_file(&self.full).1
    }

    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        Some(FsPath {
            mount: split_dir_file(&self.mount).0.to_string(),
            full: split_dir_file(&self.full).0.to_string(),
        })
    }

    pub fn child(&self, name: &str) -> FsPath {
        FsPath {
            mount: norm_path(&format!("{}/{name}", self.mount)),
            full: norm_path(&format!("{}/{name}", self.full)),
        }
    }

    pub fn blob_ref(&self) -> BlobRef {
        BlobRef::new(self.container(), self.key())
    }

    /// Key prefix of everything below this path inside its container.
    pub fn dir_prefix(&self) -> String {
        if self.key().is_empty() {
            String::new()
        } else {
            format!("{}/", self.key())
        }
    }

    pub fn marker_ref(&self) -> BlobRef {
        BlobRef::new(self.container(), format!("{}{DIR_MARKER}", self.dir_prefix()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    Root,
    Container,
    VirtualDirectory,
    File,
    Symlink,
    Invalid,
}

impl PathKind {
    pub fn is_dir(&self) -> bool {
        matches!(
            self,
            PathKind::Root | PathKind::Container | PathKind::VirtualDirectory
        )
    }
}

/// Resolved attributes of a path; only ever lives in the files cache.
#[derive(Debug, Clone)]
pub struct PathInfo {
    pub kind: PathKind,
    pub name: String,
    pub created: SystemTime,
    pub modified: SystemTime,
    /// Byte size for files, target length for symlinks, 0 otherwise.
    pub size: u64,
    pub blob_kind: Option<BlobKind>,
}

impl PathInfo {
    fn dir(kind: PathKind, name: &str, created: SystemTime, modified: SystemTime) -> Self {
        Self {
            kind,
            name: name.to_string(),
            created,
            modified,
            size: 0,
            blob_kind: None,
        }
    }

    pub fn invalid(name: &str) -> Self {
        Self::dir(PathKind::Invalid, name, SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Classifies paths against the blob store, reading through the files cache.
pub struct PathResolver {
    store: Arc<dyn BlobStore>,
    prefix: String,
    cache: Arc<TtlCache<PathInfo>>,
}

impl PathResolver {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str, cache: Arc<TtlCache<PathInfo>>) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            cache,
        }
    }

    pub fn parse(&self, raw: &str) -> FsPath {
        FsPath::new(&self.prefix, raw)
    }

    pub fn cache(&self) -> &Arc<TtlCache<PathInfo>> {
        &self.cache
    }

    /// Cached classification. Invalid results are never cached.
    pub async fn resolve(&self, path: &FsPath) -> FsResult<PathInfo> {
        if let Some(info) = self.cache.get(path.full()) {
            trace!(path = path.full(), "attribute cache hit");
            return Ok(info);
        }
        let info = self.classify(path).await?;
        if info.kind != PathKind::Invalid {
            if let Err(e) = self.cache.put(path.full(), info.clone()) {
                debug!(path = path.full(), error = %e, "attribute not cached");
            }
        }
        Ok(info)
    }

    /// Uncached classification straight from the blob store.
    pub async fn classify(&self, path: &FsPath) -> FsResult<PathInfo> {
        let name = path.name();
        if path.is_root() {
            let now = SystemTime::now();
            return Ok(PathInfo::dir(PathKind::Root, name, now, now));
        }
        let container = path.container();
        if path.key().is_empty() {
            let exists = self
                .store
                .container_exists(container)
                .await
                .map_err(FsError::io("container_exists", path.full()))?;
            if !exists {
                return Ok(PathInfo::invalid(name));
            }
            let props = self
                .store
                .container_properties(container)
                .await
                .map_err(FsError::io("container_properties", path.full()))?;
            return Ok(PathInfo::dir(
                PathKind::Container,
                name,
                props.created,
                props.modified,
            ));
        }

        // 容器不存在时其下的任何 key 都无效
        let container_exists = self
            .store
            .container_exists(container)
            .await
            .map_err(FsError::io("container_exists", path.full()))?;
        if !container_exists {
            return Ok(PathInfo::invalid(name));
        }

        let blob = path.blob_ref();
        let exists = self
            .store
            .blob_exists(&blob)
            .await
            .map_err(FsError::io("blob_exists", path.full()))?;
        if exists {
            let props = self
                .store
                .blob_properties(&blob)
                .await
                .map_err(FsError::io("blob_properties", path.full()))?;
            let kind = if props.is_link() {
                PathKind::Symlink
            } else {
                PathKind::File
            };
            return Ok(PathInfo {
                kind,
                name: name.to_string(),
                created: props.created,
                modified: props.modified,
                size: props.length,
                blob_kind: Some(props.kind),
            });
        }

        if !self.virtual_dir_exists(path).await? {
            return Ok(PathInfo::invalid(name));
        }
        let marker = path.marker_ref();
        let has_marker = self
            .store
            .blob_exists(&marker)
            .await
            .map_err(FsError::io("blob_exists", path.full()))?;
        if !has_marker {
            self.store
                .create_blob(&marker, BlobKind::Block, Bytes::new(), None)
                .await
                .map_err(FsError::io("create_marker", path.full()))?;
        }
        let props = self
            .store
            .blob_properties(&marker)
            .await
            .map_err(FsError::io("blob_properties", path.full()))?;
        Ok(PathInfo::dir(
            PathKind::VirtualDirectory,
            name,
            props.created,
            props.modified,
        ))
    }

    /// True when at least one object lives under `key/`.
    pub async fn virtual_dir_exists(&self, path: &FsPath) -> FsResult<bool> {
        let items = self
            .store
            .list_blobs(path.container(), &path.dir_prefix(), false)
            .await
            .map_err(FsError::io("list_blobs", path.full()))?;
        Ok(items.iter().any(|i| !i.is_prefix))
    }

    /// One level of entries below a directory, `.` and `..` first.
    pub async fn readdir(&self, path: &FsPath) -> FsResult<Vec<DirEntry>> {
        let info = self.resolve(path).await?;
        let mut entries = vec![
            DirEntry {
                name: ".".into(),
                is_dir: true,
            },
            DirEntry {
                name: "..".into(),
                is_dir: true,
            },
        ];
        match info.kind {
            PathKind::Root => {
                let containers = self
                    .store
                    .list_containers()
                    .await
                    .map_err(FsError::io("list_containers", path.full()))?;
                entries.extend(containers.into_iter().map(|name| DirEntry { name, is_dir: true }));
            }
            PathKind::Container | PathKind::VirtualDirectory => {
                let prefix = path.dir_prefix();
                let items = self
                    .store
                    .list_blobs(path.container(), &prefix, true)
                    .await
                    .map_err(FsError::io("list_blobs", path.full()))?;
                for item in items {
                    if item.name.ends_with(DIR_MARKER) {
                        continue;
                    }
                    let rest = item.name[prefix.len()..].trim_end_matches('/');
                    if rest.is_empty() {
                        continue;
                    }
                    entries.push(DirEntry {
                        name: rest.to_string(),
                        is_dir: item.is_prefix,
                    });
                }
            }
            PathKind::File | PathKind::Symlink => {
                return Err(FsError::NotADirectory {
                    path: path.full().into(),
                });
            }
            PathKind::Invalid => return Err(FsError::not_found(path.full())),
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::{InMemoryBlobStore, META_IS_LINK};
    use std::time::Duration;

    #[test]
    fn test_path_split() {
        let p = FsPath::new("", "//c//dir/file.txt");
        assert_eq!(p.full(), "/c/dir/file.txt");
        assert_eq!(p.container(), "c");
        assert_eq!(p.key(), "dir/file.txt");
        assert_eq!(p.name(), "file.txt");
        assert_eq!(p.depth(), 3);
        assert_eq!(p.parent().unwrap().full(), "/c/dir");
        assert_eq!(p.marker_ref().key, "dir/file.txt/$.$$");

        let c = FsPath::new("", "/c");
        assert_eq!(c.key(), "");
        assert_eq!(c.depth(), 1);
        assert_eq!(c.parent().unwrap().full(), "/");
        assert!(FsPath::new("", "/").is_root());
        assert_eq!(FsPath::new("", "").full(), "/");
    }

    #[test]
    fn test_prefix_applies_to_full_path_only() {
        let p = FsPath::new("/tenant/", "/dir/a");
        assert_eq!(p.mount_path(), "/dir/a");
        assert_eq!(p.full(), "/tenant/dir/a");
        assert_eq!(p.container(), "tenant");
        assert_eq!(p.child("b").full(), "/tenant/dir/a/b");
        assert_eq!(p.parent().unwrap().mount_path(), "/dir");
    }

    async fn fixture() -> (Arc<InMemoryBlobStore>, PathResolver) {
        let store = Arc::new(InMemoryBlobStore::new());
        store.create_container("c").await.unwrap();
        let cache = Arc::new(TtlCache::new("files", 64, Some(Duration::from_secs(60))));
        let resolver = PathResolver::new(store.clone(), "", cache);
        (store, resolver)
    }

    #[tokio::test]
    async fn test_classification() {
        let (store, resolver) = fixture().await;
        store
            .create_blob(
                &BlobRef::new("c", "f"),
                BlobKind::Append,
                Bytes::from_static(b"12345"),
                None,
            )
            .await
            .unwrap();
        store
            .create_blob(
                &BlobRef::new("c", "l"),
                BlobKind::Block,
                Bytes::from_static(b"/c/f"),
                None,
            )
            .await
            .unwrap();
        store
            .set_metadata(&BlobRef::new("c", "l"), META_IS_LINK, "1", None)
            .await
            .unwrap();
        store
            .create_blob(&BlobRef::new("c", "d/x"), BlobKind::Block, Bytes::new(), None)
            .await
            .unwrap();

        let kind = |p: &str| {
            let path = resolver.parse(p);
            let resolver = &resolver;
            async move { resolver.classify(&path).await.unwrap() }
        };
        assert_eq!(kind("/").await.kind, PathKind::Root);
        assert_eq!(kind("/c").await.kind, PathKind::Container);
        assert_eq!(kind("/nope").await.kind, PathKind::Invalid);
        let f = kind("/c/f").await;
        assert_eq!(f.kind, PathKind::File);
        assert_eq!(f.size, 5);
        assert_eq!(f.blob_kind, Some(BlobKind::Append));
        assert_eq!(kind("/c/l").await.kind, PathKind::Symlink);
        assert_eq!(kind("/c/missing").await.kind, PathKind::Invalid);

        // 虚拟目录首次解析时补建目录标记
        assert!(!store.blob_exists(&BlobRef::new("c", "d/$.$$")).await.unwrap());
        assert_eq!(kind("/c/d").await.kind, PathKind::VirtualDirectory);
        assert!(store.blob_exists(&BlobRef::new("c", "d/$.$$")).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_container_is_invalid() {
        let (_store, resolver) = fixture().await;
        let info = resolver.classify(&resolver.parse("/nope/d")).await.unwrap();
        assert_eq!(info.kind, PathKind::Invalid);
        let info = resolver.resolve(&resolver.parse("/nope/a/b")).await.unwrap();
        assert_eq!(info.kind, PathKind::Invalid);
        assert_eq!(
            resolver.classify(&resolver.parse("/nope")).await.unwrap().kind,
            PathKind::Invalid
        );
    }

    #[tokio::test]
    async fn test_resolve_reads_through_cache() {
        let (store, resolver) = fixture().await;
        let f = BlobRef::new("c", "f");
        store
            .create_blob(&f, BlobKind::Block, Bytes::from_static(b"abc"), None)
            .await
            .unwrap();
        let path = resolver.parse("/c/f");
        assert_eq!(resolver.resolve(&path).await.unwrap().size, 3);
        store.delete_blob(&f, None).await.unwrap();
        // 缓存命中，仍返回旧属性
        assert_eq!(resolver.resolve(&path).await.unwrap().kind, PathKind::File);
        resolver.cache().delete(path.full());
        assert_eq!(resolver.resolve(&path).await.unwrap().kind, PathKind::Invalid);
        assert!(!resolver.cache().has(path.full()));
    }

    #[tokio::test]
    async fn test_readdir_one_level() {
        let (store, resolver) = fixture().await;
        for key in ["a.txt", "d/$.$$", "d/b.txt", "d/sub/c.txt"] {
            store
                .create_blob(&BlobRef::new("c", key), BlobKind::Block, Bytes::new(), None)
                .await
                .unwrap();
        }
        let names = |entries: Vec<DirEntry>| -> Vec<(String, bool)> {
            entries.into_iter().map(|e| (e.name, e.is_dir)).collect()
        };
        let root = names(resolver.readdir(&resolver.parse("/")).await.unwrap());
        assert_eq!(root[2], ("c".to_string(), true));

        let c = names(resolver.readdir(&resolver.parse("/c")).await.unwrap());
        assert_eq!(
            c,
            vec![
                (".".to_string(), true),
                ("..".to_string(), true),
                ("a.txt".to_string(), false),
                ("d".to_string(), true)
            ]
        );
        let d = names(resolver.readdir(&resolver.parse("/c/d")).await.unwrap());
        assert_eq!(&d[2..], &[("b.txt".to_string(), false), ("sub".to_string(), true)]);

        assert!(matches!(
            resolver.readdir(&resolver.parse("/c/a.txt")).await,
            Err(FsError::NotADirectory { .. })
        ));
        assert!(matches!(
            resolver.readdir(&resolver.parse("/c/zzz")).await,
            Err(FsError::NotFound { .. })
        ));
    }
}
