use crate::bus::MessageBus;
use crate::cache::TtlCache;
use crate::config::INVALIDATION_TOPIC;
use crate::stream::ReadStream;
use crate::vfs::path::{FsPath, PathInfo, PathKind};
use std::sync::Arc;
use tracing::{debug, warn};

/// Drops stale attributes and reader slots for a path, locally and on every peer.
pub struct Invalidator {
    files: Arc<TtlCache<PathInfo>>,
    readers: Arc<TtlCache<Arc<ReadStream>>>,
    bus: Arc<dyn MessageBus>,
    cluster: bool,
}

impl Invalidator {
    pub fn new(
        files: Arc<TtlCache<PathInfo>>,
        readers: Arc<TtlCache<Arc<ReadStream>>>,
        bus: Arc<dyn MessageBus>,
        cluster: bool,
    ) -> Self {
        Self {
            files,
            readers,
            bus,
            cluster,
        }
    }

    /// Applies the rule for `kind` and, in cluster mode, publishes the mount-relative path.
    /// Publish failures are logged only.
    pub async fn invalidate(&self, path: &FsPath, kind: PathKind) {
        self.apply(path, kind);
        if !self.cluster {
            return;
        }
        if let Err(e) = self.bus.publish(INVALIDATION_TOPIC, path.mount_path()).await {
            warn!(path = path.mount_path(), error = %e, "failed to publish invalidation");
        }
    }

    /// Local half of the protocol: root clears everything, directories drop every key under
    /// them, files drop their own key. Invalid falls back to the directory rule since the
    /// path may have been a directory before it disappeared.
    pub fn apply(&self, path: &FsPath, kind: PathKind) {
        let key = path.full();
        match kind {
            PathKind::Root => {
                self.files.clear();
                self.readers.clear();
            }
            PathKind::Container | PathKind::VirtualDirectory | PathKind::Invalid => {
                let files = self.files.delete_prefix(key);
                let readers = self.readers.delete_prefix(key);
                debug!(path = key, files, readers, "invalidated prefix");
            }
            PathKind::File | PathKind::Symlink => {
                self.files.delete(key);
                self.readers.delete(key);
            }
        }
    }

    pub fn files(&self) -> &Arc<TtlCache<PathInfo>> {
        &self.files
    }

    pub fn readers(&self) -> &Arc<TtlCache<Arc<ReadStream>>> {
        &self.readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;
    use crate::config::DEFAULT_SUBSCRIPTION;

    fn info(kind: PathKind) -> PathInfo {
        let mut info = PathInfo::invalid("x");
        info.kind = kind;
        info
    }

    fn fixture(cluster: bool) -> (Arc<LocalBus>, Invalidator) {
        let bus = Arc::new(LocalBus::new());
        bus.subscribe(INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION);
        let files = Arc::new(TtlCache::new("files", 32, None));
        for key in ["/", "/c", "/c/d", "/c/d/a", "/c/d/b", "/c/e", "/k/d"] {
            files.put(key, info(PathKind::File)).unwrap();
        }
        let readers = Arc::new(TtlCache::new("readers", 8, None));
        let inv = Invalidator::new(files, readers, bus.clone(), cluster);
        (bus, inv)
    }

    #[tokio::test]
    async fn test_rules_by_kind() {
        let (_, inv) = fixture(false);
        inv.invalidate(&FsPath::new("", "/c/e"), PathKind::File).await;
        assert!(!inv.files().has("/c/e"));
        assert!(inv.files().has("/c/d"));

        inv.invalidate(&FsPath::new("", "/c/d"), PathKind::VirtualDirectory)
            .await;
        assert!(!inv.files().has("/c/d/a"));
        assert!(!inv.files().has("/c/d"));
        assert!(inv.files().has("/c"));
        assert!(inv.files().has("/k/d"));

        inv.invalidate(&FsPath::new("", "/"), PathKind::Root).await;
        assert!(inv.files().is_empty());
    }

    #[tokio::test]
    async fn test_publishes_mount_path_in_cluster_mode() {
        let (bus, inv) = fixture(true);
        inv.invalidate(&FsPath::new("/c", "/d/a"), PathKind::File).await;
        assert!(!inv.files().has("/c/d/a"));
        assert_eq!(
            bus.receive(INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION)
                .await
                .unwrap()
                .as_deref(),
            Some("/d/a")
        );

        let (bus, inv) = fixture(false);
        inv.invalidate(&FsPath::new("", "/c/e"), PathKind::File).await;
        assert_eq!(
            bus.receive(INVALIDATION_TOPIC, DEFAULT_SUBSCRIPTION)
                .await
                .unwrap(),
            None
        );
    }
}
