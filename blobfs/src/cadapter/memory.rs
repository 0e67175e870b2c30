//! 内存版 BlobStore：本地开发与测试使用。
//!
//! Mirrors the lease, block-list and copy semantics of a real object store closely enough
//! for the streams and batch operations to be exercised without a network. Fault injection
//! hooks let tests force copy or delete failures for chosen objects.

use super::{
    BlobItem, BlobKind, BlobProperties, BlobRef, BlobStore, ContainerProperties, CopyStatus,
    StoreResult,
};
use crate::error::{PathHint, StoreError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tracing::trace;

#[derive(Debug, Clone)]
struct Lease {
    id: String,
    duration: Duration,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct StoredBlob {
    kind: BlobKind,
    data: Bytes,
    created: SystemTime,
    modified: SystemTime,
    content_md5: Option<String>,
    committed: Vec<(String, Bytes)>,
    appended: u64,
    staged: HashMap<String, Bytes>,
    metadata: HashMap<String, String>,
    lease: Option<Lease>,
}

impl StoredBlob {
    fn new(kind: BlobKind, data: Bytes) -> Self {
        let now = SystemTime::now();
        let appended = u64::from(kind == BlobKind::Append && !data.is_empty());
        let committed = if kind == BlobKind::Block && !data.is_empty() {
            vec![(String::new(), data.clone())]
        } else {
            Vec::new()
        };
        Self {
            kind,
            data,
            created: now,
            modified: now,
            content_md5: None,
            committed,
            appended,
            staged: HashMap::new(),
            metadata: HashMap::new(),
            lease: None,
        }
    }

    fn properties(&self) -> BlobProperties {
        let committed_block_count = match self.kind {
            BlobKind::Block => self.committed.len() as u64,
            BlobKind::Append => self.appended,
            BlobKind::Page => 0,
        };
        BlobProperties {
            kind: self.kind,
            length: self.data.len() as u64,
            created: self.created,
            modified: self.modified,
            content_md5: self.content_md5.clone(),
            committed_block_count,
            metadata: self.metadata.clone(),
        }
    }

    fn active_lease(&self, now: Instant) -> Option<&Lease> {
        self.lease.as_ref().filter(|l| l.expires_at > now)
    }

    /// A write must name the held lease; naming a lease that is not held also conflicts.
    fn check_lease(&self, lease: Option<&str>, path: &BlobRef) -> StoreResult<()> {
        let held = self.active_lease(Instant::now()).map(|l| l.id.as_str());
        let matches = match (held, lease) {
            (None, None) => true,
            (Some(held), Some(given)) => held == given,
            // 过期的租约仍可由持有者继续使用
            (None, Some(given)) => self.lease.as_ref().is_some_and(|l| l.id == given),
            (Some(_), None) => false,
        };
        if matches {
            Ok(())
        } else {
            Err(StoreError::LeaseConflict {
                path: PathHint::some(path.to_string()),
            })
        }
    }

    fn touch(&mut self) {
        self.modified = SystemTime::now();
    }
}

#[derive(Debug)]
struct Container {
    created: SystemTime,
    modified: SystemTime,
    blobs: BTreeMap<String, StoredBlob>,
}

#[derive(Debug, Default)]
struct State {
    containers: BTreeMap<String, Container>,
    copies: HashMap<String, CopyProgress>,
    next_lease: u64,
}

#[derive(Debug, Clone)]
struct CopyProgress {
    polls_left: u32,
    outcome: CopyStatus,
}

#[derive(Debug, Default)]
struct Faults {
    fail_copy_from: HashSet<String>,
    fail_delete: HashSet<String>,
    copy_attempts: HashMap<String, u32>,
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    state: Mutex<State>,
    faults: Mutex<Faults>,
    uploads: Mutex<Vec<usize>>,
    downloads: AtomicUsize,
    commits: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_found(path: impl ToString) -> StoreError {
    StoreError::not_found(path.to_string())
}

impl State {
    fn container(&self, name: &str) -> StoreResult<&Container> {
        self.containers
            .get(name)
            .ok_or_else(|| not_found(format!("/{name}")))
    }

    fn blob(&self, blob: &BlobRef) -> StoreResult<&StoredBlob> {
        self.container(&blob.container)?
            .blobs
            .get(&blob.key)
            .ok_or_else(|| not_found(blob))
    }

    fn blob_mut(&mut self, blob: &BlobRef) -> StoreResult<&mut StoredBlob> {
        self.containers
            .get_mut(&blob.container)
            .ok_or_else(|| not_found(format!("/{}", blob.container)))?
            .blobs
            .get_mut(&blob.key)
            .ok_or_else(|| not_found(blob))
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every copy whose source is `src` reports `CopyStatus::Failed`.
    pub fn fail_copies_from(&self, src: &BlobRef) {
        lock(&self.faults).fail_copy_from.insert(src.to_string());
    }

    /// Every delete of `blob` fails with a backend error.
    pub fn fail_deletes_of(&self, blob: &BlobRef) {
        lock(&self.faults).fail_delete.insert(blob.to_string());
    }

    pub fn clear_faults(&self) {
        let mut faults = lock(&self.faults);
        faults.fail_copy_from.clear();
        faults.fail_delete.clear();
    }

    /// Copies started from `src` so far.
    pub fn copy_attempts(&self, src: &BlobRef) -> u32 {
        lock(&self.faults)
            .copy_attempts
            .get(&src.to_string())
            .copied()
            .unwrap_or(0)
    }

    /// Sizes of every staged or appended chunk, in upload order.
    pub fn uploads(&self) -> Vec<usize> {
        lock(&self.uploads).clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Current committed content, bypassing counters and leases.
    pub fn contents(&self, blob: &BlobRef) -> Option<Bytes> {
        lock(&self.state).blob(blob).ok().map(|b| b.data.clone())
    }

    /// Id of the unexpired lease on `blob`, if any.
    pub fn lease_of(&self, blob: &BlobRef) -> Option<String> {
        lock(&self.state)
            .blob(blob)
            .ok()
            .and_then(|b| b.active_lease(Instant::now()).map(|l| l.id.clone()))
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        Ok(lock(&self.state).containers.contains_key(container))
    }

    async fn container_properties(&self, container: &str) -> StoreResult<ContainerProperties> {
        let state = lock(&self.state);
        let c = state.container(container)?;
        Ok(ContainerProperties {
            created: c.created,
            modified: c.modified,
        })
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        let mut state = lock(&self.state);
        if state.containers.contains_key(container) {
            return Err(StoreError::AlreadyExists {
                path: PathHint::some(format!("/{container}")),
            });
        }
        let now = SystemTime::now();
        state.containers.insert(
            container.to_string(),
            Container {
                created: now,
                modified: now,
                blobs: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        lock(&self.state)
            .containers
            .remove(container)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("/{container}")))
    }

    async fn list_containers(&self) -> StoreResult<Vec<String>> {
        Ok(lock(&self.state).containers.keys().cloned().collect())
    }

    async fn blob_exists(&self, blob: &BlobRef) -> StoreResult<bool> {
        let state = lock(&self.state);
        Ok(state
            .containers
            .get(&blob.container)
            .is_some_and(|c| c.blobs.contains_key(&blob.key)))
    }

    async fn blob_properties(&self, blob: &BlobRef) -> StoreResult<BlobProperties> {
        Ok(lock(&self.state).blob(blob)?.properties())
    }

    async fn create_blob(
        &self,
        blob: &BlobRef,
        kind: BlobKind,
        content: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let container = state
            .containers
            .get_mut(&blob.container)
            .ok_or_else(|| not_found(format!("/{}", blob.container)))?;
        let mut fresh = StoredBlob::new(kind, content);
        if let Some(existing) = container.blobs.get(&blob.key) {
            existing.check_lease(lease, blob)?;
            fresh.created = existing.created;
            fresh.lease = existing.lease.clone();
        } else if lease.is_some() {
            return Err(StoreError::LeaseConflict {
                path: PathHint::some(blob.to_string()),
            });
        }
        container.blobs.insert(blob.key.clone(), fresh);
        container.modified = SystemTime::now();
        Ok(())
    }

    async fn delete_blob(&self, blob: &BlobRef, lease: Option<&str>) -> StoreResult<()> {
        if lock(&self.faults).fail_delete.contains(&blob.to_string()) {
            return Err(StoreError::backend("delete_blob", "injected delete failure"));
        }
        let mut state = lock(&self.state);
        state.blob(blob)?.check_lease(lease, blob)?;
        if let Some(container) = state.containers.get_mut(&blob.container) {
            container.blobs.remove(&blob.key);
            container.modified = SystemTime::now();
        }
        Ok(())
    }

    async fn download_range(&self, blob: &BlobRef, offset: u64, len: u64) -> StoreResult<Bytes> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let state = lock(&self.state);
        let data = &state.blob(blob)?.data;
        let size = data.len() as u64;
        if offset >= size {
            return Ok(Bytes::new());
        }
        let end = offset.saturating_add(len).min(size);
        Ok(data.slice(offset as usize..end as usize))
    }

    async fn append_block(
        &self,
        blob: &BlobRef,
        data: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        if stored.kind != BlobKind::Append {
            return Err(StoreError::backend(
                "append_block",
                format!("{blob} is a {} object", stored.kind),
            ));
        }
        let mut buf = BytesMut::with_capacity(stored.data.len() + data.len());
        buf.extend_from_slice(&stored.data);
        buf.extend_from_slice(&data);
        stored.data = buf.freeze();
        stored.appended += 1;
        stored.touch();
        lock(&self.uploads).push(data.len());
        trace!(%blob, len = data.len(), "append block");
        Ok(())
    }

    async fn stage_block(
        &self,
        blob: &BlobRef,
        block_id: &str,
        data: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        if stored.kind != BlobKind::Block {
            return Err(StoreError::backend(
                "stage_block",
                format!("{blob} is a {} object", stored.kind),
            ));
        }
        lock(&self.uploads).push(data.len());
        stored.staged.insert(block_id.to_string(), data);
        Ok(())
    }

    async fn commit_block_list(
        &self,
        blob: &BlobRef,
        block_ids: &[String],
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        let mut committed = Vec::with_capacity(block_ids.len());
        for id in block_ids {
            let data = stored
                .staged
                .get(id)
                .or_else(|| stored.committed.iter().find(|(c, _)| c == id).map(|(_, d)| d))
                .cloned()
                .ok_or_else(|| {
                    StoreError::backend("commit_block_list", format!("unknown block id {id}"))
                })?;
            committed.push((id.clone(), data));
        }
        let mut buf = BytesMut::new();
        for (_, data) in &committed {
            buf.extend_from_slice(data);
        }
        stored.data = buf.freeze();
        stored.committed = committed;
        stored.staged.clear();
        stored.touch();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn acquire_lease(&self, blob: &BlobRef, duration: Duration) -> StoreResult<String> {
        let mut state = lock(&self.state);
        state.next_lease += 1;
        let id = format!("lease-{:08}", state.next_lease);
        let stored = state.blob_mut(blob)?;
        let now = Instant::now();
        if stored.active_lease(now).is_some() {
            return Err(StoreError::LeaseConflict {
                path: PathHint::some(blob.to_string()),
            });
        }
        stored.lease = Some(Lease {
            id: id.clone(),
            duration,
            expires_at: now + duration,
        });
        Ok(id)
    }

    async fn renew_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        match stored.lease.as_mut() {
            Some(lease) if lease.id == lease_id => {
                lease.expires_at = Instant::now() + lease.duration;
                Ok(())
            }
            _ => Err(StoreError::LeaseConflict {
                path: PathHint::some(blob.to_string()),
            }),
        }
    }

    async fn release_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        match &stored.lease {
            Some(lease) if lease.id == lease_id => {
                stored.lease = None;
                Ok(())
            }
            _ => Err(StoreError::LeaseConflict {
                path: PathHint::some(blob.to_string()),
            }),
        }
    }

    async fn set_metadata(
        &self,
        blob: &BlobRef,
        key: &str,
        value: &str,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        stored.metadata.retain(|k, _| !k.eq_ignore_ascii_case(key));
        stored.metadata.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_metadata(
        &self,
        blob: &BlobRef,
        key: &str,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        stored.metadata.retain(|k, _| !k.eq_ignore_ascii_case(key));
        Ok(())
    }

    async fn set_content_md5(
        &self,
        blob: &BlobRef,
        md5: Option<String>,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        let mut state = lock(&self.state);
        let stored = state.blob_mut(blob)?;
        stored.check_lease(lease, blob)?;
        stored.content_md5 = md5;
        Ok(())
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimited: bool,
    ) -> StoreResult<Vec<BlobItem>> {
        let state = lock(&self.state);
        let c = state.container(container)?;
        let mut items = Vec::new();
        let mut seen_prefixes = HashSet::new();
        for (key, blob) in c.blobs.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest = &key[prefix.len()..];
            match rest.find('/') {
                Some(idx) if delimited => {
                    let dir = format!("{prefix}{}", &rest[..=idx]);
                    if seen_prefixes.insert(dir.clone()) {
                        items.push(BlobItem {
                            name: dir,
                            is_prefix: true,
                            properties: None,
                        });
                    }
                }
                _ => items.push(BlobItem {
                    name: key.clone(),
                    is_prefix: false,
                    properties: Some(blob.properties()),
                }),
            }
        }
        Ok(items)
    }

    async fn start_copy(&self, src: &BlobRef, dst: &BlobRef) -> StoreResult<()> {
        let failing = {
            let mut faults = lock(&self.faults);
            *faults.copy_attempts.entry(src.to_string()).or_insert(0) += 1;
            faults.fail_copy_from.contains(&src.to_string())
        };
        let mut state = lock(&self.state);
        let source = state.blob(src)?.clone();
        let outcome = if failing {
            CopyStatus::Failed(format!("copy from {src} aborted"))
        } else {
            let target = state
                .containers
                .get_mut(&dst.container)
                .ok_or_else(|| not_found(format!("/{}", dst.container)))?;
            if let Some(existing) = target.blobs.get(&dst.key) {
                existing.check_lease(None, dst)?;
            }
            let mut copy = source;
            copy.lease = None;
            copy.staged.clear();
            copy.created = SystemTime::now();
            copy.modified = copy.created;
            target.blobs.insert(dst.key.clone(), copy);
            target.modified = SystemTime::now();
            CopyStatus::Success
        };
        state.copies.insert(
            dst.to_string(),
            CopyProgress {
                polls_left: 1,
                outcome,
            },
        );
        Ok(())
    }

    async fn copy_status(&self, dst: &BlobRef) -> StoreResult<CopyStatus> {
        let mut state = lock(&self.state);
        let progress = state
            .copies
            .get_mut(&dst.to_string())
            .ok_or_else(|| not_found(dst))?;
        if progress.polls_left > 0 {
            progress.polls_left -= 1;
            return Ok(CopyStatus::Pending);
        }
        Ok(progress.outcome.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(key: &str) -> BlobRef {
        BlobRef::new("c", key)
    }

    #[tokio::test]
    async fn test_lease_rules() {
        let store = InMemoryBlobStore::new();
        store.create_container("c").await.unwrap();
        store
            .create_blob(&blob("f"), BlobKind::Block, Bytes::from_static(b"x"), None)
            .await
            .unwrap();
        let lease = store
            .acquire_lease(&blob("f"), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(
            store
                .acquire_lease(&blob("f"), Duration::from_secs(60))
                .await
                .unwrap_err()
                .is_lease_conflict()
        );
        assert!(store.delete_blob(&blob("f"), None).await.is_err());
        assert!(store.delete_blob(&blob("f"), Some("other")).await.is_err());
        store.renew_lease(&blob("f"), &lease).await.unwrap();
        store.release_lease(&blob("f"), &lease).await.unwrap();
        // 无租约时携带租约 id 也视为冲突
        assert!(
            store
                .set_metadata(&blob("f"), "k", "v", Some(&lease))
                .await
                .unwrap_err()
                .is_lease_conflict()
        );
        store.delete_blob(&blob("f"), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_stage_and_commit() {
        let store = InMemoryBlobStore::new();
        store.create_container("c").await.unwrap();
        let b = blob("dir/f");
        store
            .create_blob(&b, BlobKind::Block, Bytes::new(), None)
            .await
            .unwrap();
        store
            .stage_block(&b, "b1", Bytes::from_static(b"hello "), None)
            .await
            .unwrap();
        store
            .stage_block(&b, "b2", Bytes::from_static(b"world"), None)
            .await
            .unwrap();
        assert_eq!(store.contents(&b).unwrap().len(), 0);
        store
            .commit_block_list(&b, &["b1".into(), "b2".into()], None)
            .await
            .unwrap();
        assert_eq!(store.contents(&b).unwrap(), Bytes::from_static(b"hello world"));
        let props = store.blob_properties(&b).await.unwrap();
        assert_eq!(props.committed_block_count, 2);
        assert_eq!(store.uploads(), vec![6, 5]);
    }

    #[tokio::test]
    async fn test_delimited_listing() {
        let store = InMemoryBlobStore::new();
        store.create_container("c").await.unwrap();
        for key in ["a", "d/$.$$", "d/x", "d/sub/y", "e"] {
            store
                .create_blob(&blob(key), BlobKind::Block, Bytes::new(), None)
                .await
                .unwrap();
        }
        let names: Vec<_> = store
            .list_blobs("c", "d/", true)
            .await
            .unwrap()
            .into_iter()
            .map(|i| (i.name, i.is_prefix))
            .collect();
        assert_eq!(
            names,
            vec![
                ("d/$.$$".to_string(), false),
                ("d/sub/".to_string(), true),
                ("d/x".to_string(), false)
            ]
        );
        assert_eq!(store.list_blobs("c", "d/", false).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_copy_status_and_faults() {
        let store = InMemoryBlobStore::new();
        store.create_container("c").await.unwrap();
        store
            .create_blob(&blob("a"), BlobKind::Append, Bytes::from_static(b"abc"), None)
            .await
            .unwrap();
        store.start_copy(&blob("a"), &blob("b")).await.unwrap();
        assert_eq!(store.copy_status(&blob("b")).await.unwrap(), CopyStatus::Pending);
        assert_eq!(store.copy_status(&blob("b")).await.unwrap(), CopyStatus::Success);
        assert_eq!(store.contents(&blob("b")).unwrap(), Bytes::from_static(b"abc"));

        store.fail_copies_from(&blob("a"));
        store.start_copy(&blob("a"), &blob("z")).await.unwrap();
        store.copy_status(&blob("z")).await.unwrap();
        assert!(matches!(
            store.copy_status(&blob("z")).await.unwrap(),
            CopyStatus::Failed(_)
        ));
        assert!(!store.blob_exists(&blob("z")).await.unwrap());
        assert_eq!(store.copy_attempts(&blob("a")), 2);
    }
}
