//! Object-level copy, move, delete and rewrite helpers used by rename, rmdir, truncate and
//! append conversion.

use crate::cadapter::{BlobKind, BlobRef, BlobStore, CopyStatus, META_LEASE_ID};
use crate::config::{BatchSettings, TransferSettings};
use crate::error::{FsError, FsResult, StoreError};
use crate::stream::{ReadStream, WriteStream};
use crate::vfs::path::FsPath;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyMode {
    Copy,
    Move,
}

/// Per-object result of a directory-wide operation: objects listed in `failed` (as
/// `/container/key`) were left untouched after every retry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub failed: Vec<String>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn into_result(self, op: &'static str, path: &str) -> FsResult<()> {
        if self.is_complete() {
            Ok(())
        } else {
            Err(FsError::BatchIncomplete {
                op,
                path: path.into(),
                failed: self.failed,
            })
        }
    }
}

pub struct BlobTransfer {
    store: Arc<dyn BlobStore>,
    transfer: TransferSettings,
    batch: BatchSettings,
    tmp_seq: AtomicU64,
}

impl BlobTransfer {
    pub fn new(store: Arc<dyn BlobStore>, transfer: TransferSettings, batch: BatchSettings) -> Self {
        Self {
            store,
            transfer,
            batch,
            tmp_seq: AtomicU64::new(0),
        }
    }

    fn temp_ref(&self, blob: &BlobRef) -> BlobRef {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        BlobRef::new(
            blob.container.clone(),
            format!("{}-{:x}.tmp", blob.key, nanos ^ seq.rotate_left(48)),
        )
    }

    /// Runs `op` up to `retries` times, sleeping `backoff` between attempts.
    async fn with_retries<F, Fut>(&self, what: &str, mut op: F) -> FsResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = FsResult<()>>,
    {
        let attempts = self.batch.retries.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    debug!(what, attempt, error = %e, "retrying");
                    attempt += 1;
                    tokio::time::sleep(self.batch.backoff).await;
                }
            }
        }
    }

    /// Deletes an object and its snapshots; a missing object counts as deleted. Without an
    /// explicit lease, a leased object is deleted with the lease recorded in its metadata.
    pub async fn delete_blob(&self, blob: &BlobRef, lease: Option<&str>) -> FsResult<()> {
        let path = blob.to_string();
        match self.store.delete_blob(blob, lease).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_lease_conflict() && lease.is_none() => {
                let recorded = self
                    .store
                    .blob_properties(blob)
                    .await
                    .map_err(FsError::io("blob_properties", &path))?
                    .metadata_value(META_LEASE_ID)
                    .map(str::to_string);
                match recorded {
                    Some(id) => self
                        .store
                        .delete_blob(blob, Some(&id))
                        .await
                        .or_else(|e| if e.is_not_found() { Ok(()) } else { Err(e) })
                        .map_err(FsError::io("delete_blob", &path)),
                    None => Err(FsError::io("delete_blob", &path)(e)),
                }
            }
            Err(e) => Err(FsError::io("delete_blob", &path)(e)),
        }
    }

    /// Server-side copy of one object, holding a lease on the source until the copy settles.
    pub async fn copy_or_move_blob(&self, src: &BlobRef, dst: &BlobRef, mode: CopyMode) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        let path = src.to_string();
        let lease = self
            .store
            .acquire_lease(src, self.transfer.lease_duration)
            .await
            .map_err(FsError::io("acquire_lease", &path))?;
        let copied = self.await_copy(src, dst, &lease).await;
        if let Err(e) = self.store.release_lease(src, &lease).await {
            warn!(blob = %src, error = %e, "failed to release copy lease");
        }
        copied?;
        if mode == CopyMode::Move {
            self.delete_blob(src, None).await?;
        }
        debug!(from = %src, to = %dst, ?mode, "copy completed");
        Ok(())
    }

    async fn await_copy(&self, src: &BlobRef, dst: &BlobRef, lease: &str) -> FsResult<()> {
        let path = src.to_string();
        self.store
            .start_copy(src, dst)
            .await
            .map_err(FsError::io("start_copy", &path))?;
        let mut polls = 0u32;
        loop {
            let status = self
                .store
                .copy_status(dst)
                .await
                .map_err(FsError::io("copy_status", dst.to_string()))?;
            match status {
                CopyStatus::Success => return Ok(()),
                CopyStatus::Failed(reason) => {
                    return Err(FsError::BackendIOFailure {
                        op: "copy",
                        path: path.into(),
                        source: StoreError::backend("copy", reason),
                    });
                }
                CopyStatus::Pending => {
                    tokio::time::sleep(self.batch.copy_poll_interval).await;
                    polls += 1;
                    if polls >= self.batch.copy_renew_every {
                        polls = 0;
                        self.store
                            .renew_lease(src, lease)
                            .await
                            .map_err(FsError::io("renew_lease", &path))?;
                    }
                }
            }
        }
    }

    async fn list_under(&self, dir: &FsPath) -> FsResult<Vec<String>> {
        Ok(self
            .store
            .list_blobs(dir.container(), &dir.dir_prefix(), false)
            .await
            .map_err(FsError::io("list_blobs", dir.full()))?
            .into_iter()
            .filter(|item| !item.is_prefix)
            .map(|item| item.name)
            .collect())
    }

    /// Copies or moves every object under `src` to the same relative key under `dst`.
    /// A move deletes the source of each object once its copy succeeded, so objects that
    /// fail stay at the source and are reported in the outcome.
    pub async fn copy_or_move_directory(
        &self,
        src: &FsPath,
        dst: &FsPath,
        mode: CopyMode,
    ) -> FsResult<BatchOutcome> {
        if !dst.key().is_empty() && !self.list_under(dst).await?.is_empty() {
            return Err(FsError::already_exists(dst.full()));
        }
        let src_prefix = src.dir_prefix();
        let dst_prefix = dst.dir_prefix();
        let mut outcome = BatchOutcome::default();
        for key in self.list_under(src).await? {
            let from = BlobRef::new(src.container(), key.clone());
            let to = BlobRef::new(dst.container(), format!("{dst_prefix}{}", &key[src_prefix.len()..]));
            let copied = self
                .with_retries("copy", || self.copy_or_move_blob(&from, &to, CopyMode::Copy))
                .await;
            if let Err(e) = copied {
                warn!(from = %from, to = %to, error = %e, "giving up on object");
                outcome.failed.push(from.to_string());
                continue;
            }
            if mode == CopyMode::Move {
                if let Err(e) = self.with_retries("delete", || self.delete_blob(&from, None)).await {
                    warn!(blob = %from, error = %e, "copied but source not deleted");
                    outcome.failed.push(from.to_string());
                }
            }
        }
        info!(
            from = src.full(),
            to = dst.full(),
            ?mode,
            failed = outcome.failed.len(),
            "directory transfer finished"
        );
        Ok(outcome)
    }

    /// Deletes every object under `dir`.
    pub async fn delete_directory(&self, dir: &FsPath) -> FsResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for key in self.list_under(dir).await? {
            let blob = BlobRef::new(dir.container(), key);
            if let Err(e) = self.with_retries("delete", || self.delete_blob(&blob, None)).await {
                warn!(blob = %blob, error = %e, "giving up on object");
                outcome.failed.push(blob.to_string());
            }
        }
        Ok(outcome)
    }

    /// Streams `len` bytes of `src` into `writer`, then `zeros` zero bytes.
    async fn pump(
        &self,
        src: &BlobRef,
        writer: &WriteStream,
        len: u64,
        zeros: u64,
        renew: Option<(&BlobRef, &str)>,
    ) -> FsResult<()> {
        let chunk = self.transfer.download_chunk.max(1);
        if len > 0 {
            let reader = ReadStream::open(self.store.clone(), src.clone(), chunk).await?;
            let mut offset = 0u64;
            while offset < len {
                let want = (len - offset).min(chunk as u64) as usize;
                let Some(data) = reader.read(offset, want).await? else {
                    break;
                };
                writer.write(&data, 0, data.len()).await?;
                offset += data.len() as u64;
                if let Some((blob, lease)) = renew {
                    self.store
                        .renew_lease(blob, lease)
                        .await
                        .map_err(FsError::io("renew_lease", blob.to_string()))?;
                }
            }
        }
        let mut left = zeros;
        let block = vec![0u8; chunk];
        while left > 0 {
            let n = left.min(chunk as u64) as usize;
            writer.write(&block, 0, n).await?;
            left -= n as u64;
        }
        Ok(())
    }

    /// Rewrites `src` into a temporary object of `kind`, replaces the original with it and
    /// moves it back under the original key. `lease` is the lease held on `src`.
    async fn rewrite(
        &self,
        src: &BlobRef,
        kind: BlobKind,
        keep: u64,
        zeros: u64,
        lease: &str,
    ) -> FsResult<()> {
        let tmp = self.temp_ref(src);
        self.store
            .create_blob(&tmp, kind, Bytes::new(), None)
            .await
            .map_err(FsError::io("create_blob", tmp.to_string()))?;
        let staged = async {
            let writer = WriteStream::open(self.store.clone(), tmp.clone(), kind, self.transfer).await?;
            let pumped = self.pump(src, &writer, keep, zeros, Some((src, lease))).await;
            let closed = writer.close().await;
            pumped.and(closed)
        }
        .await;
        if let Err(e) = staged {
            let _ = self.delete_blob(&tmp, None).await;
            return Err(e);
        }
        // 删除原对象后再把临时对象移回原名
        self.delete_blob(src, Some(lease)).await?;
        self.copy_or_move_blob(&tmp, src, CopyMode::Move).await
    }

    /// Changes the length of an object, truncating or zero-padding it.
    pub async fn resize(&self, blob: &BlobRef, new_size: u64) -> FsResult<()> {
        let path = blob.to_string();
        let props = self
            .store
            .blob_properties(blob)
            .await
            .map_err(FsError::io("blob_properties", &path))?;
        if props.length == new_size {
            return Ok(());
        }
        let (lease, acquired) = match props.metadata_value(META_LEASE_ID) {
            Some(id) => (id.to_string(), false),
            None => (
                self.store
                    .acquire_lease(blob, self.transfer.lease_duration)
                    .await
                    .map_err(FsError::io("acquire_lease", &path))?,
                true,
            ),
        };

        let result = if new_size == 0 {
            self.store
                .create_blob(blob, props.kind, Bytes::new(), Some(&lease))
                .await
                .map_err(FsError::io("create_blob", &path))
        } else if props.kind == BlobKind::Page {
            Err(FsError::Unsupported("resizing page objects"))
        } else {
            let keep = props.length.min(new_size);
            let zeros = new_size.saturating_sub(props.length);
            self.rewrite(blob, props.kind, keep, zeros, &lease).await
        };

        // 原对象被替换后租约随之消失，释放失败可忽略
        if acquired {
            let _ = self.store.release_lease(blob, &lease).await;
        }
        if result.is_ok() {
            debug!(blob = %blob, from = props.length, to = new_size, "resized");
        }
        result
    }

    /// Turns a block object into an append object with the same content.
    pub async fn convert_to_append(&self, blob: &BlobRef) -> FsResult<()> {
        let path = blob.to_string();
        let props = self
            .store
            .blob_properties(blob)
            .await
            .map_err(FsError::io("blob_properties", &path))?;
        if props.kind == BlobKind::Append {
            return Ok(());
        }
        let lease = self
            .store
            .acquire_lease(blob, self.transfer.lease_duration)
            .await
            .map_err(FsError::io("acquire_lease", &path))?;
        let result = self
            .rewrite(blob, BlobKind::Append, props.length, 0, &lease)
            .await;
        if result.is_err() {
            let _ = self.store.release_lease(blob, &lease).await;
        } else {
            info!(blob = %blob, "converted to append object");
        }
        result
    }
}
