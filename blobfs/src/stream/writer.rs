use crate::cadapter::{
    BlobKind, BlobRef, BlobStore, META_COMMITTED_BLOCKS, META_LEASE_ID, block_id,
};
use crate::config::TransferSettings;
use crate::error::{FsError, FsResult};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

#[derive(Default)]
struct WriteState {
    buf: Vec<u8>,
    uploaded: u64,
    chunk_index: u64,
    block_ids: Vec<String>,
    /// Size and block count the object already had, discovered on the first write.
    existing: Option<(u64, u64)>,
    closed: bool,
}

/// Leased writer for one object.
///
/// Block objects stage numbered blocks and commit the list on close, replacing the
/// previous content. Append objects append every chunk at the end.
pub struct WriteStream {
    store: Arc<dyn BlobStore>,
    blob: BlobRef,
    kind: BlobKind,
    lease: String,
    transfer: TransferSettings,
    state: Mutex<WriteState>,
}

impl WriteStream {
    /// Acquires the write lease and records it on the object as `leaseID`.
    pub async fn open(
        store: Arc<dyn BlobStore>,
        blob: BlobRef,
        kind: BlobKind,
        transfer: TransferSettings,
    ) -> FsResult<Self> {
        let path = blob.to_string();
        let lease = store
            .acquire_lease(&blob, transfer.lease_duration)
            .await
            .map_err(FsError::io("acquire_lease", &path))?;
        if let Err(e) = store
            .set_metadata(&blob, META_LEASE_ID, &lease, Some(&lease))
            .await
        {
            let _ = store.release_lease(&blob, &lease).await;
            return Err(FsError::io("set_metadata", &path)(e));
        }
        debug!(blob = %blob, kind = %kind, lease = %lease, "write stream opened");
        Ok(Self {
            store,
            blob,
            kind,
            lease,
            transfer,
            state: Mutex::new(WriteState::default()),
        })
    }

    pub fn lease_id(&self) -> &str {
        &self.lease
    }

    pub fn blob(&self) -> &BlobRef {
        &self.blob
    }

    pub fn kind(&self) -> BlobKind {
        self.kind
    }

    /// Whether `close` has run; a closed stream no longer holds its lease.
    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    pub async fn renew_lease(&self) -> FsResult<()> {
        self.store
            .renew_lease(&self.blob, &self.lease)
            .await
            .map_err(FsError::io("renew_lease", self.blob.to_string()))
    }

    fn threshold(&self) -> usize {
        match self.kind {
            BlobKind::Block => self.transfer.block_upload_chunk,
            BlobKind::Append => self.transfer.append_upload_chunk,
            BlobKind::Page => self.transfer.page_upload_chunk,
        }
        .max(1)
    }

    fn size_limit(&self) -> u64 {
        match self.kind {
            BlobKind::Block => self.transfer.block_size_limit,
            BlobKind::Append => self.transfer.append_size_limit,
            BlobKind::Page => self.transfer.page_size_limit,
        }
    }

    /// Buffers `data[offset..offset + length]`. Every full chunk beyond the threshold is
    /// uploaded right away; the remainder waits for the next write, `flush` or `close`.
    pub async fn write(&self, data: &[u8], offset: usize, length: usize) -> FsResult<usize> {
        if offset.checked_add(length).is_none_or(|end| end > data.len()) {
            return Err(FsError::InvalidArgument(format!(
                "write range {offset}+{length} outside a {} byte buffer",
                data.len()
            )));
        }
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(FsError::InvalidArgument(format!("write after close: {}", self.blob)));
        }
        self.verify_upload_conditions(&mut state, length as u64)
            .await?;

        state.buf.extend_from_slice(&data[offset..offset + length]);
        let threshold = self.threshold();
        while state.buf.len() > threshold {
            let chunk: Vec<u8> = state.buf.drain(..threshold).collect();
            self.upload_chunk(&mut state, Bytes::from(chunk)).await?;
        }
        Ok(length)
    }

    async fn verify_upload_conditions(&self, state: &mut WriteState, incoming: u64) -> FsResult<()> {
        let path = self.blob.to_string();
        if self.kind == BlobKind::Page {
            return Err(FsError::Unsupported("writing page objects"));
        }
        if state.existing.is_none() {
            let existing = match self.kind {
                BlobKind::Append => {
                    let exists = self
                        .store
                        .blob_exists(&self.blob)
                        .await
                        .map_err(FsError::io("blob_exists", &path))?;
                    if !exists {
                        self.store
                            .create_blob(&self.blob, BlobKind::Append, Bytes::new(), None)
                            .await
                            .map_err(FsError::io("create_blob", &path))?;
                    }
                    let props = self
                        .store
                        .blob_properties(&self.blob)
                        .await
                        .map_err(FsError::io("blob_properties", &path))?;
                    (props.length, props.committed_block_count)
                }
                // the committed list replaces the old content
                BlobKind::Block | BlobKind::Page => (0, 0),
            };
            state.existing = Some(existing);
        }
        let (base_size, base_blocks) = state.existing.unwrap_or_default();

        let total = base_size + state.uploaded + state.buf.len() as u64 + incoming;
        if total > self.size_limit() {
            return Err(FsError::FileTooLarge {
                path: path.into(),
                reason: format!("{total} bytes exceeds the {} limit of {}", self.kind, self.size_limit()),
            });
        }
        if base_blocks + state.chunk_index > self.transfer.block_limit.saturating_sub(1) {
            return Err(FsError::FileTooLarge {
                path: path.into(),
                reason: format!("block count exceeds {}", self.transfer.block_limit),
            });
        }
        Ok(())
    }

    async fn upload_chunk(&self, state: &mut WriteState, chunk: Bytes) -> FsResult<()> {
        let path = self.blob.to_string();
        let len = chunk.len() as u64;
        let base_blocks = state.existing.map_or(0, |(_, blocks)| blocks);
        if base_blocks + state.chunk_index >= self.transfer.block_limit {
            return Err(FsError::FileTooLarge {
                path: path.into(),
                reason: format!("block count exceeds {}", self.transfer.block_limit),
            });
        }
        // 先续租，避免长时间上传期间租约过期
        self.renew_lease().await?;
        state.chunk_index += 1;
        match self.kind {
            BlobKind::Block => {
                let id = block_id(state.chunk_index);
                self.store
                    .stage_block(&self.blob, &id, chunk, Some(&self.lease))
                    .await
                    .map_err(FsError::io("stage_block", &path))?;
                state.block_ids.push(id);
                self.store
                    .set_metadata(
                        &self.blob,
                        META_COMMITTED_BLOCKS,
                        &state.block_ids.join(","),
                        Some(&self.lease),
                    )
                    .await
                    .map_err(FsError::io("set_metadata", &path))?;
            }
            BlobKind::Append => {
                self.store
                    .append_block(&self.blob, chunk, Some(&self.lease))
                    .await
                    .map_err(FsError::io("append_block", &path))?;
            }
            BlobKind::Page => return Err(FsError::Unsupported("writing page objects")),
        }
        state.uploaded += len;
        trace!(blob = %self.blob, chunk = state.chunk_index, len, "uploaded chunk");
        Ok(())
    }

    /// Uploads whatever is buffered.
    pub async fn flush(&self) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut WriteState) -> FsResult<()> {
        if state.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::take(&mut state.buf));
        self.upload_chunk(state, chunk).await
    }

    /// Flushes, commits the block list, clears the writer metadata and releases the lease.
    /// A second call does nothing; the stream counts as closed even when this fails.
    pub async fn close(&self) -> FsResult<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let result = self.close_locked(&mut state).await;
        state.closed = true;
        state.buf = Vec::new();
        result
    }

    async fn close_locked(&self, state: &mut WriteState) -> FsResult<()> {
        let path = self.blob.to_string();
        let lease = Some(self.lease.as_str());
        self.flush_locked(state).await?;
        if self.kind == BlobKind::Block && state.uploaded > 0 {
            self.store
                .commit_block_list(&self.blob, &state.block_ids, lease)
                .await
                .map_err(FsError::io("commit_block_list", &path))?;
        }
        self.store
            .remove_metadata(&self.blob, META_LEASE_ID, lease)
            .await
            .map_err(FsError::io("remove_metadata", &path))?;
        self.store
            .remove_metadata(&self.blob, META_COMMITTED_BLOCKS, lease)
            .await
            .map_err(FsError::io("remove_metadata", &path))?;
        self.store
            .set_content_md5(&self.blob, None, lease)
            .await
            .map_err(FsError::io("set_content_md5", &path))?;
        self.store
            .release_lease(&self.blob, &self.lease)
            .await
            .map_err(FsError::io("release_lease", &path))?;
        debug!(blob = %self.blob, bytes = state.uploaded, chunks = state.chunk_index, "write stream closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::InMemoryBlobStore;

    async fn fixture(kind: BlobKind) -> (Arc<InMemoryBlobStore>, BlobRef) {
        let store = Arc::new(InMemoryBlobStore::new());
        store.create_container("c").await.unwrap();
        let blob = BlobRef::new("c", "f");
        store
            .create_blob(&blob, kind, Bytes::new(), None)
            .await
            .unwrap();
        (store, blob)
    }

    #[tokio::test]
    async fn test_block_upload_in_threshold_chunks() {
        let (store, blob) = fixture(BlobKind::Block).await;
        let transfer = TransferSettings::default();
        assert_eq!(transfer.block_upload_chunk, 4_194_304);
        let writer = WriteStream::open(store.clone(), blob.clone(), BlobKind::Block, transfer)
            .await
            .unwrap();
        let data = vec![7u8; 5_000_000];
        assert_eq!(writer.write(&data, 0, data.len()).await.unwrap(), 5_000_000);
        assert_eq!(store.uploads(), vec![4_194_304]);
        writer.close().await.unwrap();
        assert_eq!(store.uploads(), vec![4_194_304, 805_696]);
        assert_eq!(store.commit_count(), 1);

        let props = store.blob_properties(&blob).await.unwrap();
        assert_eq!(props.length, 5_000_000);
        assert_eq!(props.committed_block_count, 2);
        assert!(props.metadata_value(META_LEASE_ID).is_none());
        assert!(props.metadata_value(META_COMMITTED_BLOCKS).is_none());
        assert!(store.lease_of(&blob).is_none());
    }

    #[tokio::test]
    async fn test_chunk_count_matches_threshold() {
        let (store, blob) = fixture(BlobKind::Block).await;
        let transfer = TransferSettings {
            block_upload_chunk: 10,
            ..TransferSettings::default()
        };
        let writer = WriteStream::open(store.clone(), blob.clone(), BlobKind::Block, transfer)
            .await
            .unwrap();
        let data: Vec<u8> = (0..35u8).collect();
        for piece in data.chunks(4) {
            writer.write(piece, 0, piece.len()).await.unwrap();
        }
        writer.close().await.unwrap();
        let uploads = store.uploads();
        assert_eq!(uploads.iter().sum::<usize>(), 35);
        assert_eq!(uploads.len(), 4);
        assert_eq!(store.contents(&blob).unwrap(), Bytes::from(data));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_are_serialized() {
        let (store, blob) = fixture(BlobKind::Block).await;
        let transfer = TransferSettings {
            block_upload_chunk: 64,
            ..TransferSettings::default()
        };
        let writer = Arc::new(
            WriteStream::open(store.clone(), blob.clone(), BlobKind::Block, transfer)
                .await
                .unwrap(),
        );
        let mut tasks = Vec::new();
        for byte in [b'a', b'b', b'c', b'd'] {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let piece = [byte; 13];
                    assert_eq!(writer.write(&piece, 0, piece.len()).await.unwrap(), 13);
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        writer.close().await.unwrap();
        assert!(writer.is_closed().await);

        let total = 4 * 50 * 13;
        assert_eq!(store.uploads().iter().sum::<usize>(), total);
        let contents = store.contents(&blob).unwrap();
        assert_eq!(contents.len(), total);
        // 每次写入整体落盘，不会与其他写入交错
        for piece in contents.chunks(13) {
            assert!(piece.iter().all(|b| *b == piece[0]));
        }
        for byte in [b'a', b'b', b'c', b'd'] {
            assert_eq!(contents.iter().filter(|b| **b == byte).count(), 50 * 13);
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (store, blob) = fixture(BlobKind::Block).await;
        let writer = WriteStream::open(store.clone(), blob.clone(), BlobKind::Block, TransferSettings::default())
            .await
            .unwrap();
        writer.write(b"hello", 0, 5).await.unwrap();
        writer.close().await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.commit_count(), 1);
        assert_eq!(store.contents(&blob).unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_lease_recorded_while_open() {
        let (store, blob) = fixture(BlobKind::Append).await;
        let writer = WriteStream::open(store.clone(), blob.clone(), BlobKind::Append, TransferSettings::default())
            .await
            .unwrap();
        let props = store.blob_properties(&blob).await.unwrap();
        assert_eq!(props.metadata_value(META_LEASE_ID), Some(writer.lease_id()));
        assert_eq!(store.lease_of(&blob).as_deref(), Some(writer.lease_id()));

        // 第二个写者拿不到租约
        let second = WriteStream::open(store.clone(), blob.clone(), BlobKind::Append, TransferSettings::default()).await;
        assert!(matches!(second, Err(FsError::StaleOrMissingLease { .. })));

        writer.write(b"abc", 0, 3).await.unwrap();
        writer.write(b"xdefx", 1, 3).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(store.contents(&blob).unwrap(), Bytes::from_static(b"abcdef"));
        assert!(store.lease_of(&blob).is_none());
    }

    #[tokio::test]
    async fn test_rejects_bad_ranges_and_limits() {
        let (store, blob) = fixture(BlobKind::Append).await;
        let transfer = TransferSettings {
            append_size_limit: 8,
            ..TransferSettings::default()
        };
        let writer = WriteStream::open(store.clone(), blob, BlobKind::Append, transfer)
            .await
            .unwrap();
        assert!(matches!(
            writer.write(b"abc", 2, 2).await,
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            writer.write(b"abc", usize::MAX, 2).await,
            Err(FsError::InvalidArgument(_))
        ));
        writer.write(b"12345678", 0, 8).await.unwrap();
        assert!(matches!(
            writer.write(b"9", 0, 1).await,
            Err(FsError::FileTooLarge { .. })
        ));
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_block_limit() {
        let (store, blob) = fixture(BlobKind::Block).await;
        let transfer = TransferSettings {
            block_upload_chunk: 1,
            block_limit: 3,
            ..TransferSettings::default()
        };
        let writer = WriteStream::open(store, blob, BlobKind::Block, transfer)
            .await
            .unwrap();
        writer.write(b"abc", 0, 3).await.unwrap();
        writer.write(b"d", 0, 1).await.unwrap();
        // 已上传 3 个 block，达到上限
        assert!(matches!(
            writer.write(b"e", 0, 1).await,
            Err(FsError::FileTooLarge { .. })
        ));
    }
}
