use crate::cadapter::{BlobRef, BlobStore};
use crate::error::{FsError, FsResult};
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::trace;

#[derive(Default)]
struct ReadState {
    /// Most recently downloaded contiguous bytes.
    buf: Vec<u8>,
    /// Object offset of `buf[0]`.
    buf_start: u64,
    /// Offset the next sequential read is expected at.
    next_offset: u64,
    eof: bool,
}

impl ReadState {
    fn reset(&mut self, offset: u64) {
        self.buf.clear();
        self.buf_start = offset;
        self.next_offset = offset;
        self.eof = false;
    }

    /// Drops buffered bytes before `offset`; what is left starts at `offset`.
    /// Callers reset first when `offset < buf_start`.
    fn skip_to(&mut self, offset: u64) {
        let skipped = offset.saturating_sub(self.buf_start);
        if skipped >= self.buf.len() as u64 {
            self.buf.clear();
        } else {
            self.buf.drain(..skipped as usize);
        }
        self.buf_start = offset;
        self.next_offset = offset;
    }

    fn take(&mut self, len: usize) -> Bytes {
        let n = len.min(self.buf.len());
        let out = Bytes::copy_from_slice(&self.buf[..n]);
        self.buf.drain(..n);
        self.buf_start += n as u64;
        self.next_offset = self.buf_start;
        out
    }
}

/// Seekable reader over one object. The object length is fixed when the stream is opened.
pub struct ReadStream {
    store: Arc<dyn BlobStore>,
    blob: BlobRef,
    size: u64,
    chunk: usize,
    state: Mutex<ReadState>,
}

impl ReadStream {
    pub async fn open(store: Arc<dyn BlobStore>, blob: BlobRef, chunk: usize) -> FsResult<Self> {
        let props = store
            .blob_properties(&blob)
            .await
            .map_err(FsError::io("blob_properties", blob.to_string()))?;
        Ok(Self {
            store,
            blob,
            size: props.length,
            chunk: chunk.max(1),
            state: Mutex::new(ReadState::default()),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn blob(&self) -> &BlobRef {
        &self.blob
    }

    /// Reads up to `len` bytes at `offset`. `None` means end of stream.
    ///
    /// Reading before the previous read's end discards the buffer and downloads again.
    pub async fn read(&self, offset: u64, len: usize) -> FsResult<Option<Bytes>> {
        let mut state = self.state.lock().await;
        self.read_locked(&mut state, offset, len).await
    }

    async fn read_locked(
        &self,
        state: &mut ReadState,
        offset: u64,
        len: usize,
    ) -> FsResult<Option<Bytes>> {
        if len == 0 {
            return Ok(Some(Bytes::new()));
        }
        if offset < state.next_offset || offset < state.buf_start {
            trace!(blob = %self.blob, offset, expected = state.next_offset, "backward read, reset");
            state.reset(offset);
        }
        state.skip_to(offset);

        if state.buf.len() >= len {
            return Ok(Some(state.take(len)));
        }
        if state.eof {
            if state.buf.is_empty() {
                return Ok(None);
            }
            let n = state.buf.len();
            return Ok(Some(state.take(n)));
        }

        while state.buf.len() < len {
            let at = state.buf_start + state.buf.len() as u64;
            if at >= self.size {
                state.eof = true;
                break;
            }
            let want = (self.chunk as u64).min(self.size - at);
            let data = self
                .store
                .download_range(&self.blob, at, want)
                .await
                .map_err(FsError::io("download_range", self.blob.to_string()))?;
            if data.is_empty() {
                state.eof = true;
                break;
            }
            trace!(blob = %self.blob, at, len = data.len(), "downloaded chunk");
            state.buf.extend_from_slice(&data);
            if at + data.len() as u64 >= self.size {
                state.eof = true;
            }
        }

        if state.buf.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.take(len)))
    }

    /// Next CR-LF terminated line after the previous read, without the terminator.
    /// At the end of the object returns the trailing partial line, or `None`.
    pub async fn read_line(&self) -> FsResult<Option<String>> {
        let mut state = self.state.lock().await;
        if state.next_offset >= self.size {
            return Ok(None);
        }
        let mut line = Vec::new();
        loop {
            let at = state.next_offset;
            let Some(b) = self.read_locked(&mut state, at, 1).await? else {
                break;
            };
            match b[0] {
                b'\r' => {
                    let at = state.next_offset;
                    match self.read_locked(&mut state, at, 1).await? {
                        Some(n) if n[0] == b'\n' => {
                            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
                        }
                        other => {
                            return Err(FsError::InvalidArgument(format!(
                                "unexpected byte after \\r in {}: {:?}",
                                self.blob,
                                other.map(|b| b[0])
                            )));
                        }
                    }
                }
                c => line.push(c),
            }
        }
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::{BlobKind, InMemoryBlobStore};

    async fn object(content: Vec<u8>) -> (Arc<InMemoryBlobStore>, BlobRef) {
        let store = Arc::new(InMemoryBlobStore::new());
        store.create_container("c").await.unwrap();
        let blob = BlobRef::new("c", "f");
        store
            .create_blob(&blob, BlobKind::Block, Bytes::from(content), None)
            .await
            .unwrap();
        (store, blob)
    }

    fn pattern(n: usize) -> Vec<u8> {
        (0..n).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_sequential_chunked_reads() {
        let content = pattern(10_000);
        let (store, blob) = object(content.clone()).await;
        let reader = ReadStream::open(store.clone(), blob, 4096).await.unwrap();
        assert_eq!(reader.size(), 10_000);

        let a = reader.read(0, 4096).await.unwrap().unwrap();
        let b = reader.read(4096, 4096).await.unwrap().unwrap();
        let c = reader.read(8192, 4096).await.unwrap().unwrap();
        assert_eq!((a.len(), b.len(), c.len()), (4096, 4096, 1808));
        assert!(reader.read(12_288, 4096).await.unwrap().is_none());
        assert!(reader.read(10_000, 1).await.unwrap().is_none());

        let mut all = a.to_vec();
        all.extend_from_slice(&b);
        all.extend_from_slice(&c);
        assert_eq!(all, content);
        assert_eq!(store.download_count(), 3);
    }

    #[tokio::test]
    async fn test_small_reads_served_from_buffer() {
        let content = pattern(1000);
        let (store, blob) = object(content.clone()).await;
        let reader = ReadStream::open(store.clone(), blob, 4096).await.unwrap();
        let mut out = Vec::new();
        let mut offset = 0u64;
        while let Some(chunk) = reader.read(offset, 300).await.unwrap() {
            offset += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, content);
        assert_eq!(store.download_count(), 1);
        assert_eq!(reader.read(0, 0).await.unwrap().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_backward_read_reproduces_bytes() {
        let content = pattern(9000);
        let (store, blob) = object(content.clone()).await;
        let reader = ReadStream::open(store, blob, 1024).await.unwrap();
        let first = reader.read(2000, 3000).await.unwrap().unwrap();
        reader.read(5000, 4000).await.unwrap().unwrap();
        let again = reader.read(2000, 3000).await.unwrap().unwrap();
        assert_eq!(first, again);
        assert_eq!(&first[..], &content[2000..5000]);

        // 向前跳读
        let tail = reader.read(8500, 1000).await.unwrap().unwrap();
        assert_eq!(&tail[..], &content[8500..]);
    }

    #[tokio::test]
    async fn test_read_after_skip_past_eof() {
        let content = pattern(10_000);
        let (store, blob) = object(content.clone()).await;
        let reader = ReadStream::open(store, blob, 4096).await.unwrap();
        reader.read(0, 100).await.unwrap().unwrap();
        assert!(reader.read(20_000, 10).await.unwrap().is_none());

        // 越过末尾之后再读中间的有效区间
        let mid = reader.read(5000, 10).await.unwrap().unwrap();
        assert_eq!(&mid[..], &content[5000..5010]);
        let tail = reader.read(9995, 100).await.unwrap().unwrap();
        assert_eq!(&tail[..], &content[9995..]);
        assert!(reader.read(10_000, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_line() {
        let (store, blob) = object(b"first\r\nsecond\r\ntail".to_vec()).await;
        let reader = ReadStream::open(store.clone(), blob.clone(), 4).await.unwrap();
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(reader.read_line().await.unwrap(), None);

        store
            .create_blob(&blob, BlobKind::Block, Bytes::from_static(b"a\rb"), None)
            .await
            .unwrap();
        let reader = ReadStream::open(store, blob, 4).await.unwrap();
        assert!(matches!(
            reader.read_line().await,
            Err(FsError::InvalidArgument(_))
        ));
    }
}
