//! S3 适配器：container 对应 bucket，key 对应 object。
//!
//! S3 has no object kinds, leases or block lists, so this adapter emulates them:
//! - the kind and committed block count live in object metadata (`blobfs-kind`,
//!   `blobfs-blocks`);
//! - leases are held in-process in a `moka` cache;
//! - staged blocks are hidden objects under `.blobfs-staging/`, concatenated on commit
//!   (multipart upload for large results);
//! - append is read-modify-write;
//! - metadata updates copy the object onto itself with a replaced metadata set.

use super::{
    BlobItem, BlobKind, BlobProperties, BlobRef, BlobStore, ContainerProperties, CopyStatus,
    StoreResult,
};
use crate::error::{PathHint, StoreError};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, MetadataDirective};
use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, warn};

const KIND_META: &str = "blobfs-kind";
const BLOCKS_META: &str = "blobfs-blocks";
const STAGING_PREFIX: &str = ".blobfs-staging/";

/// S3 后端配置选项
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub force_path_style: bool,
    /// 分段大小（字节）；提交后超过该大小的对象走 multipart
    pub part_size: usize,
    /// 最大并发分段上传数
    pub max_concurrency: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始重试延迟（毫秒）
    pub initial_retry_delay_ms: u64,
    /// Upper bound on how long an abandoned lease entry is kept.
    pub lease_retention: Duration,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            force_path_style: true,
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 8,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            lease_retention: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    id: String,
    duration: Duration,
    expires_at: Instant,
}

impl LeaseEntry {
    fn is_active(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

pub struct S3BlobStore {
    client: Client,
    config: S3Config,
    leases: moka::future::Cache<String, LeaseEntry>,
    copies: Mutex<HashMap<String, CopyStatus>>,
    lease_seq: AtomicU64,
}

fn to_system_time(dt: Option<&DateTime>) -> SystemTime {
    match dt {
        Some(dt) if dt.secs() >= 0 => {
            UNIX_EPOCH + Duration::new(dt.secs() as u64, dt.subsec_nanos())
        }
        _ => UNIX_EPOCH,
    }
}

fn sdk_err<E: std::error::Error>(op: &'static str, e: E) -> StoreError {
    StoreError::backend(op, DisplayErrorContext(e))
}

fn staging_prefix(key: &str) -> String {
    format!("{STAGING_PREFIX}{key}/")
}

fn staging_key(key: &str, block_id: &str) -> String {
    format!("{}{}", staging_prefix(key), URL_SAFE_NO_PAD.encode(block_id))
}

fn conflict(blob: &BlobRef) -> StoreError {
    StoreError::LeaseConflict {
        path: PathHint::some(blob.to_string()),
    }
}

/// User-visible metadata with the adapter's bookkeeping keys removed.
fn split_metadata(mut raw: HashMap<String, String>) -> (BlobKind, u64, HashMap<String, String>) {
    let kind = raw
        .remove(KIND_META)
        .and_then(|k| BlobKind::parse(&k))
        .unwrap_or(BlobKind::Block);
    let blocks = raw
        .remove(BLOCKS_META)
        .and_then(|b| b.parse().ok())
        .unwrap_or(0);
    (kind, blocks, raw)
}

fn join_metadata(
    kind: BlobKind,
    blocks: u64,
    mut user: HashMap<String, String>,
) -> HashMap<String, String> {
    user.insert(KIND_META.to_string(), kind.as_str().to_string());
    user.insert(BLOCKS_META.to_string(), blocks.to_string());
    user
}

impl S3BlobStore {
    pub async fn connect(config: S3Config) -> StoreResult<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&sdk)
            .force_path_style(config.force_path_style)
            .build();
        let leases = moka::future::Cache::builder()
            .max_capacity(100_000)
            .time_to_live(config.lease_retention)
            .build();
        Ok(Self {
            client: Client::from_conf(s3_conf),
            config,
            leases,
            copies: Mutex::new(HashMap::new()),
            lease_seq: AtomicU64::new(0),
        })
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    fn next_lease_id(&self) -> String {
        let seq = self.lease_seq.fetch_add(1, Ordering::Relaxed);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        format!("{nanos:x}-{seq:08x}")
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e @ StoreError::Backend { .. }) if attempt <= max_retries => {
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    debug!(operation_name, attempt, error = %e, "retrying");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fails unless `lease` names the lease currently held on `blob` (or none is held and
    /// none is given).
    async fn check_lease(&self, blob: &BlobRef, lease: Option<&str>) -> StoreResult<()> {
        let held = self.leases.get(&blob.to_string()).await;
        let ok = match (held, lease) {
            (None, None) => true,
            (Some(held), None) => !held.is_active(),
            (Some(held), Some(given)) => held.id == given,
            (None, Some(_)) => false,
        };
        if ok { Ok(()) } else { Err(conflict(blob)) }
    }

    async fn head(&self, blob: &BlobRef) -> StoreResult<BlobProperties> {
        let resp = self
            .execute_with_retry(
                || async {
                    self.client
                        .head_object()
                        .bucket(&blob.container)
                        .key(&blob.key)
                        .send()
                        .await
                        .map_err(|e| match e.as_service_error() {
                            Some(se) if se.is_not_found() => StoreError::not_found(blob.to_string()),
                            _ => sdk_err("head_object", e),
                        })
                },
                "head_object",
            )
            .await?;
        let (kind, committed_block_count, metadata) =
            split_metadata(resp.metadata().cloned().unwrap_or_default());
        let modified = to_system_time(resp.last_modified());
        Ok(BlobProperties {
            kind,
            length: resp.content_length().unwrap_or(0).max(0) as u64,
            created: modified,
            modified,
            content_md5: resp.e_tag().map(|s| s.trim_matches('"').to_string()),
            committed_block_count,
            metadata,
        })
    }

    async fn get_all(&self, bucket: &str, key: &str) -> StoreResult<Bytes> {
        self.execute_with_retry(
            || async {
                let resp = self
                    .client
                    .get_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| match e.as_service_error() {
                        Some(se) if se.is_no_such_key() => {
                            StoreError::not_found(format!("/{bucket}/{key}"))
                        }
                        _ => sdk_err("get_object", e),
                    })?;
                resp.body
                    .collect()
                    .await
                    .map(|b| b.into_bytes())
                    .map_err(|e| sdk_err("get_object", e))
            },
            "get_object",
        )
        .await
    }

    async fn put_small(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()> {
        let checksum = Self::md5_base64(&data);
        self.execute_with_retry(
            || async {
                self.client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(ByteStream::from(data.clone()))
                    .content_md5(checksum.clone())
                    .set_metadata(Some(metadata.clone()))
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| sdk_err("put_object", e))
            },
            "put_object",
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
        semaphore: Arc<Semaphore>,
    ) -> StoreResult<(i32, Option<String>)> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| StoreError::backend("upload_part", e))?;
        let checksum = Self::md5_base64(&data);

        let operation = || async {
            self.client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(checksum.clone())
                .body(ByteStream::from(data.clone()))
                .send()
                .await
                .map_err(|e| sdk_err("upload_part", e))
        };

        self.execute_with_retry(operation, "upload_part")
            .await
            .map(|resp| (part_number, resp.e_tag().map(|s| s.to_string())))
    }

    /// Whole-object write; objects above `part_size` go through a multipart upload.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        metadata: HashMap<String, String>,
    ) -> StoreResult<()> {
        if data.len() <= self.config.part_size {
            return self.put_small(bucket, key, data, metadata).await;
        }

        let create = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| sdk_err("create_multipart_upload", e))?;
        let upload_id = create.upload_id().unwrap_or_default().to_string();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency));

        let mut parts = Vec::new();
        let mut idx = 0usize;
        let mut part_number = 1i32;
        while idx < data.len() {
            let end = (idx + self.config.part_size).min(data.len());
            parts.push(self.upload_part(
                bucket,
                key,
                &upload_id,
                part_number,
                data.slice(idx..end),
                sem.clone(),
            ));
            idx = end;
            part_number += 1;
        }

        let results = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(key, error = %DisplayErrorContext(abort), "abort multipart upload failed");
                }
                return Err(e);
            }
        };

        let completed_parts = results
            .into_iter()
            .map(|(pn, etag)| CompletedPart::builder().part_number(pn).set_e_tag(etag).build())
            .collect::<Vec<_>>();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| sdk_err("complete_multipart_upload", e))?;
        Ok(())
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .list_raw(bucket, prefix, false)
            .await?
            .into_iter()
            .map(|(name, _, _, _)| name)
            .collect())
    }

    /// `(name, is_prefix, size, last_modified)` for every entry under `prefix`.
    async fn list_raw(
        &self,
        bucket: &str,
        prefix: &str,
        delimited: bool,
    ) -> StoreResult<Vec<(String, bool, u64, SystemTime)>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut req = self.client.list_objects_v2().bucket(bucket).prefix(prefix);
            if delimited {
                req = req.delimiter("/");
            }
            if let Some(t) = &token {
                req = req.continuation_token(t);
            }
            let resp = req.send().await.map_err(|e| match e.as_service_error() {
                Some(se) if se.is_no_such_bucket() => StoreError::not_found(format!("/{bucket}")),
                _ => sdk_err("list_objects_v2", e),
            })?;
            for obj in resp.contents() {
                if let Some(key) = obj.key() {
                    out.push((
                        key.to_string(),
                        false,
                        obj.size().unwrap_or(0).max(0) as u64,
                        to_system_time(obj.last_modified()),
                    ));
                }
            }
            for cp in resp.common_prefixes() {
                if let Some(p) = cp.prefix() {
                    out.push((p.to_string(), true, 0, UNIX_EPOCH));
                }
            }
            match resp.next_continuation_token() {
                Some(t) if resp.is_truncated().unwrap_or(false) => token = Some(t.to_string()),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn delete_key(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.execute_with_retry(
            || async {
                self.client
                    .delete_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|e| sdk_err("delete_object", e))
            },
            "delete_object",
        )
        .await
    }

    /// Rewrites the user metadata of `blob` in place.
    async fn replace_metadata<F>(&self, blob: &BlobRef, edit: F) -> StoreResult<()>
    where
        F: FnOnce(&mut HashMap<String, String>) + Send,
    {
        let props = self.head(blob).await?;
        let mut user = props.metadata;
        edit(&mut user);
        let metadata = join_metadata(props.kind, props.committed_block_count, user);
        self.client
            .copy_object()
            .bucket(&blob.container)
            .key(&blob.key)
            .copy_source(format!("{}/{}", blob.container, blob.key))
            .metadata_directive(MetadataDirective::Replace)
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| sdk_err("copy_object", e))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn container_exists(&self, container: &str) -> StoreResult<bool> {
        match self.client.head_bucket().bucket(container).send().await {
            Ok(_) => Ok(true),
            Err(e) => match e.as_service_error() {
                Some(se) if se.is_not_found() => Ok(false),
                _ => Err(sdk_err("head_bucket", e)),
            },
        }
    }

    async fn container_properties(&self, container: &str) -> StoreResult<ContainerProperties> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| sdk_err("list_buckets", e))?;
        let bucket = resp
            .buckets()
            .iter()
            .find(|b| b.name() == Some(container))
            .ok_or_else(|| StoreError::not_found(format!("/{container}")))?;
        let created = to_system_time(bucket.creation_date());
        Ok(ContainerProperties {
            created,
            modified: created,
        })
    }

    async fn create_container(&self, container: &str) -> StoreResult<()> {
        match self.client.create_bucket().bucket(container).send().await {
            Ok(_) => Ok(()),
            Err(e) => match e.as_service_error() {
                Some(se) if se.is_bucket_already_exists() || se.is_bucket_already_owned_by_you() => {
                    Err(StoreError::AlreadyExists {
                        path: PathHint::some(format!("/{container}")),
                    })
                }
                _ => Err(sdk_err("create_bucket", e)),
            },
        }
    }

    async fn delete_container(&self, container: &str) -> StoreResult<()> {
        // bucket 必须为空才能删除
        for key in self.list_keys(container, "").await? {
            self.delete_key(container, &key).await?;
        }
        self.client
            .delete_bucket()
            .bucket(container)
            .send()
            .await
            .map_err(|e| sdk_err("delete_bucket", e))?;
        Ok(())
    }

    async fn list_containers(&self) -> StoreResult<Vec<String>> {
        let resp = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| sdk_err("list_buckets", e))?;
        Ok(resp
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }

    async fn blob_exists(&self, blob: &BlobRef) -> StoreResult<bool> {
        match self.head(blob).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn blob_properties(&self, blob: &BlobRef) -> StoreResult<BlobProperties> {
        self.head(blob).await
    }

    async fn create_blob(
        &self,
        blob: &BlobRef,
        kind: BlobKind,
        content: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        let blocks = u64::from(!content.is_empty());
        let metadata = join_metadata(kind, blocks, HashMap::new());
        self.put_object(&blob.container, &blob.key, content, metadata)
            .await
    }

    async fn delete_blob(&self, blob: &BlobRef, lease: Option<&str>) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        if !self.blob_exists(blob).await? {
            return Err(StoreError::not_found(blob.to_string()));
        }
        self.delete_key(&blob.container, &blob.key).await?;
        self.leases.invalidate(&blob.to_string()).await;
        Ok(())
    }

    async fn download_range(&self, blob: &BlobRef, offset: u64, len: u64) -> StoreResult<Bytes> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let range = format!("bytes={}-{}", offset, offset + len - 1);
        let resp = self
            .client
            .get_object()
            .bucket(&blob.container)
            .key(&blob.key)
            .range(range)
            .send()
            .await;
        match resp {
            Ok(o) => o
                .body
                .collect()
                .await
                .map(|b| b.into_bytes())
                .map_err(|e| sdk_err("get_object", e)),
            Err(e) => {
                // 416: 起始偏移已超出对象末尾
                if e.raw_response().map(|r| r.status().as_u16()) == Some(416) {
                    return Ok(Bytes::new());
                }
                match e.as_service_error() {
                    Some(se) if se.is_no_such_key() => Err(StoreError::not_found(blob.to_string())),
                    _ => Err(sdk_err("get_object", e)),
                }
            }
        }
    }

    async fn append_block(
        &self,
        blob: &BlobRef,
        data: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        let props = self.head(blob).await?;
        if props.kind != BlobKind::Append {
            return Err(StoreError::backend(
                "append_block",
                format!("{blob} is a {} object", props.kind),
            ));
        }
        let existing = self.get_all(&blob.container, &blob.key).await?;
        let mut buf = BytesMut::with_capacity(existing.len() + data.len());
        buf.extend_from_slice(&existing);
        buf.extend_from_slice(&data);
        let metadata = join_metadata(
            BlobKind::Append,
            props.committed_block_count + 1,
            props.metadata,
        );
        self.put_object(&blob.container, &blob.key, buf.freeze(), metadata)
            .await
    }

    async fn stage_block(
        &self,
        blob: &BlobRef,
        block_id: &str,
        data: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        self.put_small(
            &blob.container,
            &staging_key(&blob.key, block_id),
            data,
            HashMap::new(),
        )
        .await
    }

    async fn commit_block_list(
        &self,
        blob: &BlobRef,
        block_ids: &[String],
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        let props = self.head(blob).await?;
        let mut buf = BytesMut::new();
        for id in block_ids {
            let part = self
                .get_all(&blob.container, &staging_key(&blob.key, id))
                .await?;
            buf.extend_from_slice(&part);
        }
        let metadata = join_metadata(BlobKind::Block, block_ids.len() as u64, props.metadata);
        self.put_object(&blob.container, &blob.key, buf.freeze(), metadata)
            .await?;
        for key in self
            .list_keys(&blob.container, &staging_prefix(&blob.key))
            .await?
        {
            if let Err(e) = self.delete_key(&blob.container, &key).await {
                warn!(key, error = %e, "failed to remove staged block");
            }
        }
        Ok(())
    }

    async fn acquire_lease(&self, blob: &BlobRef, duration: Duration) -> StoreResult<String> {
        if !self.blob_exists(blob).await? {
            return Err(StoreError::not_found(blob.to_string()));
        }
        let candidate = LeaseEntry {
            id: self.next_lease_id(),
            duration,
            expires_at: Instant::now() + duration,
        };
        let entry = self
            .leases
            .entry(blob.to_string())
            .or_insert_with(async { candidate.clone() })
            .await;
        if entry.is_fresh() {
            return Ok(candidate.id);
        }
        if entry.into_value().is_active() {
            return Err(conflict(blob));
        }
        // 过期租约可被重新获取
        self.leases
            .insert(blob.to_string(), candidate.clone())
            .await;
        Ok(candidate.id)
    }

    async fn renew_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()> {
        match self.leases.get(&blob.to_string()).await {
            Some(mut held) if held.id == lease_id => {
                held.expires_at = Instant::now() + held.duration;
                self.leases.insert(blob.to_string(), held).await;
                Ok(())
            }
            _ => Err(conflict(blob)),
        }
    }

    async fn release_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()> {
        match self.leases.get(&blob.to_string()).await {
            Some(held) if held.id == lease_id => {
                self.leases.invalidate(&blob.to_string()).await;
                Ok(())
            }
            _ => Err(conflict(blob)),
        }
    }

    async fn set_metadata(
        &self,
        blob: &BlobRef,
        key: &str,
        value: &str,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        let key = key.to_ascii_lowercase();
        let value = value.to_string();
        self.replace_metadata(blob, move |m| {
            m.retain(|k, _| !k.eq_ignore_ascii_case(&key));
            m.insert(key, value);
        })
        .await
    }

    async fn remove_metadata(
        &self,
        blob: &BlobRef,
        key: &str,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        self.check_lease(blob, lease).await?;
        let key = key.to_string();
        self.replace_metadata(blob, move |m| m.retain(|k, _| !k.eq_ignore_ascii_case(&key)))
            .await
    }

    async fn set_content_md5(
        &self,
        blob: &BlobRef,
        _md5: Option<String>,
        lease: Option<&str>,
    ) -> StoreResult<()> {
        // S3 的 MD5 由 ETag 决定，无法单独设置
        self.check_lease(blob, lease).await
    }

    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimited: bool,
    ) -> StoreResult<Vec<BlobItem>> {
        let raw = self.list_raw(container, prefix, delimited).await?;
        Ok(raw
            .into_iter()
            .filter(|(name, _, _, _)| !name.starts_with(STAGING_PREFIX))
            .map(|(name, is_prefix, length, modified)| BlobItem {
                name,
                is_prefix,
                properties: (!is_prefix).then(|| BlobProperties {
                    kind: BlobKind::Block,
                    length,
                    created: modified,
                    modified,
                    content_md5: None,
                    committed_block_count: 0,
                    metadata: HashMap::new(),
                }),
            })
            .collect())
    }

    async fn start_copy(&self, src: &BlobRef, dst: &BlobRef) -> StoreResult<()> {
        self.check_lease(dst, None).await?;
        if !self.blob_exists(src).await? {
            return Err(StoreError::not_found(src.to_string()));
        }
        // copy_object 是同步完成的，状态立即可查
        let status = match self
            .client
            .copy_object()
            .bucket(&dst.container)
            .key(&dst.key)
            .copy_source(format!("{}/{}", src.container, src.key))
            .metadata_directive(MetadataDirective::Copy)
            .send()
            .await
        {
            Ok(_) => CopyStatus::Success,
            Err(e) => CopyStatus::Failed(DisplayErrorContext(e).to_string()),
        };
        self.copies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(dst.to_string(), status);
        Ok(())
    }

    async fn copy_status(&self, dst: &BlobRef) -> StoreResult<CopyStatus> {
        self.copies
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&dst.to_string())
            .cloned()
            .ok_or_else(|| StoreError::not_found(dst.to_string()))
    }
}
