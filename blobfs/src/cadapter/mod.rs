//! Blob store adapter (cAdapter)
//!
//! Submodules:
//! - `memory`: in-process store with leases, staged blocks and fault injection
//! - `s3`: S3-compatible adapter on top of `aws-sdk-s3`
//!
//! Responsibilities summary:
//! - Define the `BlobStore` capability every filesystem layer talks to: containers,
//!   three object kinds, ranged download, append, staged block commit, leases, metadata,
//!   listing and server-side copy.
//! - Keep backend quirks (lease emulation, retries, checksums) behind that trait.

pub mod memory;
pub mod s3;

pub use memory::InMemoryBlobStore;
pub use s3::{S3BlobStore, S3Config};

use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, SystemTime};

pub type StoreResult<T> = Result<T, StoreError>;

/// Metadata key marking an object as a symbolic link.
pub const META_IS_LINK: &str = "isLink";
/// Metadata key holding the active write lease of an object.
pub const META_LEASE_ID: &str = "leaseID";
/// Metadata key holding the block ids uploaded so far by an unfinished writer.
pub const META_COMMITTED_BLOCKS: &str = "commitedBlocks";
/// Owner recorded on objects created through the filesystem.
pub const META_UID: &str = "uid";
pub const META_GID: &str = "gid";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    /// Built from staged blocks and an ordered commit.
    Block,
    /// Only grows at the end.
    Append,
    /// Fixed-size, page aligned.
    Page,
}

impl BlobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobKind::Block => "block",
            BlobKind::Append => "append",
            BlobKind::Page => "page",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "block" | "blockblob" => Some(BlobKind::Block),
            "append" | "appendblob" => Some(BlobKind::Append),
            "page" | "pageblob" => Some(BlobKind::Page),
            _ => None,
        }
    }
}

impl fmt::Display for BlobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one object: the container plus the key inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobRef {
    pub container: String,
    pub key: String,
}

impl BlobRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.container, self.key)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerProperties {
    pub created: SystemTime,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct BlobProperties {
    pub kind: BlobKind,
    pub length: u64,
    pub created: SystemTime,
    pub modified: SystemTime,
    pub content_md5: Option<String>,
    /// Committed blocks (block objects) or appended blocks (append objects).
    pub committed_block_count: u64,
    pub metadata: HashMap<String, String>,
}

impl BlobProperties {
    /// Case-insensitive metadata lookup; backends are free to fold key case.
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_link(&self) -> bool {
        self.metadata_value(META_IS_LINK).is_some()
    }
}

/// One listing result. `is_prefix` entries are the common prefixes of a delimited listing
/// and carry no properties.
#[derive(Debug, Clone)]
pub struct BlobItem {
    pub name: String,
    pub is_prefix: bool,
    pub properties: Option<BlobProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Failed(String),
}

/// Object storage capability used by the filesystem core.
///
/// Every call that mutates a leased object must carry the active lease id; a lease supplied
/// for an object that is not leased, or the wrong id, is a `StoreError::LeaseConflict`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn container_exists(&self, container: &str) -> StoreResult<bool>;

    async fn container_properties(&self, container: &str) -> StoreResult<ContainerProperties>;

    async fn create_container(&self, container: &str) -> StoreResult<()>;

    async fn delete_container(&self, container: &str) -> StoreResult<()>;

    async fn list_containers(&self) -> StoreResult<Vec<String>>;

    async fn blob_exists(&self, blob: &BlobRef) -> StoreResult<bool>;

    async fn blob_properties(&self, blob: &BlobRef) -> StoreResult<BlobProperties>;

    /// Creates or replaces the object with `content`. Metadata is reset.
    async fn create_blob(
        &self,
        blob: &BlobRef,
        kind: BlobKind,
        content: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()>;

    /// Deletes the object together with any snapshots.
    async fn delete_blob(&self, blob: &BlobRef, lease: Option<&str>) -> StoreResult<()>;

    /// Reads up to `len` bytes at `offset`; a range starting at or past the end is empty.
    async fn download_range(&self, blob: &BlobRef, offset: u64, len: u64) -> StoreResult<Bytes>;

    async fn append_block(&self, blob: &BlobRef, data: Bytes, lease: Option<&str>)
    -> StoreResult<()>;

    async fn stage_block(
        &self,
        blob: &BlobRef,
        block_id: &str,
        data: Bytes,
        lease: Option<&str>,
    ) -> StoreResult<()>;

    /// Replaces the content of a block object with the staged blocks, in order.
    async fn commit_block_list(
        &self,
        blob: &BlobRef,
        block_ids: &[String],
        lease: Option<&str>,
    ) -> StoreResult<()>;

    async fn acquire_lease(&self, blob: &BlobRef, duration: Duration) -> StoreResult<String>;

    async fn renew_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()>;

    async fn release_lease(&self, blob: &BlobRef, lease_id: &str) -> StoreResult<()>;

    async fn set_metadata(
        &self,
        blob: &BlobRef,
        key: &str,
        value: &str,
        lease: Option<&str>,
    ) -> StoreResult<()>;

    async fn remove_metadata(&self, blob: &BlobRef, key: &str, lease: Option<&str>)
    -> StoreResult<()>;

    async fn set_content_md5(
        &self,
        blob: &BlobRef,
        md5: Option<String>,
        lease: Option<&str>,
    ) -> StoreResult<()>;

    /// Lists objects of `container` whose key starts with `prefix`. With `delimited` only
    /// one level is returned: deeper keys collapse into `prefix/` entries.
    async fn list_blobs(
        &self,
        container: &str,
        prefix: &str,
        delimited: bool,
    ) -> StoreResult<Vec<BlobItem>>;

    async fn start_copy(&self, src: &BlobRef, dst: &BlobRef) -> StoreResult<()>;

    async fn copy_status(&self, dst: &BlobRef) -> StoreResult<CopyStatus>;
}

/// Sequential block id for the `index`-th uploaded chunk.
pub fn block_id(index: u64) -> String {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as B64;
    B64.encode(format!("BlockId{index:07}"))
}
