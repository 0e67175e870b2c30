//! Runtime configuration for a mounted BlobFS instance.
//!
//! Every tunable has a `DEFAULT_*` constant; `FsConfig::default()` assembles them and the
//! `with_*` setters override single values (the CLI and the tests both go through them).

use std::time::Duration;

pub const DEFAULT_FILES_CACHE_CAPACITY: usize = 65_535;
pub const DEFAULT_FILES_CACHE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_HANDLE_TABLE_CAPACITY: usize = 65_535;
pub const DEFAULT_READER_CACHE_CAPACITY: usize = 8;
pub const DEFAULT_READER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;
pub const TIB: u64 = 1024 * GIB;

pub const DEFAULT_DOWNLOAD_CHUNK: usize = 4 * MIB as usize;
pub const DEFAULT_BLOCK_UPLOAD_CHUNK: usize = 4 * MIB as usize;
pub const DEFAULT_APPEND_UPLOAD_CHUNK: usize = 4 * MIB as usize;
pub const DEFAULT_PAGE_UPLOAD_CHUNK: usize = 4 * MIB as usize;
pub const DEFAULT_BLOCK_LIMIT: u64 = 50_000;
pub const DEFAULT_BLOCK_SIZE_LIMIT: u64 = 5 * TIB;
pub const DEFAULT_APPEND_SIZE_LIMIT: u64 = 195 * GIB;
pub const DEFAULT_PAGE_SIZE_LIMIT: u64 = TIB;
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);

pub const DEFAULT_BATCH_RETRIES: u32 = 3;
pub const DEFAULT_BATCH_BACKOFF: Duration = Duration::from_millis(100);

pub const DEFAULT_COPY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DEFAULT_COPY_RENEW_EVERY: u32 = 1_200;

pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LISTEN_INTERVAL: Duration = Duration::from_millis(200);

pub const DEFAULT_UID: u32 = 0;
pub const DEFAULT_GID: u32 = 0;

/// Topic and subscription used for cross-process cache invalidation.
pub const INVALIDATION_TOPIC: &str = "blobfs-invalidation";
pub const DEFAULT_SUBSCRIPTION: &str = "blobfs";

/// Capacity and optional TTL of one `TtlCache` instance. `ttl == None` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub capacity: usize,
    pub ttl: Option<Duration>,
}

impl CacheSettings {
    pub const fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self { capacity, ttl }
    }
}

/// Chunking, ceilings and lease parameters used by the read/write streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSettings {
    pub download_chunk: usize,
    pub block_upload_chunk: usize,
    pub append_upload_chunk: usize,
    pub page_upload_chunk: usize,
    pub block_limit: u64,
    pub block_size_limit: u64,
    pub append_size_limit: u64,
    pub page_size_limit: u64,
    pub lease_duration: Duration,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            download_chunk: DEFAULT_DOWNLOAD_CHUNK,
            block_upload_chunk: DEFAULT_BLOCK_UPLOAD_CHUNK,
            append_upload_chunk: DEFAULT_APPEND_UPLOAD_CHUNK,
            page_upload_chunk: DEFAULT_PAGE_UPLOAD_CHUNK,
            block_limit: DEFAULT_BLOCK_LIMIT,
            block_size_limit: DEFAULT_BLOCK_SIZE_LIMIT,
            append_size_limit: DEFAULT_APPEND_SIZE_LIMIT,
            page_size_limit: DEFAULT_PAGE_SIZE_LIMIT,
            lease_duration: DEFAULT_LEASE_DURATION,
        }
    }
}

/// Retry policy for directory-wide copy/move/delete and the server-side copy poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSettings {
    pub retries: u32,
    pub backoff: Duration,
    pub copy_poll_interval: Duration,
    pub copy_renew_every: u32,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            retries: DEFAULT_BATCH_RETRIES,
            backoff: DEFAULT_BATCH_BACKOFF,
            copy_poll_interval: DEFAULT_COPY_POLL_INTERVAL,
            copy_renew_every: DEFAULT_COPY_RENEW_EVERY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsConfig {
    /// Prepended to every incoming path before it is split into container and key.
    pub prefix: String,
    pub files_cache: CacheSettings,
    pub handle_table: CacheSettings,
    pub reader_cache: CacheSettings,
    pub transfer: TransferSettings,
    pub batch: BatchSettings,
    /// Publish invalidations on the message bus for peer processes.
    pub cluster: bool,
    pub auto_convert_to_append: bool,
    pub uid: u32,
    pub gid: u32,
    pub renew_interval: Duration,
    pub listen_interval: Duration,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            files_cache: CacheSettings::new(
                DEFAULT_FILES_CACHE_CAPACITY,
                Some(DEFAULT_FILES_CACHE_TTL),
            ),
            handle_table: CacheSettings::new(DEFAULT_HANDLE_TABLE_CAPACITY, None),
            reader_cache: CacheSettings::new(
                DEFAULT_READER_CACHE_CAPACITY,
                Some(DEFAULT_READER_CACHE_TTL),
            ),
            transfer: TransferSettings::default(),
            batch: BatchSettings::default(),
            cluster: false,
            auto_convert_to_append: false,
            uid: DEFAULT_UID,
            gid: DEFAULT_GID,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            listen_interval: DEFAULT_LISTEN_INTERVAL,
        }
    }
}

impl FsConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_files_cache(mut self, capacity: usize, ttl: Option<Duration>) -> Self {
        self.files_cache = CacheSettings::new(capacity, ttl);
        self
    }

    pub fn with_handle_capacity(mut self, capacity: usize) -> Self {
        self.handle_table = CacheSettings::new(capacity, None);
        self
    }

    pub fn with_reader_cache(mut self, capacity: usize, ttl: Option<Duration>) -> Self {
        self.reader_cache = CacheSettings::new(capacity, ttl);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferSettings) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_batch(mut self, batch: BatchSettings) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_cluster(mut self, cluster: bool) -> Self {
        self.cluster = cluster;
        self
    }

    pub fn with_auto_convert_to_append(mut self, enabled: bool) -> Self {
        self.auto_convert_to_append = enabled;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_renew_interval(mut self, interval: Duration) -> Self {
        self.renew_interval = interval;
        self
    }

    pub fn with_listen_interval(mut self, interval: Duration) -> Self {
        self.listen_interval = interval;
        self
    }
}
