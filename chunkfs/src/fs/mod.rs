pub mod async_op;
pub mod attrs;
pub mod chunk;
pub mod errors;
pub mod file_io;
pub mod inline;
pub mod lock;

use crate::fs::file_io::FileIO;
use crate::pool::PoolRef;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use errors::{FsError, FsResult};

/// Advisory lock identity on the inode object. One logical lock, two
/// cookies: shared single-chunk writers share one, exclusive users get
/// the other.
pub const FILE_CHUNK_LOCKER: &str = "file-chunk-locker";
pub const FILE_CHUNK_LOCKER_COOKIE_WRITE: &str = "file-chunk-locker-cookie-write";
pub const FILE_CHUNK_LOCKER_COOKIE_OTHER: &str = "file-chunk-locker-cookie-other";
pub const FILE_CHUNK_LOCKER_TAG: &str = "file-chunk-locker-tag";

pub const FILE_LOCK_DURATION: Duration = Duration::from_secs(120);
pub const FILE_IDLE_LOCK_TIMEOUT: Duration = Duration::from_secs(1);
const IDLE_LOCK_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Xattr names on the inode object.
pub const XATTR_FILE_SIZE: &str = "cfs.size";
pub const XATTR_MTIME: &str = "cfs.mtime";
pub const XATTR_BACKLINK: &str = "cfs.backlink";
pub const XATTR_CHUNK_SIZE: &str = "cfs.chunk-size";
pub const XATTR_LAST_CHUNK_SIZE: &str = "cfs.last-chunk-size";

/// Omap key prefix of inline-buffer entries on a parent directory
/// object; the file's basename follows the prefix.
pub const INLINE_BUFFER_KEY_PREFIX: &str = "cfs.inline.";
pub const INLINE_BUFFER_HEADER_SIZE: usize = 8;

/// Per-filesystem registry handing out shared [`FileIO`] handles keyed
/// by inode. It also runs the idle-lock sweep that returns locks
/// nobody is using, so other clients never wait out a full lease.
pub struct FileIoRegistry {
    handles: DashMap<String, Arc<FileIO>>,
    shutdown: CancellationToken,
}

impl FileIoRegistry {
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            handles: DashMap::new(),
            shutdown: CancellationToken::new(),
        });

        let weak = Arc::downgrade(&registry);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_LOCK_SWEEP_INTERVAL).await;
                let registry = match weak.upgrade() {
                    Some(registry) => registry,
                    None => break,
                };
                if registry.shutdown.is_cancelled() {
                    break;
                }

                let handles: Vec<Arc<FileIO>> = registry
                    .handles
                    .iter()
                    .map(|entry| Arc::clone(entry.value()))
                    .collect();
                for io in handles {
                    io.manage_idle_lock(FILE_IDLE_LOCK_TIMEOUT).await;
                }
            }
            debug!("idle-lock sweep stopped");
        });

        registry
    }

    pub fn get_or_insert(&self, pool: &PoolRef, inode: &str, chunk_size: u64) -> Arc<FileIO> {
        Arc::clone(
            self.handles
                .entry(inode.to_string())
                .or_insert_with(|| FileIO::new(Arc::clone(pool), inode, chunk_size))
                .value(),
        )
    }

    pub fn get_or_insert_with_path(
        &self,
        pool: &PoolRef,
        inode: &str,
        path: &str,
        chunk_size: u64,
    ) -> Arc<FileIO> {
        Arc::clone(
            self.handles
                .entry(inode.to_string())
                .or_insert_with(|| FileIO::new_with_path(Arc::clone(pool), inode, path, chunk_size))
                .value(),
        )
    }

    pub fn get(&self, inode: &str) -> Option<Arc<FileIO>> {
        self.handles.get(inode).map(|entry| Arc::clone(entry.value()))
    }

    /// True when only the registry and the caller still hold the
    /// handle; gates safe teardown.
    pub fn is_unique_after_registry(io: &Arc<FileIO>) -> bool {
        Arc::strong_count(io) == 2
    }

    /// Lets go of one user's handle; the last user's release closes
    /// the FileIO and drops it from the registry. The idle sweep
    /// clones handles for the length of a sweep, so a transient extra
    /// holder gets a moment to let go before the handle is kept alive.
    pub async fn release(&self, io: Arc<FileIO>) {
        for _ in 0..3 {
            if Self::is_unique_after_registry(&io) {
                self.handles.remove(io.inode());
                io.close().await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl Drop for FileIoRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
