//! Inode xattr bookkeeping: logical size, mtime and backlink.
//!
//! The size xattr is a fixed-width hex string so the store-side
//! greater-than guard can compare lexicographically.

use crate::fs::{XATTR_BACKLINK, XATTR_CHUNK_SIZE, XATTR_FILE_SIZE, XATTR_MTIME};
use crate::fs::errors::{FsError, FsResult};
use crate::pool::{CmpOp, ObjectPool, PoolRef, StoreError, WriteOp};
use bytes::Bytes;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub fn size_to_hex(size: u64) -> String {
    format!("{:016x}", size)
}

pub fn size_from_hex(raw: &[u8]) -> Option<u64> {
    let text = std::str::from_utf8(raw).ok()?;
    u64::from_str_radix(text.trim(), 16).ok()
}

pub fn current_time_string() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{:010}.{:09}", now.as_secs(), now.subsec_nanos())
}

/// Reads the logical size recorded on the inode object; a never-written
/// inode reports 0.
pub async fn read_size(pool: &PoolRef, inode: &str) -> u64 {
    match pool.get_xattr(inode, XATTR_FILE_SIZE).await {
        Ok(raw) => size_from_hex(&raw).unwrap_or(0),
        Err(_) => 0,
    }
}

/// Like [`read_size`] but requires the inode object to exist.
pub async fn read_size_assert_exists(pool: &PoolRef, inode: &str) -> FsResult<u64> {
    match pool.get_xattr(inode, XATTR_FILE_SIZE).await {
        Ok(raw) => Ok(size_from_hex(&raw).unwrap_or(0)),
        Err(StoreError::NoData) => Ok(0),
        Err(e) => Err(FsError::from(e)),
    }
}

/// Builds the conditional size raise batched into every chunk write:
/// the guard aborts the whole batch when a newer writer already
/// advanced the size past `size` (benign). The file's chunk size rides
/// along, and the backlink does too when it has not been set yet.
pub fn set_size_if_bigger_op(size: u64, chunk_size: u64, backlink: Option<&str>) -> WriteOp {
    let hex = Bytes::from(size_to_hex(size));
    let mut op = WriteOp::new()
        .cmp_xattr(XATTR_FILE_SIZE, CmpOp::Gt, hex.clone())
        .set_xattr(XATTR_FILE_SIZE, hex)
        .set_xattr(XATTR_CHUNK_SIZE, Bytes::from(chunk_size.to_string()));

    if let Some(path) = backlink {
        op = op.set_xattr(XATTR_BACKLINK, Bytes::from(path.to_string()));
    }

    op
}

/// Unconditional size write used by truncate.
pub async fn set_size(
    pool: &PoolRef,
    inode: &str,
    size: u64,
    backlink: Option<&str>,
) -> FsResult<()> {
    let mut op = WriteOp::new()
        .create(false)
        .set_xattr(XATTR_FILE_SIZE, Bytes::from(size_to_hex(size)));

    if let Some(path) = backlink {
        op = op.set_xattr(XATTR_BACKLINK, Bytes::from(path.to_string()));
    }

    pool.operate_write(inode, op).await?;
    debug!(inode, size, "set size");
    Ok(())
}

/// Builds the idempotent backlink update: with `old` set the write only
/// lands when the stored backlink still matches `old` (rename), without
/// it the guard turns a repeated set into Canceled.
pub fn backlink_op(path: &str, old: Option<&str>) -> WriteOp {
    let value = Bytes::from(path.to_string());
    let op = match old {
        Some(previous) => {
            WriteOp::new().cmp_xattr(XATTR_BACKLINK, CmpOp::Eq, Bytes::from(previous.to_string()))
        }
        None => WriteOp::new().cmp_xattr(XATTR_BACKLINK, CmpOp::Ne, value.clone()),
    };
    op.set_xattr(XATTR_BACKLINK, value)
}

/// Fire-and-forget mtime touch scheduled by every mutating op.
pub fn touch_mtime_async(pool: PoolRef, inode: String) {
    tokio::spawn(async move {
        let op = WriteOp::new()
            .create(false)
            .set_xattr(XATTR_MTIME, Bytes::from(current_time_string()));
        if let Err(e) = pool.operate_write(&inode, op).await {
            debug!(inode, error = %e, "mtime update failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::MemoryPool;

    #[test]
    fn test_size_hex_roundtrip() {
        assert_eq!(size_to_hex(0), "0000000000000000");
        assert_eq!(size_to_hex(0x1f4), "00000000000001f4");
        assert_eq!(size_from_hex(b"00000000000001f4"), Some(0x1f4));
        assert_eq!(size_from_hex(b"not hex"), None);
    }

    #[test]
    fn test_hex_order_is_numeric_order() {
        for (a, b) in [(0u64, 1u64), (9, 16), (255, 256), (1 << 32, (1 << 32) + 1)] {
            assert!(size_to_hex(a) < size_to_hex(b));
        }
    }

    #[tokio::test]
    async fn test_size_raise_is_monotonic() {
        let pool: PoolRef = MemoryPool::new("p", 1 << 30);

        pool.operate_write("ino", set_size_if_bigger_op(100, 64, None))
            .await
            .unwrap();
        assert_eq!(read_size(&pool, "ino").await, 100);

        // A smaller raise aborts without touching the stored size.
        let err = pool
            .operate_write("ino", set_size_if_bigger_op(50, 64, None))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::Canceled);
        assert_eq!(read_size(&pool, "ino").await, 100);

        pool.operate_write("ino", set_size_if_bigger_op(200, 64, None))
            .await
            .unwrap();
        assert_eq!(read_size(&pool, "ino").await, 200);
    }

    #[tokio::test]
    async fn test_unconditional_set_size() {
        let pool: PoolRef = MemoryPool::new("p", 1 << 30);

        set_size(&pool, "ino", 4096, None).await.unwrap();
        assert_eq!(read_size(&pool, "ino").await, 4096);

        set_size(&pool, "ino", 16, None).await.unwrap();
        assert_eq!(read_size(&pool, "ino").await, 16);
    }

    #[tokio::test]
    async fn test_backlink_set_is_idempotent() {
        let pool: PoolRef = MemoryPool::new("p", 1 << 30);

        pool.operate_write("ino", backlink_op("/a/b", None)).await.unwrap();
        assert_eq!(
            pool.get_xattr("ino", XATTR_BACKLINK).await.unwrap(),
            Bytes::from_static(b"/a/b")
        );

        // Already matching: the guard cancels the rewrite.
        assert_eq!(
            pool.operate_write("ino", backlink_op("/a/b", None)).await,
            Err(StoreError::Canceled)
        );

        // Rename-style compare against the previous path.
        pool.operate_write("ino", backlink_op("/a/c", Some("/a/b")))
            .await
            .unwrap();
        assert_eq!(
            pool.get_xattr("ino", XATTR_BACKLINK).await.unwrap(),
            Bytes::from_static(b"/a/c")
        );

        // Stale rename loses.
        assert_eq!(
            pool.operate_write("ino", backlink_op("/a/d", Some("/a/b"))).await,
            Err(StoreError::Canceled)
        );
    }

    #[tokio::test]
    async fn test_read_size_assert_exists() {
        let pool: PoolRef = MemoryPool::new("p", 1 << 30);

        assert_eq!(
            read_size_assert_exists(&pool, "missing").await,
            Err(FsError::NotFound)
        );

        pool.operate_write("ino", WriteOp::new().create(false))
            .await
            .unwrap();
        assert_eq!(read_size_assert_exists(&pool, "ino").await, Ok(0));
    }
}
