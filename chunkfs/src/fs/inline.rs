//! The inline buffer: a bounded prefix of a file stored as an omap
//! entry on the parent directory object.
//!
//! Entry format: a fixed-width hex header carrying the live length L,
//! followed by exactly L payload bytes, L <= capacity. Every rewrite
//! goes through a compare-and-swap on the previous entry value so
//! concurrent writers from other clients retry instead of clobbering
//! each other.

use crate::fs::errors::FsResult;
use crate::fs::{INLINE_BUFFER_HEADER_SIZE, INLINE_BUFFER_KEY_PREFIX};
use crate::pool::{ObjectPool, PoolRef, StoreError, WriteOp};
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const CAS_RETRY_START: Duration = Duration::from_millis(25);

pub struct InlineBuffer {
    pool: PoolRef,
    parent_object: String,
    file_base_name: String,
    capacity: u64,
    /// Process-local mirror used once lazy removal arms it; a doomed
    /// file must stop touching the parent object.
    memory: Mutex<Option<Vec<u8>>>,
}

pub fn encode_entry(contents: &[u8]) -> Bytes {
    let mut entry = Vec::with_capacity(INLINE_BUFFER_HEADER_SIZE + contents.len());
    entry.extend_from_slice(format!("{:08x}", contents.len()).as_bytes());
    entry.extend_from_slice(contents);
    Bytes::from(entry)
}

pub fn decode_entry(entry: &[u8]) -> Vec<u8> {
    if entry.len() < INLINE_BUFFER_HEADER_SIZE {
        return Vec::new();
    }
    let len = std::str::from_utf8(&entry[..INLINE_BUFFER_HEADER_SIZE])
        .ok()
        .and_then(|text| usize::from_str_radix(text, 16).ok())
        .unwrap_or(0);
    let payload = &entry[INLINE_BUFFER_HEADER_SIZE..];
    payload[..len.min(payload.len())].to_vec()
}

impl InlineBuffer {
    pub fn new(pool: PoolRef, parent_object: &str, file_base_name: &str, capacity: u64) -> Self {
        Self {
            pool,
            parent_object: parent_object.to_string(),
            file_base_name: file_base_name.to_string(),
            capacity,
            memory: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn parent_object(&self) -> &str {
        &self.parent_object
    }

    pub fn file_base_name(&self) -> &str {
        &self.file_base_name
    }

    pub fn entry_key(&self) -> String {
        format!("{}{}", INLINE_BUFFER_KEY_PREFIX, self.file_base_name)
    }

    pub fn arm_memory_mirror(&self) {
        let mut memory = self.memory.lock().unwrap();
        if memory.is_none() {
            *memory = Some(Vec::new());
        }
    }

    /// Raw entry value, or empty when the entry (or parent) is absent.
    async fn raw_entry(&self) -> FsResult<Bytes> {
        let key = self.entry_key();
        match self
            .pool
            .get_omap_vals_by_keys(&self.parent_object, std::slice::from_ref(&key))
            .await
        {
            Ok(mut vals) => Ok(vals.remove(&key).unwrap_or_default()),
            Err(StoreError::NotFound) => Ok(Bytes::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Live contents of the inline region (length L, possibly empty).
    pub async fn read_contents(&self) -> FsResult<Vec<u8>> {
        if let Some(mirror) = self.memory.lock().unwrap().as_ref() {
            return Ok(mirror.clone());
        }
        Ok(decode_entry(&self.raw_entry().await?))
    }

    /// CAS loop shared by every rewrite: reads the current entry,
    /// derives the new contents from it, and retries with a doubling
    /// back-off while other writers race the swap.
    async fn rewrite<F>(&self, mut derive: F) -> FsResult<usize>
    where
        F: FnMut(Vec<u8>) -> Option<Vec<u8>>,
    {
        let mut backoff = CAS_RETRY_START;
        loop {
            let old_raw = self.raw_entry().await?;
            let contents = decode_entry(&old_raw);

            let updated = match derive(contents) {
                Some(updated) => updated,
                None => return Ok(0),
            };
            let new_len = updated.len();

            let op = WriteOp::new()
                .omap_cmp(&self.entry_key(), old_raw)
                .omap_set(&self.entry_key(), encode_entry(&updated));

            match self.pool.operate_write(&self.parent_object, op).await {
                Ok(()) => return Ok(new_len),
                Err(StoreError::Canceled) => {
                    debug!(
                        parent = %self.parent_object,
                        key = %self.entry_key(),
                        "inline buffer swap lost, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Places `buf` at `offset`, clamped to the capacity. Returns the
    /// number of bytes actually absorbed by the inline region.
    pub async fn write(&self, buf: &[u8], offset: u64) -> FsResult<usize> {
        if self.capacity == 0 || offset >= self.capacity {
            return Ok(0);
        }
        let offset = offset as usize;
        let placed = buf.len().min(self.capacity as usize - offset);

        if let Some(mirror) = self.memory.lock().unwrap().as_mut() {
            if mirror.len() < offset + placed {
                mirror.resize(offset + placed, 0);
            }
            mirror[offset..offset + placed].copy_from_slice(&buf[..placed]);
            return Ok(placed);
        }

        self.rewrite(|mut contents| {
            if contents.len() < offset + placed {
                contents.resize(offset + placed, 0);
            }
            contents[offset..offset + placed].copy_from_slice(&buf[..placed]);
            Some(contents)
        })
        .await?;

        Ok(placed)
    }

    /// Extends the live length to the full capacity with zero padding,
    /// so a write landing past the capacity leaves no inline hole.
    pub async fn fill_remaining(&self) -> FsResult<usize> {
        let capacity = self.capacity as usize;

        if let Some(mirror) = self.memory.lock().unwrap().as_mut() {
            if mirror.len() < capacity {
                mirror.resize(capacity, 0);
            }
            return Ok(mirror.len());
        }

        self.rewrite(|mut contents| {
            if contents.len() >= capacity {
                return None;
            }
            contents.resize(capacity, 0);
            Some(contents)
        })
        .await?;

        Ok(capacity)
    }

    /// Matches the user-visible size: above the capacity nothing
    /// changes, below it the live length becomes exactly `size`.
    pub async fn truncate(&self, size: u64) -> FsResult<()> {
        if size >= self.capacity {
            return Ok(());
        }
        let size = size as usize;

        if let Some(mirror) = self.memory.lock().unwrap().as_mut() {
            mirror.resize(size, 0);
            return Ok(());
        }

        self.rewrite(|mut contents| {
            if contents.len() == size {
                return None;
            }
            contents.resize(size, 0);
            Some(contents)
        })
        .await?;

        Ok(())
    }
}
