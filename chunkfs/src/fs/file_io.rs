//! The file I/O engine: maps a logical file (inode + byte range) onto
//! chunk objects in the backing pool, folds the optional inline buffer
//! into the address space, coordinates writers through the inode's
//! advisory lock, and drives everything as tracked async operations.

use crate::fs::async_op::{AsyncOp, OpCallback, OpsRegistry};
use crate::fs::attrs;
use crate::fs::chunk::{
    align_chunk_size, align_up, chunk_name, chunk_slices, last_chunk_index,
    split_at_inline_capacity, InlineSplit,
};
use crate::fs::errors::{check_retcode, FsError, FsResult};
use crate::fs::inline::InlineBuffer;
use crate::fs::lock::InodeLock;
use crate::fs::{FILE_IDLE_LOCK_TIMEOUT, XATTR_LAST_CHUNK_SIZE};
use crate::pool::{ObjectPool, PoolRef, StoreError, WriteOp};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use uuid::Uuid;

struct SlotInner {
    buf: Vec<u8>,
    ret: i64,
}

/// Destination of one caller interval: the filled buffer plus the
/// bytes-read slot, updated independently by every sub-read that lands
/// in it.
pub struct ReadSlot {
    inner: Mutex<SlotInner>,
}

impl ReadSlot {
    fn new(len: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SlotInner {
                buf: vec![0; len],
                ret: 0,
            }),
        })
    }

    fn copy_at(&self, at: usize, bytes: &[u8]) {
        let mut inner = self.inner.lock().unwrap();
        inner.buf[at..at + bytes.len()].copy_from_slice(bytes);
    }

    /// Positive values accumulate; the first negative value sticks
    /// unless bytes were already credited.
    fn add_return_value(&self, value: i64) {
        let mut inner = self.inner.lock().unwrap();
        if value >= 0 {
            inner.ret += value;
        } else if inner.ret == 0 {
            inner.ret = value;
        }
    }

    fn bytes_read(&self) -> i64 {
        self.inner.lock().unwrap().ret
    }

    fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.inner.lock().unwrap().buf)
    }
}

/// Caller-retained view of one interval's outcome, valid after the op
/// has been synced.
pub struct ReadHandle(Arc<ReadSlot>);

impl ReadHandle {
    pub fn bytes_read(&self) -> i64 {
        self.0.bytes_read()
    }

    /// The interval's whole buffer (zero-filled where nothing landed).
    pub fn bytes(&self) -> Bytes {
        self.0.snapshot()
    }

    /// The prefix actually read.
    pub fn read_data(&self) -> Bytes {
        let read = self.bytes_read().max(0) as usize;
        self.0.snapshot().slice(..read)
    }
}

/// One interval of a vector read.
pub struct ReadInterval {
    pub offset: u64,
    pub length: usize,
    slot: Arc<ReadSlot>,
}

impl ReadInterval {
    pub fn new(offset: u64, length: usize) -> (Self, ReadHandle) {
        let slot = ReadSlot::new(length);
        (
            Self {
                offset,
                length,
                slot: Arc::clone(&slot),
            },
            ReadHandle(slot),
        )
    }
}

/// A fragment of one interval that fits a single read target.
#[derive(Clone)]
struct ReadPiece {
    slot: Arc<ReadSlot>,
    /// Absolute file offset of the fragment.
    file_offset: u64,
    len: usize,
    /// Where the fragment lands inside the interval's buffer.
    buf_offset: usize,
}

/// Credits the zero bytes between what the store returned and what the
/// recorded file size covers. The slot buffer is pre-zeroed, so only
/// the byte count moves.
fn credit_zero_fill(piece: &ReadPiece, copied: usize, file_size: u64) {
    let start = piece.file_offset + copied as u64;
    let end = (piece.file_offset + piece.len as u64).min(file_size);
    if end > start {
        piece.slot.add_return_value((end - start) as i64);
    }
}

/// Fetched lazily, at most once per read op.
async fn shared_file_size(cell: &Arc<OnceCell<u64>>, pool: &PoolRef, inode: &str) -> u64 {
    *cell
        .get_or_init(|| async {
            let size = attrs::read_size(pool, inode).await;
            debug!(inode, size, "resolved file size for vector read");
            size
        })
        .await
}

struct BacklinkState {
    path: Option<String>,
    has_backlink: bool,
}

/// Engine state shared with background submission tasks. The public
/// [`FileIO`] stays out of those tasks on purpose: its reference count
/// is what the handle registry uses to decide when the last user is
/// gone.
struct FileCore {
    pool: PoolRef,
    inode: String,
    chunk_size: u64,
    lazy_removal: AtomicBool,
    lock: InodeLock,
    inline: Mutex<Option<Arc<InlineBuffer>>>,
    backlink: Mutex<BacklinkState>,
}

pub struct FileIO {
    core: Arc<FileCore>,
    ops: OpsRegistry,
}

impl FileIO {
    pub fn new(pool: PoolRef, inode: &str, chunk_size: u64) -> Arc<Self> {
        Self::build(pool, inode, None, chunk_size)
    }

    pub fn new_with_path(pool: PoolRef, inode: &str, path: &str, chunk_size: u64) -> Arc<Self> {
        let path = (!path.is_empty()).then(|| path.to_string());
        Self::build(pool, inode, path, chunk_size)
    }

    fn build(pool: PoolRef, inode: &str, path: Option<String>, chunk_size: u64) -> Arc<Self> {
        assert!(chunk_size != 0);
        let chunk_size = align_chunk_size(chunk_size, pool.alignment());
        let lock = InodeLock::new(Arc::clone(&pool), inode.to_string());
        Arc::new(Self {
            core: Arc::new(FileCore {
                pool,
                inode: inode.to_string(),
                chunk_size,
                lazy_removal: AtomicBool::new(false),
                lock,
                inline: Mutex::new(None),
                backlink: Mutex::new(BacklinkState {
                    has_backlink: path.is_none(),
                    path,
                }),
            }),
            ops: OpsRegistry::new(),
        })
    }

    pub fn inode(&self) -> &str {
        &self.core.inode
    }

    pub fn pool(&self) -> &PoolRef {
        &self.core.pool
    }

    pub fn chunk_size(&self) -> u64 {
        self.core.chunk_size
    }

    pub fn chunk_path(&self, offset: u64) -> String {
        chunk_name(&self.core.inode, offset / self.core.chunk_size)
    }

    pub fn set_lazy_removal(&self, remove: bool) {
        self.core.lazy_removal.store(remove, Ordering::SeqCst);
        if remove {
            if let Some(inline) = self.core.inline.lock().unwrap().as_ref() {
                inline.arm_memory_mirror();
            }
        }
    }

    pub fn lazy_removal(&self) -> bool {
        self.core.lazy_removal.load(Ordering::SeqCst)
    }

    /// Routes the file's first `capacity` bytes through an omap entry
    /// on the parent object keyed by the file's basename.
    pub fn set_inline_buffer(&self, parent_object: &str, path: &str, capacity: u64) {
        let base_name = path.rsplit('/').next().unwrap_or(path);
        let mut slot = self.core.inline.lock().unwrap();

        if let Some(existing) = slot.as_ref() {
            if existing.parent_object() == parent_object && existing.file_base_name() == base_name {
                return;
            }
        }

        let buffer = Arc::new(InlineBuffer::new(
            Arc::clone(&self.core.pool),
            parent_object,
            base_name,
            capacity,
        ));
        if self.lazy_removal() {
            buffer.arm_memory_mirror();
        }
        *slot = Some(buffer);
    }

    pub fn inline_buffer(&self) -> Option<Arc<InlineBuffer>> {
        self.core.inline_buffer()
    }

    pub fn set_path(&self, path: &str) {
        let mut state = self.core.backlink.lock().unwrap();
        state.path = Some(path.to_string());
        state.has_backlink = false;
    }

    pub fn path(&self) -> Option<String> {
        self.core.backlink.lock().unwrap().path.clone()
    }

    pub fn set_has_backlink(&self, has_backlink: bool) {
        self.core.set_has_backlink(has_backlink);
    }

    pub fn has_backlink(&self) -> bool {
        self.core.backlink.lock().unwrap().has_backlink
    }

    pub fn should_set_backlink(&self) -> bool {
        let state = self.core.backlink.lock().unwrap();
        !state.has_backlink && state.path.is_some()
    }

    pub fn has_running_async_ops(&self) -> bool {
        self.ops.has_running_ops()
    }

    pub async fn manage_idle_lock(&self, idle_timeout: Duration) {
        self.core.lock.manage_idle_lock(idle_timeout).await;
    }

    /// Waits for one op and surfaces its aggregate return code.
    pub async fn sync(&self, op_id: &str) -> FsResult<()> {
        check_retcode(self.ops.sync(op_id).await)
    }

    pub async fn size(&self) -> u64 {
        attrs::read_size(&self.core.pool, &self.core.inode).await
    }

    pub async fn last_chunk_index_and_size(&self) -> FsResult<(u64, u64)> {
        self.core.last_chunk_index_and_size().await
    }

    // ---- reads ---------------------------------------------------------

    pub async fn read_scalar(&self, offset: u64, len: usize) -> FsResult<Bytes> {
        if len == 0 {
            debug!("cannot read 0 bytes");
            return Err(FsError::InvalidArgument);
        }

        let (interval, handle) = ReadInterval::new(offset, len);
        let op_id = self.read_vector(vec![interval], None).await?;
        self.sync(&op_id).await?;

        let read = handle.bytes_read();
        if read < 0 {
            return Err(FsError::from_retcode(read as i32));
        }
        Ok(handle.bytes().slice(..read as usize))
    }

    /// Submits one async read op covering all intervals and returns its
    /// id; the caller syncs it (or gets the callback) before touching
    /// the handles.
    pub async fn read_vector(
        &self,
        intervals: Vec<ReadInterval>,
        callback: Option<OpCallback>,
    ) -> FsResult<String> {
        let _ = self.ops.sync_all(true).await;

        if intervals.is_empty() {
            debug!("no intervals given for reading");
            return Err(FsError::InvalidArgument);
        }

        let op = AsyncOp::with_generated_id();
        if let Some(callback) = callback {
            op.set_callback(callback);
        }
        self.ops.add(Arc::clone(&op));
        let op_id = op.id().to_string();

        let core = &self.core;
        let inline = core.inline_buffer();
        let capacity = inline.as_ref().map(|b| b.capacity()).unwrap_or(0);

        let mut inline_pieces: Vec<ReadPiece> = Vec::new();
        let mut chunk_pieces: BTreeMap<u64, Vec<ReadPiece>> = BTreeMap::new();

        for interval in &intervals {
            let split = if inline.is_some() {
                split_at_inline_capacity(interval.offset, interval.length, capacity)
            } else {
                InlineSplit {
                    inline: None,
                    inode: Some((interval.offset, interval.length)),
                }
            };

            if let Some((offset, len)) = split.inline {
                inline_pieces.push(ReadPiece {
                    slot: Arc::clone(&interval.slot),
                    file_offset: offset,
                    len,
                    buf_offset: 0,
                });
            }

            if let Some((offset, len)) = split.inode {
                let base = (offset - interval.offset) as usize;
                for slice in chunk_slices(offset, len, core.chunk_size) {
                    chunk_pieces.entry(slice.index).or_default().push(ReadPiece {
                        slot: Arc::clone(&interval.slot),
                        file_offset: slice.index * core.chunk_size + slice.local_offset,
                        len: slice.len,
                        buf_offset: base + slice.buf_offset,
                    });
                }
            }
        }

        let size_cell: Arc<OnceCell<u64>> = Arc::new(OnceCell::new());

        if let Some(inline) = inline {
            if !inline_pieces.is_empty() {
                debug!(op = %op_id, "vector reading inline buffer");
                core.spawn_inline_read(inline, inline_pieces, &op, &size_cell);
            }
        }

        for (index, pieces) in chunk_pieces {
            core.spawn_chunk_read(index, pieces, &op, &size_cell);
        }

        op.set_ready();
        Ok(op_id)
    }

    // ---- writes --------------------------------------------------------

    fn verify_write_params(&self, offset: u64, len: usize) -> FsResult<()> {
        if len == 0 {
            debug!("cannot write 0 bytes");
            return Err(FsError::InvalidArgument);
        }
        if offset + len as u64 > self.core.pool.max_object_size() {
            return Err(FsError::FileTooBig);
        }
        Ok(())
    }

    /// Performs the write on the caller's task and surfaces the
    /// aggregate return code.
    pub async fn write_sync(&self, data: Bytes, offset: u64) -> FsResult<()> {
        self.verify_write_params(offset, data.len())?;

        let op = AsyncOp::with_generated_id();
        self.ops.add(Arc::clone(&op));
        let op_id = op.id().to_string();

        self.core.real_write(data, offset, op).await;
        self.sync(&op_id).await
    }

    /// Dispatches the write to a background task and returns its op id
    /// immediately.
    pub fn write(&self, data: Bytes, offset: u64) -> FsResult<String> {
        self.write_with_callback(data, offset, None)
    }

    pub fn write_with_callback(
        &self,
        data: Bytes,
        offset: u64,
        callback: Option<OpCallback>,
    ) -> FsResult<String> {
        self.verify_write_params(offset, data.len())?;

        let op = AsyncOp::with_generated_id();
        if let Some(callback) = callback {
            op.set_callback(callback);
        }
        self.ops.add(Arc::clone(&op));
        let op_id = op.id().to_string();

        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            core.real_write(data, offset, op).await;
        });

        Ok(op_id)
    }

    // ---- truncate / remove ---------------------------------------------

    pub async fn truncate(&self, new_size: u64) -> FsResult<()> {
        let core = &self.core;

        if new_size > core.pool.max_object_size() {
            debug!("the size given for truncating is too big for the pool");
            return Err(FsError::FileTooBig);
        }

        let _ = self.ops.sync_all(true).await;
        attrs::touch_mtime_async(Arc::clone(&core.pool), core.inode.clone());

        core.lock.release_shared().await;

        let op_id = Uuid::new_v4().to_string();
        core.lock.lock_exclusive(&op_id).await;

        if let Some(inline) = core.inline_buffer() {
            inline.truncate(new_size).await?;
        }

        let (last_chunk, current_size) = match core.last_chunk_index_and_size().await {
            Ok(v) => v,
            Err(FsError::NotFound) | Err(FsError::NoData) => (0, 0),
            Err(e) => return Err(e),
        };

        let chunk_size = core.chunk_size;
        let new_last = last_chunk_index(new_size, chunk_size);
        let truncate_down = current_size > new_size;
        let tail_size = match new_size {
            0 => 0,
            n if n % chunk_size == 0 => chunk_size,
            n => n % chunk_size,
        };
        let total_chunks = if truncate_down {
            last_chunk - new_last + 1
        } else {
            1
        };

        let backlink = core.pending_backlink();
        let carries_backlink = backlink.is_some();
        attrs::set_size(&core.pool, &core.inode, new_size, backlink.as_deref()).await?;
        if carries_backlink {
            core.set_has_backlink(true);
        }

        debug!(inode = %core.inode, op = %op_id, new_size, "truncating");

        let op = AsyncOp::new(op_id.clone());
        self.ops.add(Arc::clone(&op));

        // Tail first: concurrent opens observe the new size before the
        // surviving chunk shrinks.
        for i in (0..total_chunks).rev() {
            core.lock.lock_exclusive(&op_id).await;

            let index = new_last + i;
            let chunk = chunk_name(&core.inode, index);

            let write_op = if i == 0 {
                // The chunk that survives is truncated in place, never
                // removed.
                if core.pool.has_alignment() {
                    let zeros = vec![0u8; (chunk_size - tail_size) as usize];
                    match core
                        .build_aligned_rmw(&chunk, tail_size, &zeros, Some(tail_size), true)
                        .await
                    {
                        Ok(write_op) => write_op,
                        Err(e) => {
                            op.push_result(e.to_retcode());
                            continue;
                        }
                    }
                } else {
                    WriteOp::new().assert_exists().truncate(tail_size)
                }
            } else {
                debug!(chunk = %chunk, op = %op_id, "removing chunk in truncate");
                WriteOp::new().remove(false)
            };

            core.submit_write_op(&chunk, write_op, &op);
        }

        op.set_ready();
        let code = core.lock.sync_and_reset_locker(&op).await;
        if code != 0 {
            // A missing tail chunk is the usual benign case when
            // truncating a hole upwards.
            debug!(inode = %core.inode, op = %op_id, retcode = code, "truncate op finished");
        }
        Ok(())
    }

    /// Removes every chunk including the base one, from chunk 0 upward
    /// so observers see the file absent as early as possible.
    pub async fn remove(&self) -> FsResult<()> {
        let core = &self.core;
        let op_id = Uuid::new_v4().to_string();
        let _ = self.ops.sync_all(true).await;

        core.lock.release_shared().await;
        core.lock.lock_exclusive(&op_id).await;

        let (last_chunk, _) = match core.last_chunk_index_and_size().await {
            Ok(v) => v,
            Err(e) => {
                debug!(inode = %core.inode, error = %e, "cannot resolve chunks for removal");
                return Err(e);
            }
        };

        debug!(inode = %core.inode, op = %op_id, last_chunk, "removing inode chunks");

        let op = AsyncOp::new(op_id.clone());
        self.ops.add(Arc::clone(&op));

        for index in 0..=last_chunk {
            core.lock.lock_exclusive(&op_id).await;
            let chunk = chunk_name(&core.inode, index);
            debug!(chunk = %chunk, op = %op_id, "removing chunk");
            core.submit_write_op(&chunk, WriteOp::new().remove(false), &op);
        }

        op.set_ready();
        let _ = core.lock.sync_and_reset_locker(&op).await;
        Ok(())
    }

    // ---- backlink ------------------------------------------------------

    /// Schedules the idempotent backlink write; returns the op id, or
    /// None when no logical path is known. A Canceled aggregate means
    /// the backlink already matched, which still counts as set.
    pub fn update_backlink(&self, old_backlink: Option<&str>) -> Option<String> {
        let path = self.path()?;

        let op = AsyncOp::with_generated_id();
        self.ops.add(Arc::clone(&op));
        let op_id = op.id().to_string();

        let completion = op.new_completion();
        let old_backlink = old_backlink.map(str::to_string);
        let core = Arc::clone(&self.core);
        tokio::spawn(async move {
            let write_op = attrs::backlink_op(&path, old_backlink.as_deref());
            let ret = match core.pool.operate_write(&core.inode, write_op).await {
                Ok(()) => {
                    core.set_has_backlink(true);
                    0
                }
                Err(StoreError::Canceled) => {
                    core.set_has_backlink(true);
                    -libc::ECANCELED
                }
                Err(e) => e.to_retcode(),
            };
            completion.finish(ret);
        });

        op.set_ready();
        Some(op_id)
    }

    // ---- teardown ------------------------------------------------------

    /// The destruction sequence: drain every outstanding op, then
    /// either remove the doomed file or hand back an idle lock. The
    /// handle registry calls this when the last user lets go.
    pub async fn close(&self) {
        let _ = self.ops.sync_all(false).await;
        self.ops.wait_for_lone_ops().await;

        if self.lazy_removal() {
            if let Err(e) = self.remove().await {
                debug!(inode = %self.core.inode, error = %e, "lazy removal failed");
            }
            return;
        }

        self.core.lock.release_if_idle(FILE_IDLE_LOCK_TIMEOUT).await;
    }
}

impl Drop for FileIO {
    fn drop(&mut self) {
        if self.ops.has_running_ops() {
            warn!(inode = %self.core.inode, "file handle dropped with running async ops");
        }
    }
}

impl FileCore {
    fn inline_buffer(&self) -> Option<Arc<InlineBuffer>> {
        self.inline.lock().unwrap().clone()
    }

    fn set_has_backlink(&self, has_backlink: bool) {
        self.backlink.lock().unwrap().has_backlink = has_backlink;
    }

    fn pending_backlink(&self) -> Option<String> {
        let state = self.backlink.lock().unwrap();
        if state.has_backlink {
            None
        } else {
            state.path.clone()
        }
    }

    async fn last_chunk_index_and_size(&self) -> FsResult<(u64, u64)> {
        let size = attrs::read_size_assert_exists(&self.pool, &self.inode).await?;
        Ok((last_chunk_index(size, self.chunk_size), size))
    }

    fn spawn_inline_read(
        &self,
        inline: Arc<InlineBuffer>,
        pieces: Vec<ReadPiece>,
        op: &Arc<AsyncOp>,
        size_cell: &Arc<OnceCell<u64>>,
    ) {
        let completion = op.new_completion();
        let pool = Arc::clone(&self.pool);
        let inode = self.inode.clone();
        let size_cell = Arc::clone(size_cell);

        tokio::spawn(async move {
            let mut ret = 0;
            match inline.read_contents().await {
                Ok(contents) => {
                    for piece in &pieces {
                        let offset = piece.file_offset as usize;
                        let copied = contents.len().saturating_sub(offset).min(piece.len);
                        if copied > 0 {
                            piece
                                .slot
                                .copy_at(piece.buf_offset, &contents[offset..offset + copied]);
                            piece.slot.add_return_value(copied as i64);
                        }
                        if copied < piece.len {
                            let size = shared_file_size(&size_cell, &pool, &inode).await;
                            credit_zero_fill(piece, copied, size);
                        }
                    }
                }
                Err(e) => ret = e.to_retcode(),
            }
            completion.finish(ret);
        });
    }

    fn spawn_chunk_read(
        &self,
        index: u64,
        pieces: Vec<ReadPiece>,
        op: &Arc<AsyncOp>,
        size_cell: &Arc<OnceCell<u64>>,
    ) {
        let completion = op.new_completion();
        let pool = Arc::clone(&self.pool);
        let inode = self.inode.clone();
        let chunk_size = self.chunk_size;
        let size_cell = Arc::clone(size_cell);

        tokio::spawn(async move {
            let chunk = chunk_name(&inode, index);
            let mut ret = 0;

            for piece in &pieces {
                let local_offset = piece.file_offset - index * chunk_size;
                match pool.read(&chunk, local_offset, piece.len as u64).await {
                    Ok(bytes) => {
                        let copied = bytes.len().min(piece.len);
                        if copied > 0 {
                            piece.slot.copy_at(piece.buf_offset, &bytes[..copied]);
                            piece.slot.add_return_value(copied as i64);
                        }
                        if copied < piece.len {
                            let size = shared_file_size(&size_cell, &pool, &inode).await;
                            credit_zero_fill(piece, copied, size);
                        }
                    }
                    Err(e) => {
                        if ret == 0 {
                            ret = e.to_retcode();
                        }
                        let size = shared_file_size(&size_cell, &pool, &inode).await;
                        if e == StoreError::NotFound
                            && size >= piece.file_offset + piece.len as u64
                        {
                            // The chunk is gone but the declared size
                            // covers the request: zero bytes, not an
                            // error.
                            completion.override_return_code(0);
                        }
                        credit_zero_fill(piece, 0, size);
                    }
                }
            }

            debug!(chunk = %chunk, retcode = ret, "chunk read complete");
            completion.finish(ret);
        });
    }

    async fn real_write(self: &Arc<Self>, mut data: Bytes, mut offset: u64, op: Arc<AsyncOp>) {
        if let Some(inline) = self.inline_buffer() {
            if inline.capacity() > 0 {
                let absorbed = if offset < inline.capacity() {
                    inline.write(&data, offset).await
                } else {
                    // The write starts past the inline region; make the
                    // region logically cover its full capacity first.
                    inline.fill_remaining().await.map(|_| 0)
                };

                let absorbed = match absorbed {
                    Ok(n) => n,
                    Err(e) => {
                        op.push_result(e.to_retcode());
                        op.set_ready();
                        return;
                    }
                };

                offset += absorbed as u64;
                let _ = data.split_to(absorbed);

                if data.is_empty() {
                    // Fully absorbed: no chunk is touched, but the
                    // recorded size still has to cover the new bytes.
                    self.submit_size_raise(offset, &op);
                    op.set_ready();
                    return;
                }
            }
        }

        attrs::touch_mtime_async(Arc::clone(&self.pool), self.inode.clone());

        let chunk_size = self.chunk_size;
        let first = offset / chunk_size;
        let last = (offset + data.len() as u64 - 1) / chunk_size;
        let exclusive = last > first;
        let total_size = offset + data.len() as u64;
        let op_id = op.id().to_string();

        if exclusive {
            self.lock.lock_exclusive(&op_id).await;
        } else {
            self.lock.lock_shared(&op_id).await;
        }

        self.submit_size_raise(total_size, &op);

        debug!(
            inode = %self.inode,
            op = %op_id,
            total_size,
            first,
            last,
            "writing chunks"
        );

        let mut local_offset = offset % chunk_size;
        let mut consumed = 0usize;

        for index in first..=last {
            // Refreshing per chunk keeps the lease alive across long
            // writes.
            if exclusive {
                self.lock.lock_exclusive(&op_id).await;
            } else {
                self.lock.lock_shared(&op_id).await;
            }

            let slice_len = ((chunk_size - local_offset) as usize).min(data.len() - consumed);
            let chunk_data = data.slice(consumed..consumed + slice_len);
            let chunk = chunk_name(&self.inode, index);

            let write_op = if self.pool.has_alignment() {
                match self
                    .build_aligned_rmw(&chunk, local_offset, &chunk_data, None, false)
                    .await
                {
                    Ok(write_op) => write_op,
                    Err(e) => {
                        op.push_result(e.to_retcode());
                        consumed += slice_len;
                        local_offset = 0;
                        continue;
                    }
                }
            } else {
                WriteOp::new().write(local_offset, chunk_data)
            };

            debug!(chunk = %chunk, op = %op_id, "scheduling chunk write");
            self.submit_write_op(&chunk, write_op, &op);

            consumed += slice_len;
            local_offset = 0;
        }

        op.set_ready();
        let code = self.lock.sync_and_reset_locker(&op).await;
        if code != 0 {
            debug!(inode = %self.inode, op = %op_id, retcode = code, "write finished with error");
        }
    }

    /// Batches the monotonic size raise (plus the chunk-size record and
    /// a pending backlink) into the write op. A Canceled guard means a
    /// newer writer already advanced the size.
    fn submit_size_raise(self: &Arc<Self>, size: u64, op: &Arc<AsyncOp>) {
        let backlink = self.pending_backlink();
        let carries_backlink = backlink.is_some();
        let write_op = attrs::set_size_if_bigger_op(size, self.chunk_size, backlink.as_deref());

        let completion = op.new_completion();
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let ret = match core.pool.operate_write(&core.inode, write_op).await {
                Ok(()) => {
                    if carries_backlink {
                        core.set_has_backlink(true);
                    }
                    0
                }
                Err(StoreError::Canceled) => 0,
                Err(e) => e.to_retcode(),
            };
            completion.finish(ret);
        });
    }

    fn submit_write_op(&self, obj: &str, write_op: WriteOp, op: &Arc<AsyncOp>) {
        let completion = op.new_completion();
        let pool = Arc::clone(&self.pool);
        let obj = obj.to_string();

        tokio::spawn(async move {
            let ret = match pool.operate_write(&obj, write_op).await {
                Ok(()) => 0,
                Err(e) => e.to_retcode(),
            };
            debug!(obj = %obj, retcode = ret, "store op completed");
            completion.finish(ret);
        });
    }

    /// Sub-chunk writes on aligned pools go through a read-modify-write
    /// that rebuilds the whole object: read contents and xattrs,
    /// replace the affected slice, then rewrite the aligned buffer.
    /// The base chunk doubles as the inode object, so it is emptied in
    /// place rather than removed; its xattrs (size, mtime, backlink)
    /// must survive the concurrent size raise. Higher chunks are
    /// removed and recreated with their xattr snapshot re-applied.
    async fn build_aligned_rmw(
        &self,
        chunk: &str,
        offset: u64,
        data: &[u8],
        recorded_override: Option<u64>,
        assert_exists: bool,
    ) -> FsResult<WriteOp> {
        let is_inode_object = chunk == self.inode;
        let chunk_size = self.chunk_size as usize;

        let existing = match self.pool.read(chunk, 0, self.chunk_size).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound) => Bytes::new(),
            Err(e) => return Err(e.into()),
        };
        let xattrs: HashMap<String, Bytes> = match self.pool.get_xattrs(chunk).await {
            Ok(map) => map,
            Err(StoreError::NotFound) => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut contents: Vec<u8> = if !existing.is_empty() {
            existing.to_vec()
        } else if data.len() != chunk_size {
            vec![0; chunk_size]
        } else {
            Vec::new()
        };

        let end = offset as usize + data.len();
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[offset as usize..end].copy_from_slice(data);

        let recorded = recorded_override.unwrap_or_else(|| {
            let existing_recorded = xattrs
                .get(XATTR_LAST_CHUNK_SIZE)
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(existing.len() as u64);
            existing_recorded.max(end as u64)
        });

        let aligned_len = align_up(contents.len() as u64, self.pool.alignment()) as usize;
        contents.resize(aligned_len, 0);

        let mut write_op = WriteOp::new();
        if assert_exists {
            write_op = write_op.assert_exists();
        }
        if is_inode_object {
            write_op = write_op.create(false).truncate(0);
        } else {
            write_op = write_op.remove(true).create(false);
            for (name, value) in &xattrs {
                if name != XATTR_LAST_CHUNK_SIZE {
                    write_op = write_op.set_xattr(name, value.clone());
                }
            }
        }
        write_op = write_op
            .set_xattr(XATTR_LAST_CHUNK_SIZE, Bytes::from(recorded.to_string()))
            .append(Bytes::from(contents));

        Ok(write_op)
    }
}
