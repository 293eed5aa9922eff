pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryPool;

/// Errors surfaced by the backing object store.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,

    #[error("object already exists")]
    Exists,

    #[error("lock is busy")]
    Busy,

    #[error("operation canceled by a failed guard")]
    Canceled,

    #[error("no such attribute")]
    NoData,

    #[error("invalid argument")]
    InvalidArgument,

    #[error("I/O error")]
    Io,
}

impl StoreError {
    pub fn to_errno(self) -> i32 {
        match self {
            StoreError::NotFound => libc::ENOENT,
            StoreError::Exists => libc::EEXIST,
            StoreError::Busy => libc::EBUSY,
            StoreError::Canceled => libc::ECANCELED,
            StoreError::NoData => libc::ENODATA,
            StoreError::InvalidArgument => libc::EINVAL,
            StoreError::Io => libc::EIO,
        }
    }

    /// Negative errno form used by completion tracking.
    pub fn to_retcode(self) -> i32 {
        -self.to_errno()
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Comparison operator for xattr guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    /// Succeeds when the supplied value is greater than the stored one.
    /// Fixed-width hex values make lexicographic order numeric order.
    Gt,
}

impl CmpOp {
    pub fn eval(self, supplied: &[u8], stored: &[u8]) -> bool {
        match self {
            CmpOp::Eq => supplied == stored,
            CmpOp::Ne => supplied != stored,
            CmpOp::Gt => supplied > stored,
        }
    }
}

/// One step of a compound write operation.
#[derive(Debug, Clone)]
pub enum WriteAction {
    Write { offset: u64, data: Bytes },
    Append { data: Bytes },
    Truncate { len: u64 },
    /// `fail_ok` removals tolerate a missing object.
    Remove { fail_ok: bool },
    Create { exclusive: bool },
    AssertExists,
    SetXattr { name: String, value: Bytes },
    CmpXattr { name: String, op: CmpOp, value: Bytes },
    OmapSet { key: String, value: Bytes },
    OmapCmp { key: String, expected: Bytes },
}

/// An ordered batch of actions applied atomically to one object.
///
/// A failed guard (`CmpXattr`, `OmapCmp`, `AssertExists`, exclusive
/// `Create`) aborts the whole batch with no state change.
#[derive(Debug, Clone, Default)]
pub struct WriteOp {
    pub actions: Vec<WriteAction>,
}

impl WriteOp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(mut self, offset: u64, data: Bytes) -> Self {
        self.actions.push(WriteAction::Write { offset, data });
        self
    }

    pub fn append(mut self, data: Bytes) -> Self {
        self.actions.push(WriteAction::Append { data });
        self
    }

    pub fn truncate(mut self, len: u64) -> Self {
        self.actions.push(WriteAction::Truncate { len });
        self
    }

    pub fn remove(mut self, fail_ok: bool) -> Self {
        self.actions.push(WriteAction::Remove { fail_ok });
        self
    }

    pub fn create(mut self, exclusive: bool) -> Self {
        self.actions.push(WriteAction::Create { exclusive });
        self
    }

    pub fn assert_exists(mut self) -> Self {
        self.actions.push(WriteAction::AssertExists);
        self
    }

    pub fn set_xattr(mut self, name: &str, value: Bytes) -> Self {
        self.actions.push(WriteAction::SetXattr {
            name: name.to_string(),
            value,
        });
        self
    }

    pub fn cmp_xattr(mut self, name: &str, op: CmpOp, value: Bytes) -> Self {
        self.actions.push(WriteAction::CmpXattr {
            name: name.to_string(),
            op,
            value,
        });
        self
    }

    pub fn omap_set(mut self, key: &str, value: Bytes) -> Self {
        self.actions.push(WriteAction::OmapSet {
            key: key.to_string(),
            value,
        });
        self
    }

    pub fn omap_cmp(mut self, key: &str, expected: Bytes) -> Self {
        self.actions.push(WriteAction::OmapCmp {
            key: key.to_string(),
            expected,
        });
        self
    }
}

/// Object metadata returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime_secs: u64,
}

/// The seam to the backing pool of named objects.
///
/// The engine assumes these primitives and their store-side semantics:
/// compound writes apply atomically per object, advisory locks are
/// leases identified by (name, cookie) and create the object when it
/// does not exist yet, and reads return the bytes available (possibly
/// fewer than requested).
#[async_trait]
pub trait ObjectPool: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn max_object_size(&self) -> u64;

    /// 0 means no alignment requirement; otherwise every stored object
    /// length must be a multiple of this.
    fn alignment(&self) -> u64;

    fn has_alignment(&self) -> bool {
        self.alignment() != 0
    }

    async fn read(&self, obj: &str, offset: u64, len: u64) -> StoreResult<Bytes>;

    async fn stat(&self, obj: &str) -> StoreResult<ObjectStat>;

    async fn get_xattr(&self, obj: &str, name: &str) -> StoreResult<Bytes>;

    async fn get_xattrs(&self, obj: &str) -> StoreResult<HashMap<String, Bytes>>;

    async fn get_omap_vals_by_keys(
        &self,
        obj: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, Bytes>>;

    async fn operate_write(&self, obj: &str, op: WriteOp) -> StoreResult<()>;

    async fn lock_shared(
        &self,
        obj: &str,
        name: &str,
        cookie: &str,
        tag: &str,
        duration: Duration,
    ) -> StoreResult<()>;

    async fn lock_exclusive(
        &self,
        obj: &str,
        name: &str,
        cookie: &str,
        duration: Duration,
    ) -> StoreResult<()>;

    async fn unlock(&self, obj: &str, name: &str, cookie: &str) -> StoreResult<()>;
}

pub type PoolRef = Arc<dyn ObjectPool>;
