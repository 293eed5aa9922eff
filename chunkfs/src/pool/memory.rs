use super::{CmpOp, ObjectPool, ObjectStat, StoreError, StoreResult, WriteAction, WriteOp};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// In-process object pool used by the tests and demos.
///
/// Lock grants are keyed by (client, cookie) the way a real store keys
/// them by (client, cookie): handles cloned with [`MemoryPool::new_client`]
/// share the object table but conflict with each other on locks.
pub struct MemoryPool {
    inner: Arc<Inner>,
    client_id: u64,
}

struct Inner {
    name: String,
    max_object_size: u64,
    alignment: u64,
    next_client: AtomicU64,
    objects: Mutex<HashMap<String, MemObject>>,
}

#[derive(Clone, Default)]
struct MemObject {
    data: Vec<u8>,
    xattrs: HashMap<String, Bytes>,
    omap: BTreeMap<String, Bytes>,
    locks: HashMap<String, LockGrant>,
    mtime_secs: u64,
}

#[derive(Clone, Default)]
struct LockGrant {
    exclusive: Option<Holder>,
    shared: Vec<Holder>,
}

#[derive(Clone)]
struct Holder {
    client: u64,
    cookie: String,
    expires: Instant,
}

impl LockGrant {
    fn prune(&mut self) {
        let now = Instant::now();
        if let Some(h) = &self.exclusive {
            if h.expires <= now {
                self.exclusive = None;
            }
        }
        self.shared.retain(|h| h.expires > now);
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

impl MemObject {
    fn touch(&mut self) {
        self.mtime_secs = now_secs();
    }
}

impl MemoryPool {
    pub fn new(name: &str, max_object_size: u64) -> Arc<Self> {
        Self::with_alignment(name, max_object_size, 0)
    }

    pub fn with_alignment(name: &str, max_object_size: u64, alignment: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                max_object_size,
                alignment,
                next_client: AtomicU64::new(1),
                objects: Mutex::new(HashMap::new()),
            }),
            client_id: 0,
        })
    }

    /// A handle over the same object table with a distinct lock identity.
    pub fn new_client(&self) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::clone(&self.inner),
            client_id: self.inner.next_client.fetch_add(1, Ordering::SeqCst),
        })
    }

    pub fn object_exists(&self, obj: &str) -> bool {
        self.inner.objects.lock().unwrap().contains_key(obj)
    }

    pub fn object_len(&self, obj: &str) -> Option<u64> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(obj)
            .map(|o| o.data.len() as u64)
    }

    pub fn object_data(&self, obj: &str) -> Option<Bytes> {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(obj)
            .map(|o| Bytes::copy_from_slice(&o.data))
    }

    fn check_aligned(&self, len: u64) -> StoreResult<()> {
        let alignment = self.inner.alignment;
        if alignment != 0 && len % alignment != 0 {
            return Err(StoreError::InvalidArgument);
        }
        Ok(())
    }

    fn apply(&self, obj: &str, op: WriteOp) -> StoreResult<()> {
        let mut map = self.inner.objects.lock().unwrap();
        let mut staged: Option<MemObject> = map.get(obj).cloned();

        for action in op.actions {
            match action {
                WriteAction::Write { offset, data } => {
                    if self.inner.alignment != 0 {
                        return Err(StoreError::InvalidArgument);
                    }
                    let target = staged.get_or_insert_with(MemObject::default);
                    let end = offset as usize + data.len();
                    if end as u64 > self.inner.max_object_size {
                        return Err(StoreError::InvalidArgument);
                    }
                    if target.data.len() < end {
                        target.data.resize(end, 0);
                    }
                    target.data[offset as usize..end].copy_from_slice(&data);
                }
                WriteAction::Append { data } => {
                    self.check_aligned(data.len() as u64)?;
                    let target = staged.get_or_insert_with(MemObject::default);
                    if (target.data.len() + data.len()) as u64 > self.inner.max_object_size {
                        return Err(StoreError::InvalidArgument);
                    }
                    target.data.extend_from_slice(&data);
                }
                WriteAction::Truncate { len } => {
                    self.check_aligned(len)?;
                    let target = staged.get_or_insert_with(MemObject::default);
                    target.data.resize(len as usize, 0);
                }
                WriteAction::Remove { fail_ok } => {
                    if staged.is_none() && !fail_ok {
                        return Err(StoreError::NotFound);
                    }
                    staged = None;
                }
                WriteAction::Create { exclusive } => {
                    if exclusive && staged.is_some() {
                        return Err(StoreError::Exists);
                    }
                    staged.get_or_insert_with(MemObject::default);
                }
                WriteAction::AssertExists => {
                    if staged.is_none() {
                        return Err(StoreError::NotFound);
                    }
                }
                WriteAction::SetXattr { name, value } => {
                    let target = staged.get_or_insert_with(MemObject::default);
                    target.xattrs.insert(name, value);
                }
                WriteAction::CmpXattr { name, op, value } => {
                    let stored = staged
                        .as_ref()
                        .and_then(|o| o.xattrs.get(&name))
                        .cloned()
                        .unwrap_or_default();
                    if !op.eval(&value, &stored) {
                        return Err(StoreError::Canceled);
                    }
                }
                WriteAction::OmapSet { key, value } => {
                    let target = staged.get_or_insert_with(MemObject::default);
                    target.omap.insert(key, value);
                }
                WriteAction::OmapCmp { key, expected } => {
                    let stored = staged
                        .as_ref()
                        .and_then(|o| o.omap.get(&key))
                        .cloned()
                        .unwrap_or_default();
                    if !CmpOp::Eq.eval(&expected, &stored) {
                        return Err(StoreError::Canceled);
                    }
                }
            }
        }

        match staged {
            Some(mut updated) => {
                updated.touch();
                map.insert(obj.to_string(), updated);
            }
            None => {
                map.remove(obj);
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ObjectPool for MemoryPool {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn max_object_size(&self) -> u64 {
        self.inner.max_object_size
    }

    fn alignment(&self) -> u64 {
        self.inner.alignment
    }

    async fn read(&self, obj: &str, offset: u64, len: u64) -> StoreResult<Bytes> {
        let map = self.inner.objects.lock().unwrap();
        let object = map.get(obj).ok_or(StoreError::NotFound)?;
        let start = (offset as usize).min(object.data.len());
        let end = (offset as usize + len as usize).min(object.data.len());
        Ok(Bytes::copy_from_slice(&object.data[start..end]))
    }

    async fn stat(&self, obj: &str) -> StoreResult<ObjectStat> {
        let map = self.inner.objects.lock().unwrap();
        let object = map.get(obj).ok_or(StoreError::NotFound)?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            mtime_secs: object.mtime_secs,
        })
    }

    async fn get_xattr(&self, obj: &str, name: &str) -> StoreResult<Bytes> {
        let map = self.inner.objects.lock().unwrap();
        let object = map.get(obj).ok_or(StoreError::NotFound)?;
        object.xattrs.get(name).cloned().ok_or(StoreError::NoData)
    }

    async fn get_xattrs(&self, obj: &str) -> StoreResult<HashMap<String, Bytes>> {
        let map = self.inner.objects.lock().unwrap();
        let object = map.get(obj).ok_or(StoreError::NotFound)?;
        Ok(object.xattrs.clone())
    }

    async fn get_omap_vals_by_keys(
        &self,
        obj: &str,
        keys: &[String],
    ) -> StoreResult<HashMap<String, Bytes>> {
        let map = self.inner.objects.lock().unwrap();
        let object = map.get(obj).ok_or(StoreError::NotFound)?;
        Ok(keys
            .iter()
            .filter_map(|k| object.omap.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn operate_write(&self, obj: &str, op: WriteOp) -> StoreResult<()> {
        self.apply(obj, op)
    }

    async fn lock_shared(
        &self,
        obj: &str,
        name: &str,
        cookie: &str,
        _tag: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        let mut map = self.inner.objects.lock().unwrap();
        let object = map.entry(obj.to_string()).or_default();
        let grant = object.locks.entry(name.to_string()).or_default();
        grant.prune();

        if grant.exclusive.is_some() {
            return Err(StoreError::Busy);
        }

        grant.shared.push(Holder {
            client: self.client_id,
            cookie: cookie.to_string(),
            expires: Instant::now() + duration,
        });
        trace!(obj, name, cookie, client = self.client_id, "shared lock granted");
        Ok(())
    }

    async fn lock_exclusive(
        &self,
        obj: &str,
        name: &str,
        cookie: &str,
        duration: Duration,
    ) -> StoreResult<()> {
        let mut map = self.inner.objects.lock().unwrap();
        let object = map.entry(obj.to_string()).or_default();
        let grant = object.locks.entry(name.to_string()).or_default();
        grant.prune();

        if !grant.shared.is_empty() {
            return Err(StoreError::Busy);
        }
        if let Some(holder) = &grant.exclusive {
            if holder.client != self.client_id || holder.cookie != cookie {
                return Err(StoreError::Busy);
            }
        }

        grant.exclusive = Some(Holder {
            client: self.client_id,
            cookie: cookie.to_string(),
            expires: Instant::now() + duration,
        });
        trace!(obj, name, cookie, client = self.client_id, "exclusive lock granted");
        Ok(())
    }

    async fn unlock(&self, obj: &str, name: &str, cookie: &str) -> StoreResult<()> {
        let mut map = self.inner.objects.lock().unwrap();
        let object = map.get_mut(obj).ok_or(StoreError::NotFound)?;
        let grant = object.locks.get_mut(name).ok_or(StoreError::NotFound)?;
        grant.prune();

        if let Some(holder) = &grant.exclusive {
            if holder.client == self.client_id && holder.cookie == cookie {
                grant.exclusive = None;
                return Ok(());
            }
        }

        if let Some(pos) = grant
            .shared
            .iter()
            .position(|h| h.client == self.client_id && h.cookie == cookie)
        {
            grant.shared.remove(pos);
            return Ok(());
        }

        Err(StoreError::NotFound)
    }
}
