//! Multi-completion async operations and the per-file op registry.
//!
//! One logical operation (a vector read, a chunked write, a truncate)
//! fans out into several store submissions. Each submission reports
//! its errno-style return code into the op; the submitter marks the op
//! ready once the last submission has been added; waiters block until
//! ready and all submissions have resolved, then see the aggregate
//! code (first negative, unless overridden to 0).

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

const WAIT_FOR_LONE_OPS_CYCLE_SLEEP: Duration = Duration::from_millis(250);

pub type OpCallback = Box<dyn FnOnce(&str, i32) + Send + 'static>;

pub struct AsyncOp {
    id: String,
    next_completion: AtomicU64,
    results: Mutex<Vec<(u64, i32)>>,
    overrides: Mutex<HashMap<u64, i32>>,
    callback: Mutex<Option<OpCallback>>,
    ready_tx: watch::Sender<bool>,
    pending_tx: watch::Sender<usize>,
    aggregate: tokio::sync::Mutex<Option<i32>>,
    complete: AtomicBool,
}

impl AsyncOp {
    pub fn new(id: String) -> Arc<Self> {
        let (ready_tx, _) = watch::channel(false);
        let (pending_tx, _) = watch::channel(0);
        Arc::new(Self {
            id,
            next_completion: AtomicU64::new(0),
            results: Mutex::new(Vec::new()),
            overrides: Mutex::new(HashMap::new()),
            callback: Mutex::new(None),
            ready_tx,
            pending_tx,
            aggregate: tokio::sync::Mutex::new(None),
            complete: AtomicBool::new(false),
        })
    }

    pub fn with_generated_id() -> Arc<Self> {
        Self::new(Uuid::new_v4().to_string())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_callback(&self, callback: OpCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    /// Registers one more store submission. The returned token must be
    /// finished (or dropped) by the submission's completion path.
    pub fn new_completion(self: &Arc<Self>) -> Completion {
        let id = self.next_completion.fetch_add(1, Ordering::SeqCst);
        self.pending_tx.send_modify(|n| *n += 1);
        Completion {
            op: Arc::clone(self),
            id,
            finished: false,
        }
    }

    /// Records an already-resolved sub-result.
    pub fn push_result(self: &Arc<Self>, ret: i32) {
        self.new_completion().finish(ret);
    }

    /// Marks the op as fully submitted. Called exactly once, after the
    /// last completion has been added.
    pub fn set_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    pub fn is_ready(&self) -> bool {
        *self.ready_tx.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    /// Ready but with unresolved submissions.
    pub fn has_unresolved(&self) -> bool {
        self.is_ready() && *self.pending_tx.borrow() > 0
    }

    fn set_override(&self, completion: u64, ret: i32) {
        self.overrides.lock().unwrap().insert(completion, ret);
    }

    fn record(&self, completion: u64, ret: i32) {
        self.results.lock().unwrap().push((completion, ret));
        self.pending_tx.send_modify(|n| *n -= 1);
    }

    fn aggregate_results(&self) -> i32 {
        let overrides = self.overrides.lock().unwrap();
        let mut results = self.results.lock().unwrap();
        results.sort_by_key(|(id, _)| *id);

        for (id, raw) in results.iter() {
            let effective = overrides.get(id).copied().unwrap_or(*raw);
            if effective < 0 {
                return effective;
            }
        }
        0
    }

    /// Waits for readiness and every submission, then returns the
    /// aggregate return code. Idempotent; the user callback fires once,
    /// from the first waiter.
    pub async fn wait(&self) -> i32 {
        let mut aggregate = self.aggregate.lock().await;
        if let Some(code) = *aggregate {
            return code;
        }

        let mut ready_rx = self.ready_tx.subscribe();
        if ready_rx.wait_for(|ready| *ready).await.is_err() {
            warn!(op = %self.id, "async op abandoned before becoming ready");
        }

        let mut pending_rx = self.pending_tx.subscribe();
        let _ = pending_rx.wait_for(|pending| *pending == 0).await;

        let code = self.aggregate_results();
        *aggregate = Some(code);
        self.complete.store(true, Ordering::SeqCst);
        debug!(op = %self.id, retcode = code, "async op completed");

        if let Some(callback) = self.callback.lock().unwrap().take() {
            callback(&self.id, code);
        }

        code
    }
}

/// Token for one pending store submission.
pub struct Completion {
    op: Arc<AsyncOp>,
    id: u64,
    finished: bool,
}

impl Completion {
    pub fn op_id(&self) -> &str {
        self.op.id()
    }

    /// Reinterprets this submission's store-level return code, e.g. to
    /// treat a missing chunk as zero bytes when the file size covers
    /// the missing region.
    pub fn override_return_code(&self, ret: i32) {
        self.op.set_override(self.id, ret);
    }

    pub fn finish(mut self, ret: i32) {
        self.finished = true;
        self.op.record(self.id, ret);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if !self.finished {
            // A dropped token means the submission task died.
            self.op.record(self.id, -libc::EIO);
        }
    }
}

/// The per-file map of in-flight operations.
#[derive(Default)]
pub struct OpsRegistry {
    ops: Mutex<HashMap<String, Arc<AsyncOp>>>,
}

impl OpsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, op: Arc<AsyncOp>) {
        self.ops
            .lock()
            .unwrap()
            .insert(op.id().to_string(), op);
    }

    pub fn get(&self, op_id: &str) -> Option<Arc<AsyncOp>> {
        self.ops.lock().unwrap().get(op_id).cloned()
    }

    /// Waits for one op and returns its aggregate code; the op is
    /// dropped from the map afterwards. Unknown ids report -ENOENT.
    pub async fn sync(&self, op_id: &str) -> i32 {
        let op = match self.get(op_id) {
            Some(op) => op,
            None => return -libc::ENOENT,
        };

        let code = op.wait().await;
        self.ops.lock().unwrap().remove(op_id);
        code
    }

    /// Waits for every op currently in the map; returns the first
    /// non-zero aggregate encountered. Tolerates concurrent removals.
    pub async fn sync_all(&self, remove: bool) -> i32 {
        let snapshot: Vec<(String, Arc<AsyncOp>)> = self
            .ops
            .lock()
            .unwrap()
            .iter()
            .map(|(id, op)| (id.clone(), Arc::clone(op)))
            .collect();

        let codes = join_all(snapshot.iter().map(|(_, op)| op.wait())).await;
        let first_error = codes.into_iter().find(|code| *code != 0).unwrap_or(0);

        if remove {
            let mut ops = self.ops.lock().unwrap();
            for (id, _) in &snapshot {
                ops.remove(id);
            }
        }

        first_error
    }

    /// Drops every op whose only remaining holder is this registry and
    /// returns once the map is empty. Ops still referenced by in-flight
    /// submitters are waited out with a fixed back-off.
    pub async fn wait_for_lone_ops(&self) {
        loop {
            let remaining = {
                let mut ops = self.ops.lock().unwrap();
                ops.retain(|_, op| Arc::strong_count(op) > 1);
                ops.len()
            };

            if remaining == 0 {
                return;
            }

            tokio::time::sleep(WAIT_FOR_LONE_OPS_CYCLE_SLEEP).await;
        }
    }

    /// Non-blocking check for ready ops with unresolved submissions.
    /// Reports false when the map is contended.
    pub fn has_running_ops(&self) -> bool {
        match self.ops.try_lock() {
            Ok(ops) => ops.values().any(|op| op.has_unresolved()),
            Err(_) => false,
        }
    }
}
