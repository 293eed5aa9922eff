//! Advisory inode lock held by one FileIO on behalf of its writers.
//!
//! The store grants a lease of FILE_LOCK_DURATION; within the lease
//! the lock is renewed locally without another store round-trip. A
//! single-chunk write takes the shared lock (many such writers may
//! interleave), a multi-chunk write takes the exclusive one. An idle
//! lock is handed back early so other clients do not wait out the
//! whole lease.

use crate::fs::async_op::AsyncOp;
use crate::fs::{
    FILE_CHUNK_LOCKER, FILE_CHUNK_LOCKER_COOKIE_OTHER, FILE_CHUNK_LOCKER_COOKIE_WRITE,
    FILE_CHUNK_LOCKER_TAG, FILE_LOCK_DURATION,
};
use crate::pool::{ObjectPool, PoolRef, StoreError};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::debug;

const BUSY_RETRY_SLEEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn cookie(self) -> &'static str {
        match self {
            LockMode::Shared => FILE_CHUNK_LOCKER_COOKIE_WRITE,
            LockMode::Exclusive => FILE_CHUNK_LOCKER_COOKIE_OTHER,
        }
    }
}

enum LockState {
    Unlocked,
    Held {
        mode: LockMode,
        /// Empty once the owning op finished; an idle held lock is the
        /// release candidate.
        locker: String,
        lease_start: Instant,
        last_renew: Instant,
    },
}

pub struct InodeLock {
    pool: PoolRef,
    inode: String,
    state: Mutex<LockState>,
}

impl InodeLock {
    pub fn new(pool: PoolRef, inode: String) -> Self {
        Self {
            pool,
            inode,
            state: Mutex::new(LockState::Unlocked),
        }
    }

    pub async fn lock_shared(&self, uuid: &str) {
        self.acquire(LockMode::Shared, uuid).await;
    }

    pub async fn lock_exclusive(&self, uuid: &str) {
        self.acquire(LockMode::Exclusive, uuid).await;
    }

    async fn acquire(&self, mode: LockMode, uuid: &str) {
        enum FastPath {
            Kept,
            ReleaseFirst,
            StoreLock,
        }

        loop {
            // Fast path under the state mutex. Re-checked every spin:
            // the conflicting lock may be our own, released here once
            // its op is done.
            {
                let mut state = self.state.lock().await;
                let decision = match &mut *state {
                    LockState::Held {
                        mode: held_mode,
                        locker,
                        lease_start,
                        last_renew,
                    } if lease_start.elapsed() < FILE_LOCK_DURATION - Duration::from_secs(1) => {
                        if *held_mode == mode {
                            *last_renew = Instant::now();
                            if locker.is_empty() {
                                *locker = uuid.to_string();
                            }
                            if locker == uuid {
                                FastPath::Kept
                            } else {
                                // Another live op on this handle owns
                                // the lease; contention resolves at
                                // the store.
                                FastPath::StoreLock
                            }
                        } else if locker.is_empty() || locker == uuid {
                            // Mode change between ops on this handle:
                            // hand the old cookie back before taking
                            // the other one, or the store would report
                            // our own lock as Busy forever.
                            FastPath::ReleaseFirst
                        } else {
                            FastPath::StoreLock
                        }
                    }
                    _ => FastPath::StoreLock,
                };

                match decision {
                    FastPath::Kept => {
                        debug!(inode = %self.inode, ?mode, locker = %uuid, "keep lock");
                        return;
                    }
                    FastPath::ReleaseFirst => self.unlock_inner(&mut state).await,
                    FastPath::StoreLock => {}
                }
            }

            let result = match mode {
                LockMode::Shared => {
                    self.pool
                        .lock_shared(
                            &self.inode,
                            FILE_CHUNK_LOCKER,
                            mode.cookie(),
                            FILE_CHUNK_LOCKER_TAG,
                            FILE_LOCK_DURATION,
                        )
                        .await
                }
                LockMode::Exclusive => {
                    self.pool
                        .lock_exclusive(
                            &self.inode,
                            FILE_CHUNK_LOCKER,
                            mode.cookie(),
                            FILE_LOCK_DURATION,
                        )
                        .await
                }
            };

            match result {
                Ok(()) => break,
                Err(StoreError::Busy) => tokio::time::sleep(BUSY_RETRY_SLEEP).await,
                Err(e) => {
                    // Anything but contention is unexpected from a lock
                    // call; keep retrying the way contention is retried.
                    debug!(inode = %self.inode, error = %e, "lock attempt failed");
                    tokio::time::sleep(BUSY_RETRY_SLEEP).await;
                }
            }
        }

        let now = Instant::now();
        let mut state = self.state.lock().await;
        *state = LockState::Held {
            mode,
            locker: uuid.to_string(),
            lease_start: now,
            last_renew: now,
        };
        debug!(inode = %self.inode, ?mode, locker = %uuid, "lock acquired");
    }

    async fn store_unlock(&self, mode: LockMode) -> Result<(), StoreError> {
        self.pool
            .unlock(&self.inode, FILE_CHUNK_LOCKER, mode.cookie())
            .await
    }

    /// Tries the shared cookie first, then the exclusive one.
    pub async fn unlock(&self) {
        let mut state = self.state.lock().await;
        self.unlock_inner(&mut state).await;
    }

    async fn unlock_inner(&self, state: &mut LockState) {
        if self.store_unlock(LockMode::Shared).await.is_err() {
            let _ = self.store_unlock(LockMode::Exclusive).await;
        }
        *state = LockState::Unlocked;
        debug!(inode = %self.inode, "unlocked");
    }

    /// Drops a held shared lock ahead of an exclusive phase (truncate,
    /// remove). A held exclusive lock is left alone.
    pub async fn release_shared(&self) {
        let mut state = self.state.lock().await;
        if self.store_unlock(LockMode::Shared).await.is_ok() {
            *state = LockState::Unlocked;
        }
    }

    /// Waits out the op while holding the lock state, then clears the
    /// owning locker so the idle sweep may hand the lock back. Holding
    /// the state across the wait is what serialises writers on this
    /// FileIO instance.
    pub async fn sync_and_reset_locker(&self, op: &AsyncOp) -> i32 {
        let mut state = self.state.lock().await;
        let code = op.wait().await;
        if let LockState::Held { locker, .. } = &mut *state {
            locker.clear();
        }
        code
    }

    /// Idle sweep hook: releases a lock nobody logically owns once it
    /// has gone `idle_timeout` without a renewal. Skips without
    /// blocking when the state is contended.
    pub async fn manage_idle_lock(&self, idle_timeout: Duration) {
        let Ok(mut state) = self.state.try_lock() else {
            return;
        };
        let unowned = matches!(&*state, LockState::Held { locker, .. } if locker.is_empty());
        if unowned {
            self.unlock_if_time_is_out(&mut state, idle_timeout).await;
        }
    }

    /// Teardown hook: same policy, owner or not.
    pub async fn release_if_idle(&self, idle_timeout: Duration) {
        let mut state = self.state.lock().await;
        self.unlock_if_time_is_out(&mut state, idle_timeout).await;
    }

    async fn unlock_if_time_is_out(&self, state: &mut LockState, idle_timeout: Duration) {
        let (is_idle, timed_out) = match &*state {
            LockState::Held {
                lease_start,
                last_renew,
                ..
            } => (
                last_renew.elapsed() >= idle_timeout,
                // A lease past its duration was already reaped by the
                // store; it must not be unlocked again.
                lease_start.elapsed() > FILE_LOCK_DURATION,
            ),
            LockState::Unlocked => return,
        };

        if is_idle && !timed_out {
            debug!(inode = %self.inode, "unlocked idle lock");
            self.unlock_inner(state).await;
        } else if timed_out {
            *state = LockState::Unlocked;
        }
    }
}
