// Task registry: one tracked transfer per resource key, with its waiters and streamed bytes.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info};

use super::stats::TransferStats;
use crate::error::{TransferCallback, TransferResult};
use crate::transport::traits::{ResourceKey, TransferHandle};

/// Runs once, the next time the registry has no transfers left.
pub type DrainHandler = Box<dyn FnOnce() + Send + 'static>;

struct TrackedTransfer {
    handle: TransferHandle,
    priority: f32,
    buffer: BytesMut,
    callbacks: Vec<TransferCallback>,
}

impl TrackedTransfer {
    fn new(handle: TransferHandle, priority: f32) -> Self {
        Self {
            handle,
            priority,
            buffer: BytesMut::new(),
            callbacks: Vec::new(),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    transfers: HashMap<ResourceKey, TrackedTransfer>,
    drain_handlers: Vec<DrainHandler>,
}

/// Outcome of [`TaskRegistry::admit`].
pub enum Admission {
    /// A new transfer was registered. `superseded` is the lower-priority
    /// transfer it replaced, which the caller must cancel.
    Started {
        handle: TransferHandle,
        superseded: Option<TransferHandle>,
    },
    /// The request joined a transfer already in flight.
    Attached,
    /// `create` declined to issue a transfer. Nothing was registered and the
    /// callback is handed back.
    Refused(Option<TransferCallback>),
}

/// The dedup engine.
///
/// Every read-modify-write happens under one lock. Callbacks and drain
/// handlers always run after the lock is released, so they may issue new
/// requests from inside.
pub struct TaskRegistry {
    state: Mutex<RegistryState>,
    stats: Arc<TransferStats>,
}

impl TaskRegistry {
    pub fn new(stats: Arc<TransferStats>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            stats,
        }
    }

    /// True if `key` is tracked at a priority of at least `min_priority`.
    pub fn has_transfer(&self, key: &ResourceKey, min_priority: f32) -> bool {
        let state = self.state.lock();
        Self::tracked_at_least(&state, key, min_priority)
    }

    fn tracked_at_least(state: &RegistryState, key: &ResourceKey, min_priority: f32) -> bool {
        state
            .transfers
            .get(key)
            .is_some_and(|tracked| tracked.priority >= min_priority)
    }

    /// Admission check and registration as a single critical section.
    ///
    /// If `key` is already tracked at `priority` or higher, `callback` joins it.
    /// Otherwise `create` issues a new transfer, which replaces any tracked one.
    /// `create` returns `None` when its transport can no longer take work.
    pub fn admit<F>(
        &self,
        key: &ResourceKey,
        priority: f32,
        callback: Option<TransferCallback>,
        create: F,
    ) -> Admission
    where
        F: FnOnce() -> Option<TransferHandle>,
    {
        let mut state = self.state.lock();
        if Self::tracked_at_least(&state, key, priority) {
            if let Some(callback) = callback {
                Self::attach_locked(&mut state, key, callback);
            }
            self.stats.record_coalesced();
            debug!("request for {} attached to in-flight transfer", key);
            return Admission::Attached;
        }

        let Some(handle) = create() else {
            return Admission::Refused(callback);
        };
        let superseded = self.register_locked(&mut state, handle.clone(), priority);
        if let Some(callback) = callback {
            Self::attach_locked(&mut state, key, callback);
        }
        Admission::Started { handle, superseded }
    }

    /// Track `handle` for its key, replacing whatever was tracked before.
    ///
    /// Callbacks already waiting on the replaced transfer move to the new one;
    /// its buffered bytes are discarded. Returns the replaced handle so the
    /// caller can cancel it.
    pub fn register_new_transfer(
        &self,
        handle: TransferHandle,
        priority: f32,
    ) -> Option<TransferHandle> {
        let mut state = self.state.lock();
        self.register_locked(&mut state, handle, priority)
    }

    fn register_locked(
        &self,
        state: &mut RegistryState,
        handle: TransferHandle,
        priority: f32,
    ) -> Option<TransferHandle> {
        let key = handle.key().clone();
        let mut tracked = TrackedTransfer::new(handle, priority);
        let superseded = state.transfers.remove(&key).map(|previous| {
            tracked.callbacks = previous.callbacks;
            self.stats.record_superseded();
            info!(
                "transfer {} for {} superseded at priority {} (was {})",
                previous.handle.id(),
                key,
                priority,
                previous.priority
            );
            previous.handle
        });
        debug!(
            "transfer {} registered for {} at priority {}",
            tracked.handle.id(),
            key,
            priority
        );
        state.transfers.insert(key, tracked);
        self.stats.record_started();
        superseded
    }

    /// Append `callback` to the waiters for `key`. No-op if `key` is not tracked.
    pub fn attach_callback(&self, key: &ResourceKey, callback: TransferCallback) -> bool {
        let mut state = self.state.lock();
        Self::attach_locked(&mut state, key, callback)
    }

    fn attach_locked(state: &mut RegistryState, key: &ResourceKey, callback: TransferCallback) -> bool {
        match state.transfers.get_mut(key) {
            Some(tracked) => {
                tracked.callbacks.push(callback);
                true
            }
            None => false,
        }
    }

    /// Append a streamed chunk. Ignored unless `handle` is the transfer currently tracked for its key.
    pub fn append_bytes(&self, handle: &TransferHandle, chunk: &[u8]) -> bool {
        let mut state = self.state.lock();
        match state.transfers.get_mut(handle.key()) {
            Some(tracked) if tracked.handle.id() == handle.id() => {
                tracked.buffer.extend_from_slice(chunk);
                self.stats.record_bytes(chunk.len() as u64);
                true
            }
            _ => false,
        }
    }

    /// Deliver `result` to every waiter of `handle`, in attach order, and stop tracking it.
    ///
    /// Returns false (and does nothing) if `handle` is no longer the tracked transfer.
    pub fn complete_transfer(&self, handle: &TransferHandle, result: TransferResult) -> bool {
        self.finish(handle, Some(result))
    }

    /// Like `complete_transfer`, delivering the bytes accumulated so far as the payload.
    pub fn complete_with_buffer(&self, handle: &TransferHandle) -> bool {
        self.finish(handle, None)
    }

    fn finish(&self, handle: &TransferHandle, result: Option<TransferResult>) -> bool {
        let (tracked, drain_handlers) = {
            let mut state = self.state.lock();
            let is_current = state
                .transfers
                .get(handle.key())
                .is_some_and(|tracked| tracked.handle.id() == handle.id());
            if !is_current {
                debug!(
                    "ignoring completion of stale transfer {} for {}",
                    handle.id(),
                    handle.key()
                );
                return false;
            }
            let Some(tracked) = state.transfers.remove(handle.key()) else {
                return false;
            };
            let drain_handlers = if state.transfers.is_empty() {
                mem::take(&mut state.drain_handlers)
            } else {
                Vec::new()
            };
            (tracked, drain_handlers)
        };

        let TrackedTransfer {
            buffer, callbacks, ..
        } = tracked;
        let result = result.unwrap_or_else(|| Ok(buffer.freeze()));
        self.stats.record_finished(result.is_ok());
        match &result {
            Ok(bytes) => debug!(
                "transfer {} for {} completed: {} bytes to {} waiters",
                handle.id(),
                handle.key(),
                bytes.len(),
                callbacks.len()
            ),
            Err(e) => info!(
                "transfer {} for {} failed for {} waiters: {}",
                handle.id(),
                handle.key(),
                callbacks.len(),
                e
            ),
        }

        for callback in callbacks {
            callback(result.clone());
        }
        Self::run_drain_handlers(drain_handlers);
        true
    }

    /// Register a handler for the next transition to empty.
    pub fn add_drain_handler(&self, handler: DrainHandler) {
        self.state.lock().drain_handlers.push(handler);
    }

    /// Run and clear every drain handler now, whether or not transfers remain.
    pub fn fire_drain_handlers(&self) {
        let handlers = mem::take(&mut self.state.lock().drain_handlers);
        Self::run_drain_handlers(handlers);
    }

    fn run_drain_handlers(handlers: Vec<DrainHandler>) {
        if handlers.is_empty() {
            return;
        }
        debug!("registry drained, running {} handlers", handlers.len());
        for handler in handlers {
            handler();
        }
    }

    /// Stop tracking every transfer matching `abandoned` without calling its waiters.
    /// Drain handlers are left queued.
    pub fn abandon_where<F>(&self, abandoned: F) -> usize
    where
        F: Fn(&TransferHandle) -> bool,
    {
        let dropped: Vec<TrackedTransfer> = {
            let mut state = self.state.lock();
            let keys: Vec<ResourceKey> = state
                .transfers
                .iter()
                .filter(|(_, tracked)| abandoned(&tracked.handle))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| state.transfers.remove(key))
                .collect()
        };
        for tracked in &dropped {
            self.stats.record_finished(false);
            debug!(
                "transfer {} for {} abandoned with {} waiters",
                tracked.handle.id(),
                tracked.handle.key(),
                tracked.callbacks.len()
            );
        }
        dropped.len()
    }

    /// Run `action` under the registry lock if no tracked transfer matches `owned`.
    ///
    /// `action` must not call back into the registry. Returns whether it ran.
    pub fn when_idle<P, F>(&self, owned: P, action: F) -> bool
    where
        P: Fn(&TransferHandle) -> bool,
        F: FnOnce(),
    {
        let state = self.state.lock();
        if state.transfers.values().any(|tracked| owned(&tracked.handle)) {
            return false;
        }
        action();
        true
    }

    /// Bytes buffered so far for `key`.
    pub fn buffered(&self, key: &ResourceKey) -> Option<Bytes> {
        let state = self.state.lock();
        state
            .transfers
            .get(key)
            .map(|tracked| Bytes::copy_from_slice(&tracked.buffer))
    }

    /// Handle of the transfer currently tracked for `key`.
    pub fn tracked_handle(&self, key: &ResourceKey) -> Option<TransferHandle> {
        let state = self.state.lock();
        state.transfers.get(key).map(|tracked| tracked.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().transfers.is_empty()
    }
}
