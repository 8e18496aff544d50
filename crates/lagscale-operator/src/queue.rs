//! Coalescing work queue keyed by ConsumerAutoscaler
//!
//! A key is either ready (waiting for a worker), in flight, or idle.
//! Enqueueing a ready key is a no-op; enqueueing an in-flight key marks it
//! dirty so exactly one follow-up cycle runs once the current one is done.
//! At most one cycle per key is ever in flight.

use crate::model::ObjectKey;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    closed: bool,
}

/// Work queue shared by the dispatcher and the worker pool
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request a reconcile of `key`
    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        if state.in_flight.contains(&key) {
            trace!(key = %key, "Key in flight, marking for follow-up");
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Request a reconcile of `key` once `delay` has elapsed
    pub fn enqueue_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(key);
        });
    }

    /// Wait for the next ready key and mark it in flight.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    // Let another idle worker look at what is left
                    if !state.ready.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark the cycle for `key` finished, scheduling the follow-up if one was requested
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state.lock();
        state.in_flight.remove(key);
        if state.dirty.remove(key) && !state.closed && state.queued.insert(key.clone()) {
            state.ready.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out work; waiting workers return `None`
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    /// Number of keys waiting for a worker
    pub fn len(&self) -> usize {
        self.state.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.state.lock().in_flight.contains(key)
    }
}
