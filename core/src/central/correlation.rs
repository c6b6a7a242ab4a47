//! Operation correlation queue
//!
//! Native completion callbacks carry no caller-supplied identifier, but BLE
//! guarantees in-order completion per connection, so the oldest unresolved
//! waiter for a given (attribute, operation-kind) key always matches the
//! next callback. This module holds those FIFO queues.
//!
//! Correlation is only ever done through these queues, never by payload
//! inspection or any other heuristic. Cancellation removes the waiter from
//! its queue under the session lock — not merely marks it done — so a later
//! completion can never mis-resolve the next waiter in line.

use crate::{Error, Result};
use crate::types::AttributeHandle;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tracing::{trace, warn};

/// Operation kind half of a correlation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OpKind {
    /// Value read; completions arrive as value updates.
    Read,
    /// Acknowledged write.
    Write,
    /// Subscription-state change (set notify on/off).
    NotifyConfig,
}

/// Correlation key: one FIFO queue per (attribute, kind) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OpKey {
    pub attribute: AttributeHandle,
    pub kind: OpKind,
}

impl OpKey {
    pub fn new(attribute: AttributeHandle, kind: OpKind) -> Self {
        OpKey { attribute, kind }
    }
}

/// Outcome delivered to the head waiter of a queue.
pub(crate) enum Completion {
    Value(Result<Vec<u8>>),
    Done(Result<()>),
}

enum WaiterTx {
    Value(oneshot::Sender<Result<Vec<u8>>>),
    Done(oneshot::Sender<Result<()>>),
}

struct Waiter {
    id: u64,
    tx: WaiterTx,
}

impl Waiter {
    fn complete(self, completion: Completion) {
        // The receiver may already be gone if the caller was cancelled in
        // the same instant; losing that race is a legitimate no-op.
        match (self.tx, completion) {
            (WaiterTx::Value(tx), Completion::Value(result)) => {
                let _ = tx.send(result);
            }
            (WaiterTx::Done(tx), Completion::Done(result)) => {
                let _ = tx.send(result);
            }
            (WaiterTx::Value(tx), Completion::Done(_)) => {
                warn!("completion kind mismatch for value waiter");
                let _ = tx.send(Err(Error::InvalidState(
                    "completion kind mismatch".to_string(),
                )));
            }
            (WaiterTx::Done(tx), Completion::Value(_)) => {
                warn!("completion kind mismatch for unit waiter");
                let _ = tx.send(Err(Error::InvalidState(
                    "completion kind mismatch".to_string(),
                )));
            }
        }
    }
}

/// Per-connection FIFO correlation queues.
#[derive(Default)]
pub(crate) struct OperationQueues {
    queues: HashMap<OpKey, VecDeque<Waiter>>,
    next_id: u64,
}

impl OperationQueues {
    pub fn new() -> Self {
        OperationQueues::default()
    }

    /// Append a waiter expecting a value completion. Returns the waiter id
    /// (for cancellation) and the receiver the caller awaits on. The native
    /// call is issued after this, so a completion can never precede its
    /// waiter.
    pub fn enqueue_value(&mut self, key: OpKey) -> (u64, oneshot::Receiver<Result<Vec<u8>>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.push(key, WaiterTx::Value(tx));
        (id, rx)
    }

    /// Append a waiter expecting a unit completion.
    pub fn enqueue_done(&mut self, key: OpKey) -> (u64, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let id = self.push(key, WaiterTx::Done(tx));
        (id, rx)
    }

    fn push(&mut self, key: OpKey, tx: WaiterTx) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queues.entry(key).or_default().push_back(Waiter { id, tx });
        trace!(attribute = key.attribute.raw(), kind = ?key.kind, id, "waiter enqueued");
        id
    }

    /// Pop and complete the head waiter for `key`. Returns `false` when the
    /// queue is empty: the event was unsolicited and the caller must route
    /// it to the notification path instead.
    pub fn resolve(&mut self, key: OpKey, completion: Completion) -> bool {
        let Some(queue) = self.queues.get_mut(&key) else {
            return false;
        };
        let Some(waiter) = queue.pop_front() else {
            return false;
        };
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        trace!(attribute = key.attribute.raw(), kind = ?key.kind, id = waiter.id, "waiter resolved");
        waiter.complete(completion);
        true
    }

    /// Atomically remove a waiter from its queue. Absence (already resolved
    /// or already cancelled) is the legitimate no-op case, never an error.
    pub fn cancel(&mut self, key: OpKey, id: u64) -> bool {
        let Some(queue) = self.queues.get_mut(&key) else {
            return false;
        };
        let Some(position) = queue.iter().position(|waiter| waiter.id == id) else {
            return false;
        };
        let _ = queue.remove(position);
        if queue.is_empty() {
            self.queues.remove(&key);
        }
        trace!(attribute = key.attribute.raw(), kind = ?key.kind, id, "waiter cancelled");
        true
    }

    /// Whether a solicited operation is pending on `key`. For
    /// `OpKind::Read` this is the pending-solicited-read state that routes
    /// the next value update to the read queue; it clears when the last
    /// queued read for the attribute resolves.
    pub fn has_pending(&self, key: OpKey) -> bool {
        self.queues.get(&key).is_some_and(|queue| !queue.is_empty())
    }

    /// Empty every queue, completing each waiter with `reason`. Used at
    /// session teardown.
    pub fn fail_all(&mut self, reason: &Error) {
        for (key, mut queue) in self.queues.drain() {
            trace!(attribute = key.attribute.raw(), kind = ?key.kind, waiters = queue.len(), "failing queue");
            for waiter in queue.drain(..) {
                let completion = match waiter.tx {
                    WaiterTx::Value(_) => Completion::Value(Err(reason.clone())),
                    WaiterTx::Done(_) => Completion::Done(Err(reason.clone())),
                };
                waiter.complete(completion);
            }
        }
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
