//! Server request objects
//!
//! Every incoming read/write event is wrapped in a request object carrying
//! exactly one single-use responder. Responding consumes the request, so a
//! second response is impossible by construction. Dropping a request without
//! responding leaves the remote peer waiting until its transport timeout —
//! answering is a caller obligation the engine does not enforce.

use crate::backend::ServiceEvent;
use crate::types::{AttErrorCode, BleUuid, DeviceId};
use tokio::sync::oneshot;
use tracing::trace;

/// Single-use reply slot wired back to the platform adapter.
struct Responder<T> {
    tx: Option<oneshot::Sender<Result<T, AttErrorCode>>>,
}

impl<T> Responder<T> {
    fn new(tx: oneshot::Sender<Result<T, AttErrorCode>>) -> Self {
        Responder { tx: Some(tx) }
    }

    /// Responder for requests the protocol does not acknowledge.
    fn absent() -> Self {
        Responder { tx: None }
    }

    fn send(mut self, outcome: Result<T, AttErrorCode>) {
        match self.tx.take() {
            Some(tx) => {
                // The adapter may have abandoned the request (e.g. the peer
                // disconnected mid-exchange); a closed channel is a no-op.
                let _ = tx.send(outcome);
            }
            None => trace!("response to unacknowledged request discarded"),
        }
    }
}

impl<T> Drop for Responder<T> {
    fn drop(&mut self) {
        if self.tx.is_some() {
            trace!("request dropped without a response");
        }
    }
}

/// A remote read of a characteristic value.
pub struct ReadRequest {
    pub peer: DeviceId,
    pub characteristic: BleUuid,
    /// Byte offset the peer is reading from (long reads).
    pub offset: usize,
    responder: Responder<Vec<u8>>,
}

impl ReadRequest {
    /// Answer with the value at the requested offset.
    pub fn respond(self, value: &[u8]) {
        self.responder.send(Ok(value.to_vec()));
    }

    /// Refuse the read with a protocol error code.
    pub fn reject(self, code: AttErrorCode) {
        self.responder.send(Err(code));
    }
}

/// A remote write of a characteristic value.
pub struct WriteRequest {
    pub peer: DeviceId,
    pub characteristic: BleUuid,
    pub value: Vec<u8>,
    /// False for an ATT write command, which the protocol does not
    /// acknowledge; responding to one is a no-op.
    pub acknowledged: bool,
    responder: Responder<()>,
}

impl WriteRequest {
    pub fn respond(self) {
        self.responder.send(Ok(()));
    }

    pub fn reject(self, code: AttErrorCode) {
        self.responder.send(Err(code));
    }
}

/// One staged write of a prepared-write sequence. Staged writes are not
/// applied until the peer commits via [`ExecuteWriteRequest`].
pub struct QueuedWriteRequest {
    pub peer: DeviceId,
    pub characteristic: BleUuid,
    pub offset: usize,
    pub value: Vec<u8>,
    responder: Responder<()>,
}

impl QueuedWriteRequest {
    pub fn respond(self) {
        self.responder.send(Ok(()));
    }

    pub fn reject(self, code: AttErrorCode) {
        self.responder.send(Err(code));
    }
}

/// Commit or rollback of a peer's staged writes.
pub struct ExecuteWriteRequest {
    pub peer: DeviceId,
    /// True to apply the staged writes, false to discard them.
    pub commit: bool,
    responder: Responder<()>,
}

impl ExecuteWriteRequest {
    pub fn respond(self) {
        self.responder.send(Ok(()));
    }

    pub fn reject(self, code: AttErrorCode) {
        self.responder.send(Err(code));
    }
}

/// One event on a service registration's request stream.
pub enum ServiceRequest {
    Read(ReadRequest),
    Write(WriteRequest),
    QueuedWrite(QueuedWriteRequest),
    ExecuteWrite(ExecuteWriteRequest),
    /// A central enabled notifications/indications. Informational only; the
    /// protocol does not acknowledge subscription changes.
    Subscribed {
        peer: DeviceId,
        characteristic: BleUuid,
    },
    /// A central disabled notifications/indications.
    Unsubscribed {
        peer: DeviceId,
        characteristic: BleUuid,
    },
}

impl ServiceRequest {
    pub(crate) fn from_event(event: ServiceEvent) -> Self {
        match event {
            ServiceEvent::Read {
                peer,
                characteristic,
                offset,
                reply,
            } => ServiceRequest::Read(ReadRequest {
                peer,
                characteristic,
                offset,
                responder: Responder::new(reply),
            }),
            ServiceEvent::Write {
                peer,
                characteristic,
                value,
                reply,
            } => ServiceRequest::Write(WriteRequest {
                peer,
                characteristic,
                value,
                acknowledged: reply.is_some(),
                responder: reply.map_or_else(Responder::absent, Responder::new),
            }),
            ServiceEvent::QueuedWrite {
                peer,
                characteristic,
                offset,
                value,
                reply,
            } => ServiceRequest::QueuedWrite(QueuedWriteRequest {
                peer,
                characteristic,
                offset,
                value,
                responder: Responder::new(reply),
            }),
            ServiceEvent::ExecuteWrite { peer, commit, reply } => {
                ServiceRequest::ExecuteWrite(ExecuteWriteRequest {
                    peer,
                    commit,
                    responder: Responder::new(reply),
                })
            }
            ServiceEvent::Subscribed {
                peer,
                characteristic,
            } => ServiceRequest::Subscribed {
                peer,
                characteristic,
            },
            ServiceEvent::Unsubscribed {
                peer,
                characteristic,
            } => ServiceRequest::Unsubscribed {
                peer,
                characteristic,
            },
        }
    }
}
