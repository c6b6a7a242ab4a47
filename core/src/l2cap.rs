//! Connection-oriented L2CAP channels
//!
//! A byte channel identified by its protocol/service multiplexer (PSM).
//! Inbound delivery is push-driven: the owning session routes
//! `ChannelData` events into the channel's buffer, where bytes wait until
//! the application consumes them. Close or link loss deterministically
//! finishes the inbound stream; send failures and transport backpressure
//! surface as typed errors and are never silently dropped.

use crate::backend::{ConnectionLink, PeripheralBackend};
use crate::types::ChannelId;
use crate::{Error, Result};
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

/// Role-specific transport half a channel sends through.
pub(crate) enum ChannelIo {
    Central(Arc<dyn ConnectionLink>),
    Peripheral(Arc<dyn PeripheralBackend>),
}

impl ChannelIo {
    async fn send(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
        match self {
            ChannelIo::Central(link) => link.channel_send(channel, data).await,
            ChannelIo::Peripheral(backend) => backend.channel_send(channel, data).await,
        }
    }

    async fn close(&self, channel: ChannelId) -> Result<()> {
        match self {
            ChannelIo::Central(link) => link.channel_close(channel).await,
            ChannelIo::Peripheral(backend) => backend.channel_close(channel).await,
        }
    }
}

/// An open connection-oriented channel.
///
/// Obtained from [`crate::Connection::open_channel`] (central role) or from
/// [`crate::ChannelListener`] (peripheral role). Dropping the value without
/// [`close`](L2capChannel::close) leaves the native channel to be reclaimed
/// by link teardown.
pub struct L2capChannel {
    psm: u16,
    id: ChannelId,
    io: ChannelIo,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for L2capChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L2capChannel")
            .field("psm", &self.psm)
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl L2capChannel {
    pub(crate) fn new(
        psm: u16,
        id: ChannelId,
        io: ChannelIo,
        inbound: mpsc::UnboundedReceiver<Vec<u8>>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        L2capChannel {
            psm,
            id,
            io,
            inbound,
            closed,
        }
    }

    pub fn psm(&self) -> u16 {
        self.psm
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// True once the channel was closed locally, by the peer, or by link
    /// loss.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send bytes to the peer. Backpressure from the native transport
    /// surfaces as [`Error::Backpressure`]; the engine never buffers
    /// outbound data.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionFailed("channel closed".to_string()));
        }
        self.io.send(self.id, data).await
    }

    /// Receive the next inbound payload. Returns `None` once the channel is
    /// closed and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }

    /// Close the channel. Idempotent: the native close is issued exactly
    /// once no matter how many times it is called, and is skipped entirely
    /// when the peer or link teardown closed the channel first.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(channel = self.id.raw(), psm = self.psm, "closing channel");
        self.io.close(self.id).await
    }
}

impl Stream for L2capChannel {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx)
    }
}
