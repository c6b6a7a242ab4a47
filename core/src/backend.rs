//! Backend contract
//!
//! The minimal downward seam every platform adapter must satisfy. Adapters
//! translate native stack callbacks into the event enums here and push them
//! into engine-owned channels; native completion callbacks carry no caller
//! identifier, so the engine performs all request/response correlation above
//! this seam. Everything in [`crate::central`], [`crate::peripheral`] and
//! [`crate::l2cap`] is built on these traits and is otherwise
//! backend-independent.
//!
//! Adapters map native error values onto [`AttErrorCode`] /
//! [`crate::Error`]; raw platform codes never cross this boundary. An
//! operation a platform cannot perform returns
//! [`crate::Error::NotSupported`].

use crate::types::{
    AdapterState, AdvertisementData, AttErrorCode, AttributeHandle, BleUuid, ChannelId,
    Characteristic, ConnectionParams, Descriptor, DeviceId, NotifyKind, PreferredPhy, ScanFilter,
    ScanResult, Service, ServiceDefinition, WriteKind,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Events a central-role adapter feeds into a connection session's inbox.
///
/// A value update is a single ambiguous event: native stacks deliver
/// solicited read completions and unsolicited notifications through the same
/// callback, so [`ValueChanged`](SessionEvent::ValueChanged) carries no
/// indication of which it is. Disambiguation is the session engine's job.
#[derive(Debug)]
pub enum SessionEvent {
    /// Value update for a characteristic or descriptor: a solicited read
    /// completion or an unsolicited notification/indication.
    ValueChanged {
        attribute: AttributeHandle,
        result: Result<Vec<u8>, AttErrorCode>,
    },
    /// Completion of an acknowledged write.
    WriteCompleted {
        attribute: AttributeHandle,
        result: Result<(), AttErrorCode>,
    },
    /// Completion of a subscription-state change request.
    NotifyConfigCompleted {
        attribute: AttributeHandle,
        result: Result<(), AttErrorCode>,
    },
    ServicesDiscovered {
        result: Result<Vec<Service>, AttErrorCode>,
    },
    CharacteristicsDiscovered {
        service: BleUuid,
        result: Result<Vec<Characteristic>, AttErrorCode>,
    },
    DescriptorsDiscovered {
        characteristic: BleUuid,
        result: Result<Vec<Descriptor>, AttErrorCode>,
    },
    RssiRead {
        result: Result<i16, AttErrorCode>,
    },
    /// Inbound bytes on an open L2CAP channel.
    ChannelData { channel: ChannelId, data: Vec<u8> },
    /// The peer or the transport closed an L2CAP channel.
    ChannelClosed { channel: ChannelId },
    /// The link is gone. The session tears down on receipt.
    Disconnected { reason: String },
}

/// Events a peripheral-role adapter feeds into a service registration's
/// request stream. Read/write variants carry the raw reply channel the
/// engine wraps into a single-use responder; subscribe/unsubscribe are
/// informational notices (the protocol does not acknowledge them).
#[derive(Debug)]
pub enum ServiceEvent {
    Read {
        peer: DeviceId,
        characteristic: BleUuid,
        offset: usize,
        reply: oneshot::Sender<Result<Vec<u8>, AttErrorCode>>,
    },
    Write {
        peer: DeviceId,
        characteristic: BleUuid,
        value: Vec<u8>,
        /// `None` for an unacknowledged write command.
        reply: Option<oneshot::Sender<Result<(), AttErrorCode>>>,
    },
    /// One staged write of a prepared-write sequence.
    QueuedWrite {
        peer: DeviceId,
        characteristic: BleUuid,
        offset: usize,
        value: Vec<u8>,
        reply: oneshot::Sender<Result<(), AttErrorCode>>,
    },
    /// Commit (`commit == true`) or roll back the staged writes of a peer.
    ExecuteWrite {
        peer: DeviceId,
        commit: bool,
        reply: oneshot::Sender<Result<(), AttErrorCode>>,
    },
    Subscribed {
        peer: DeviceId,
        characteristic: BleUuid,
    },
    Unsubscribed {
        peer: DeviceId,
        characteristic: BleUuid,
    },
}

/// Events for an L2CAP PSM published by the peripheral role.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened {
        channel: ChannelId,
        peer: DeviceId,
        psm: u16,
    },
    Data {
        channel: ChannelId,
        data: Vec<u8>,
    },
    Closed {
        channel: ChannelId,
    },
}

/// Handle on one active native discovery operation.
pub trait ScanHandle: Send {
    /// Close the native scan. The scan session guarantees exactly one call
    /// regardless of which direction (explicit stop, stream drop, facade
    /// teardown) triggers it.
    fn stop(&mut self);
}

/// Central-role half of the backend contract.
#[async_trait]
pub trait CentralBackend: Send + Sync {
    /// Current adapter state.
    fn adapter_state(&self) -> AdapterState;

    /// Subscribe to adapter state changes. Each call returns an independent
    /// subscription.
    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterState>;

    /// Start a native scan. Results are pushed into `events`; deduplication
    /// of repeated advertisements is delegated to the native layer when it
    /// offers one and is not synthesized otherwise (platform-dependent).
    /// Service filters are applied natively where supported.
    async fn start_scan(
        &self,
        filter: &ScanFilter,
        events: mpsc::UnboundedSender<ScanResult>,
    ) -> crate::Result<Box<dyn ScanHandle>>;

    /// Establish a link. Resolves once the native stack reports the
    /// connection; all subsequent events for the link flow through `inbox`.
    /// The engine bounds this call with its connect timeout and calls
    /// [`cancel_connect`](CentralBackend::cancel_connect) if it loses the
    /// race.
    async fn connect(
        &self,
        device: &DeviceId,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> crate::Result<Arc<dyn ConnectionLink>>;

    /// Abort an in-flight connect attempt. Best effort; absence of an
    /// attempt is a no-op.
    async fn cancel_connect(&self, device: &DeviceId);
}

/// Per-link operations of an established central connection.
///
/// GATT calls here are issue-only: `Ok(())` means the native request was
/// submitted, and the outcome arrives later as a [`SessionEvent`] on the
/// link's inbox. Descriptor reads/writes use the descriptor's own attribute
/// handle with [`read`](ConnectionLink::read) /
/// [`write`](ConnectionLink::write).
#[async_trait]
pub trait ConnectionLink: Send + Sync {
    async fn discover_services(&self) -> crate::Result<()>;
    async fn discover_characteristics(&self, service: BleUuid) -> crate::Result<()>;
    async fn discover_descriptors(&self, characteristic: BleUuid) -> crate::Result<()>;
    async fn read(&self, attribute: AttributeHandle) -> crate::Result<()>;
    async fn write(
        &self,
        attribute: AttributeHandle,
        value: &[u8],
        kind: WriteKind,
    ) -> crate::Result<()>;
    async fn set_notify(&self, attribute: AttributeHandle, enabled: bool) -> crate::Result<()>;
    async fn read_rssi(&self) -> crate::Result<()>;
    async fn request_connection_update(&self, params: &ConnectionParams) -> crate::Result<()>;
    async fn set_preferred_phy(&self, phy: PreferredPhy) -> crate::Result<()>;

    /// Open a connection-oriented channel on `psm`. Unlike the GATT calls
    /// this resolves with the channel id directly; inbound data then arrives
    /// as [`SessionEvent::ChannelData`].
    async fn open_channel(&self, psm: u16) -> crate::Result<ChannelId>;
    async fn channel_send(&self, channel: ChannelId, data: &[u8]) -> crate::Result<()>;
    async fn channel_close(&self, channel: ChannelId) -> crate::Result<()>;

    /// Drop the link. The adapter emits a final
    /// [`SessionEvent::Disconnected`] once the native stack confirms.
    async fn disconnect(&self);
}

/// Peripheral-role half of the backend contract.
#[async_trait]
pub trait PeripheralBackend: Send + Sync {
    fn adapter_state(&self) -> AdapterState;
    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterState>;

    async fn start_advertising(&self, data: &AdvertisementData) -> crate::Result<()>;
    async fn update_advertising(&self, data: &AdvertisementData) -> crate::Result<()>;
    async fn stop_advertising(&self) -> crate::Result<()>;

    /// Register a service. Remote requests against it are pushed into
    /// `events`. Returns the characteristic handle map for
    /// [`notify_value`](PeripheralBackend::notify_value).
    async fn add_service(
        &self,
        definition: &ServiceDefinition,
        events: mpsc::UnboundedSender<ServiceEvent>,
    ) -> crate::Result<HashMap<BleUuid, AttributeHandle>>;

    /// Unregister a service; its event sender is dropped, ending the
    /// registration's request stream.
    async fn remove_service(&self, service: BleUuid) -> crate::Result<()>;

    /// Push a server-initiated notification or indication to subscribed
    /// centrals. Fails with [`crate::Error::Backpressure`] when the native
    /// outbound queue is full; the engine never queues on the caller's
    /// behalf.
    async fn notify_value(
        &self,
        characteristic: AttributeHandle,
        value: &[u8],
        kind: NotifyKind,
    ) -> crate::Result<()>;

    /// Listen for incoming connection-oriented channels on `psm`.
    async fn publish_channel(
        &self,
        psm: u16,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> crate::Result<()>;
    async fn unpublish_channel(&self, psm: u16) -> crate::Result<()>;
    async fn channel_send(&self, channel: ChannelId, data: &[u8]) -> crate::Result<()>;
    async fn channel_close(&self, channel: ChannelId) -> crate::Result<()>;
}
