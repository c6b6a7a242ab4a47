//! Connection session and GATT client engine
//!
//! One session per established link. The session owns the correlation
//! queues, the discovery snapshot cache, the notification registrations and
//! the open L2CAP channels, and it is the single serialization point for
//! native events: a spawned pump task drains the link's inbox one event at a
//! time, so callback threads never touch session state directly.
//!
//! The pump holds only a `Weak` reference back to the session; dropping the
//! last `Connection` handle therefore drops the session and the pump exits
//! on its next event.

use crate::backend::{ConnectionLink, SessionEvent};
use crate::central::correlation::{Completion, OpKey, OpKind, OperationQueues};
use crate::l2cap::{ChannelIo, L2capChannel};
use crate::types::{
    AttributeHandle, BleUuid, ChannelId, Characteristic, ConnectionParams, ConnectionState,
    Descriptor, DeviceId, PreferredPhy, Service, WriteKind,
};
use crate::{Error, Result};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Engine-internal requests handled by the session pump.
enum ControlMsg {
    /// Fire-and-forget subscription disable after a notification stream was
    /// dropped without an explicit unsubscribe.
    DisableNotify(AttributeHandle),
}

struct SubscriptionEntry {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

struct ChannelEntry {
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Immutable snapshots of the last discovery per scope, keyed by parent
/// UUID. Re-discovery replaces a scope wholesale.
#[derive(Default)]
struct DiscoveryCache {
    services: Option<Arc<Vec<Service>>>,
    characteristics: HashMap<BleUuid, Arc<Vec<Characteristic>>>,
    descriptors: HashMap<BleUuid, Arc<Vec<Descriptor>>>,
}

#[derive(Default)]
struct SessionShared {
    queues: OperationQueues,
    cache: DiscoveryCache,
    subscriptions: HashMap<AttributeHandle, SubscriptionEntry>,
    channels: HashMap<ChannelId, ChannelEntry>,
    pending_services: Option<oneshot::Sender<Result<Vec<Service>>>>,
    pending_characteristics: HashMap<BleUuid, oneshot::Sender<Result<Vec<Characteristic>>>>,
    pending_descriptors: HashMap<BleUuid, oneshot::Sender<Result<Vec<Descriptor>>>>,
    pending_rssi: VecDeque<oneshot::Sender<Result<i16>>>,
    torn_down: bool,
}

impl SessionShared {
    fn ensure_live(&self) -> Result<()> {
        if self.torn_down {
            Err(Error::ConnectionFailed("session closed".to_string()))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct ConnectionInner {
    device: DeviceId,
    link: Arc<dyn ConnectionLink>,
    state_tx: watch::Sender<ConnectionState>,
    control_tx: mpsc::UnboundedSender<ControlMsg>,
    /// Serializes the enqueue-then-issue step so queue order always matches
    /// native issue order. Never held while awaiting a completion.
    issue_lock: tokio::sync::Mutex<()>,
    shared: Mutex<SessionShared>,
}

/// A live connection session. Cheap to clone; all handles refer to the same
/// session. The session is terminal at `Disconnected` — reconnecting means
/// a new [`crate::Central::connect`] call and a new session.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device", &self.inner.device)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        device: DeviceId,
        link: Arc<dyn ConnectionLink>,
        inbox: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connected);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            device,
            link,
            state_tx,
            control_tx,
            issue_lock: tokio::sync::Mutex::new(()),
            shared: Mutex::new(SessionShared::default()),
        });
        spawn_event_pump(&inner, inbox, control_rx);
        Connection { inner }
    }

    pub fn device(&self) -> &DeviceId {
        &self.inner.device
    }

    /// Current session state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    /// Ordered state sequence. A new observer receives the current state
    /// immediately even when joining late.
    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Drop the link and tear the session down. Idempotent with the
    /// native-initiated disconnect path: teardown runs exactly once no
    /// matter which side triggers first.
    pub async fn disconnect(&self) {
        self.inner.link.disconnect().await;
        teardown(&self.inner, "disconnected by caller");
    }

    /// Discover the peer's services, replacing the cached snapshot.
    pub async fn discover_services(&self) -> Result<Vec<Service>> {
        let rx = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            if shared.pending_services.is_some() {
                return Err(Error::InvalidState(
                    "service discovery already in progress".to_string(),
                ));
            }
            let (tx, rx) = oneshot::channel();
            shared.pending_services = Some(tx);
            rx
        };
        if let Err(err) = self.inner.link.discover_services().await {
            self.inner.shared.lock().pending_services = None;
            return Err(err);
        }
        await_oneshot(rx).await
    }

    /// Discover the characteristics of a previously discovered service.
    /// Unknown parents fail with [`Error::NotFound`].
    pub async fn discover_characteristics(&self, service: BleUuid) -> Result<Vec<Characteristic>> {
        let rx = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            let known = shared
                .cache
                .services
                .as_ref()
                .is_some_and(|services| services.iter().any(|s| s.uuid == service));
            if !known {
                return Err(Error::NotFound(format!("service {} not discovered", service)));
            }
            if shared.pending_characteristics.contains_key(&service) {
                return Err(Error::InvalidState(format!(
                    "characteristic discovery already in progress for {}",
                    service
                )));
            }
            let (tx, rx) = oneshot::channel();
            shared.pending_characteristics.insert(service, tx);
            rx
        };
        if let Err(err) = self.inner.link.discover_characteristics(service).await {
            self.inner.shared.lock().pending_characteristics.remove(&service);
            return Err(err);
        }
        await_oneshot(rx).await
    }

    /// Discover the descriptors of a previously discovered characteristic.
    pub async fn discover_descriptors(&self, characteristic: BleUuid) -> Result<Vec<Descriptor>> {
        let rx = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            let known = shared
                .cache
                .characteristics
                .values()
                .any(|list| list.iter().any(|c| c.uuid == characteristic));
            if !known {
                return Err(Error::NotFound(format!(
                    "characteristic {} not discovered",
                    characteristic
                )));
            }
            if shared.pending_descriptors.contains_key(&characteristic) {
                return Err(Error::InvalidState(format!(
                    "descriptor discovery already in progress for {}",
                    characteristic
                )));
            }
            let (tx, rx) = oneshot::channel();
            shared.pending_descriptors.insert(characteristic, tx);
            rx
        };
        if let Err(err) = self.inner.link.discover_descriptors(characteristic).await {
            self.inner.shared.lock().pending_descriptors.remove(&characteristic);
            return Err(err);
        }
        await_oneshot(rx).await
    }

    /// Read a characteristic value.
    pub async fn read(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.read_attribute(characteristic.handle).await
    }

    /// Read a descriptor value.
    pub async fn read_descriptor(&self, descriptor: &Descriptor) -> Result<Vec<u8>> {
        self.read_attribute(descriptor.handle).await
    }

    async fn read_attribute(&self, handle: AttributeHandle) -> Result<Vec<u8>> {
        let key = OpKey::new(handle, OpKind::Read);
        let issue = self.inner.issue_lock.lock().await;
        let (id, waiter_rx) = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            shared.queues.enqueue_value(key)
        };
        // Guards the waiter for the rest of the call: cancelled work is
        // removed from its queue, resolved work makes the drop a no-op.
        let _guard = WaiterGuard::new(&self.inner, key, id);
        self.inner.link.read(handle).await?;
        drop(issue);
        match waiter_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionFailed("session closed".to_string())),
        }
    }

    /// Write a characteristic value.
    ///
    /// With [`WriteKind::WithResponse`] the call completes when the peer
    /// acknowledges. With [`WriteKind::WithoutResponse`] it returns as soon
    /// as the native call is issued; there is no delivery guarantee.
    pub async fn write(
        &self,
        characteristic: &Characteristic,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        match kind {
            WriteKind::WithResponse => self.write_acknowledged(characteristic.handle, value).await,
            WriteKind::WithoutResponse => {
                self.inner.shared.lock().ensure_live()?;
                self.inner
                    .link
                    .write(characteristic.handle, value, WriteKind::WithoutResponse)
                    .await
            }
        }
    }

    /// Write a descriptor value. Descriptor writes are always acknowledged.
    pub async fn write_descriptor(&self, descriptor: &Descriptor, value: &[u8]) -> Result<()> {
        self.write_acknowledged(descriptor.handle, value).await
    }

    async fn write_acknowledged(&self, handle: AttributeHandle, value: &[u8]) -> Result<()> {
        let key = OpKey::new(handle, OpKind::Write);
        let issue = self.inner.issue_lock.lock().await;
        let (id, waiter_rx) = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            shared.queues.enqueue_done(key)
        };
        let _guard = WaiterGuard::new(&self.inner, key, id);
        self.inner
            .link
            .write(handle, value, WriteKind::WithResponse)
            .await?;
        drop(issue);
        match waiter_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionFailed("session closed".to_string())),
        }
    }

    /// Subscribe to value pushes from `characteristic`.
    ///
    /// Enabling issues a queued subscription-state request before delivery
    /// begins. At most one stream may exist per characteristic per session;
    /// a second open fails with [`Error::InvalidState`] until the first is
    /// dropped or unsubscribed.
    pub async fn notifications(&self, characteristic: &Characteristic) -> Result<NotificationStream> {
        let handle = characteristic.handle;
        let key = OpKey::new(handle, OpKind::NotifyConfig);
        let issue = self.inner.issue_lock.lock().await;
        let (id, data_rx, waiter_rx) = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            if shared.subscriptions.contains_key(&handle) {
                return Err(Error::InvalidState(format!(
                    "characteristic {} already has an active notification stream",
                    characteristic.uuid
                )));
            }
            let (tx, data_rx) = mpsc::unbounded_channel();
            shared.subscriptions.insert(handle, SubscriptionEntry { tx });
            let (id, waiter_rx) = shared.queues.enqueue_done(key);
            (id, data_rx, waiter_rx)
        };
        // Cleans up both the registration slot and the queued waiter if the
        // call fails or is cancelled before the subscription is live.
        let mut guard = SubscribeGuard {
            inner: &self.inner,
            attribute: handle,
            key,
            id,
            armed: true,
        };
        self.inner.link.set_notify(handle, true).await?;
        drop(issue);
        match waiter_rx.await {
            Ok(Ok(())) => {
                guard.armed = false;
                debug!(characteristic = %characteristic.uuid, "subscription enabled");
                Ok(NotificationStream {
                    inner: self.inner.clone(),
                    attribute: handle,
                    characteristic: characteristic.uuid,
                    rx: data_rx,
                    detached: false,
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::ConnectionFailed("session closed".to_string())),
        }
    }

    /// Read the current signal strength of the link.
    pub async fn read_rssi(&self) -> Result<i16> {
        let issue = self.inner.issue_lock.lock().await;
        let rx = {
            let mut shared = self.inner.shared.lock();
            shared.ensure_live()?;
            let (tx, rx) = oneshot::channel();
            shared.pending_rssi.push_back(tx);
            rx
        };
        if let Err(err) = self.inner.link.read_rssi().await {
            // No completion will arrive for this request; drop the waiter
            // just enqueued (the issue lock is still held, so it is
            // necessarily the tail).
            self.inner.shared.lock().pending_rssi.pop_back();
            return Err(err);
        }
        drop(issue);
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConnectionFailed("session closed".to_string())),
        }
    }

    /// Ask the link layer to renegotiate connection parameters.
    pub async fn request_connection_update(&self, params: &ConnectionParams) -> Result<()> {
        self.inner.shared.lock().ensure_live()?;
        self.inner.link.request_connection_update(params).await
    }

    /// Set the preferred physical layer for the link.
    pub async fn set_preferred_phy(&self, phy: PreferredPhy) -> Result<()> {
        self.inner.shared.lock().ensure_live()?;
        self.inner.link.set_preferred_phy(phy).await
    }

    /// Open a connection-oriented L2CAP channel on `psm`.
    pub async fn open_channel(&self, psm: u16) -> Result<L2capChannel> {
        self.inner.shared.lock().ensure_live()?;
        let id = self.inner.link.open_channel(psm).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        {
            let mut shared = self.inner.shared.lock();
            if shared.torn_down {
                // Lost the race against teardown; the native channel dies
                // with the link.
                closed.store(true, Ordering::Release);
                return Err(Error::ConnectionFailed("session closed".to_string()));
            }
            shared.channels.insert(
                id,
                ChannelEntry {
                    inbound: tx,
                    closed: closed.clone(),
                },
            );
        }
        debug!(device = %self.inner.device, psm, channel = id.raw(), "channel opened");
        Ok(L2capChannel::new(
            psm,
            id,
            ChannelIo::Central(self.inner.link.clone()),
            rx,
            closed,
        ))
    }
}

async fn await_oneshot<T>(rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(Error::ConnectionFailed("session closed".to_string())),
    }
}

/// Removes a queued waiter on drop. Resolution and cancellation race under
/// the session lock; whichever runs first wins and the loser finds nothing
/// to do, so dropping after a completed await is a no-op.
struct WaiterGuard<'a> {
    inner: &'a Arc<ConnectionInner>,
    key: OpKey,
    id: u64,
}

impl<'a> WaiterGuard<'a> {
    fn new(inner: &'a Arc<ConnectionInner>, key: OpKey, id: u64) -> Self {
        WaiterGuard { inner, key, id }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.shared.lock().queues.cancel(self.key, self.id);
    }
}

/// Cleanup for a subscription that never became live: releases the
/// registration slot and removes the queued enable waiter.
struct SubscribeGuard<'a> {
    inner: &'a Arc<ConnectionInner>,
    attribute: AttributeHandle,
    key: OpKey,
    id: u64,
    armed: bool,
}

impl Drop for SubscribeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut shared = self.inner.shared.lock();
            shared.subscriptions.remove(&self.attribute);
            shared.queues.cancel(self.key, self.id);
        }
    }
}

/// A lazy sequence of notification/indication payloads, finite once the
/// subscription ends. Dropping the stream releases the registration and
/// disables the subscription best-effort; [`unsubscribe`] does so
/// deterministically.
///
/// [`unsubscribe`]: NotificationStream::unsubscribe
pub struct NotificationStream {
    inner: Arc<ConnectionInner>,
    attribute: AttributeHandle,
    characteristic: BleUuid,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    detached: bool,
}

impl std::fmt::Debug for NotificationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationStream")
            .field("device", &self.inner.device)
            .field("attribute", &self.attribute)
            .field("characteristic", &self.characteristic)
            .field("detached", &self.detached)
            .finish()
    }
}

impl NotificationStream {
    pub fn characteristic(&self) -> BleUuid {
        self.characteristic
    }

    /// Receive the next payload; `None` once the subscription terminated.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Disable the subscription and release the registration, waiting for
    /// the set-notify-off request to complete.
    pub async fn unsubscribe(mut self) -> Result<()> {
        self.detached = true;
        let key = OpKey::new(self.attribute, OpKind::NotifyConfig);
        let rx;
        {
            let _issue = self.inner.issue_lock.lock().await;
            let id;
            {
                let mut shared = self.inner.shared.lock();
                shared.subscriptions.remove(&self.attribute);
                if shared.torn_down {
                    return Ok(());
                }
                let (waiter_id, waiter_rx) = shared.queues.enqueue_done(key);
                id = waiter_id;
                rx = waiter_rx;
            }
            if let Err(err) = self.inner.link.set_notify(self.attribute, false).await {
                self.inner.shared.lock().queues.cancel(key, id);
                return Err(err);
            }
        }
        match rx.await {
            Ok(result) => result,
            Err(_) => Ok(()),
        }
    }
}

impl Stream for NotificationStream {
    type Item = Vec<u8>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for NotificationStream {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let mut shared = self.inner.shared.lock();
        shared.subscriptions.remove(&self.attribute);
        if !shared.torn_down {
            let _ = self
                .inner
                .control_tx
                .send(ControlMsg::DisableNotify(self.attribute));
        }
    }
}

fn spawn_event_pump(
    inner: &Arc<ConnectionInner>,
    mut inbox: mpsc::UnboundedReceiver<SessionEvent>,
    mut control: mpsc::UnboundedReceiver<ControlMsg>,
) {
    let weak: Weak<ConnectionInner> = Arc::downgrade(inner);
    tokio::spawn(async move {
        trace!("session event pump started");
        loop {
            tokio::select! {
                event = inbox.recv() => {
                    let Some(inner) = weak.upgrade() else { break };
                    match event {
                        Some(event) => {
                            if handle_event(&inner, event) {
                                break;
                            }
                        }
                        None => {
                            teardown(&inner, "backend event stream closed");
                            break;
                        }
                    }
                }
                msg = control.recv() => {
                    match msg {
                        Some(ControlMsg::DisableNotify(attribute)) => {
                            let Some(inner) = weak.upgrade() else { break };
                            let link = inner.link.clone();
                            drop(inner);
                            if let Err(err) = link.set_notify(attribute, false).await {
                                debug!(attribute = attribute.raw(), %err, "best-effort notify disable failed");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        trace!("session event pump finished");
    });
}

/// Apply one native event to the session. Returns `true` when the pump
/// should stop (session terminal).
fn handle_event(inner: &Arc<ConnectionInner>, event: SessionEvent) -> bool {
    match event {
        SessionEvent::ValueChanged { attribute, result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let key = OpKey::new(attribute, OpKind::Read);
            if shared.queues.has_pending(key) {
                // Solicited: the oldest queued read owns this update.
                shared
                    .queues
                    .resolve(key, Completion::Value(result.map_err(Error::Protocol)));
                return false;
            }
            match result {
                Ok(value) => {
                    if let Some(subscription) = shared.subscriptions.get(&attribute) {
                        if subscription.tx.send(value).is_err() {
                            // Stream receiver just dropped; registration
                            // cleanup happens in the stream's Drop.
                            trace!(attribute = attribute.raw(), "notification receiver gone");
                        }
                    } else {
                        // No subscriber and no pending read: a legitimate
                        // no-op, never an error.
                        trace!(attribute = attribute.raw(), "discarding unsolicited value update");
                    }
                }
                Err(code) => {
                    trace!(attribute = attribute.raw(), %code, "discarding unsolicited error update");
                }
            }
        }
        SessionEvent::WriteCompleted { attribute, result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let resolved = shared.queues.resolve(
                OpKey::new(attribute, OpKind::Write),
                Completion::Done(result.map_err(Error::Protocol)),
            );
            if !resolved {
                warn!(attribute = attribute.raw(), "write completion without a waiter");
            }
        }
        SessionEvent::NotifyConfigCompleted { attribute, result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let resolved = shared.queues.resolve(
                OpKey::new(attribute, OpKind::NotifyConfig),
                Completion::Done(result.map_err(Error::Protocol)),
            );
            if !resolved {
                // Expected after a fire-and-forget disable.
                trace!(attribute = attribute.raw(), "unsolicited notify-config completion");
            }
        }
        SessionEvent::ServicesDiscovered { result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let waiter = shared.pending_services.take();
            let result = result.map_err(Error::Protocol);
            if let Ok(services) = &result {
                shared.cache.services = Some(Arc::new(services.clone()));
                // The whole subtree is replaced; child snapshots are stale.
                shared.cache.characteristics.clear();
                shared.cache.descriptors.clear();
            }
            if let Some(tx) = waiter {
                let _ = tx.send(result);
            }
        }
        SessionEvent::CharacteristicsDiscovered { service, result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let waiter = shared.pending_characteristics.remove(&service);
            let result = result.map_err(Error::Protocol);
            if let Ok(characteristics) = &result {
                if let Some(previous) = shared.cache.characteristics.get(&service) {
                    let stale: Vec<BleUuid> = previous.iter().map(|c| c.uuid).collect();
                    for uuid in stale {
                        shared.cache.descriptors.remove(&uuid);
                    }
                }
                shared
                    .cache
                    .characteristics
                    .insert(service, Arc::new(characteristics.clone()));
            }
            if let Some(tx) = waiter {
                let _ = tx.send(result);
            }
        }
        SessionEvent::DescriptorsDiscovered {
            characteristic,
            result,
        } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            let waiter = shared.pending_descriptors.remove(&characteristic);
            let result = result.map_err(Error::Protocol);
            if let Ok(descriptors) = &result {
                shared
                    .cache
                    .descriptors
                    .insert(characteristic, Arc::new(descriptors.clone()));
            }
            if let Some(tx) = waiter {
                let _ = tx.send(result);
            }
        }
        SessionEvent::RssiRead { result } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            // One completion per issued request: pop even when the caller
            // already went away, so later completions stay aligned.
            if let Some(tx) = shared.pending_rssi.pop_front() {
                let _ = tx.send(result.map_err(Error::Protocol));
            } else {
                warn!("RSSI completion without a waiter");
            }
        }
        SessionEvent::ChannelData { channel, data } => {
            let shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            if let Some(entry) = shared.channels.get(&channel) {
                let _ = entry.inbound.send(data);
            } else {
                trace!(channel = channel.raw(), "data for unknown channel discarded");
            }
        }
        SessionEvent::ChannelClosed { channel } => {
            let mut shared = inner.shared.lock();
            if shared.torn_down {
                return true;
            }
            if let Some(entry) = shared.channels.remove(&channel) {
                entry.closed.store(true, Ordering::Release);
                drop(entry.inbound);
                debug!(channel = channel.raw(), "channel closed by transport");
            }
        }
        SessionEvent::Disconnected { reason } => {
            teardown(inner, &reason);
            return true;
        }
    }
    false
}

/// Run the session's teardown sequence exactly once, regardless of how many
/// times (or from which direction) it is triggered:
///
/// 1. fail every pending operation with a connection-failed reason,
/// 2. close and fail every open L2CAP channel,
/// 3. terminate every notification delivery stream,
/// 4. emit the terminal state event,
/// 5. release the discovery caches.
fn teardown(inner: &Arc<ConnectionInner>, reason: &str) {
    let mut shared = inner.shared.lock();
    if shared.torn_down {
        return;
    }
    shared.torn_down = true;

    let error = Error::ConnectionFailed(reason.to_string());
    shared.queues.fail_all(&error);
    if let Some(tx) = shared.pending_services.take() {
        let _ = tx.send(Err(error.clone()));
    }
    for (_, tx) in shared.pending_characteristics.drain() {
        let _ = tx.send(Err(error.clone()));
    }
    for (_, tx) in shared.pending_descriptors.drain() {
        let _ = tx.send(Err(error.clone()));
    }
    while let Some(tx) = shared.pending_rssi.pop_front() {
        let _ = tx.send(Err(error.clone()));
    }

    for (_, entry) in shared.channels.drain() {
        entry.closed.store(true, Ordering::Release);
        drop(entry.inbound);
    }

    shared.subscriptions.clear();

    let _ = inner
        .state_tx
        .send(ConnectionState::Disconnected(reason.to_string()));

    shared.cache = DiscoveryCache::default();
    drop(shared);

    info!(device = %inner.device, reason, "session torn down");
}
