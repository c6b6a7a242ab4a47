//! Scripted in-memory backend
//!
//! Implements both halves of the backend contract without any radio, for
//! tests, examples and development off-hardware. Two kinds of device exist:
//!
//! - **Manual peers** (added with [`MockBackend::add_peer`]): every issued
//!   operation is recorded and no completion is produced; tests inject
//!   [`SessionEvent`]s through [`MockBackend::session_inbox`] to script the
//!   native side, including out-of-order and failure cases.
//! - **The loopback device** ([`MockBackend::loopback_device`]): a central
//!   connection to it is wired to this backend's own peripheral half, so a
//!   service registered through the server engine is discoverable, readable,
//!   writable and notifiable through the client engine, L2CAP included.
//!
//! Connect behavior, adapter state, notify-queue exhaustion and channel
//! backpressure are all scriptable.

use crate::backend::{
    CentralBackend, ChannelEvent, ConnectionLink, PeripheralBackend, ScanHandle, ServiceEvent,
    SessionEvent,
};
use crate::types::{
    AdapterState, AdvertisementData, AttErrorCode, AttributeHandle, BleUuid, ChannelId,
    Characteristic, CharacteristicProperties, ConnectionParams, Descriptor, DeviceId, NotifyKind,
    PreferredPhy, ScanFilter, ScanResult, Service, ServiceDefinition, WriteKind,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

const LOOPBACK_ID: &str = "mock-loopback";
const CENTRAL_PEER_ID: &str = "mock-central";

/// Scripted outcome of the next connect attempts.
#[derive(Clone)]
pub enum ConnectBehavior {
    /// Resolve with a live link (default).
    Succeed,
    /// Fail immediately with the given error.
    Fail(Error),
    /// Never resolve; used to exercise the connect timeout race.
    Hang,
}

/// Operations a session issued against a mock link, in issue order.
#[derive(Debug, Clone, PartialEq)]
pub enum IssuedOp {
    DiscoverServices,
    DiscoverCharacteristics(BleUuid),
    DiscoverDescriptors(BleUuid),
    Read(AttributeHandle),
    Write(AttributeHandle, Vec<u8>, WriteKind),
    SetNotify(AttributeHandle, bool),
    ReadRssi,
    ConnectionUpdate,
    PreferredPhy(PreferredPhy),
    OpenChannel(u16),
    ChannelSend(ChannelId, Vec<u8>),
    ChannelClose(ChannelId),
    Disconnect,
}

struct MockPeer {
    advertisement: AdvertisementData,
    rssi: i16,
}

struct MockCharacteristic {
    handle: AttributeHandle,
    properties: CharacteristicProperties,
    subscribed: bool,
    descriptors: HashMap<BleUuid, AttributeHandle>,
}

struct MockService {
    service_handle: AttributeHandle,
    primary: bool,
    characteristics: HashMap<BleUuid, MockCharacteristic>,
    events: mpsc::UnboundedSender<ServiceEvent>,
}

/// Loopback channel route between the central link and the peripheral half.
struct ChannelRoute {
    psm: u16,
    central_inbox: mpsc::UnboundedSender<SessionEvent>,
}

struct MockInner {
    adapter: Mutex<AdapterState>,
    adapter_subs: Mutex<Vec<mpsc::UnboundedSender<AdapterState>>>,

    peers: Mutex<HashMap<DeviceId, MockPeer>>,
    scan_tx: Mutex<Option<mpsc::UnboundedSender<ScanResult>>>,
    scan_stops: AtomicU64,

    connect_behavior: Mutex<ConnectBehavior>,
    cancelled_connects: Mutex<Vec<DeviceId>>,
    links: Mutex<HashMap<DeviceId, Arc<MockLink>>>,

    gatt: Mutex<HashMap<BleUuid, MockService>>,
    advertising: Mutex<Option<AdvertisementData>>,
    published: Mutex<HashMap<u16, mpsc::UnboundedSender<ChannelEvent>>>,
    channel_routes: Mutex<HashMap<ChannelId, ChannelRoute>>,

    notify_queue_full: AtomicBool,
    channel_backpressure: AtomicBool,
    phy_unsupported: AtomicBool,

    next_handle: AtomicU64,
    next_channel: AtomicU64,
}

impl MockInner {
    fn next_handle(&self) -> AttributeHandle {
        AttributeHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn next_channel(&self) -> ChannelId {
        ChannelId::new(self.next_channel.fetch_add(1, Ordering::Relaxed))
    }

    fn find_characteristic<R>(
        &self,
        handle: AttributeHandle,
        f: impl FnOnce(&mut MockCharacteristic, &mpsc::UnboundedSender<ServiceEvent>, BleUuid) -> R,
    ) -> Option<R> {
        let mut gatt = self.gatt.lock();
        for service in gatt.values_mut() {
            let events = service.events.clone();
            for (uuid, characteristic) in service.characteristics.iter_mut() {
                if characteristic.handle == handle {
                    return Some(f(characteristic, &events, *uuid));
                }
            }
        }
        None
    }
}

/// The scripted backend. Cloning shares the same inner state, so one
/// instance can serve a [`crate::Central`] and a [`crate::Peripheral`] at
/// once (which is what the loopback device relies on).
#[derive(Clone)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        MockBackend {
            inner: Arc::new(MockInner {
                adapter: Mutex::new(AdapterState::PoweredOn),
                adapter_subs: Mutex::new(Vec::new()),
                peers: Mutex::new(HashMap::new()),
                scan_tx: Mutex::new(None),
                scan_stops: AtomicU64::new(0),
                connect_behavior: Mutex::new(ConnectBehavior::Succeed),
                cancelled_connects: Mutex::new(Vec::new()),
                links: Mutex::new(HashMap::new()),
                gatt: Mutex::new(HashMap::new()),
                advertising: Mutex::new(None),
                published: Mutex::new(HashMap::new()),
                channel_routes: Mutex::new(HashMap::new()),
                notify_queue_full: AtomicBool::new(false),
                channel_backpressure: AtomicBool::new(false),
                phy_unsupported: AtomicBool::new(false),
                next_handle: AtomicU64::new(1),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// The device id whose central connection loops back into this
    /// backend's peripheral half.
    pub fn loopback_device() -> DeviceId {
        DeviceId::new(LOOPBACK_ID)
    }

    pub fn set_adapter_state(&self, state: AdapterState) {
        *self.inner.adapter.lock() = state;
        self.inner
            .adapter_subs
            .lock()
            .retain(|tx| tx.send(state).is_ok());
    }

    /// Make a manual peer visible to scans and connectable.
    pub fn add_peer(&self, device: DeviceId, advertisement: AdvertisementData, rssi: i16) {
        self.inner.peers.lock().insert(
            device,
            MockPeer {
                advertisement,
                rssi,
            },
        );
    }

    /// Push one scan result into the active scan, bypassing native filters.
    pub fn emit_scan_result(&self, result: ScanResult) {
        if let Some(tx) = self.inner.scan_tx.lock().as_ref() {
            let _ = tx.send(result);
        }
    }

    pub fn scan_active(&self) -> bool {
        self.inner.scan_tx.lock().is_some()
    }

    /// How many times a scan handle was stopped.
    pub fn scan_stop_count(&self) -> u64 {
        self.inner.scan_stops.load(Ordering::Acquire)
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        *self.inner.connect_behavior.lock() = behavior;
    }

    pub fn cancelled_connects(&self) -> Vec<DeviceId> {
        self.inner.cancelled_connects.lock().clone()
    }

    /// Injection handle for a registered service's event stream, for
    /// scripting request kinds a loopback central never produces (prepared
    /// writes, execute-write).
    pub fn service_inbox(&self, service: &BleUuid) -> Option<mpsc::UnboundedSender<ServiceEvent>> {
        self.inner
            .gatt
            .lock()
            .get(service)
            .map(|entry| entry.events.clone())
    }

    /// Injection handle for a connected device's session inbox.
    pub fn session_inbox(&self, device: &DeviceId) -> Option<mpsc::UnboundedSender<SessionEvent>> {
        self.inner
            .links
            .lock()
            .get(device)
            .map(|link| link.inbox.clone())
    }

    /// Snapshot of the operations issued against a connected device.
    pub fn issued_ops(&self, device: &DeviceId) -> Vec<IssuedOp> {
        self.inner
            .links
            .lock()
            .get(device)
            .map(|link| link.issued.lock().clone())
            .unwrap_or_default()
    }

    pub fn set_notify_queue_full(&self, full: bool) {
        self.inner.notify_queue_full.store(full, Ordering::Release);
    }

    pub fn set_channel_backpressure(&self, full: bool) {
        self.inner
            .channel_backpressure
            .store(full, Ordering::Release);
    }

    /// Script the PHY-update capability away, for capability-error tests.
    pub fn set_phy_unsupported(&self, unsupported: bool) {
        self.inner.phy_unsupported.store(unsupported, Ordering::Release);
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.lock().is_some()
    }
}

struct MockScanHandle {
    inner: Arc<MockInner>,
}

impl ScanHandle for MockScanHandle {
    fn stop(&mut self) {
        self.inner.scan_stops.fetch_add(1, Ordering::AcqRel);
        *self.inner.scan_tx.lock() = None;
    }
}

#[async_trait]
impl CentralBackend for MockBackend {
    fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.lock()
    }

    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.adapter_subs.lock().push(tx);
        rx
    }

    async fn start_scan(
        &self,
        filter: &ScanFilter,
        events: mpsc::UnboundedSender<ScanResult>,
    ) -> Result<Box<dyn ScanHandle>> {
        // Service filtering happens "natively" here; name prefixes are the
        // engine's job.
        for (device, peer) in self.inner.peers.lock().iter() {
            let matches = filter.services.is_empty()
                || peer
                    .advertisement
                    .service_uuids
                    .iter()
                    .any(|uuid| filter.services.contains(uuid));
            if matches {
                let _ = events.send(ScanResult {
                    device: device.clone(),
                    advertisement: peer.advertisement.clone(),
                    rssi: peer.rssi,
                });
            }
        }
        *self.inner.scan_tx.lock() = Some(events);
        Ok(Box::new(MockScanHandle {
            inner: self.inner.clone(),
        }))
    }

    async fn connect(
        &self,
        device: &DeviceId,
        inbox: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn ConnectionLink>> {
        let behavior = self.inner.connect_behavior.lock().clone();
        match behavior {
            ConnectBehavior::Succeed => {}
            ConnectBehavior::Fail(err) => return Err(err),
            ConnectBehavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!("pending future resolved");
            }
        }
        let loopback = device.as_str() == LOOPBACK_ID;
        if !loopback && !self.inner.peers.lock().contains_key(device) {
            return Err(Error::NotFound(format!("device {} unknown", device)));
        }
        let link = Arc::new(MockLink {
            device: device.clone(),
            inbox,
            issued: Mutex::new(Vec::new()),
            backend: Arc::downgrade(&self.inner),
            loopback,
        });
        self.inner.links.lock().insert(device.clone(), link.clone());
        debug!(%device, loopback, "mock link established");
        Ok(link)
    }

    async fn cancel_connect(&self, device: &DeviceId) {
        self.inner.cancelled_connects.lock().push(device.clone());
    }
}

struct MockLink {
    device: DeviceId,
    inbox: mpsc::UnboundedSender<SessionEvent>,
    issued: Mutex<Vec<IssuedOp>>,
    backend: Weak<MockInner>,
    loopback: bool,
}

impl MockLink {
    fn record(&self, op: IssuedOp) {
        self.issued.lock().push(op);
    }

    fn backend(&self) -> Result<Arc<MockInner>> {
        self.backend
            .upgrade()
            .ok_or_else(|| Error::BackendUnavailable("mock backend dropped".to_string()))
    }

    fn push(&self, event: SessionEvent) {
        let _ = self.inbox.send(event);
    }
}

#[async_trait]
impl ConnectionLink for MockLink {
    async fn discover_services(&self) -> Result<()> {
        self.record(IssuedOp::DiscoverServices);
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        let services = inner
            .gatt
            .lock()
            .iter()
            .map(|(uuid, service)| Service {
                uuid: *uuid,
                handle: service.service_handle,
                primary: service.primary,
            })
            .collect();
        self.push(SessionEvent::ServicesDiscovered {
            result: Ok(services),
        });
        Ok(())
    }

    async fn discover_characteristics(&self, service: BleUuid) -> Result<()> {
        self.record(IssuedOp::DiscoverCharacteristics(service));
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        let result = match inner.gatt.lock().get(&service) {
            Some(entry) => Ok(entry
                .characteristics
                .iter()
                .map(|(uuid, characteristic)| Characteristic {
                    uuid: *uuid,
                    handle: characteristic.handle,
                    service,
                    properties: characteristic.properties,
                })
                .collect()),
            None => Err(AttErrorCode::AttributeNotFound),
        };
        self.push(SessionEvent::CharacteristicsDiscovered { service, result });
        Ok(())
    }

    async fn discover_descriptors(&self, characteristic: BleUuid) -> Result<()> {
        self.record(IssuedOp::DiscoverDescriptors(characteristic));
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        let gatt = inner.gatt.lock();
        let found = gatt.values().find_map(|service| {
            service
                .characteristics
                .get(&characteristic)
                .map(|entry| &entry.descriptors)
        });
        let result = match found {
            Some(descriptors) => Ok(descriptors
                .iter()
                .map(|(uuid, handle)| Descriptor {
                    uuid: *uuid,
                    handle: *handle,
                    characteristic,
                })
                .collect()),
            None => Err(AttErrorCode::AttributeNotFound),
        };
        drop(gatt);
        self.push(SessionEvent::DescriptorsDiscovered {
            characteristic,
            result,
        });
        Ok(())
    }

    async fn read(&self, attribute: AttributeHandle) -> Result<()> {
        self.record(IssuedOp::Read(attribute));
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        let dispatched = inner.find_characteristic(attribute, |_, events, uuid| {
            events
                .send(ServiceEvent::Read {
                    peer: DeviceId::new(CENTRAL_PEER_ID),
                    characteristic: uuid,
                    offset: 0,
                    reply: reply_tx,
                })
                .is_ok()
        });
        match dispatched {
            Some(true) => {
                let inbox = self.inbox.clone();
                tokio::spawn(async move {
                    // The application may never answer; then neither does
                    // the mock, mirroring a peer waiting for its transport
                    // timeout.
                    if let Ok(result) = reply_rx.await {
                        let _ = inbox.send(SessionEvent::ValueChanged { attribute, result });
                    }
                });
            }
            Some(false) => {
                self.push(SessionEvent::ValueChanged {
                    attribute,
                    result: Err(AttErrorCode::UnlikelyError),
                });
            }
            None => {
                // Not a characteristic; descriptors auto-answer empty.
                self.push(SessionEvent::ValueChanged {
                    attribute,
                    result: Ok(Vec::new()),
                });
            }
        }
        Ok(())
    }

    async fn write(
        &self,
        attribute: AttributeHandle,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<()> {
        self.record(IssuedOp::Write(attribute, value.to_vec(), kind));
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        match kind {
            WriteKind::WithResponse => {
                let (reply_tx, reply_rx) = oneshot::channel();
                let dispatched = inner.find_characteristic(attribute, |_, events, uuid| {
                    events
                        .send(ServiceEvent::Write {
                            peer: DeviceId::new(CENTRAL_PEER_ID),
                            characteristic: uuid,
                            value: value.to_vec(),
                            reply: Some(reply_tx),
                        })
                        .is_ok()
                });
                match dispatched {
                    Some(true) => {
                        let inbox = self.inbox.clone();
                        tokio::spawn(async move {
                            if let Ok(result) = reply_rx.await {
                                let _ =
                                    inbox.send(SessionEvent::WriteCompleted { attribute, result });
                            }
                        });
                    }
                    _ => {
                        self.push(SessionEvent::WriteCompleted {
                            attribute,
                            result: Err(AttErrorCode::AttributeNotFound),
                        });
                    }
                }
            }
            WriteKind::WithoutResponse => {
                let _ = inner.find_characteristic(attribute, |_, events, uuid| {
                    let _ = events.send(ServiceEvent::Write {
                        peer: DeviceId::new(CENTRAL_PEER_ID),
                        characteristic: uuid,
                        value: value.to_vec(),
                        reply: None,
                    });
                });
            }
        }
        Ok(())
    }

    async fn set_notify(&self, attribute: AttributeHandle, enabled: bool) -> Result<()> {
        self.record(IssuedOp::SetNotify(attribute, enabled));
        if !self.loopback {
            return Ok(());
        }
        let inner = self.backend()?;
        let outcome = inner.find_characteristic(attribute, |characteristic, events, uuid| {
            if !characteristic.properties.can_subscribe() {
                return Err(AttErrorCode::RequestNotSupported);
            }
            characteristic.subscribed = enabled;
            let notice = if enabled {
                ServiceEvent::Subscribed {
                    peer: DeviceId::new(CENTRAL_PEER_ID),
                    characteristic: uuid,
                }
            } else {
                ServiceEvent::Unsubscribed {
                    peer: DeviceId::new(CENTRAL_PEER_ID),
                    characteristic: uuid,
                }
            };
            let _ = events.send(notice);
            Ok(())
        });
        let result = match outcome {
            Some(result) => result,
            None => Err(AttErrorCode::AttributeNotFound),
        };
        self.push(SessionEvent::NotifyConfigCompleted { attribute, result });
        Ok(())
    }

    async fn read_rssi(&self) -> Result<()> {
        self.record(IssuedOp::ReadRssi);
        if self.loopback {
            self.push(SessionEvent::RssiRead { result: Ok(-30) });
        }
        Ok(())
    }

    async fn request_connection_update(&self, _params: &ConnectionParams) -> Result<()> {
        self.record(IssuedOp::ConnectionUpdate);
        Ok(())
    }

    async fn set_preferred_phy(&self, phy: PreferredPhy) -> Result<()> {
        self.record(IssuedOp::PreferredPhy(phy));
        let inner = self.backend()?;
        if inner.phy_unsupported.load(Ordering::Acquire) {
            return Err(Error::NotSupported("PHY selection".to_string()));
        }
        Ok(())
    }

    async fn open_channel(&self, psm: u16) -> Result<ChannelId> {
        self.record(IssuedOp::OpenChannel(psm));
        if !self.loopback {
            let inner = self.backend()?;
            return Ok(inner.next_channel());
        }
        let inner = self.backend()?;
        let listener = inner
            .published
            .lock()
            .get(&psm)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no listener on PSM 0x{:04X}", psm)))?;
        let channel = inner.next_channel();
        inner.channel_routes.lock().insert(
            channel,
            ChannelRoute {
                psm,
                central_inbox: self.inbox.clone(),
            },
        );
        let _ = listener.send(ChannelEvent::Opened {
            channel,
            peer: DeviceId::new(CENTRAL_PEER_ID),
            psm,
        });
        Ok(channel)
    }

    async fn channel_send(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
        self.record(IssuedOp::ChannelSend(channel, data.to_vec()));
        let inner = self.backend()?;
        if inner.channel_backpressure.load(Ordering::Acquire) {
            return Err(Error::Backpressure);
        }
        if !self.loopback {
            return Ok(());
        }
        let routes = inner.channel_routes.lock();
        let route = routes
            .get(&channel)
            .ok_or_else(|| Error::ConnectionFailed("channel closed".to_string()))?;
        let listener = inner.published.lock().get(&route.psm).cloned();
        drop(routes);
        match listener {
            Some(tx) => {
                let _ = tx.send(ChannelEvent::Data {
                    channel,
                    data: data.to_vec(),
                });
                Ok(())
            }
            None => Err(Error::ConnectionFailed("channel closed".to_string())),
        }
    }

    async fn channel_close(&self, channel: ChannelId) -> Result<()> {
        self.record(IssuedOp::ChannelClose(channel));
        let inner = self.backend()?;
        close_route(&inner, channel);
        Ok(())
    }

    async fn disconnect(&self) {
        self.record(IssuedOp::Disconnect);
        if let Some(inner) = self.backend.upgrade() {
            inner.links.lock().remove(&self.device);
        }
        self.push(SessionEvent::Disconnected {
            reason: "link closed".to_string(),
        });
    }
}

/// Tear one loopback channel route down, notifying both ends.
fn close_route(inner: &MockInner, channel: ChannelId) {
    let route = inner.channel_routes.lock().remove(&channel);
    if let Some(route) = route {
        let _ = route
            .central_inbox
            .send(SessionEvent::ChannelClosed { channel });
        if let Some(listener) = inner.published.lock().get(&route.psm) {
            let _ = listener.send(ChannelEvent::Closed { channel });
        }
        trace!(channel = channel.raw(), "loopback channel closed");
    }
}

#[async_trait]
impl PeripheralBackend for MockBackend {
    fn adapter_state(&self) -> AdapterState {
        *self.inner.adapter.lock()
    }

    fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.adapter_subs.lock().push(tx);
        rx
    }

    async fn start_advertising(&self, data: &AdvertisementData) -> Result<()> {
        *self.inner.advertising.lock() = Some(data.clone());
        Ok(())
    }

    async fn update_advertising(&self, data: &AdvertisementData) -> Result<()> {
        let mut advertising = self.inner.advertising.lock();
        if advertising.is_none() {
            return Err(Error::InvalidState("not advertising".to_string()));
        }
        *advertising = Some(data.clone());
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        *self.inner.advertising.lock() = None;
        Ok(())
    }

    async fn add_service(
        &self,
        definition: &ServiceDefinition,
        events: mpsc::UnboundedSender<ServiceEvent>,
    ) -> Result<HashMap<BleUuid, AttributeHandle>> {
        let mut gatt = self.inner.gatt.lock();
        if gatt.contains_key(&definition.uuid) {
            return Err(Error::InvalidState(format!(
                "service {} already registered",
                definition.uuid
            )));
        }
        let mut characteristics = HashMap::new();
        let mut handles = HashMap::new();
        for characteristic in &definition.characteristics {
            let handle = self.inner.next_handle();
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|descriptor| (descriptor.uuid, self.inner.next_handle()))
                .collect();
            characteristics.insert(
                characteristic.uuid,
                MockCharacteristic {
                    handle,
                    properties: characteristic.properties,
                    subscribed: false,
                    descriptors,
                },
            );
            handles.insert(characteristic.uuid, handle);
        }
        gatt.insert(
            definition.uuid,
            MockService {
                service_handle: self.inner.next_handle(),
                primary: definition.primary,
                characteristics,
                events,
            },
        );
        Ok(handles)
    }

    async fn remove_service(&self, service: BleUuid) -> Result<()> {
        match self.inner.gatt.lock().remove(&service) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("service {} not registered", service))),
        }
    }

    async fn notify_value(
        &self,
        characteristic: AttributeHandle,
        value: &[u8],
        kind: NotifyKind,
    ) -> Result<()> {
        if self.inner.notify_queue_full.load(Ordering::Acquire) {
            return Err(Error::Backpressure);
        }
        let subscribed = self
            .inner
            .find_characteristic(characteristic, |entry, _, _| entry.subscribed)
            .ok_or_else(|| Error::NotFound("characteristic not registered".to_string()))?;
        if !subscribed {
            trace!(attribute = characteristic.raw(), ?kind, "no subscriber, value push dropped");
            return Ok(());
        }
        if let Some(link) = self.inner.links.lock().get(&Self::loopback_device()) {
            let _ = link.inbox.send(SessionEvent::ValueChanged {
                attribute: characteristic,
                result: Ok(value.to_vec()),
            });
        }
        Ok(())
    }

    async fn publish_channel(
        &self,
        psm: u16,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<()> {
        let mut published = self.inner.published.lock();
        if published.contains_key(&psm) {
            return Err(Error::InvalidState(format!(
                "PSM 0x{:04X} already published",
                psm
            )));
        }
        published.insert(psm, events);
        Ok(())
    }

    async fn unpublish_channel(&self, psm: u16) -> Result<()> {
        self.inner.published.lock().remove(&psm);
        let stale: Vec<ChannelId> = self
            .inner
            .channel_routes
            .lock()
            .iter()
            .filter(|(_, route)| route.psm == psm)
            .map(|(id, _)| *id)
            .collect();
        for channel in stale {
            close_route(&self.inner, channel);
        }
        Ok(())
    }

    async fn channel_send(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
        if self.inner.channel_backpressure.load(Ordering::Acquire) {
            return Err(Error::Backpressure);
        }
        let routes = self.inner.channel_routes.lock();
        let route = routes
            .get(&channel)
            .ok_or_else(|| Error::ConnectionFailed("channel closed".to_string()))?;
        let _ = route.central_inbox.send(SessionEvent::ChannelData {
            channel,
            data: data.to_vec(),
        });
        Ok(())
    }

    async fn channel_close(&self, channel: ChannelId) -> Result<()> {
        close_route(&self.inner, channel);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CentralBackend as _, ConnectionLink as _};

    #[tokio::test]
    async fn test_scan_delivers_known_peers_with_native_service_filter() {
        let backend = MockBackend::new();
        let heart_rate = BleUuid::uuid16(0x180D);
        let mut advertisement = AdvertisementData::with_local_name("HrmStrap");
        advertisement.service_uuids.push(heart_rate);
        backend.add_peer(DeviceId::new("peer-a"), advertisement, -40);
        backend.add_peer(
            DeviceId::new("peer-b"),
            AdvertisementData::with_local_name("Other"),
            -50,
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let filter = ScanFilter::new().with_service(heart_rate);
        let _handle = backend.start_scan(&filter, tx).await.unwrap();

        let result = rx.recv().await.unwrap();
        assert_eq!(result.device, DeviceId::new("peer-a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_to_unknown_peer_fails() {
        let backend = MockBackend::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = backend
            .connect(&DeviceId::new("ghost"), tx)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_manual_link_records_issue_order() {
        let backend = MockBackend::new();
        let device = DeviceId::new("peer-a");
        backend.add_peer(device.clone(), AdvertisementData::default(), -40);

        let (tx, _rx) = mpsc::unbounded_channel();
        let link = backend.connect(&device, tx).await.unwrap();
        link.read(AttributeHandle::new(7)).await.unwrap();
        link.write(AttributeHandle::new(7), b"x", WriteKind::WithResponse)
            .await
            .unwrap();

        assert_eq!(
            backend.issued_ops(&device),
            vec![
                IssuedOp::Read(AttributeHandle::new(7)),
                IssuedOp::Write(AttributeHandle::new(7), b"x".to_vec(), WriteKind::WithResponse),
            ]
        );
    }
}
