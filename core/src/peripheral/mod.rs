//! Peripheral (server) role
//!
//! [`Peripheral`] owns one backend instance and exposes advertising, service
//! registration, server-initiated value pushes and L2CAP PSM publishing.
//! Each registration owns its characteristic handle map and a stream of
//! wrapped remote requests; registrations die with service removal or
//! backend teardown.

pub mod request;

pub use request::{
    ExecuteWriteRequest, QueuedWriteRequest, ReadRequest, ServiceRequest, WriteRequest,
};

use crate::backend::{ChannelEvent, PeripheralBackend, ServiceEvent};
use crate::l2cap::{ChannelIo, L2capChannel};
use crate::types::{
    AdapterState, AdvertisementData, AttributeHandle, BleUuid, ChannelId, NotifyKind,
    ServiceDefinition,
};
use crate::{Error, Result};
use futures::Stream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct ServiceEntry {
    handles: HashMap<BleUuid, AttributeHandle>,
}

struct PeripheralInner {
    backend: Arc<dyn PeripheralBackend>,
    services: Mutex<HashMap<BleUuid, ServiceEntry>>,
    advertising: AtomicBool,
}

/// Peripheral-role facade over one backend instance.
#[derive(Clone)]
pub struct Peripheral {
    inner: Arc<PeripheralInner>,
}

impl Peripheral {
    pub fn new(backend: Arc<dyn PeripheralBackend>) -> Self {
        Peripheral {
            inner: Arc::new(PeripheralInner {
                backend,
                services: Mutex::new(HashMap::new()),
                advertising: AtomicBool::new(false),
            }),
        }
    }

    pub fn adapter_state(&self) -> AdapterState {
        self.inner.backend.adapter_state()
    }

    pub fn adapter_events(&self) -> mpsc::UnboundedReceiver<AdapterState> {
        self.inner.backend.adapter_events()
    }

    fn ensure_ready(&self) -> Result<()> {
        let state = self.adapter_state();
        if state != AdapterState::PoweredOn {
            warn!(%state, "operation refused, adapter not ready");
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// Begin advertising. Fails with [`Error::InvalidState`] while an
    /// advertisement is already active; use
    /// [`update_advertising`](Peripheral::update_advertising) to change a
    /// live payload.
    pub async fn start_advertising(&self, data: &AdvertisementData) -> Result<()> {
        self.ensure_ready()?;
        if self
            .inner
            .advertising
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState("advertising already active".to_string()));
        }
        match self.inner.backend.start_advertising(data).await {
            Ok(()) => {
                info!(name = ?data.local_name, "advertising started");
                Ok(())
            }
            Err(err) => {
                self.inner.advertising.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Replace the payload of the active advertisement.
    pub async fn update_advertising(&self, data: &AdvertisementData) -> Result<()> {
        if !self.inner.advertising.load(Ordering::Acquire) {
            return Err(Error::InvalidState("not advertising".to_string()));
        }
        self.inner.backend.update_advertising(data).await
    }

    /// Stop advertising. Idempotent.
    pub async fn stop_advertising(&self) -> Result<()> {
        if !self.inner.advertising.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("advertising stopped");
        self.inner.backend.stop_advertising().await
    }

    /// Register a service and return its registration: the characteristic
    /// handle map plus the stream of wrapped remote requests.
    pub async fn add_service(&self, definition: ServiceDefinition) -> Result<RegisteredService> {
        self.ensure_ready()?;
        definition.validate()?;
        {
            // Reserve the slot first so a concurrent registration of the
            // same UUID fails instead of racing.
            let mut services = self.inner.services.lock();
            if services.contains_key(&definition.uuid) {
                return Err(Error::InvalidState(format!(
                    "service {} already registered",
                    definition.uuid
                )));
            }
            services.insert(definition.uuid, ServiceEntry::default());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.backend.add_service(&definition, tx).await {
            Ok(handles) => {
                {
                    let mut services = self.inner.services.lock();
                    if let Some(entry) = services.get_mut(&definition.uuid) {
                        entry.handles = handles.clone();
                    }
                }
                info!(service = %definition.uuid, characteristics = definition.characteristics.len(), "service registered");
                Ok(RegisteredService {
                    uuid: definition.uuid,
                    handles,
                    events: rx,
                })
            }
            Err(err) => {
                self.inner.services.lock().remove(&definition.uuid);
                Err(err)
            }
        }
    }

    /// Unregister a service. Its request stream ends once the backend drops
    /// the registration.
    pub async fn remove_service(&self, service: BleUuid) -> Result<()> {
        if self.inner.services.lock().remove(&service).is_none() {
            return Err(Error::NotFound(format!("service {} not registered", service)));
        }
        debug!(%service, "service removed");
        self.inner.backend.remove_service(service).await
    }

    /// Push a server-initiated notification or indication for a registered
    /// characteristic. If the native outbound queue is full this fails with
    /// [`Error::Backpressure`]; the engine never queues or retries on the
    /// caller's behalf.
    pub async fn update_value(
        &self,
        characteristic: BleUuid,
        value: &[u8],
        kind: NotifyKind,
    ) -> Result<()> {
        let handle = {
            let services = self.inner.services.lock();
            services
                .values()
                .find_map(|entry| entry.handles.get(&characteristic).copied())
                .ok_or_else(|| {
                    Error::NotFound(format!("characteristic {} not registered", characteristic))
                })?
        };
        self.inner.backend.notify_value(handle, value, kind).await
    }

    /// Publish an L2CAP PSM and return the accept stream for incoming
    /// channels. [`ChannelListener::close`] unpublishes deterministically.
    pub async fn publish_channel(&self, psm: u16) -> Result<ChannelListener> {
        self.ensure_ready()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.inner.backend.publish_channel(psm, events_tx).await?;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        spawn_channel_router(self.inner.backend.clone(), psm, events_rx, accept_tx);
        info!(psm, "channel published");
        Ok(ChannelListener {
            inner: self.inner.clone(),
            psm,
            accept_rx,
        })
    }
}

/// One registered service: its handle map and remote request stream. The
/// stream ends when the service is removed or the backend is torn down.
pub struct RegisteredService {
    uuid: BleUuid,
    handles: HashMap<BleUuid, AttributeHandle>,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
}

impl std::fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredService")
            .field("uuid", &self.uuid)
            .field("handles", &self.handles)
            .finish()
    }
}

impl RegisteredService {
    pub fn uuid(&self) -> BleUuid {
        self.uuid
    }

    /// Backend handle for a characteristic of this service.
    pub fn characteristic_handle(&self, characteristic: &BleUuid) -> Option<AttributeHandle> {
        self.handles.get(characteristic).copied()
    }

    /// Receive the next remote request; `None` once the registration is
    /// gone.
    pub async fn next_request(&mut self) -> Option<ServiceRequest> {
        self.events.recv().await.map(ServiceRequest::from_event)
    }
}

impl Stream for RegisteredService {
    type Item = ServiceRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events
            .poll_recv(cx)
            .map(|event| event.map(ServiceRequest::from_event))
    }
}

struct RouterChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    closed: Arc<AtomicBool>,
}

/// Routes raw channel events for one published PSM: new channels to the
/// accept stream, data and closes to the right open channel.
fn spawn_channel_router(
    backend: Arc<dyn PeripheralBackend>,
    psm: u16,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
    accept_tx: mpsc::UnboundedSender<L2capChannel>,
) {
    tokio::spawn(async move {
        let mut channels: HashMap<ChannelId, RouterChannel> = HashMap::new();
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Opened { channel, peer, psm } => {
                    debug!(channel = channel.raw(), %peer, psm, "incoming channel");
                    let (tx, rx) = mpsc::unbounded_channel();
                    let closed = Arc::new(AtomicBool::new(false));
                    channels.insert(
                        channel,
                        RouterChannel {
                            tx,
                            closed: closed.clone(),
                        },
                    );
                    let accepted = L2capChannel::new(
                        psm,
                        channel,
                        ChannelIo::Peripheral(backend.clone()),
                        rx,
                        closed,
                    );
                    if accept_tx.send(accepted).is_err() {
                        // Listener gone; the channel object just created is
                        // dropped and the peer sees the close at link level.
                        channels.remove(&channel);
                    }
                }
                ChannelEvent::Data { channel, data } => {
                    if let Some(entry) = channels.get(&channel) {
                        let _ = entry.tx.send(data);
                    } else {
                        trace!(channel = channel.raw(), "data for unknown channel discarded");
                    }
                }
                ChannelEvent::Closed { channel } => {
                    if let Some(entry) = channels.remove(&channel) {
                        entry.closed.store(true, Ordering::Release);
                    }
                }
            }
        }
        // Unpublished or backend gone: finish every open channel.
        for (_, entry) in channels.drain() {
            entry.closed.store(true, Ordering::Release);
        }
        trace!(psm, "channel router finished");
    });
}

/// Accept stream for one published PSM.
pub struct ChannelListener {
    inner: Arc<PeripheralInner>,
    psm: u16,
    accept_rx: mpsc::UnboundedReceiver<L2capChannel>,
}

impl ChannelListener {
    pub fn psm(&self) -> u16 {
        self.psm
    }

    /// Wait for the next incoming channel; `None` once the PSM is
    /// unpublished or the backend is gone.
    pub async fn accept(&mut self) -> Option<L2capChannel> {
        self.accept_rx.recv().await
    }

    /// Unpublish the PSM. Open channels are finished by the router once the
    /// backend drops the event stream.
    pub async fn close(mut self) -> Result<()> {
        self.accept_rx.close();
        self.inner.backend.unpublish_channel(self.psm).await
    }
}

impl Stream for ChannelListener {
    type Item = L2capChannel;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.accept_rx.poll_recv(cx)
    }
}
