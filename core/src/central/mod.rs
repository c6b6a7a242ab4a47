//! Central (client) role
//!
//! [`Central`] is the single entry point for the client role: it owns one
//! backend instance and exposes scanning, connecting and the adapter state
//! sequence. Concurrent calls through clones of one facade are safe; no
//! state exists outside the facade and its sessions.

pub mod connection;
pub(crate) mod correlation;
pub mod scan;

pub use connection::{Connection, NotificationStream};
pub use scan::ScanStream;

use crate::backend::CentralBackend;
use crate::types::{AdapterState, CentralConfig, DeviceId, ScanFilter};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct CentralInner {
    backend: Arc<dyn CentralBackend>,
    config: CentralConfig,
    scanning: Arc<AtomicBool>,
}

/// Central-role facade over one backend instance.
#[derive(Clone)]
pub struct Central {
    inner: Arc<CentralInner>,
}

impl Central {
    /// Wrap a backend instance. The `adapter` string in `config` is opaque:
    /// it is handed to the platform adapter unmodified at construction time
    /// and has no effect on engine behavior.
    pub fn new(backend: Arc<dyn CentralBackend>, config: CentralConfig) -> Result<Self> {
        config.validate()?;
        Ok(Central {
            inner: Arc::new(CentralInner {
                backend,
                config,
                scanning: Arc::new(AtomicBool::new(false)),
            }),
        })
    }

    pub fn config(&self) -> &CentralConfig {
        &self.inner.config
    }

    /// Current adapter state.
    pub fn adapter_state(&self) -> AdapterState {
        self.inner.backend.adapter_state()
    }

    /// Subscribe to adapter state changes.
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

    /// Start a device scan. At most one scan may be active per central
    /// instance; a second concurrent request fails with
    /// [`Error::InvalidState`].
    pub async fn scan(&self, filter: ScanFilter) -> Result<ScanStream> {
        self.ensure_ready()?;
        if self
            .inner
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::InvalidState("a scan is already active".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.backend.start_scan(&filter, tx).await {
            Ok(handle) => {
                info!(?filter, "scan started");
                Ok(ScanStream::new(
                    self.inner.scanning.clone(),
                    handle,
                    rx,
                    &filter,
                ))
            }
            Err(err) => {
                self.inner.scanning.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Connect to `device` and return the new session.
    ///
    /// The attempt races the configured timeout against the native success
    /// callback; exactly one of success, failure or timeout resolves the
    /// call, and the losing side is cancelled. A timeout converts to
    /// [`Error::ConnectionFailed`].
    pub async fn connect(&self, device: &DeviceId) -> Result<Connection> {
        self.ensure_ready()?;
        debug!(%device, "connecting");
        let (tx, rx) = mpsc::unbounded_channel();
        let attempt = self.inner.backend.connect(device, tx);
        match tokio::time::timeout(self.inner.config.connect_timeout, attempt).await {
            Ok(Ok(link)) => {
                info!(%device, "connected");
                Ok(Connection::new(device.clone(), link, rx))
            }
            Ok(Err(err)) => {
                warn!(%device, %err, "connect failed");
                Err(err)
            }
            Err(_) => {
                self.inner.backend.cancel_connect(device).await;
                warn!(%device, "connect timed out");
                Err(Error::ConnectionFailed(format!(
                    "connect to {} timed out",
                    device
                )))
            }
        }
    }
}
