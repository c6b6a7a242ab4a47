//! Scan session
//!
//! At most one scan is active per central instance. Each native discovery
//! event maps to a [`ScanResult`]; deduplication of repeated advertisements
//! is delegated to the native layer when it offers one and not synthesized
//! here (platform-dependent). Name-prefix filters the platform cannot apply
//! natively are applied in this module via exact prefix match against the
//! advertised or the already-known name.

use crate::backend::ScanHandle;
use crate::types::{DeviceId, ScanFilter, ScanResult};
use futures::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// The result sequence of one active scan.
///
/// The native scan handle is closed exactly once, whether through an
/// explicit [`stop`](ScanStream::stop) or by dropping the stream; either
/// also frees the central's single-scan slot.
pub struct ScanStream {
    scanning: Arc<AtomicBool>,
    handle: Option<Box<dyn ScanHandle>>,
    rx: mpsc::UnboundedReceiver<ScanResult>,
    name_prefix: Option<String>,
    known_names: HashMap<DeviceId, String>,
}

impl std::fmt::Debug for ScanStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanStream")
            .field("scanning", &self.scanning.load(Ordering::Relaxed))
            .field("name_prefix", &self.name_prefix)
            .finish()
    }
}

impl ScanStream {
    pub(crate) fn new(
        scanning: Arc<AtomicBool>,
        handle: Box<dyn ScanHandle>,
        rx: mpsc::UnboundedReceiver<ScanResult>,
        filter: &ScanFilter,
    ) -> Self {
        ScanStream {
            scanning,
            handle: Some(handle),
            rx,
            name_prefix: filter.name_prefix.clone(),
            known_names: HashMap::new(),
        }
    }

    /// Stop the scan. Idempotent; further results are discarded.
    pub fn stop(&mut self) {
        self.close_native();
        self.rx.close();
    }

    fn close_native(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            debug!("stopping scan");
            handle.stop();
            self.scanning.store(false, Ordering::Release);
        }
    }

    /// Receive the next (filtered) scan result; `None` once stopped.
    pub async fn recv(&mut self) -> Option<ScanResult> {
        loop {
            let result = self.rx.recv().await?;
            if self.admit(&result) {
                return Some(result);
            }
        }
    }

    /// Apply the engine-side name-prefix filter. Names learned from earlier
    /// advertisements count, so a nameless advertisement from a device whose
    /// name is already known still matches.
    fn admit(&mut self, result: &ScanResult) -> bool {
        if let Some(name) = &result.advertisement.local_name {
            self.known_names.insert(result.device.clone(), name.clone());
        }
        let Some(prefix) = &self.name_prefix else {
            return true;
        };
        let name = result
            .advertisement
            .local_name
            .as_deref()
            .or_else(|| self.known_names.get(&result.device).map(String::as_str));
        match name {
            Some(name) if name.starts_with(prefix.as_str()) => true,
            _ => {
                trace!(device = %result.device, "scan result filtered by name prefix");
                false
            }
        }
    }
}

impl Stream for ScanStream {
    type Item = ScanResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(result)) => {
                    if self.admit(&result) {
                        return Poll::Ready(Some(result));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for ScanStream {
    fn drop(&mut self) {
        self.close_native();
    }
}
