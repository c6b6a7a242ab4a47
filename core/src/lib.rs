//! BlueLink Core — cross-platform BLE session engine
//!
//! Exposes the central (client) and peripheral (server) BLE roles, GATT
//! operations and connection-oriented L2CAP channels over whatever native
//! stack the host platform provides. The core of the crate is the session
//! engine: it converts a platform's callback-driven, one-outstanding-request
//! native API into a uniform, cancellable, concurrently usable surface with
//! deterministic request/response correlation and clean teardown on
//! disconnect.
//!
//! Platform adapters implement the contracts in [`backend`] and feed native
//! events into engine-owned channels; everything above that seam is
//! backend-independent. The [`mock`] backend implements both contracts in
//! memory and is what the test suite runs against.

pub mod backend;
pub mod central;
pub mod l2cap;
pub mod mock;
pub mod peripheral;
pub mod types;

use thiserror::Error;

pub use central::{Central, Connection, NotificationStream, ScanStream};
pub use l2cap::L2capChannel;
pub use peripheral::{
    ChannelListener, ExecuteWriteRequest, Peripheral, QueuedWriteRequest, ReadRequest,
    RegisteredService, ServiceRequest, WriteRequest,
};
pub use types::{
    AdapterState, AdvertisementData, AttErrorCode, AttributeHandle, BleUuid, CentralConfig,
    ChannelId, Characteristic, CharacteristicDefinition, CharacteristicProperties,
    ConnectionParams, ConnectionState, Descriptor, DescriptorDefinition, DeviceId, NotifyKind,
    PreferredPhy, ScanFilter, ScanResult, Service, ServiceDefinition, WriteKind,
};

/// The closed error taxonomy observed by callers. Native failures are mapped
/// into these variants by platform adapters and the engine; raw platform
/// error values never cross the API boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The adapter is not powered on or the backend is not initialized.
    #[error("Adapter not ready")]
    NotReady,

    /// Operation invoked in a state that cannot serve it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The active backend does not implement this capability. Surfaced
    /// immediately, never retried.
    #[error("Not supported by this backend: {0}")]
    NotSupported(String),

    /// Unknown device, service, characteristic or descriptor.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connect failure or timeout; also the cascade reason applied to every
    /// operation pending on a session at the moment the link is lost.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A single request was rejected by the peer with a standardized ATT
    /// error code. The caller decides whether to retry.
    #[error("Protocol error: {0}")]
    Protocol(AttErrorCode),

    /// Transient transport backpressure (notify queue full, channel send
    /// buffer full). Retryable by the caller; never queued or retried by the
    /// engine.
    #[error("Transport backpressure")]
    Backpressure,

    /// The backend instance behind the facade is gone.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

impl From<AttErrorCode> for Error {
    fn from(code: AttErrorCode) -> Self {
        Error::Protocol(code)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
