//! Identifier and value model
//!
//! Opaque platform-derived identifiers, the GATT attribute hierarchy,
//! advertisement payloads and the configuration types shared by both roles.
//! Identifiers are created by platform adapters and treated as opaque by the
//! engine; they are stable for the lifetime of the process.

pub mod uuid;

pub use self::uuid::{BleUuid, BLUETOOTH_BASE_UUID};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Opaque device identifier assigned by the platform backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque per-connection attribute identifier assigned by the backend.
///
/// Used as correlation-key material; two handles on the same connection are
/// equal exactly when they refer to the same attribute instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributeHandle(u64);

impl AttributeHandle {
    pub const fn new(raw: u64) -> Self {
        AttributeHandle(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Opaque identifier for an open L2CAP channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u64);

impl ChannelId {
    pub const fn new(raw: u64) -> Self {
        ChannelId(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

/// Standardized ATT protocol error codes (Core Specification Vol 3, Part F).
///
/// Native error values are mapped onto this enum by platform adapters;
/// applications never observe raw platform codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttErrorCode {
    InvalidHandle,
    ReadNotPermitted,
    WriteNotPermitted,
    InvalidPdu,
    InsufficientAuthentication,
    RequestNotSupported,
    InvalidOffset,
    InsufficientAuthorization,
    PrepareQueueFull,
    AttributeNotFound,
    AttributeNotLong,
    InsufficientKeySize,
    InvalidAttributeValueLength,
    UnlikelyError,
    InsufficientEncryption,
    UnsupportedGroupType,
    InsufficientResources,
    /// Application or vendor defined error octet.
    Unknown(u8),
}

impl AttErrorCode {
    /// The on-air error octet.
    pub fn code(&self) -> u8 {
        match self {
            AttErrorCode::InvalidHandle => 0x01,
            AttErrorCode::ReadNotPermitted => 0x02,
            AttErrorCode::WriteNotPermitted => 0x03,
            AttErrorCode::InvalidPdu => 0x04,
            AttErrorCode::InsufficientAuthentication => 0x05,
            AttErrorCode::RequestNotSupported => 0x06,
            AttErrorCode::InvalidOffset => 0x07,
            AttErrorCode::InsufficientAuthorization => 0x08,
            AttErrorCode::PrepareQueueFull => 0x09,
            AttErrorCode::AttributeNotFound => 0x0A,
            AttErrorCode::AttributeNotLong => 0x0B,
            AttErrorCode::InsufficientKeySize => 0x0C,
            AttErrorCode::InvalidAttributeValueLength => 0x0D,
            AttErrorCode::UnlikelyError => 0x0E,
            AttErrorCode::InsufficientEncryption => 0x0F,
            AttErrorCode::UnsupportedGroupType => 0x10,
            AttErrorCode::InsufficientResources => 0x11,
            AttErrorCode::Unknown(code) => *code,
        }
    }

    /// Map an error octet back to its code.
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => AttErrorCode::InvalidHandle,
            0x02 => AttErrorCode::ReadNotPermitted,
            0x03 => AttErrorCode::WriteNotPermitted,
            0x04 => AttErrorCode::InvalidPdu,
            0x05 => AttErrorCode::InsufficientAuthentication,
            0x06 => AttErrorCode::RequestNotSupported,
            0x07 => AttErrorCode::InvalidOffset,
            0x08 => AttErrorCode::InsufficientAuthorization,
            0x09 => AttErrorCode::PrepareQueueFull,
            0x0A => AttErrorCode::AttributeNotFound,
            0x0B => AttErrorCode::AttributeNotLong,
            0x0C => AttErrorCode::InsufficientKeySize,
            0x0D => AttErrorCode::InvalidAttributeValueLength,
            0x0E => AttErrorCode::UnlikelyError,
            0x0F => AttErrorCode::InsufficientEncryption,
            0x10 => AttErrorCode::UnsupportedGroupType,
            0x11 => AttErrorCode::InsufficientResources,
            other => AttErrorCode::Unknown(other),
        }
    }
}

impl fmt::Display for AttErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttErrorCode::InvalidHandle => write!(f, "invalid handle"),
            AttErrorCode::ReadNotPermitted => write!(f, "read not permitted"),
            AttErrorCode::WriteNotPermitted => write!(f, "write not permitted"),
            AttErrorCode::InvalidPdu => write!(f, "invalid PDU"),
            AttErrorCode::InsufficientAuthentication => write!(f, "insufficient authentication"),
            AttErrorCode::RequestNotSupported => write!(f, "request not supported"),
            AttErrorCode::InvalidOffset => write!(f, "invalid offset"),
            AttErrorCode::InsufficientAuthorization => write!(f, "insufficient authorization"),
            AttErrorCode::PrepareQueueFull => write!(f, "prepare queue full"),
            AttErrorCode::AttributeNotFound => write!(f, "attribute not found"),
            AttErrorCode::AttributeNotLong => write!(f, "attribute not long"),
            AttErrorCode::InsufficientKeySize => write!(f, "insufficient key size"),
            AttErrorCode::InvalidAttributeValueLength => write!(f, "invalid attribute value length"),
            AttErrorCode::UnlikelyError => write!(f, "unlikely error"),
            AttErrorCode::InsufficientEncryption => write!(f, "insufficient encryption"),
            AttErrorCode::UnsupportedGroupType => write!(f, "unsupported group type"),
            AttErrorCode::InsufficientResources => write!(f, "insufficient resources"),
            AttErrorCode::Unknown(code) => write!(f, "error 0x{:02X}", code),
        }
    }
}

/// Power/availability state of the adapter behind a facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterState::Unknown => write!(f, "Unknown"),
            AdapterState::Unsupported => write!(f, "Unsupported"),
            AdapterState::Unauthorized => write!(f, "Unauthorized"),
            AdapterState::PoweredOff => write!(f, "PoweredOff"),
            AdapterState::PoweredOn => write!(f, "PoweredOn"),
        }
    }
}

/// Lifecycle of one connection session. `Disconnected` is terminal; a new
/// session is required to reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected(String),
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Disconnected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
            ConnectionState::Disconnected(reason) => write!(f, "Disconnected ({})", reason),
        }
    }
}

/// Write acknowledgment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteKind {
    /// ATT Write Request: completion is acknowledged by the peer.
    WithResponse,
    /// ATT Write Command: no acknowledgment, no delivery guarantee.
    WithoutResponse,
}

/// Server-initiated value push mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    /// Unacknowledged push.
    Notification,
    /// Acknowledged push.
    Indication,
}

/// Physical layer preference for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PreferredPhy {
    Le1M,
    Le2M,
    LeCoded,
}

/// Requested connection parameters. The link layer is free to negotiate
/// values inside the requested window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub latency: u16,
    pub supervision_timeout: Duration,
}

/// Capability flags of a characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicProperties {
    pub broadcast: bool,
    pub read: bool,
    pub write_without_response: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicProperties {
    /// True when the characteristic supports any server-initiated push.
    pub fn can_subscribe(&self) -> bool {
        self.notify || self.indicate
    }
}

/// Advertisement payload as reported by the platform. Byte-level encoding is
/// a platform-adapter concern.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementData {
    pub local_name: Option<String>,
    pub service_uuids: Vec<BleUuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<BleUuid, Vec<u8>>,
    pub tx_power: Option<i8>,
    pub is_connectable: bool,
}

impl AdvertisementData {
    pub fn with_local_name(name: impl Into<String>) -> Self {
        AdvertisementData {
            local_name: Some(name.into()),
            is_connectable: true,
            ..Default::default()
        }
    }
}

/// A single discovery event from an active scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanResult {
    pub device: DeviceId,
    pub advertisement: AdvertisementData,
    /// Received signal strength in dBm.
    pub rssi: i16,
}

/// Scan filter. Service UUID filtering is delegated to the native layer;
/// name-prefix filtering is applied by the scan session via exact prefix
/// match when the platform has no native equivalent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanFilter {
    pub services: Vec<BleUuid>,
    pub name_prefix: Option<String>,
}

impl ScanFilter {
    pub fn new() -> Self {
        ScanFilter::default()
    }

    pub fn with_service(mut self, uuid: BleUuid) -> Self {
        self.services.push(uuid);
        self
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }
}

/// Configuration for a central facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CentralConfig {
    /// Opaque platform-specific adapter selector, passed through to the
    /// backend unmodified. `None` selects the platform default.
    pub adapter: Option<String>,
    /// Upper bound on a connect attempt; elapsing converts the attempt into
    /// a connection failure.
    pub connect_timeout: Duration,
}

impl Default for CentralConfig {
    fn default() -> Self {
        CentralConfig {
            adapter: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl CentralConfig {
    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.connect_timeout.is_zero() {
            return Err(crate::Error::InvalidState(
                "connect_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: BleUuid,
    pub handle: AttributeHandle,
    pub primary: bool,
}

/// A discovered characteristic. Belongs to exactly one service instance,
/// recorded in `service`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: BleUuid,
    pub handle: AttributeHandle,
    pub service: BleUuid,
    pub properties: CharacteristicProperties,
}

/// A discovered descriptor. Belongs to exactly one characteristic instance,
/// recorded in `characteristic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: BleUuid,
    pub handle: AttributeHandle,
    pub characteristic: BleUuid,
}

/// Descriptor template for service registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescriptorDefinition {
    pub uuid: BleUuid,
}

/// Characteristic template for service registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacteristicDefinition {
    pub uuid: BleUuid,
    pub properties: CharacteristicProperties,
    pub descriptors: Vec<DescriptorDefinition>,
}

impl CharacteristicDefinition {
    pub fn new(uuid: BleUuid, properties: CharacteristicProperties) -> Self {
        CharacteristicDefinition {
            uuid,
            properties,
            descriptors: Vec::new(),
        }
    }

    pub fn with_descriptor(mut self, uuid: BleUuid) -> Self {
        self.descriptors.push(DescriptorDefinition { uuid });
        self
    }
}

/// Service template for registration with the server engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub uuid: BleUuid,
    pub primary: bool,
    pub characteristics: Vec<CharacteristicDefinition>,
}

impl ServiceDefinition {
    pub fn new(uuid: BleUuid) -> Self {
        ServiceDefinition {
            uuid,
            primary: true,
            characteristics: Vec::new(),
        }
    }

    pub fn with_characteristic(mut self, characteristic: CharacteristicDefinition) -> Self {
        self.characteristics.push(characteristic);
        self
    }

    /// Reject duplicate characteristic UUIDs inside one service; the
    /// registration handle map is keyed by UUID.
    pub fn validate(&self) -> Result<(), crate::Error> {
        let mut seen = std::collections::HashSet::new();
        for characteristic in &self.characteristics {
            if !seen.insert(characteristic.uuid) {
                return Err(crate::Error::InvalidState(format!(
                    "duplicate characteristic {} in service {}",
                    characteristic.uuid, self.uuid
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_att_error_code_roundtrip() {
        for code in 0x01..=0x11u8 {
            assert_eq!(AttErrorCode::from_code(code).code(), code);
        }
        assert_eq!(AttErrorCode::from_code(0x80), AttErrorCode::Unknown(0x80));
        assert_eq!(AttErrorCode::Unknown(0x80).code(), 0x80);
    }

    #[test]
    fn test_att_error_code_display() {
        assert_eq!(AttErrorCode::ReadNotPermitted.to_string(), "read not permitted");
        assert_eq!(AttErrorCode::InvalidOffset.to_string(), "invalid offset");
        assert_eq!(AttErrorCode::Unknown(0x91).to_string(), "error 0x91");
    }

    #[test]
    fn test_connection_state_terminal() {
        assert!(!ConnectionState::Connecting.is_terminal());
        assert!(!ConnectionState::Connected.is_terminal());
        assert!(ConnectionState::Disconnected("link lost".to_string()).is_terminal());
    }

    #[test]
    fn test_central_config_default() {
        let config = CentralConfig::default();
        assert!(config.adapter.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_central_config_rejects_zero_timeout() {
        let config = CentralConfig::default().with_connect_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_scan_filter_builder() {
        let filter = ScanFilter::new()
            .with_service(BleUuid::uuid16(0x180D))
            .with_name_prefix("Demo");
        assert_eq!(filter.services, vec![BleUuid::uuid16(0x180D)]);
        assert_eq!(filter.name_prefix.as_deref(), Some("Demo"));
    }

    #[test]
    fn test_characteristic_properties_subscribe() {
        let mut props = CharacteristicProperties::default();
        assert!(!props.can_subscribe());
        props.notify = true;
        assert!(props.can_subscribe());
        props.notify = false;
        props.indicate = true;
        assert!(props.can_subscribe());
    }

    #[test]
    fn test_service_definition_rejects_duplicate_characteristics() {
        let uuid = BleUuid::uuid16(0x2A37);
        let def = ServiceDefinition::new(BleUuid::uuid16(0x180D))
            .with_characteristic(CharacteristicDefinition::new(
                uuid,
                CharacteristicProperties::default(),
            ))
            .with_characteristic(CharacteristicDefinition::new(
                uuid,
                CharacteristicProperties::default(),
            ));
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::new("hci0/AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "hci0/AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "hci0/AA:BB:CC:DD:EE:FF");
    }
}
