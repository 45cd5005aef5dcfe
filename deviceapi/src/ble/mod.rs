//! Bluetooth Low Energy: the adapter facade, GATT object graph and the
//! boundary to the native Bluetooth SDK.

use std::fmt;
use std::sync::Weak;

use log::trace;

use crate::{Error, NativeHandle, RequestId};

pub mod adapter;
pub use adapter::{ConnectionChange, LowEnergyAdapter};

pub mod device;
pub use device::{AdvertiseData, AdvertiseState, LeDevice, ManufacturerData, ServiceData};

mod client;

mod attribute;

pub mod service;
pub use service::GattService;

pub mod characteristic;
pub use characteristic::{CharacteristicProperties, GattCharacteristic};

pub mod descriptor;
pub use descriptor::GattDescriptor;

/// Error codes reported by the native Bluetooth SDK
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BtError {
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Bluetooth device is busy")]
    ResourceBusy,
    #[error("Timeout error")]
    TimedOut,
    #[error("Operation now in progress")]
    NowInProgress,
    #[error("Not Supported")]
    NotSupported,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Quota exceeded")]
    QuotaExceeded,
    #[error("No data available")]
    NoData,
    #[error("Local adapter not initialized")]
    NotInitialized,
    #[error("Local adapter not enabled")]
    NotEnabled,
    #[error("Operation already done")]
    AlreadyDone,
    #[error("Operation failed")]
    OperationFailed,
    #[error("Operation not in progress")]
    NotInProgress,
    #[error("Remote device not bonded")]
    RemoteDeviceNotBonded,
    #[error("Authentication rejected")]
    AuthRejected,
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Remote device not found")]
    RemoteDeviceNotFound,
    #[error("Service search failed")]
    ServiceSearchFailed,
    #[error("Remote device is not connected")]
    RemoteDeviceNotConnected,
    #[error("Resource temporarily unavailable")]
    Again,
    #[error("Service Not Found")]
    ServiceNotFound,
    #[error("Unknown Error")]
    Other(i32),
}

pub type NativeResult<T> = std::result::Result<T, BtError>;

impl BtError {
    /// Translates a native failure into the error kind scripts see, with a
    /// `"<hint> : <native message>"` message
    pub fn into_error(self, hint: &str) -> Error {
        let message = format!("{} : {}", hint, self);
        match self {
            BtError::ResourceBusy | BtError::NowInProgress | BtError::NotEnabled => {
                Error::ServiceNotAvailable(message)
            }
            BtError::RemoteDeviceNotFound => Error::NotFound(message),
            BtError::InvalidParameter => Error::InvalidValues(message),
            BtError::QuotaExceeded => Error::QuotaExceeded(message),
            _ => Error::Unknown(message),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Advertising,
    ScanResponse,
}

impl PacketType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ADVERTISE" => Some(PacketType::Advertising),
            "SCAN_RESPONSE" => Some(PacketType::ScanResponse),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AdvertisingMode {
    Balanced,
    LowLatency,
    LowEnergy,
}

impl AdvertisingMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BALANCED" => Some(AdvertisingMode::Balanced),
            "LOW_LATENCY" => Some(AdvertisingMode::LowLatency),
            "LOW_ENERGY" => Some(AdvertisingMode::LowEnergy),
            _ => None,
        }
    }
}

/// The contents of one advertising or scan response packet as reported by
/// the native scanner
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PacketData {
    pub device_name: Option<String>,
    pub tx_power_level: Option<i32>,
    pub appearance: Option<u32>,
    pub service_uuids: Vec<String>,
    pub solicitation_uuids: Vec<String>,
    pub service_data: Vec<(String, Vec<u8>)>,
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResultInfo {
    pub remote_address: String,
    pub rssi: i32,
    pub advertising: PacketData,
    pub scan_response: PacketData,
}

/// Callbacks that the native Bluetooth SDK delivers, typically from one of
/// its own threads.
#[derive(Clone, Debug)]
pub enum BleEvent {
    StateChanged {
        enabled: bool,
    },
    ScanResult {
        result: NativeResult<()>,
        info: ScanResultInfo,
    },
    AdvertisingStateChanged {
        result: NativeResult<()>,
        advertiser: NativeHandle,
        started: bool,
    },
    ConnectionStateChanged {
        result: NativeResult<()>,
        connected: bool,
        remote_address: String,
    },
    ValueChanged {
        characteristic: NativeHandle,
        value: Vec<u8>,
    },
    ReadCompleted {
        request: RequestId,
        result: NativeResult<Vec<u8>>,
    },
    WriteCompleted {
        request: RequestId,
        result: NativeResult<()>,
    },
}

/// The single trampoline through which a backend delivers native callbacks
/// to the adapter.
///
/// It only holds a weak reference so a backend keeping its sink around
/// doesn't keep the adapter alive.
#[derive(Clone)]
pub struct BleEventSink {
    pub(crate) adapter: Weak<adapter::LeAdapterInner>,
}

impl fmt::Debug for BleEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleEventSink").finish()
    }
}

impl BleEventSink {
    pub fn emit(&self, event: BleEvent) {
        match self.adapter.upgrade() {
            Some(inner) => LowEnergyAdapter::wrap(inner).on_native_event(event),
            None => trace!("Dropping {:?}: adapter is gone", event),
        }
    }
}

/// The native Bluetooth LE SDK as seen by the adapter.
///
/// Calls return immediately. Anything asynchronous completes later through
/// the [`BleEventSink`] registered with `set_event_sink`, which may be
/// invoked from any thread and even before the initiating call returns.
pub trait BleBackend: Send + Sync {
    fn set_event_sink(&self, sink: Option<BleEventSink>);

    fn is_le_enabled(&self) -> NativeResult<bool>;

    fn start_scan(&self) -> NativeResult<()>;
    fn stop_scan(&self) -> NativeResult<()>;

    fn gatt_connect(&self, address: &str, auto_connect: bool) -> NativeResult<()>;
    fn gatt_disconnect(&self, address: &str) -> NativeResult<()>;

    fn client_create(&self, address: &str) -> NativeResult<NativeHandle>;
    fn client_destroy(&self, client: NativeHandle) -> NativeResult<()>;
    fn client_remote_address(&self, client: NativeHandle) -> NativeResult<String>;
    fn client_get_service(&self, client: NativeHandle, uuid: &str) -> NativeResult<NativeHandle>;

    /// Works for services, characteristics and descriptors alike
    fn gatt_uuid(&self, attribute: NativeHandle) -> NativeResult<String>;

    // Enumerations stop early when the visitor returns false
    fn foreach_included_services(
        &self, service: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()>;
    fn foreach_characteristics(
        &self, service: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()>;
    fn foreach_descriptors(
        &self, characteristic: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()>;

    fn characteristic_properties(&self, characteristic: NativeHandle) -> NativeResult<u32>;
    fn set_value_changed_cb(&self, characteristic: NativeHandle) -> NativeResult<()>;
    fn unset_value_changed_cb(&self, characteristic: NativeHandle) -> NativeResult<()>;

    fn read_value(&self, attribute: NativeHandle, request: RequestId) -> NativeResult<()>;
    fn set_value(&self, attribute: NativeHandle, value: &[u8]) -> NativeResult<()>;
    fn write_value(&self, attribute: NativeHandle, request: RequestId) -> NativeResult<()>;

    fn advertiser_create(&self) -> NativeResult<NativeHandle>;
    fn advertiser_destroy(&self, advertiser: NativeHandle) -> NativeResult<()>;
    fn advertiser_set_device_name(
        &self, advertiser: NativeHandle, packet: PacketType, include: bool,
    ) -> NativeResult<()>;
    fn advertiser_add_service_uuid(
        &self, advertiser: NativeHandle, packet: PacketType, uuid: &str,
    ) -> NativeResult<()>;
    fn advertiser_add_solicitation_uuid(
        &self, advertiser: NativeHandle, packet: PacketType, uuid: &str,
    ) -> NativeResult<()>;
    fn advertiser_set_appearance(
        &self, advertiser: NativeHandle, packet: PacketType, appearance: u32,
    ) -> NativeResult<()>;
    fn advertiser_set_tx_power_level(
        &self, advertiser: NativeHandle, packet: PacketType, include: bool,
    ) -> NativeResult<()>;
    fn advertiser_add_service_data(
        &self, advertiser: NativeHandle, packet: PacketType, uuid: &str, data: &[u8],
    ) -> NativeResult<()>;
    fn advertiser_add_manufacturer_data(
        &self, advertiser: NativeHandle, packet: PacketType, id: u16, data: &[u8],
    ) -> NativeResult<()>;
    fn advertiser_set_mode(&self, advertiser: NativeHandle, mode: AdvertisingMode) -> NativeResult<()>;
    fn advertiser_set_connectable(&self, advertiser: NativeHandle, connectable: bool) -> NativeResult<()>;
    fn advertiser_start(&self, advertiser: NativeHandle) -> NativeResult<()>;
    fn advertiser_stop(&self, advertiser: NativeHandle) -> NativeResult<()>;
}
