use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use function_name::named;
use log::{debug, trace, warn};

use crate::ble::attribute::GattRequest;
use crate::ble::characteristic::CharacteristicInner;
use crate::ble::device::{AdvertiseData, AdvertiseState, LeDevice};
use crate::ble::service::GattService;
use crate::ble::{AdvertisingMode, BleBackend, BleEvent, BleEventSink, BtError, NativeResult, PacketType, ScanResultInfo};
use crate::callback::{Listener, Reply};
use crate::context::{ContextId, ContextObserver, ScriptContext};
use crate::dispatch::Dispatcher;
use crate::handle::HandleWrapper;
use crate::pending::PendingOperationTable;
use crate::privilege::{self, PrivilegeGate};
use crate::registry::CallbackRegistry;
use crate::uuid::normalize_bluetooth_uuid;
use crate::{Address, Error, ListenerId, NativeHandle, RequestId, Result};

/// Delivered to connect state listeners whose device matches the remote
/// address of a native connection state change
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionChange {
    Connected(LeDevice),
    Disconnected(LeDevice),
}

#[derive(Clone)]
struct ConnectStateListener {
    address: Address,
    device: LeDevice,
    listener: Listener<ConnectionChange>,
}

struct Advertiser {
    handle: NativeHandle,
    listener: Listener<Result<AdvertiseState>>,
}

// Characteristics register here so the value-changed trampoline can find the
// listeners for a native handle. `instance` tells apart two wrappers created
// for the same handle so that dropping a stale one doesn't unregister a live
// one.
pub(crate) struct ValueRoute {
    pub(crate) instance: u64,
    pub(crate) characteristic: Weak<CharacteristicInner>,
}

// Public for the sake of implementing Deref, none of the state is public
pub struct LeAdapterInner {
    pub(crate) backend: Arc<dyn BleBackend>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) gate: Arc<dyn PrivilegeGate>,

    enabled: AtomicBool,

    // Present while scanning
    scan: StdMutex<Option<Listener<Result<LeDevice>>>>,

    // Present from a successful start until stop_advertise()
    advertiser: StdMutex<Option<Advertiser>>,
    // Set while a start builds its advertiser with the slot unlocked
    advertise_starting: AtomicBool,

    // Connect and disconnect share one table so that only one of them can be
    // in flight for a given address
    connecting: PendingOperationTable<Address, Reply<()>>,

    connected: StdMutex<HashSet<Address>>,
    connect_listeners: CallbackRegistry<ConnectStateListener>,

    pub(crate) clients: DashMap<Address, HandleWrapper>,

    pub(crate) requests: PendingOperationTable<RequestId, GattRequest>,
    next_request: AtomicU64,

    pub(crate) value_routes: DashMap<NativeHandle, ValueRoute>,
    pub(crate) next_instance: AtomicU64,
}

/// The Bluetooth Low Energy adapter: the one place scan, advertise and
/// connection state is kept and where every native Bluetooth callback is
/// turned into deferred deliveries.
#[derive(Clone)]
pub struct LowEnergyAdapter {
    inner: Arc<LeAdapterInner>,
}
impl PartialEq for LowEnergyAdapter {
    fn eq(&self, other: &LowEnergyAdapter) -> bool {
        Arc::<LeAdapterInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for LowEnergyAdapter {}
impl Hash for LowEnergyAdapter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<LeAdapterInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for LowEnergyAdapter {
    type Target = LeAdapterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for LowEnergyAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LowEnergyAdapter")
            .field("enabled", &self.is_enabled())
            .field("scanning", &self.is_scanning())
            .field("advertising", &self.is_advertising())
            .finish()
    }
}

impl LowEnergyAdapter {
    pub fn new(
        backend: Arc<dyn BleBackend>, dispatcher: Dispatcher, gate: Arc<dyn PrivilegeGate>,
    ) -> Result<Self> {
        let enabled = backend
            .is_le_enabled()
            .map_err(|err| err.into_error("bt_adapter_le_get_state failed"))?;

        let inner = Arc::new(LeAdapterInner {
            backend,
            dispatcher,
            gate,
            enabled: AtomicBool::new(enabled),
            scan: StdMutex::new(None),
            advertiser: StdMutex::new(None),
            advertise_starting: AtomicBool::new(false),
            connecting: PendingOperationTable::new("le-connect"),
            connected: StdMutex::new(HashSet::new()),
            connect_listeners: CallbackRegistry::new(),
            clients: DashMap::new(),
            requests: PendingOperationTable::new("gatt-request"),
            next_request: AtomicU64::new(1),
            value_routes: DashMap::new(),
            next_instance: AtomicU64::new(1),
        });

        // The sink only holds a Weak reference, the backend must not keep
        // the adapter alive
        inner.backend.set_event_sink(Some(BleEventSink {
            adapter: Arc::downgrade(&inner),
        }));
        debug!("LE adapter created, enabled = {}", enabled);

        Ok(LowEnergyAdapter { inner })
    }

    pub(crate) fn wrap(inner: Arc<LeAdapterInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<LeAdapterInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn as_observer(&self) -> Weak<dyn ContextObserver> {
        let weak: Weak<LeAdapterInner> = Arc::downgrade(&self.inner);
        weak
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.lock().unwrap().is_some()
    }

    pub fn is_advertising(&self) -> bool {
        self.advertiser.lock().unwrap().is_some()
    }

    pub fn is_device_connected(&self, address: &str) -> bool {
        let key = Address::from(address);
        self.connected.lock().unwrap().contains(&key)
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    /// Starts scanning, delivering every discovered device to `listener`.
    ///
    /// A disabled adapter isn't reported as an error of this call, the
    /// listener immediately receives a `ServiceNotAvailable` error instead.
    #[named]
    pub fn start_scan(&self, listener: Listener<Result<LeDevice>>) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        {
            let mut scan = self.scan.lock().unwrap();
            if scan.is_some() {
                return Err(Error::InvalidState("Device is currently in progress of scanning".to_string()));
            }
            // Registered before starting since results may arrive from inside
            // the native call
            *scan = Some(listener.clone());
        }

        match self.backend.start_scan() {
            Ok(()) => {
                debug!("Scan started");
                Ok(())
            }
            Err(err) => {
                self.scan.lock().unwrap().take();
                match err {
                    BtError::NowInProgress => {
                        Err(Error::InvalidState("Device is currently in progress of scanning".to_string()))
                    }
                    BtError::NotEnabled => {
                        debug!("ServiceNotAvailableError : Local adapter not enabled");
                        if listener.context().is_alive() {
                            listener.invoke(Err(Error::ServiceNotAvailable("Local adapter not enabled".to_string())));
                        }
                        Ok(())
                    }
                    err => Err(err.into_error("Failed to start scan")),
                }
            }
        }
    }

    #[named]
    pub fn stop_scan(&self) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        match self.backend.stop_scan() {
            Ok(()) | Err(BtError::NotInProgress) => {
                self.scan.lock().unwrap().take();
                Ok(())
            }
            Err(err) => Err(Error::Unknown(format!("Failed to stop scan : {}", err))),
        }
    }

    fn configure_advertiser(
        &self, advertiser: NativeHandle, data: &AdvertiseData, packet: PacketType, mode: AdvertisingMode,
        connectable: bool,
    ) -> Result<()> {
        let backend = &self.backend;
        let check = |result: NativeResult<()>, hint: &str| result.map_err(|err| err.into_error(hint));

        if data.include_name {
            trace!("Device name is included");
            check(
                backend.advertiser_set_device_name(advertiser, packet, true),
                "bt_adapter_le_set_advertising_device_name failed",
            )?;
        }
        for uuid in data.service_uuids.iter() {
            check(
                backend.advertiser_add_service_uuid(advertiser, packet, uuid),
                "bt_adapter_le_add_advertising_service_uuid failed",
            )?;
        }
        for uuid in data.solicitation_uuids.iter() {
            check(
                backend.advertiser_add_solicitation_uuid(advertiser, packet, uuid),
                "bt_adapter_le_add_advertising_service_solicitation_uuid failed",
            )?;
        }
        if let Some(appearance) = data.appearance {
            check(
                backend.advertiser_set_appearance(advertiser, packet, appearance),
                "bt_adapter_le_set_advertising_appearance failed",
            )?;
        }
        if data.include_tx_power_level {
            check(
                backend.advertiser_set_tx_power_level(advertiser, packet, true),
                "bt_adapter_le_set_advertising_tx_power_level failed",
            )?;
        }
        if let Some(service_data) = &data.service_data {
            check(
                backend.advertiser_add_service_data(advertiser, packet, &service_data.uuid, &service_data.data),
                "bt_adapter_le_add_advertising_service_data failed",
            )?;
        }
        if let Some(manufacturer) = &data.manufacturer_data {
            check(
                backend.advertiser_add_manufacturer_data(advertiser, packet, manufacturer.id, &manufacturer.data),
                "bt_adapter_le_add_advertising_manufacturer_data failed",
            )?;
        }
        check(backend.advertiser_set_mode(advertiser, mode), "bt_adapter_le_set_advertising_mode failed")?;
        check(
            backend.advertiser_set_connectable(advertiser, connectable),
            "bt_adapter_le_set_advertising_connectable failed",
        )?;
        Ok(())
    }

    fn destroy_advertiser(&self, advertiser: NativeHandle) {
        if let Err(err) = self.backend.advertiser_destroy(advertiser) {
            log::error!("Failed to destroy advertiser {}: {}", advertiser, err);
        }
    }

    /// Starts advertising `data`, reporting state changes through `listener`.
    ///
    /// `packet_type` and `mode` are validated before any native advertiser is
    /// created. As with scanning, a disabled adapter is reported through the
    /// listener rather than as an error of this call.
    #[named]
    pub fn start_advertise(
        &self, data: &AdvertiseData, listener: Listener<Result<AdvertiseState>>, packet_type: &str, mode: &str,
        connectable: bool,
    ) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        if self.advertiser.lock().unwrap().is_some() || self.advertise_starting.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("Device is currently in progress of advertising".to_string()));
        }
        let _starting = StartingAdvertise(&self.advertise_starting);

        let packet = PacketType::parse(packet_type)
            .ok_or_else(|| Error::TypeMismatch(format!("Invalid packet type: {}", packet_type)))?;
        let mode = AdvertisingMode::parse(mode).ok_or_else(|| Error::TypeMismatch("Type Mismatch".to_string()))?;

        let mut data = data.clone();
        for uuid in data
            .service_uuids
            .iter_mut()
            .chain(data.solicitation_uuids.iter_mut())
            .chain(data.service_data.iter_mut().map(|service_data| &mut service_data.uuid))
        {
            *uuid = normalize_bluetooth_uuid(uuid)
                .ok_or_else(|| Error::InvalidValues(format!("Invalid UUID: {}", uuid)))?;
        }

        let advertiser = self
            .backend
            .advertiser_create()
            .map_err(|err| err.into_error("bt_adapter_le_create_advertiser failed"))?;
        if let Err(err) = self.configure_advertiser(advertiser, &data, packet, mode, connectable) {
            self.destroy_advertiser(advertiser);
            return Err(err);
        }

        // State callbacks may be delivered from inside the native start call
        *self.advertiser.lock().unwrap() = Some(Advertiser {
            handle: advertiser,
            listener: listener.clone(),
        });

        trace!("Advertising data set, start advertising");
        if let Err(err) = self.backend.advertiser_start(advertiser) {
            self.advertiser.lock().unwrap().take();
            self.destroy_advertiser(advertiser);
            return match err {
                BtError::NowInProgress => {
                    Err(Error::InvalidState("Device is currently in progress of advertising".to_string()))
                }
                BtError::NotEnabled => {
                    debug!("ServiceNotAvailableError : Local adapter not enabled");
                    if listener.context().is_alive() {
                        listener.invoke(Err(Error::ServiceNotAvailable("Local adapter not enabled".to_string())));
                    }
                    Ok(())
                }
                err => Err(err.into_error("Failed to start advertise")),
            };
        }
        Ok(())
    }

    #[named]
    pub fn stop_advertise(&self) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        let advertiser = match self.advertiser.lock().unwrap().take() {
            Some(advertiser) => advertiser,
            None => {
                debug!("Advertising is not in progress");
                return Ok(());
            }
        };

        let stopped = self.backend.advertiser_stop(advertiser.handle);
        // Destroyed whatever happened, a failed stop leaves nothing to retry with
        self.destroy_advertiser(advertiser.handle);
        match stopped {
            Ok(()) | Err(BtError::NotInProgress) => Ok(()),
            Err(err) => {
                log::error!("bt_adapter_le_stop_advertising failed with {}", err);
                Err(Error::Unknown("Failed to stop advertise".to_string()))
            }
        }
    }

    /// Starts a GATT connection to `address`, `reply` is resolved by the
    /// native connection state change for that address.
    #[named]
    pub fn connect_to_address(&self, address: &str, reply: Reply<()>) -> Result<()> {
        trace!("{}: {}", function_name!(), address);
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        let key = Address::from(address);
        self.connecting
            .begin(key.clone(), reply)
            .map_err(|_| Error::InvalidState("Connection in progress".to_string()))?;

        if let Err(err) = self.backend.gatt_connect(address, false) {
            self.connecting.abort(&key);
            return Err(err.into_error("Failed to connect to address"));
        }
        Ok(())
    }

    #[named]
    pub fn disconnect_from_address(&self, address: &str, reply: Reply<()>) -> Result<()> {
        trace!("{}: {}", function_name!(), address);
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        let key = Address::from(address);
        self.connecting.begin(key.clone(), reply)?;

        if let Err(err) = self.backend.gatt_disconnect(address) {
            self.connecting.abort(&key);
            return Err(match err {
                BtError::OperationFailed => Error::InvalidState("device is currently not connected".to_string()),
                err => err.into_error("Failed to disconnect from address"),
            });
        }
        Ok(())
    }

    /// Convenience on top of [`connect_to_address`](Self::connect_to_address)
    /// for Rust consumers. Needs the session event loop to be running.
    pub async fn connect(&self, context: &ScriptContext, address: &str) -> Result<()> {
        let (reply, rx) = Reply::channel(context);
        self.connect_to_address(address, reply)?;
        rx.await
            .map_err(|_| Error::Unknown("Connection request was dropped".to_string()))?
    }

    pub async fn disconnect(&self, context: &ScriptContext, address: &str) -> Result<()> {
        let (reply, rx) = Reply::channel(context);
        self.disconnect_from_address(address, reply)?;
        rx.await
            .map_err(|_| Error::Unknown("Disconnection request was dropped".to_string()))?
    }

    pub fn add_connect_state_change_listener(
        &self, device: LeDevice, listener: Listener<ConnectionChange>,
    ) -> Result<ListenerId> {
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;
        let id = self.connect_listeners.subscribe(ConnectStateListener {
            address: Address::from(device.address.as_str()),
            device,
            listener,
        });
        debug!("Listener ID: {}", id);
        Ok(id)
    }

    pub fn remove_connect_state_change_listener(&self, id: ListenerId) -> Result<()> {
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;
        self.connect_listeners.unsubscribe(id);
        Ok(())
    }

    /// Looks up the primary service `uuid` of a connected device
    #[named]
    pub fn get_specified_gatt_service(&self, address: &str, uuid: &str) -> Result<GattService> {
        trace!("{}: {} {}", function_name!(), address, uuid);
        self.gate.check(privilege::BLUETOOTH_ADMIN)?;

        if !self.is_enabled() {
            return Err(Error::ServiceNotAvailable("Bluetooth low energy device is turned off".to_string()));
        }
        if !self.is_device_connected(address) {
            return Err(Error::InvalidState("Device is not connected".to_string()));
        }

        let client = self.get_client(address)?;
        let service = match self.backend.client_get_service(client.handle(), uuid) {
            Ok(service) => service,
            Err(BtError::InvalidParameter) | Err(BtError::NoData) => {
                return Err(Error::NotFound("no service with the given UUID".to_string()))
            }
            Err(err) => return Err(err.into_error("Failed to get a service's GATT handle")),
        };
        debug!("service's GATT handle properly get");
        Ok(GattService::new(self.clone(), client, service))
    }

    // The trampoline: every native callback arrives here, on whatever thread
    // the backend delivers it from. Nothing in here invokes consumer code,
    // deliveries are posted to the dispatcher.
    pub(crate) fn on_native_event(&self, event: BleEvent) {
        match event {
            BleEvent::StateChanged { enabled } => {
                debug!("LE state changed, enabled = {}", enabled);
                self.enabled.store(enabled, Ordering::Release);
            }
            BleEvent::ScanResult { result, info } => self.on_scan_result(result, info),
            BleEvent::AdvertisingStateChanged { result, advertiser, started } => {
                self.on_advertising_state(result, advertiser, started)
            }
            BleEvent::ConnectionStateChanged { result, connected, remote_address } => {
                self.on_connection_state(result, connected, &remote_address)
            }
            BleEvent::ValueChanged { characteristic, value } => self.on_value_changed(characteristic, value),
            BleEvent::ReadCompleted { request, result } => self.on_read_completed(request, result),
            BleEvent::WriteCompleted { request, result } => self.on_write_completed(request, result),
        }
    }

    fn on_scan_result(&self, result: NativeResult<()>, info: ScanResultInfo) {
        trace!("Scan result {:?} for {}", result, info.remote_address);
        let listener = match self.scan.lock().unwrap().as_ref() {
            Some(listener) => listener.clone(),
            None => {
                warn!("Scan result received while not scanning");
                return;
            }
        };
        let delivery = match result {
            Ok(()) => Ok(LeDevice::from_scan_result(&info)),
            Err(err) => Err(Error::Unknown(format!("Unknown error during scan process : {}", err))),
        };
        self.dispatcher.notify("le scan", &listener, delivery);
    }

    fn on_advertising_state(&self, result: NativeResult<()>, advertiser: NativeHandle, started: bool) {
        let listener = match self.advertiser.lock().unwrap().as_ref() {
            Some(current) if current.handle == advertiser => current.listener.clone(),
            _ => {
                warn!("Advertising state for unknown advertiser {}", advertiser);
                return;
            }
        };
        let delivery = match result {
            Ok(()) if started => Ok(AdvertiseState::Started),
            Ok(()) => Ok(AdvertiseState::Stopped),
            Err(err) => Err(Error::Unknown(err.to_string())),
        };
        self.dispatcher.notify("le advertise", &listener, delivery);
    }

    fn on_connection_state(&self, result: NativeResult<()>, connected: bool, remote_address: &str) {
        debug!("Connection state: {} connected: {} ({:?})", remote_address, connected, result);
        let key = Address::from(remote_address);

        // The only place the connected set is maintained
        let was_connected = {
            let mut set = self.connected.lock().unwrap();
            let was_connected = set.contains(&key);
            if connected {
                set.insert(key.clone());
            } else {
                set.remove(&key);
            }
            was_connected
        };

        if connected != was_connected {
            self.connect_listeners.broadcast(
                |entry| entry.address == key,
                |_, entry| {
                    let change = if connected {
                        ConnectionChange::Connected(entry.device.clone())
                    } else {
                        ConnectionChange::Disconnected(entry.device.clone())
                    };
                    self.dispatcher.notify("le connect state", &entry.listener, change);
                },
            );
        }

        let reply = match self.connecting.complete(&key) {
            Some(reply) => reply,
            None => return,
        };
        let delivery = result.map_err(|err| Error::Unknown(err.to_string()));
        self.dispatcher.reply("le connect", reply, delivery);
    }

    fn on_value_changed(&self, characteristic: NativeHandle, value: Vec<u8>) {
        let route = self
            .value_routes
            .get(&characteristic)
            .map(|route| route.characteristic.clone());
        let characteristic_inner = match route.and_then(|weak| weak.upgrade()) {
            Some(inner) => inner,
            None => {
                trace!("Value change for unregistered characteristic {}", characteristic);
                return;
            }
        };
        characteristic_inner.broadcast_value(&self.dispatcher, &value);
    }

    fn on_read_completed(&self, request: RequestId, result: NativeResult<Vec<u8>>) {
        match self.requests.complete(&request) {
            Some(GattRequest::Read(reply)) => {
                let delivery = result.map_err(|err| Error::Unknown(err.to_string()));
                self.dispatcher.reply("gatt read", reply, delivery);
            }
            Some(GattRequest::Write(reply)) => {
                warn!("Read completion for write request {}", request);
                self.dispatcher.reply("gatt write", reply, Err(Error::Unknown("Unexpected read completion".to_string())));
            }
            None => {}
        }
    }

    fn on_write_completed(&self, request: RequestId, result: NativeResult<()>) {
        match self.requests.complete(&request) {
            Some(GattRequest::Write(reply)) => {
                let delivery = result.map_err(|err| Error::Unknown(err.to_string()));
                self.dispatcher.reply("gatt write", reply, delivery);
            }
            Some(GattRequest::Read(reply)) => {
                warn!("Write completion for read request {}", request);
                self.dispatcher.reply("gatt read", reply, Err(Error::Unknown("Unexpected write completion".to_string())));
            }
            None => {}
        }
    }
}

impl ContextObserver for LeAdapterInner {
    fn on_context_unloaded(&self, context: ContextId) {
        let owned_by = |ctx: &ScriptContext| ctx.id() == context;

        let removed = self.connect_listeners.remove_where(|entry| owned_by(entry.listener.context()));
        trace!("Removed {} connect state listeners of {}", removed, context);

        let scan_owned = matches!(self.scan.lock().unwrap().as_ref(), Some(l) if owned_by(l.context()));
        if scan_owned {
            debug!("Stopping scan owned by unloaded {}", context);
            match self.backend.stop_scan() {
                Ok(()) | Err(BtError::NotInProgress) => {}
                Err(err) => warn!("Failed to stop scan: {}", err),
            }
            self.scan.lock().unwrap().take();
        }

        let advertiser = {
            let mut slot = self.advertiser.lock().unwrap();
            match slot.as_ref() {
                Some(current) if owned_by(current.listener.context()) => slot.take(),
                _ => None,
            }
        };
        if let Some(advertiser) = advertiser {
            debug!("Stopping advertising owned by unloaded {}", context);
            match self.backend.advertiser_stop(advertiser.handle) {
                Ok(()) | Err(BtError::NotInProgress) => {}
                Err(err) => warn!("Failed to stop advertising: {}", err),
            }
            if let Err(err) = self.backend.advertiser_destroy(advertiser.handle) {
                log::error!("Failed to destroy advertiser {}: {}", advertiser.handle, err);
            }
        }

        self.connecting.remove_where(|_, reply| owned_by(reply.context()));
        self.requests.remove_where(|_, request| owned_by(request.context()));

        let characteristics: Vec<Arc<CharacteristicInner>> = self
            .value_routes
            .iter()
            .filter_map(|route| route.characteristic.upgrade())
            .collect();
        for characteristic in characteristics {
            characteristic.forget_context(context);
        }
    }
}

// Clears the starting flag on every way out of start_advertise
struct StartingAdvertise<'a>(&'a AtomicBool);

impl Drop for StartingAdvertise<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Drop for LeAdapterInner {
    #[named]
    fn drop(&mut self) {
        trace!("{}: tearing down LE adapter", function_name!());
        self.backend.set_event_sink(None);

        if self.scan.get_mut().map(|scan| scan.is_some()).unwrap_or(false) {
            if let Err(err) = self.backend.stop_scan() {
                warn!("{}: failed to stop scan: {}", function_name!(), err);
            }
        }
        if let Ok(slot) = self.advertiser.get_mut() {
            if let Some(advertiser) = slot.take() {
                match self.backend.advertiser_stop(advertiser.handle) {
                    Ok(()) | Err(BtError::NotInProgress) => {}
                    Err(err) => warn!("{}: failed to stop advertising: {}", function_name!(), err),
                }
                if let Err(err) = self.backend.advertiser_destroy(advertiser.handle) {
                    warn!("{}: failed to destroy advertiser: {}", function_name!(), err);
                }
            }
        }

        // Removed one by one so no wrapper is dropped while the map is locked
        let addresses: Vec<Address> = self.clients.iter().map(|entry| entry.key().clone()).collect();
        for address in addresses {
            drop(self.clients.remove(&address));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::device::{AdvertiseManufacturerData, AdvertiseServiceData};
    use crate::ble::PacketData;
    use crate::context::ContextManager;
    use crate::dispatch::{idle_queue, EventLoop};
    use crate::fake::ble::{BleCall, FakeBleBackend};
    use crate::privilege::AllowAll;
    use tokio::sync::mpsc::UnboundedReceiver;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    struct Fixture {
        fake: Arc<FakeBleBackend>,
        adapter: LowEnergyAdapter,
        event_loop: EventLoop,
        contexts: ContextManager,
        ctx: ScriptContext,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeBleBackend::new());
        let (dispatcher, event_loop) = idle_queue();
        let adapter = LowEnergyAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll)).unwrap();
        let contexts = ContextManager::new();
        contexts.add_observer(adapter.as_observer());
        let ctx = contexts.create();
        Fixture { fake, adapter, event_loop, contexts, ctx }
    }

    fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Ok(value) = rx.try_recv() {
            out.push(value);
        }
        out
    }

    fn device(address: &str) -> LeDevice {
        LeDevice::from_scan_result(&ScanResultInfo {
            remote_address: address.to_string(),
            ..Default::default()
        })
    }

    #[test]
    fn start_scan_twice_is_invalid_state() {
        let mut f = fixture();
        let (listener, mut rx) = Listener::channel(&f.ctx);
        f.adapter.start_scan(listener.clone()).unwrap();

        let err = f.adapter.start_scan(listener).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        f.fake.emit_scan_result(ScanResultInfo {
            remote_address: ADDR.to_string(),
            advertising: PacketData {
                device_name: Some("hrm".to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
        // Nothing runs until the loop does
        assert!(drain(&mut rx).is_empty());
        f.event_loop.run_until_idle();
        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap().name.as_deref(), Some("hrm"));
    }

    #[test]
    fn start_scan_not_enabled_reports_through_listener() {
        let f = fixture();
        f.fake.fail(BleCall::StartScan, BtError::NotEnabled);
        let (listener, mut rx) = Listener::channel(&f.ctx);

        f.adapter.start_scan(listener).unwrap();
        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(Error::ServiceNotAvailable(_))));
        assert!(!f.adapter.is_scanning());
    }

    #[test]
    fn start_scan_native_in_progress_is_invalid_state() {
        let f = fixture();
        f.fake.fail(BleCall::StartScan, BtError::NowInProgress);
        let (listener, _rx) = Listener::channel(&f.ctx);
        assert!(matches!(f.adapter.start_scan(listener), Err(Error::InvalidState(_))));

        f.fake.fail(BleCall::StartScan, BtError::ResourceBusy);
        let (listener, _rx) = Listener::channel(&f.ctx);
        assert!(matches!(f.adapter.start_scan(listener), Err(Error::ServiceNotAvailable(_))));
        assert!(!f.adapter.is_scanning());
    }

    #[test]
    fn stop_scan_tolerates_not_in_progress() {
        let f = fixture();
        f.fake.fail(BleCall::StopScan, BtError::NotInProgress);
        f.adapter.stop_scan().unwrap();

        f.fake.fail(BleCall::StopScan, BtError::OperationFailed);
        assert!(matches!(f.adapter.stop_scan(), Err(Error::Unknown(_))));

        f.fake.clear_failures();
        let (listener, _rx) = Listener::channel(&f.ctx);
        f.adapter.start_scan(listener.clone()).unwrap();
        f.adapter.stop_scan().unwrap();
        f.adapter.start_scan(listener).unwrap();
    }

    #[test]
    fn connect_twice_is_invalid_state_until_completion() {
        let mut f = fixture();
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.adapter.connect_to_address("AA:BB", reply).unwrap();

        let (reply, _rx2) = Reply::channel(&f.ctx);
        assert!(matches!(f.adapter.connect_to_address("AA:BB", reply), Err(Error::InvalidState(_))));

        // A disconnect shares the same pending table
        let (reply, _rx3) = Reply::channel(&f.ctx);
        assert!(matches!(f.adapter.disconnect_from_address("AA:BB", reply), Err(Error::InvalidState(_))));

        f.fake.emit_connection_state("AA:BB", Err(BtError::TimedOut), false);
        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Unknown("Timeout error".to_string())));

        let (reply, _rx4) = Reply::channel(&f.ctx);
        f.adapter.connect_to_address("AA:BB", reply).unwrap();
    }

    #[test]
    fn connect_completion_from_inside_native_call_is_not_lost() {
        let mut f = fixture();
        f.fake.set_auto_connect(true);
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.adapter.connect_to_address(ADDR, reply).unwrap();

        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert!(f.adapter.is_device_connected(ADDR));
        assert!(f.adapter.is_device_connected(&ADDR.to_lowercase()));
    }

    #[test]
    fn connect_native_failure_rolls_back_pending_entry() {
        let f = fixture();
        f.fake.fail(BleCall::GattConnect, BtError::NotEnabled);
        let (reply, _rx) = Reply::channel(&f.ctx);
        assert!(matches!(f.adapter.connect_to_address(ADDR, reply), Err(Error::ServiceNotAvailable(_))));

        f.fake.clear_failures();
        let (reply, _rx) = Reply::channel(&f.ctx);
        f.adapter.connect_to_address(ADDR, reply).unwrap();
    }

    #[test]
    fn disconnect_when_not_connected() {
        let f = fixture();
        f.fake.fail(BleCall::GattDisconnect, BtError::OperationFailed);
        let (reply, _rx) = Reply::channel(&f.ctx);
        let err = f.adapter.disconnect_from_address(ADDR, reply).unwrap_err();
        assert_eq!(err, Error::InvalidState("device is currently not connected".to_string()));
    }

    #[test]
    fn connect_state_listeners_filter_by_address() {
        let mut f = fixture();
        let (listener, mut rx) = Listener::channel(&f.ctx);
        let (other, mut other_rx) = Listener::channel(&f.ctx);
        let id = f.adapter.add_connect_state_change_listener(device(ADDR), listener).unwrap();
        f.adapter.add_connect_state_change_listener(device("11:22:33:44:55:66"), other).unwrap();
        assert_eq!(id, ListenerId(1));

        f.fake.emit_connection_state(ADDR, Ok(()), true);
        // A repeated "connected" isn't a change
        f.fake.emit_connection_state(ADDR, Ok(()), true);
        f.fake.emit_connection_state(ADDR, Ok(()), false);
        f.event_loop.run_until_idle();

        let changes = drain(&mut rx);
        assert_eq!(changes, vec![ConnectionChange::Connected(device(ADDR)), ConnectionChange::Disconnected(device(ADDR))]);
        assert!(drain(&mut other_rx).is_empty());

        f.adapter.remove_connect_state_change_listener(id).unwrap();
        f.fake.emit_connection_state(ADDR, Ok(()), true);
        f.event_loop.run_until_idle();
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn gatt_service_requires_enabled_and_connected() {
        let f = fixture();
        let err = f.adapter.get_specified_gatt_service(ADDR, "0000180d-0000-1000-8000-00805f9b34fb").unwrap_err();
        assert_eq!(err, Error::InvalidState("Device is not connected".to_string()));

        f.fake.set_enabled(false);
        let err = f.adapter.get_specified_gatt_service(ADDR, "180d").unwrap_err();
        assert!(matches!(err, Error::ServiceNotAvailable(_)));
    }

    #[test]
    fn gatt_service_unknown_uuid_is_not_found() {
        let f = fixture();
        f.fake.add_service(ADDR, "180d");
        f.fake.emit_connection_state(ADDR, Ok(()), true);

        let err = f.adapter.get_specified_gatt_service(ADDR, "180f").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let service = f.adapter.get_specified_gatt_service(ADDR, "180d").unwrap();
        assert_eq!(service.uuid().unwrap(), "180d");
    }

    #[test]
    fn client_is_shared_and_destroyed_after_last_user() {
        let f = fixture();
        f.fake.add_service(ADDR, "180d");
        f.fake.add_service(ADDR, "180f");
        f.fake.emit_connection_state(ADDR, Ok(()), true);

        let hrs = f.adapter.get_specified_gatt_service(ADDR, "180d").unwrap();
        let bas = f.adapter.get_specified_gatt_service(ADDR, "180f").unwrap();
        assert_eq!(f.fake.created_clients().len(), 1);
        assert_eq!(f.adapter.clients.len(), 1);

        drop(hrs);
        assert!(f.fake.destroyed_clients().is_empty());
        drop(bas);
        // The registry entry went away with the last user, taking the client with it
        assert_eq!(f.adapter.clients.len(), 0);
        assert_eq!(f.fake.destroyed_clients(), f.fake.created_clients());

        let _again = f.adapter.get_specified_gatt_service(ADDR, "180d").unwrap();
        assert_eq!(f.fake.created_clients().len(), 2);
    }

    #[test]
    fn advertise_invalid_mode_creates_no_advertiser() {
        let f = fixture();
        let (listener, _rx) = Listener::channel(&f.ctx);
        let err = f
            .adapter
            .start_advertise(&AdvertiseData::default(), listener.clone(), "ADVERTISE", "INVALID_MODE", true)
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));

        let err = f
            .adapter
            .start_advertise(&AdvertiseData::default(), listener, "BOTH", "BALANCED", true)
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
        assert_eq!(f.fake.count(BleCall::AdvertiserCreate), 0);
    }

    #[test]
    fn advertise_applies_fields_and_reports_state() {
        let mut f = fixture();
        let data = AdvertiseData {
            include_name: true,
            service_uuids: vec!["180D".to_string()],
            solicitation_uuids: vec!["180f".to_string()],
            appearance: Some(0x0341),
            include_tx_power_level: true,
            service_data: Some(AdvertiseServiceData { uuid: "180d".to_string(), data: vec![1, 2] }),
            manufacturer_data: Some(AdvertiseManufacturerData { id: 117, data: vec![3] }),
        };
        let (listener, mut rx) = Listener::channel(&f.ctx);
        f.adapter.start_advertise(&data, listener.clone(), "SCAN_RESPONSE", "LOW_LATENCY", false).unwrap();

        let calls = f.fake.advertiser_calls();
        assert_eq!(
            calls,
            vec![
                BleCall::AdvertiserCreate,
                BleCall::AdvertiserSetDeviceName,
                BleCall::AdvertiserAddServiceUuid,
                BleCall::AdvertiserAddSolicitationUuid,
                BleCall::AdvertiserSetAppearance,
                BleCall::AdvertiserSetTxPowerLevel,
                BleCall::AdvertiserAddServiceData,
                BleCall::AdvertiserAddManufacturerData,
                BleCall::AdvertiserSetMode,
                BleCall::AdvertiserSetConnectable,
                BleCall::AdvertiserStart,
            ]
        );
        assert_eq!(f.fake.advertised_service_uuids(), vec!["180d".to_string()]);

        let err = f
            .adapter
            .start_advertise(&data, listener, "ADVERTISE", "BALANCED", true)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        f.fake.emit_advertising_state(true);
        f.event_loop.run_until_idle();
        assert_eq!(drain(&mut rx), vec![Ok(AdvertiseState::Started)]);

        f.adapter.stop_advertise().unwrap();
        assert_eq!(f.fake.live_advertisers(), 0);
        // Stopping again only logs
        f.adapter.stop_advertise().unwrap();
    }

    #[test]
    fn advertise_setter_failure_destroys_advertiser() {
        let f = fixture();
        f.fake.fail(BleCall::AdvertiserSetAppearance, BtError::InvalidParameter);
        let data = AdvertiseData { appearance: Some(1), ..Default::default() };
        let (listener, _rx) = Listener::channel(&f.ctx);
        let err = f.adapter.start_advertise(&data, listener, "ADVERTISE", "BALANCED", true).unwrap_err();
        assert!(matches!(err, Error::InvalidValues(_)));
        assert_eq!(f.fake.live_advertisers(), 0);
        assert!(!f.adapter.is_advertising());
    }

    #[test]
    fn advertise_not_enabled_reports_through_listener() {
        let f = fixture();
        f.fake.fail(BleCall::AdvertiserStart, BtError::NotEnabled);
        let (listener, mut rx) = Listener::channel(&f.ctx);
        f.adapter
            .start_advertise(&AdvertiseData::default(), listener, "ADVERTISE", "LOW_ENERGY", true)
            .unwrap();
        assert!(matches!(drain(&mut rx).as_slice(), [Err(Error::ServiceNotAvailable(_))]));
        assert_eq!(f.fake.live_advertisers(), 0);
    }

    #[test]
    fn advertise_calls_back_into_adapter_while_configuring() {
        let f = fixture();
        let weak = f.adapter.downgrade();
        let ctx = f.ctx.clone();
        let seen: Arc<StdMutex<Vec<Result<()>>>> = Arc::new(StdMutex::new(Vec::new()));
        let reentrant = seen.clone();
        f.fake.on_call(BleCall::AdvertiserSetMode, move || {
            if let Some(inner) = weak.upgrade() {
                let adapter = LowEnergyAdapter::wrap(inner);
                let mut seen = reentrant.lock().unwrap();
                seen.push(adapter.stop_advertise());
                let (listener, _rx) = Listener::channel(&ctx);
                seen.push(adapter.start_advertise(&AdvertiseData::default(), listener, "ADVERTISE", "BALANCED", true));
            }
        });

        let (listener, _rx) = Listener::channel(&f.ctx);
        f.adapter
            .start_advertise(&AdvertiseData::default(), listener, "ADVERTISE", "BALANCED", true)
            .unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], Ok(()));
        assert!(matches!(seen[1], Err(Error::InvalidState(_))));
        assert!(f.adapter.is_advertising());
        assert_eq!(f.fake.live_advertisers(), 1);
    }

    #[test]
    fn failed_advertise_start_can_be_retried() {
        let f = fixture();
        f.fake.fail(BleCall::AdvertiserSetConnectable, BtError::OperationFailed);
        let (listener, _rx) = Listener::channel(&f.ctx);
        assert!(f
            .adapter
            .start_advertise(&AdvertiseData::default(), listener.clone(), "ADVERTISE", "BALANCED", true)
            .is_err());

        f.fake.clear_failures();
        f.adapter
            .start_advertise(&AdvertiseData::default(), listener, "ADVERTISE", "BALANCED", true)
            .unwrap();
        assert!(f.adapter.is_advertising());
    }

    #[test]
    fn dropping_adapter_destroys_advertiser_even_if_stop_fails() {
        let f = fixture();
        let (listener, _rx) = Listener::channel(&f.ctx);
        f.adapter
            .start_advertise(&AdvertiseData::default(), listener, "ADVERTISE", "BALANCED", true)
            .unwrap();
        f.fake.fail(BleCall::AdvertiserStop, BtError::OperationFailed);

        let fake = f.fake.clone();
        drop(f);
        assert_eq!(fake.count(BleCall::AdvertiserStop), 1);
        assert_eq!(fake.count(BleCall::AdvertiserDestroy), 1);
        assert_eq!(fake.live_advertisers(), 0);
    }

    #[test]
    fn unloading_context_forgets_its_registrations() {
        let mut f = fixture();
        let other_ctx = f.contexts.create();
        let (scan_listener, mut scan_rx) = Listener::channel(&f.ctx);
        f.adapter.start_scan(scan_listener).unwrap();
        let (listener, mut rx) = Listener::channel(&f.ctx);
        let (kept, mut kept_rx) = Listener::channel(&other_ctx);
        f.adapter.add_connect_state_change_listener(device(ADDR), listener).unwrap();
        f.adapter.add_connect_state_change_listener(device(ADDR), kept).unwrap();

        // Posted before the unload, dropped at delivery
        f.fake.emit_scan_result(ScanResultInfo { remote_address: ADDR.to_string(), ..Default::default() });
        f.contexts.unload(&f.ctx);
        assert!(!f.adapter.is_scanning());

        f.fake.emit_connection_state(ADDR, Ok(()), true);
        f.event_loop.run_until_idle();
        assert!(drain(&mut scan_rx).is_empty());
        assert!(drain(&mut rx).is_empty());
        assert_eq!(drain(&mut kept_rx).len(), 1);
    }

    #[test]
    fn state_changes_track_enabled() {
        let f = fixture();
        assert!(f.adapter.is_enabled());
        f.fake.set_enabled(false);
        assert!(!f.adapter.is_enabled());
    }

    #[tokio::test]
    async fn async_connect_resolves_through_spawned_loop() {
        let fake = Arc::new(FakeBleBackend::new());
        fake.set_auto_connect(true);
        let (dispatcher, event_loop) = idle_queue();
        tokio::spawn(event_loop.run());
        let adapter = LowEnergyAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll)).unwrap();
        let contexts = ContextManager::new();
        let ctx = contexts.create();

        adapter.connect(&ctx, ADDR).await.unwrap();
        assert!(adapter.is_device_connected(ADDR));
        adapter.disconnect(&ctx, ADDR).await.unwrap();
        assert!(!adapter.is_device_connected(ADDR));
    }
}
