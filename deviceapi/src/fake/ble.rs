use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use log::trace;

use crate::ble::{
    AdvertisingMode, BleBackend, BleEvent, BleEventSink, BtError, NativeResult, PacketType, ScanResultInfo,
};
use crate::uuid::parse_bluetooth_uuid;
use crate::{NativeHandle, RequestId};

/// Every call a [`FakeBleBackend`] records, also used to pick which call
/// should fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BleCall {
    IsLeEnabled,
    StartScan,
    StopScan,
    GattConnect,
    GattDisconnect,
    ClientCreate,
    ClientDestroy,
    ClientRemoteAddress,
    ClientGetService,
    GattUuid,
    ForeachIncludedServices,
    ForeachCharacteristics,
    ForeachDescriptors,
    CharacteristicProperties,
    SetValueChangedCb,
    UnsetValueChangedCb,
    ReadValue,
    SetValue,
    WriteValue,
    AdvertiserCreate,
    AdvertiserDestroy,
    AdvertiserSetDeviceName,
    AdvertiserAddServiceUuid,
    AdvertiserAddSolicitationUuid,
    AdvertiserSetAppearance,
    AdvertiserSetTxPowerLevel,
    AdvertiserAddServiceData,
    AdvertiserAddManufacturerData,
    AdvertiserSetMode,
    AdvertiserSetConnectable,
    AdvertiserStart,
    AdvertiserStop,
}

impl BleCall {
    fn is_advertiser_call(&self) -> bool {
        matches!(
            self,
            BleCall::AdvertiserCreate
                | BleCall::AdvertiserDestroy
                | BleCall::AdvertiserSetDeviceName
                | BleCall::AdvertiserAddServiceUuid
                | BleCall::AdvertiserAddSolicitationUuid
                | BleCall::AdvertiserSetAppearance
                | BleCall::AdvertiserSetTxPowerLevel
                | BleCall::AdvertiserAddServiceData
                | BleCall::AdvertiserAddManufacturerData
                | BleCall::AdvertiserSetMode
                | BleCall::AdvertiserSetConnectable
                | BleCall::AdvertiserStart
                | BleCall::AdvertiserStop
        )
    }
}

/// A characteristic to add to the simulated GATT tree
#[derive(Clone, Debug, Default)]
pub struct FakeCharacteristic {
    pub uuid: String,
    pub properties: u32,
    pub descriptors: Vec<String>,
    pub value: Vec<u8>,
}

#[derive(Debug)]
enum Node {
    Service {
        address: String,
        uuid: String,
        primary: bool,
        included: Vec<NativeHandle>,
        characteristics: Vec<NativeHandle>,
    },
    Characteristic {
        uuid: String,
        properties: u32,
        descriptors: Vec<NativeHandle>,
        value: Vec<u8>,
    },
    Descriptor {
        uuid: String,
        value: Vec<u8>,
    },
}

impl Node {
    fn uuid(&self) -> &str {
        match self {
            Node::Service { uuid, .. } | Node::Characteristic { uuid, .. } | Node::Descriptor { uuid, .. } => uuid,
        }
    }
}

#[derive(Debug, Default)]
struct FakeAdvertiser {
    service_uuids: Vec<String>,
    started: bool,
}

#[derive(Default)]
struct State {
    sink: Option<BleEventSink>,
    enabled: bool,
    scanning: bool,
    auto_connect: bool,

    failures: HashMap<BleCall, BtError>,
    hooks: HashMap<BleCall, Arc<dyn Fn() + Send + Sync>>,
    calls: Vec<BleCall>,

    next_handle: u64,
    nodes: HashMap<NativeHandle, Node>,
    clients: HashMap<NativeHandle, String>,
    created_clients: Vec<NativeHandle>,
    destroyed_clients: Vec<NativeHandle>,
    value_cbs: HashSet<NativeHandle>,
    pending_reads: Vec<(NativeHandle, RequestId)>,
    pending_writes: Vec<(NativeHandle, RequestId)>,

    advertisers: HashMap<NativeHandle, FakeAdvertiser>,
}

impl State {
    fn allocate(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle(0x1000 + self.next_handle)
    }
}

/// An in-process stand-in for the native Bluetooth LE SDK.
///
/// It keeps a simulated GATT tree, records every call, can be told to fail
/// specific calls and lets tests emit native events at will. Events are
/// delivered synchronously on the calling thread, like a native SDK calling
/// back from inside the initiating call.
pub struct FakeBleBackend {
    state: StdMutex<State>,
}

impl Default for FakeBleBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBleBackend {
    pub fn new() -> Self {
        FakeBleBackend {
            state: StdMutex::new(State {
                enabled: true,
                ..Default::default()
            }),
        }
    }

    fn record(&self, call: BleCall) -> NativeResult<()> {
        let (hook, failure) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(call);
            (state.hooks.get(&call).cloned(), state.failures.get(&call).copied())
        };
        // Run unlocked, a hook may call back into the adapter
        if let Some(hook) = hook {
            hook();
        }
        match failure {
            Some(err) => {
                trace!("Fake {:?} failing with {:?}", call, err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Runs `hook` on the calling thread each time `call` is made, the way a
    /// native SDK may call back from inside one of its functions
    pub fn on_call<F>(&self, call: BleCall, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.lock().unwrap().hooks.insert(call, Arc::new(hook));
    }

    /// Makes every following `call` fail with `err`, until cleared
    pub fn fail(&self, call: BleCall, err: BtError) {
        self.state.lock().unwrap().failures.insert(call, err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Makes connect and disconnect complete from inside the native call
    pub fn set_auto_connect(&self, auto_connect: bool) {
        self.state.lock().unwrap().auto_connect = auto_connect;
    }

    pub fn emit(&self, event: BleEvent) {
        // Never call into the adapter with the state locked
        let sink = self.state.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => trace!("No sink for {:?}", event),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().unwrap().enabled = enabled;
        self.emit(BleEvent::StateChanged { enabled });
    }

    pub fn emit_scan_result(&self, info: ScanResultInfo) {
        self.emit(BleEvent::ScanResult { result: Ok(()), info });
    }

    pub fn emit_connection_state(&self, address: &str, result: NativeResult<()>, connected: bool) {
        self.emit(BleEvent::ConnectionStateChanged {
            result,
            connected,
            remote_address: address.to_string(),
        });
    }

    /// Reports the state of the live advertiser, if any
    pub fn emit_advertising_state(&self, started: bool) {
        let advertiser = self.state.lock().unwrap().advertisers.keys().next().copied();
        if let Some(advertiser) = advertiser {
            self.emit(BleEvent::AdvertisingStateChanged { result: Ok(()), advertiser, started });
        }
    }

    pub fn emit_value_changed(&self, characteristic: NativeHandle, value: Vec<u8>) {
        self.emit(BleEvent::ValueChanged { characteristic, value });
    }

    /// Completes every outstanding read with the attribute's current value,
    /// returning how many were completed
    pub fn complete_pending_reads(&self) -> usize {
        let completions: Vec<(RequestId, NativeResult<Vec<u8>>)> = {
            let mut state = self.state.lock().unwrap();
            let reads = std::mem::take(&mut state.pending_reads);
            reads
                .into_iter()
                .map(|(attribute, request)| {
                    let value = match state.nodes.get(&attribute) {
                        Some(Node::Characteristic { value, .. }) | Some(Node::Descriptor { value, .. }) => {
                            Ok(value.clone())
                        }
                        _ => Err(BtError::InvalidParameter),
                    };
                    (request, value)
                })
                .collect()
        };
        let count = completions.len();
        for (request, result) in completions {
            self.emit(BleEvent::ReadCompleted { request, result });
        }
        count
    }

    pub fn complete_pending_writes(&self) -> usize {
        let writes = std::mem::take(&mut self.state.lock().unwrap().pending_writes);
        let count = writes.len();
        for (_, request) in writes {
            self.emit(BleEvent::WriteCompleted { request, result: Ok(()) });
        }
        count
    }

    pub fn add_service(&self, address: &str, uuid: &str) -> NativeHandle {
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate();
        state.nodes.insert(
            handle,
            Node::Service {
                address: address.to_uppercase(),
                uuid: uuid.to_string(),
                primary: true,
                included: Vec::new(),
                characteristics: Vec::new(),
            },
        );
        handle
    }

    pub fn add_included_service(&self, parent: NativeHandle, uuid: &str) -> NativeHandle {
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate();
        let address = match state.nodes.get_mut(&parent) {
            Some(Node::Service { address, included, .. }) => {
                included.push(handle);
                address.clone()
            }
            _ => panic!("{} is not a service", parent),
        };
        state.nodes.insert(
            handle,
            Node::Service {
                address,
                uuid: uuid.to_string(),
                primary: false,
                included: Vec::new(),
                characteristics: Vec::new(),
            },
        );
        handle
    }

    pub fn add_characteristic(&self, service: NativeHandle, characteristic: FakeCharacteristic) -> NativeHandle {
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate();
        let mut descriptors = Vec::new();
        for uuid in characteristic.descriptors {
            let descriptor = state.allocate();
            state.nodes.insert(descriptor, Node::Descriptor { uuid, value: Vec::new() });
            descriptors.push(descriptor);
        }
        match state.nodes.get_mut(&service) {
            Some(Node::Service { characteristics, .. }) => characteristics.push(handle),
            _ => panic!("{} is not a service", service),
        }
        state.nodes.insert(
            handle,
            Node::Characteristic {
                uuid: characteristic.uuid,
                properties: characteristic.properties,
                descriptors,
                value: characteristic.value,
            },
        );
        handle
    }

    pub fn value_of(&self, attribute: NativeHandle) -> Vec<u8> {
        match self.state.lock().unwrap().nodes.get(&attribute) {
            Some(Node::Characteristic { value, .. }) | Some(Node::Descriptor { value, .. }) => value.clone(),
            _ => Vec::new(),
        }
    }

    pub fn has_value_changed_cb(&self, characteristic: NativeHandle) -> bool {
        self.state.lock().unwrap().value_cbs.contains(&characteristic)
    }

    pub fn count(&self, call: BleCall) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| **c == call).count()
    }

    pub fn advertiser_calls(&self) -> Vec<BleCall> {
        let state = self.state.lock().unwrap();
        state.calls.iter().copied().filter(BleCall::is_advertiser_call).collect()
    }

    pub fn advertised_service_uuids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .advertisers
            .values()
            .flat_map(|advertiser| advertiser.service_uuids.iter().cloned())
            .collect()
    }

    pub fn live_advertisers(&self) -> usize {
        self.state.lock().unwrap().advertisers.len()
    }

    pub fn created_clients(&self) -> Vec<NativeHandle> {
        self.state.lock().unwrap().created_clients.clone()
    }

    pub fn destroyed_clients(&self) -> Vec<NativeHandle> {
        self.state.lock().unwrap().destroyed_clients.clone()
    }

    pub fn has_sink(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    fn children(
        &self, call: BleCall, parent: NativeHandle, pick: impl Fn(&Node) -> Option<Vec<NativeHandle>>,
    ) -> NativeResult<Vec<NativeHandle>> {
        self.record(call)?;
        let state = self.state.lock().unwrap();
        state.nodes.get(&parent).and_then(pick).ok_or(BtError::InvalidParameter)
    }

    fn with_advertiser(
        &self, call: BleCall, advertiser: NativeHandle, apply: impl FnOnce(&mut FakeAdvertiser),
    ) -> NativeResult<()> {
        self.record(call)?;
        let mut state = self.state.lock().unwrap();
        let advertiser = state.advertisers.get_mut(&advertiser).ok_or(BtError::InvalidParameter)?;
        apply(advertiser);
        Ok(())
    }
}

impl BleBackend for FakeBleBackend {
    fn set_event_sink(&self, sink: Option<BleEventSink>) {
        self.state.lock().unwrap().sink = sink;
    }

    fn is_le_enabled(&self) -> NativeResult<bool> {
        self.record(BleCall::IsLeEnabled)?;
        Ok(self.state.lock().unwrap().enabled)
    }

    fn start_scan(&self) -> NativeResult<()> {
        self.record(BleCall::StartScan)?;
        let mut state = self.state.lock().unwrap();
        if state.scanning {
            return Err(BtError::NowInProgress);
        }
        state.scanning = true;
        Ok(())
    }

    fn stop_scan(&self) -> NativeResult<()> {
        self.record(BleCall::StopScan)?;
        let mut state = self.state.lock().unwrap();
        if !state.scanning {
            return Err(BtError::NotInProgress);
        }
        state.scanning = false;
        Ok(())
    }

    fn gatt_connect(&self, address: &str, _auto_connect: bool) -> NativeResult<()> {
        self.record(BleCall::GattConnect)?;
        if self.state.lock().unwrap().auto_connect {
            self.emit_connection_state(address, Ok(()), true);
        }
        Ok(())
    }

    fn gatt_disconnect(&self, address: &str) -> NativeResult<()> {
        self.record(BleCall::GattDisconnect)?;
        if self.state.lock().unwrap().auto_connect {
            self.emit_connection_state(address, Ok(()), false);
        }
        Ok(())
    }

    fn client_create(&self, address: &str) -> NativeResult<NativeHandle> {
        self.record(BleCall::ClientCreate)?;
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate();
        state.clients.insert(handle, address.to_uppercase());
        state.created_clients.push(handle);
        Ok(handle)
    }

    fn client_destroy(&self, client: NativeHandle) -> NativeResult<()> {
        self.record(BleCall::ClientDestroy)?;
        let mut state = self.state.lock().unwrap();
        state.clients.remove(&client).ok_or(BtError::InvalidParameter)?;
        state.destroyed_clients.push(client);
        Ok(())
    }

    fn client_remote_address(&self, client: NativeHandle) -> NativeResult<String> {
        self.record(BleCall::ClientRemoteAddress)?;
        let state = self.state.lock().unwrap();
        state.clients.get(&client).cloned().ok_or(BtError::InvalidParameter)
    }

    fn client_get_service(&self, client: NativeHandle, uuid: &str) -> NativeResult<NativeHandle> {
        self.record(BleCall::ClientGetService)?;
        let state = self.state.lock().unwrap();
        let client_address = state.clients.get(&client).ok_or(BtError::InvalidParameter)?;
        let wanted = parse_bluetooth_uuid(uuid).ok_or(BtError::InvalidParameter)?;
        state
            .nodes
            .iter()
            .find(|(_, node)| match node {
                Node::Service { address, uuid, primary: true, .. } => {
                    address == client_address && parse_bluetooth_uuid(uuid) == Some(wanted)
                }
                _ => false,
            })
            .map(|(handle, _)| *handle)
            .ok_or(BtError::NoData)
    }

    fn gatt_uuid(&self, attribute: NativeHandle) -> NativeResult<String> {
        self.record(BleCall::GattUuid)?;
        let state = self.state.lock().unwrap();
        state
            .nodes
            .get(&attribute)
            .map(|node| node.uuid().to_string())
            .ok_or(BtError::InvalidParameter)
    }

    fn foreach_included_services(
        &self, service: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()> {
        let handles = self.children(BleCall::ForeachIncludedServices, service, |node| match node {
            Node::Service { included, .. } => Some(included.clone()),
            _ => None,
        })?;
        for handle in handles {
            if !visitor(handle) {
                break;
            }
        }
        Ok(())
    }

    fn foreach_characteristics(
        &self, service: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()> {
        let handles = self.children(BleCall::ForeachCharacteristics, service, |node| match node {
            Node::Service { characteristics, .. } => Some(characteristics.clone()),
            _ => None,
        })?;
        for handle in handles {
            if !visitor(handle) {
                break;
            }
        }
        Ok(())
    }

    fn foreach_descriptors(
        &self, characteristic: NativeHandle, visitor: &mut dyn FnMut(NativeHandle) -> bool,
    ) -> NativeResult<()> {
        let handles = self.children(BleCall::ForeachDescriptors, characteristic, |node| match node {
            Node::Characteristic { descriptors, .. } => Some(descriptors.clone()),
            _ => None,
        })?;
        for handle in handles {
            if !visitor(handle) {
                break;
            }
        }
        Ok(())
    }

    fn characteristic_properties(&self, characteristic: NativeHandle) -> NativeResult<u32> {
        self.record(BleCall::CharacteristicProperties)?;
        match self.state.lock().unwrap().nodes.get(&characteristic) {
            Some(Node::Characteristic { properties, .. }) => Ok(*properties),
            _ => Err(BtError::InvalidParameter),
        }
    }

    fn set_value_changed_cb(&self, characteristic: NativeHandle) -> NativeResult<()> {
        self.record(BleCall::SetValueChangedCb)?;
        self.state.lock().unwrap().value_cbs.insert(characteristic);
        Ok(())
    }

    fn unset_value_changed_cb(&self, characteristic: NativeHandle) -> NativeResult<()> {
        self.record(BleCall::UnsetValueChangedCb)?;
        self.state.lock().unwrap().value_cbs.remove(&characteristic);
        Ok(())
    }

    fn read_value(&self, attribute: NativeHandle, request: RequestId) -> NativeResult<()> {
        self.record(BleCall::ReadValue)?;
        self.state.lock().unwrap().pending_reads.push((attribute, request));
        Ok(())
    }

    fn set_value(&self, attribute: NativeHandle, new_value: &[u8]) -> NativeResult<()> {
        self.record(BleCall::SetValue)?;
        match self.state.lock().unwrap().nodes.get_mut(&attribute) {
            Some(Node::Characteristic { value, .. }) | Some(Node::Descriptor { value, .. }) => {
                *value = new_value.to_vec();
                Ok(())
            }
            _ => Err(BtError::InvalidParameter),
        }
    }

    fn write_value(&self, attribute: NativeHandle, request: RequestId) -> NativeResult<()> {
        self.record(BleCall::WriteValue)?;
        self.state.lock().unwrap().pending_writes.push((attribute, request));
        Ok(())
    }

    fn advertiser_create(&self) -> NativeResult<NativeHandle> {
        self.record(BleCall::AdvertiserCreate)?;
        let mut state = self.state.lock().unwrap();
        let handle = state.allocate();
        state.advertisers.insert(handle, FakeAdvertiser::default());
        Ok(handle)
    }

    fn advertiser_destroy(&self, advertiser: NativeHandle) -> NativeResult<()> {
        self.record(BleCall::AdvertiserDestroy)?;
        self.state
            .lock()
            .unwrap()
            .advertisers
            .remove(&advertiser)
            .map(|_| ())
            .ok_or(BtError::InvalidParameter)
    }

    fn advertiser_set_device_name(
        &self, advertiser: NativeHandle, _packet: PacketType, _include: bool,
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserSetDeviceName, advertiser, |_| ())
    }

    fn advertiser_add_service_uuid(
        &self, advertiser: NativeHandle, _packet: PacketType, uuid: &str,
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserAddServiceUuid, advertiser, |advertiser| {
            advertiser.service_uuids.push(uuid.to_string())
        })
    }

    fn advertiser_add_solicitation_uuid(
        &self, advertiser: NativeHandle, _packet: PacketType, _uuid: &str,
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserAddSolicitationUuid, advertiser, |_| ())
    }

    fn advertiser_set_appearance(
        &self, advertiser: NativeHandle, _packet: PacketType, _appearance: u32,
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserSetAppearance, advertiser, |_| ())
    }

    fn advertiser_set_tx_power_level(
        &self, advertiser: NativeHandle, _packet: PacketType, _include: bool,
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserSetTxPowerLevel, advertiser, |_| ())
    }

    fn advertiser_add_service_data(
        &self, advertiser: NativeHandle, _packet: PacketType, _uuid: &str, _data: &[u8],
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserAddServiceData, advertiser, |_| ())
    }

    fn advertiser_add_manufacturer_data(
        &self, advertiser: NativeHandle, _packet: PacketType, _id: u16, _data: &[u8],
    ) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserAddManufacturerData, advertiser, |_| ())
    }

    fn advertiser_set_mode(&self, advertiser: NativeHandle, _mode: AdvertisingMode) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserSetMode, advertiser, |_| ())
    }

    fn advertiser_set_connectable(&self, advertiser: NativeHandle, _connectable: bool) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserSetConnectable, advertiser, |_| ())
    }

    fn advertiser_start(&self, advertiser: NativeHandle) -> NativeResult<()> {
        self.with_advertiser(BleCall::AdvertiserStart, advertiser, |advertiser| advertiser.started = true)
    }

    fn advertiser_stop(&self, advertiser: NativeHandle) -> NativeResult<()> {
        self.record(BleCall::AdvertiserStop)?;
        let mut state = self.state.lock().unwrap();
        let advertiser = state.advertisers.get_mut(&advertiser).ok_or(BtError::InvalidParameter)?;
        if !advertiser.started {
            return Err(BtError::NotInProgress);
        }
        advertiser.started = false;
        Ok(())
    }
}
