use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::ble::adapter::ValueRoute;
use crate::ble::attribute::GattAttribute;
use crate::ble::descriptor::GattDescriptor;
use crate::ble::LowEnergyAdapter;
use crate::callback::{Listener, Reply};
use crate::context::{ContextId, ScriptContext};
use crate::dispatch::Dispatcher;
use crate::handle::HandleWrapper;
use crate::privilege;
use crate::registry::CallbackRegistry;
use crate::{ListenerId, NativeHandle, Result};

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

pub(crate) struct CharacteristicInner {
    attribute: GattAttribute,
    instance: u64,
    properties: CharacteristicProperties,
    descriptors: Arc<Vec<GattDescriptor>>,
    listeners: CallbackRegistry<Listener<Vec<u8>>>,
}

impl CharacteristicInner {
    pub(crate) fn broadcast_value(&self, dispatcher: &Dispatcher, value: &[u8]) {
        let notified = self.listeners.broadcast_all(|_, listener| {
            dispatcher.notify("gatt value changed", listener, value.to_vec());
        });
        trace!("Value change of {} sent to {} listeners", self.attribute.handle, notified);
    }

    pub(crate) fn forget_context(&self, context: ContextId) {
        self.listeners.remove_where(|listener| listener.context().id() == context);
    }
}

impl Drop for CharacteristicInner {
    fn drop(&mut self) {
        let adapter = &self.attribute.adapter;
        let handle = self.attribute.handle;
        let instance = self.instance;
        // A newer wrapper for the same handle owns the route now
        if adapter
            .value_routes
            .remove_if(&handle, |_, route| route.instance == instance)
            .is_some()
        {
            if let Err(err) = adapter.backend.unset_value_changed_cb(handle) {
                warn!("Failed to unset value changed callback of {}: {}", handle, err);
            }
        }
    }
}

/// A characteristic of a remote GATT service.
///
/// Properties and descriptors are read once, when the characteristic is
/// first enumerated.
#[derive(Clone)]
pub struct GattCharacteristic {
    inner: Arc<CharacteristicInner>,
}

impl fmt::Debug for GattCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattCharacteristic")
            .field("handle", &self.inner.attribute.handle)
            .field("properties", &self.inner.properties)
            .finish()
    }
}

impl GattCharacteristic {
    pub(crate) fn new(adapter: LowEnergyAdapter, client: HandleWrapper, handle: NativeHandle) -> Self {
        let backend = adapter.backend.clone();

        let mut handles = Vec::new();
        if let Err(err) = backend.foreach_descriptors(handle, &mut |descriptor| {
            handles.push(descriptor);
            true
        }) {
            log::error!("Failed to get descriptors of {}: {}", handle, err);
        }
        let descriptors = handles
            .into_iter()
            .map(|descriptor| GattDescriptor::new(adapter.clone(), client.clone(), descriptor))
            .collect();

        let properties = match backend.characteristic_properties(handle) {
            Ok(bits) => CharacteristicProperties::from_bits_truncate(bits),
            Err(err) => {
                log::error!("Failed to get properties of {}: {}", handle, err);
                CharacteristicProperties::NONE
            }
        };

        let instance = adapter.next_instance.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(CharacteristicInner {
            attribute: GattAttribute::new(adapter.clone(), client, handle),
            instance,
            properties,
            descriptors: Arc::new(descriptors),
            listeners: CallbackRegistry::new(),
        });

        adapter.value_routes.insert(
            handle,
            ValueRoute {
                instance,
                characteristic: Arc::downgrade(&inner),
            },
        );
        if let Err(err) = backend.set_value_changed_cb(handle) {
            log::error!("Failed to set value changed callback of {}: {}", handle, err);
        }
        debug!("Characteristic {} ready, properties {:?}", handle, properties);

        GattCharacteristic { inner }
    }

    pub fn uuid(&self) -> Result<String> {
        self.inner.attribute.uuid()
    }

    pub fn properties(&self) -> CharacteristicProperties {
        self.inner.properties
    }

    pub fn is_broadcast(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::BROADCAST)
    }
    pub fn has_extended_properties(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::EXTENDED_PROPERTIES)
    }
    pub fn is_notify(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::NOTIFY)
    }
    pub fn is_indication(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::INDICATE)
    }
    pub fn is_readable(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::READ)
    }
    pub fn is_signed_write(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::AUTHENTICATED_SIGNED_WRITES)
    }
    pub fn is_writable(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::WRITE)
    }
    pub fn is_write_no_response(&self) -> bool {
        self.inner.properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE)
    }

    pub fn descriptors(&self) -> Arc<Vec<GattDescriptor>> {
        self.inner.descriptors.clone()
    }

    pub fn read_value(&self, reply: Reply<Vec<u8>>) -> Result<()> {
        self.inner.attribute.read_value(reply)
    }

    pub fn write_value(&self, value: &[u8], reply: Reply<()>) -> Result<()> {
        self.inner.attribute.write_value(value, reply)
    }

    pub async fn read(&self, context: &ScriptContext) -> Result<Vec<u8>> {
        self.inner.attribute.read(context).await
    }

    pub async fn write(&self, context: &ScriptContext, value: &[u8]) -> Result<()> {
        self.inner.attribute.write(context, value).await
    }

    /// Registers for value change notifications of this characteristic,
    /// returning the id to remove the listener with.
    pub fn add_value_change_listener(&self, listener: Listener<Vec<u8>>) -> Result<ListenerId> {
        self.inner.attribute.adapter.gate.check(privilege::BLUETOOTH_ADMIN)?;
        let id = self.inner.listeners.subscribe(listener);
        debug!("Value change listener {} added to {}", id, self.inner.attribute.handle);
        Ok(id)
    }

    pub fn remove_value_change_listener(&self, id: ListenerId) -> Result<()> {
        self.inner.attribute.adapter.gate.check(privilege::BLUETOOTH_ADMIN)?;
        if !self.inner.listeners.unsubscribe(id) {
            debug!("No value change listener {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BtError;
    use crate::context::ContextManager;
    use crate::dispatch::idle_queue;
    use crate::fake::ble::{BleCall, FakeBleBackend, FakeCharacteristic};
    use crate::privilege::AllowAll;
    use crate::Error;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";
    const HEART_RATE: &str = "180d";
    const MEASUREMENT: &str = "2a37";

    fn setup(fake: &Arc<FakeBleBackend>) -> (LowEnergyAdapter, crate::EventLoop) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (dispatcher, event_loop) = idle_queue();
        let adapter = LowEnergyAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll)).unwrap();
        fake.emit_connection_state(ADDR, Ok(()), true);
        (adapter, event_loop)
    }

    fn heart_rate_fake() -> (Arc<FakeBleBackend>, NativeHandle) {
        let fake = Arc::new(FakeBleBackend::new());
        let service = fake.add_service(ADDR, HEART_RATE);
        let characteristic = fake.add_characteristic(
            service,
            FakeCharacteristic {
                uuid: MEASUREMENT.to_string(),
                properties: 0x12,
                descriptors: vec!["2902".to_string()],
                value: vec![0x00, 0x48],
            },
        );
        (fake, characteristic)
    }

    #[test]
    fn properties_and_descriptors() {
        let (fake, _) = heart_rate_fake();
        let (adapter, _event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let characteristics = service.characteristics().unwrap();
        let measurement = &characteristics[0];

        assert_eq!(measurement.uuid().unwrap(), MEASUREMENT);
        assert!(measurement.is_notify());
        assert!(measurement.is_readable());
        assert!(!measurement.is_writable());
        assert!(!measurement.is_indication());
        let descriptors = measurement.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].uuid().unwrap(), "2902");
    }

    #[test]
    fn listener_ids_match_stored_entries() {
        let (fake, characteristic) = heart_rate_fake();
        let (adapter, mut event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let measurement = service.characteristics().unwrap()[0].clone();

        let contexts = ContextManager::new();
        let ctx = contexts.create();
        let (first, mut first_rx) = Listener::channel(&ctx);
        let (second, mut second_rx) = Listener::channel(&ctx);
        let first_id = measurement.add_value_change_listener(first).unwrap();
        let second_id = measurement.add_value_change_listener(second).unwrap();
        assert_ne!(first_id, second_id);

        fake.emit_value_changed(characteristic, vec![0x00, 0x50]);
        event_loop.run_until_idle();
        assert_eq!(first_rx.try_recv().unwrap(), vec![0x00, 0x50]);
        assert_eq!(second_rx.try_recv().unwrap(), vec![0x00, 0x50]);

        // Removing by the returned id removes exactly that listener
        measurement.remove_value_change_listener(first_id).unwrap();
        fake.emit_value_changed(characteristic, vec![0x00, 0x51]);
        event_loop.run_until_idle();
        assert!(first_rx.try_recv().is_err());
        assert_eq!(second_rx.try_recv().unwrap(), vec![0x00, 0x51]);
    }

    #[test]
    fn dropping_last_copy_unsets_native_callback() {
        let (fake, characteristic) = heart_rate_fake();
        let (adapter, _event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let characteristics = service.characteristics().unwrap();
        assert!(fake.has_value_changed_cb(characteristic));

        drop(characteristics);
        // The service still caches its list
        assert!(fake.has_value_changed_cb(characteristic));
        drop(service);
        assert!(!fake.has_value_changed_cb(characteristic));
        assert_eq!(fake.count(BleCall::UnsetValueChangedCb), 1);
    }

    #[test]
    fn read_completes_through_request_table() {
        let (fake, _) = heart_rate_fake();
        let (adapter, mut event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let measurement = service.characteristics().unwrap()[0].clone();
        let contexts = ContextManager::new();
        let ctx = contexts.create();

        let (reply, mut rx) = Reply::channel(&ctx);
        measurement.read_value(reply).unwrap();
        assert_eq!(fake.complete_pending_reads(), 1);
        event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(vec![0x00, 0x48]));
    }

    #[test]
    fn write_stages_value_first() {
        let (fake, characteristic) = heart_rate_fake();
        let (adapter, mut event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let measurement = service.characteristics().unwrap()[0].clone();
        let contexts = ContextManager::new();
        let ctx = contexts.create();

        let (reply, mut rx) = Reply::channel(&ctx);
        measurement.write_value(&[0x01], reply).unwrap();
        assert_eq!(fake.value_of(characteristic), vec![0x01]);
        assert_eq!(fake.complete_pending_writes(), 1);
        event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn read_errors() {
        let (fake, _) = heart_rate_fake();
        let (adapter, mut event_loop) = setup(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, HEART_RATE).unwrap();
        let measurement = service.characteristics().unwrap()[0].clone();
        let contexts = ContextManager::new();
        let ctx = contexts.create();

        fake.fail(BleCall::ReadValue, BtError::NotEnabled);
        let (reply, _rx) = Reply::channel(&ctx);
        assert_eq!(
            measurement.read_value(reply).unwrap_err(),
            Error::InvalidState("LE is currently not enabled".to_string())
        );

        fake.fail(BleCall::ReadValue, BtError::OperationFailed);
        let (reply, mut rx) = Reply::channel(&ctx);
        measurement.read_value(reply).unwrap();
        event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Err(Error::Unknown("Operation failed".to_string())));
        assert!(adapter.requests.is_empty());
    }
}
