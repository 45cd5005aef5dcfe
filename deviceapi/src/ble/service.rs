use std::fmt;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use log::{debug, trace};

use crate::ble::attribute::GattAttribute;
use crate::ble::characteristic::GattCharacteristic;
use crate::ble::{LowEnergyAdapter, NativeResult};
use crate::handle::HandleWrapper;
use crate::{NativeHandle, Result};

struct ServiceInner {
    attribute: GattAttribute,
    uuid: StdMutex<Option<String>>,

    // Populated by the first successful enumeration and never invalidated
    services: StdMutex<Option<Arc<Vec<GattService>>>>,
    characteristics: StdMutex<Option<Arc<Vec<GattCharacteristic>>>>,
}

/// A primary or included service on a remote GATT server.
///
/// Its included services and characteristics are enumerated on first use,
/// every later call returns the same cached list.
#[derive(Clone)]
pub struct GattService {
    inner: Arc<ServiceInner>,
}

impl PartialEq for GattService {
    fn eq(&self, other: &GattService) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for GattService {}

impl fmt::Debug for GattService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattService")
            .field("handle", &self.inner.attribute.handle)
            .field("uuid", &*self.inner.uuid.lock().unwrap())
            .finish()
    }
}

fn enumerate(
    foreach: impl FnOnce(&mut dyn FnMut(NativeHandle) -> bool) -> NativeResult<()>,
) -> NativeResult<Vec<NativeHandle>> {
    let mut handles = Vec::new();
    foreach(&mut |handle| {
        handles.push(handle);
        true
    })?;
    Ok(handles)
}

impl GattService {
    pub(crate) fn new(adapter: LowEnergyAdapter, client: HandleWrapper, handle: NativeHandle) -> Self {
        GattService {
            inner: Arc::new(ServiceInner {
                attribute: GattAttribute::new(adapter, client, handle),
                uuid: StdMutex::new(None),
                services: StdMutex::new(None),
                characteristics: StdMutex::new(None),
            }),
        }
    }

    /// The service UUID as reported by the native layer
    pub fn uuid(&self) -> Result<String> {
        let mut cached = self.inner.uuid.lock().unwrap();
        if let Some(uuid) = &*cached {
            return Ok(uuid.clone());
        }
        let uuid = self.inner.attribute.uuid()?;
        *cached = Some(uuid.clone());
        Ok(uuid)
    }

    pub fn services(&self) -> Result<Arc<Vec<GattService>>> {
        let mut cached = self.inner.services.lock().unwrap();
        if let Some(services) = &*cached {
            return Ok(services.clone());
        }

        let attribute = &self.inner.attribute;
        let backend = attribute.adapter.backend.clone();
        let handles = enumerate(|visitor| backend.foreach_included_services(attribute.handle, visitor))
            .map_err(|err| err.into_error("Failed to set a service's GATT callback"))?;
        trace!("Service {} includes {} services", attribute.handle, handles.len());

        let services: Arc<Vec<GattService>> = Arc::new(
            handles
                .into_iter()
                .map(|handle| GattService::new(attribute.adapter.clone(), attribute.client.clone(), handle))
                .collect(),
        );
        *cached = Some(services.clone());
        Ok(services)
    }

    pub fn characteristics(&self) -> Result<Arc<Vec<GattCharacteristic>>> {
        let mut cached = self.inner.characteristics.lock().unwrap();
        if let Some(characteristics) = &*cached {
            return Ok(characteristics.clone());
        }

        let attribute = &self.inner.attribute;
        let backend = attribute.adapter.backend.clone();
        let handles = enumerate(|visitor| backend.foreach_characteristics(attribute.handle, visitor))
            .map_err(|err| err.into_error("Failed to get characteristics list"))?;
        debug!("Service {} has {} characteristics", attribute.handle, handles.len());

        let characteristics: Arc<Vec<GattCharacteristic>> = Arc::new(
            handles
                .into_iter()
                .map(|handle| {
                    GattCharacteristic::new(attribute.adapter.clone(), attribute.client.clone(), handle)
                })
                .collect(),
        );
        *cached = Some(characteristics.clone());
        Ok(characteristics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::BtError;
    use crate::dispatch::idle_queue;
    use crate::fake::ble::{BleCall, FakeBleBackend, FakeCharacteristic};
    use crate::privilege::AllowAll;
    use crate::Error;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    fn characteristic(uuid: &str) -> FakeCharacteristic {
        FakeCharacteristic {
            uuid: uuid.to_string(),
            properties: 0x02,
            descriptors: Vec::new(),
            value: Vec::new(),
        }
    }

    fn adapter(fake: &Arc<FakeBleBackend>) -> LowEnergyAdapter {
        let (dispatcher, _event_loop) = idle_queue();
        let adapter = LowEnergyAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll)).unwrap();
        fake.emit_connection_state(ADDR, Ok(()), true);
        adapter
    }

    #[test]
    fn characteristics_are_enumerated_once() {
        let fake = Arc::new(FakeBleBackend::new());
        let service_handle = fake.add_service(ADDR, "180f");
        fake.add_characteristic(service_handle, characteristic("2a19"));
        let adapter = adapter(&fake);

        let service = adapter.get_specified_gatt_service(ADDR, "180f").unwrap();
        let first = service.characteristics().unwrap();
        assert_eq!(first.len(), 1);

        // Changes on the native side aren't picked up
        fake.add_characteristic(service_handle, characteristic("2a1a"));
        let second = service.characteristics().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fake.count(BleCall::ForeachCharacteristics), 1);
    }

    #[test]
    fn failed_enumeration_is_retried() {
        let fake = Arc::new(FakeBleBackend::new());
        let service_handle = fake.add_service(ADDR, "180f");
        fake.add_characteristic(service_handle, characteristic("2a19"));
        let adapter = adapter(&fake);
        let service = adapter.get_specified_gatt_service(ADDR, "180f").unwrap();

        fake.fail(BleCall::ForeachCharacteristics, BtError::OperationFailed);
        let err = service.characteristics().unwrap_err();
        assert_eq!(err, Error::Unknown("Failed to get characteristics list : Operation failed".to_string()));

        fake.clear_failures();
        assert_eq!(service.characteristics().unwrap().len(), 1);
    }

    #[test]
    fn included_services_share_the_client() {
        let fake = Arc::new(FakeBleBackend::new());
        let primary = fake.add_service(ADDR, "1812");
        fake.add_included_service(primary, "180f");
        let adapter = adapter(&fake);

        let service = adapter.get_specified_gatt_service(ADDR, "1812").unwrap();
        let included = service.services().unwrap();
        assert_eq!(included.len(), 1);
        assert_eq!(included[0].uuid().unwrap(), "180f");
        assert!(Arc::ptr_eq(&included, &service.services().unwrap()));
        assert_eq!(fake.created_clients().len(), 1);

        drop(service);
        // The included service alone keeps the client alive
        assert!(fake.destroyed_clients().is_empty());
        drop(included);
        assert_eq!(fake.destroyed_clients().len(), 1);
    }
}
