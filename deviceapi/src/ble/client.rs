use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use log::{debug, warn};

use crate::ble::adapter::LeAdapterInner;
use crate::ble::{BleBackend, LowEnergyAdapter};
use crate::handle::{HandleWrapper, ReleaseHooks};
use crate::{Address, NativeHandle, Result};

// GATT clients are shared between every service obtained for the same
// remote address. The adapter's `clients` map keeps one bookkeeping copy of
// each wrapper and the GATT objects handed out hold the others.
struct ClientReleaseHooks {
    adapter: Weak<LeAdapterInner>,
    backend: Arc<dyn BleBackend>,
}

impl ReleaseHooks for ClientReleaseHooks {
    fn unreferenced(&self, handle: NativeHandle) {
        // Gone when the adapter itself is being torn down, in which case the
        // map is being emptied anyway
        let adapter = match self.adapter.upgrade() {
            Some(adapter) => adapter,
            None => return,
        };
        let address = match self.backend.client_remote_address(handle) {
            Ok(address) => Address::from(address.as_str()),
            Err(err) => {
                warn!("Failed to get the remote address of client {}: {}", handle, err);
                return;
            }
        };
        let removed = adapter
            .clients
            .remove_if(&address, |_, client| client.handle() == handle);
        match removed {
            Some((_, client)) => {
                debug!("Removing client {} of {}", handle, address);
                // Dropping the last copy outside of the map destroys the client
                drop(client);
            }
            None => warn!("Client not found"),
        }
    }

    fn destroy(&self, handle: NativeHandle) -> Result<()> {
        debug!("Destroying client {}", handle);
        self.backend
            .client_destroy(handle)
            .map_err(|err| err.into_error("Failed to destroy the GATT client's handle"))
    }
}

impl LowEnergyAdapter {
    /// Returns the shared client for `address`, creating it if needed
    pub(crate) fn get_client(&self, address: &str) -> Result<HandleWrapper> {
        let key = Address::from(address);
        match self.clients.entry(key) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let handle = self
                    .backend
                    .client_create(address)
                    .map_err(|err| err.into_error("Failed to create the GATT client's handle"))?;
                debug!("Created client {} for {}", handle, address);
                let client = HandleWrapper::acquire(
                    handle,
                    Box::new(ClientReleaseHooks {
                        adapter: self.downgrade(),
                        backend: self.backend.clone(),
                    }),
                );
                let shared = client.clone();
                entry.insert(client);
                Ok(shared)
            }
        }
    }
}
