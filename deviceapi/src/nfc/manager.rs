use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use function_name::named;
use log::{debug, trace, warn};

use crate::context::ContextObserver;
use crate::dispatch::Dispatcher;
use crate::nfc::adapter::NfcAdapter;
use crate::nfc::{NfcBackend, NfcError, NfcFeature};
use crate::privilege::{self, PrivilegeGate};
use crate::{Error, Result};

/// The initialized native NFC library. Deinitialized when the last of the
/// manager, the adapter and the tags and peers it handed out is dropped.
pub(crate) struct NfcLibrary {
    backend: Arc<dyn NfcBackend>,
    exclusive: AtomicBool,
}

impl NfcLibrary {
    fn initialize(backend: Arc<dyn NfcBackend>) -> Option<Arc<NfcLibrary>> {
        match backend.initialize() {
            Ok(()) => Some(Arc::new(NfcLibrary {
                backend,
                exclusive: AtomicBool::new(false),
            })),
            Err(err) => {
                log::error!("nfc_manager_initialize failed: {}", err);
                None
            }
        }
    }
}

impl Drop for NfcLibrary {
    #[named]
    fn drop(&mut self) {
        trace!("{}: deinitializing NFC", function_name!());
        if *self.exclusive.get_mut() {
            if let Err(err) = self.backend.set_system_handler_enable(true) {
                warn!("Failed to give tags back to the system handler: {}", err);
            }
        }
        if let Err(err) = self.backend.deinitialize() {
            log::error!("nfc_manager_deinitialize failed: {}", err);
        }
    }
}

struct ManagerInner {
    backend: Arc<dyn NfcBackend>,
    gate: Arc<dyn PrivilegeGate>,
    library: Option<Arc<NfcLibrary>>,
    adapter: Option<NfcAdapter>,
}

/// Entry point of the NFC subsystem, owns the native library's lifetime.
#[derive(Clone)]
pub struct NfcManager {
    inner: Arc<ManagerInner>,
}

impl NfcManager {
    /// Initializes the native library. A failure is logged and leaves the
    /// manager unusable rather than failing construction.
    pub fn new(backend: Arc<dyn NfcBackend>, dispatcher: Dispatcher, gate: Arc<dyn PrivilegeGate>) -> Self {
        let library = NfcLibrary::initialize(backend.clone());
        let adapter = match &library {
            Some(library) if backend.is_supported(NfcFeature::Nfc) => Some(NfcAdapter::with_library(
                backend.clone(),
                dispatcher,
                gate.clone(),
                Some(library.clone()),
            )),
            _ => None,
        };
        debug!("NFC manager created, initialized = {}", library.is_some());

        NfcManager {
            inner: Arc::new(ManagerInner {
                backend,
                gate,
                library,
                adapter,
            }),
        }
    }

    pub(crate) fn as_observer(&self) -> Option<Weak<dyn ContextObserver>> {
        self.inner.adapter.as_ref().map(|adapter| adapter.as_observer())
    }

    #[named]
    pub fn default_adapter(&self) -> Result<NfcAdapter> {
        trace!("{}", function_name!());
        self.inner.gate.check(privilege::NFC_COMMON)?;

        if self.inner.library.is_none() {
            return Err(NfcError::NotInitialized.to_error());
        }
        self.inner
            .adapter
            .clone()
            .ok_or_else(|| Error::NotSupported("Not Support".to_string()))
    }

    /// While set, tags and peers go to this application instead of the
    /// system handler
    #[named]
    pub fn set_exclusive_mode(&self, mode: bool) -> Result<()> {
        trace!("{}: {}", function_name!(), mode);
        self.inner.gate.check(privilege::NFC_COMMON)?;

        let library = self
            .inner
            .library
            .as_ref()
            .ok_or_else(|| NfcError::NotInitialized.to_error())?;
        self.inner
            .backend
            .set_system_handler_enable(!mode)
            .map_err(|err| err.into_error("Failed to set exclusive mode."))?;
        library.exclusive.store(mode, Ordering::Release);
        Ok(())
    }

    pub fn is_exclusive(&self) -> bool {
        match &self.inner.library {
            Some(library) => library.exclusive.load(Ordering::Acquire),
            None => false,
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        trace!("Dropping NFC manager");
        // The library itself goes with its last user
        if let Some(adapter) = self.adapter.take() {
            if let Err(err) = adapter.unset_tag_listener() {
                debug!("Failed to unset tag listener: {}", err);
            }
            if let Err(err) = adapter.unset_peer_listener() {
                debug!("Failed to unset peer listener: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Listener;
    use crate::context::ContextManager;
    use crate::dispatch::idle_queue;
    use crate::fake::nfc::{FakeNfcBackend, FakeTag, NfcCall};
    use crate::nfc::{TagEvent, TagType};
    use crate::privilege::AllowAll;

    fn manager(fake: &Arc<FakeNfcBackend>) -> NfcManager {
        let _ = env_logger::builder().is_test(true).try_init();
        let (dispatcher, _event_loop) = idle_queue();
        NfcManager::new(fake.clone(), dispatcher, Arc::new(AllowAll))
    }

    #[test]
    fn initializes_and_deinitializes() {
        let fake = Arc::new(FakeNfcBackend::new());
        let manager = manager(&fake);
        assert!(fake.is_initialized());
        let adapter = manager.default_adapter().unwrap();
        assert_eq!(adapter, manager.default_adapter().unwrap());

        let ctx = ContextManager::new().create();
        let (listener, _rx) = Listener::channel(&ctx);
        adapter.set_tag_listener(&[], listener).unwrap();
        drop(adapter);

        drop(manager);
        assert!(!fake.has_tag_cb());
        assert!(!fake.is_initialized());
    }

    #[test]
    fn missing_nfc_is_not_supported() {
        let fake = Arc::new(FakeNfcBackend::new());
        fake.unsupport(NfcFeature::Nfc);
        let err = manager(&fake).default_adapter().unwrap_err();
        assert_eq!(err, Error::NotSupported("Not Support".to_string()));
    }

    #[test]
    fn failed_initialization_leaves_manager_unusable() {
        let fake = Arc::new(FakeNfcBackend::new());
        fake.fail(NfcCall::Initialize, NfcError::OperationFailed);
        let manager = manager(&fake);
        assert!(matches!(manager.default_adapter(), Err(Error::Unknown(_))));
        drop(manager);
        assert_eq!(fake.count(NfcCall::Deinitialize), 0);
    }

    #[test]
    fn library_outlives_manager_while_tags_remain() {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeNfcBackend::new());
        let (dispatcher, mut event_loop) = idle_queue();
        let manager = NfcManager::new(fake.clone(), dispatcher, Arc::new(AllowAll));
        let adapter = manager.default_adapter().unwrap();

        let ctx = ContextManager::new().create();
        let (listener, mut rx) = Listener::channel(&ctx);
        adapter.set_tag_listener(&[], listener).unwrap();
        fake.attach_tag(FakeTag { tag_type: TagType::MifareUltra, ..Default::default() });
        event_loop.run_until_idle();
        let tag = match rx.try_recv().unwrap() {
            TagEvent::Attached(tag) => tag,
            other => panic!("unexpected {:?}", other),
        };
        drop(adapter);

        drop(manager);
        assert!(!fake.has_tag_cb());
        assert!(fake.is_initialized());
        assert_eq!(tag.tag_type().unwrap(), TagType::MifareUltra);

        drop(tag);
        assert!(!fake.is_initialized());
        assert_eq!(fake.count(NfcCall::Deinitialize), 1);
    }

    #[test]
    fn exclusive_mode_toggles_system_handler() {
        let fake = Arc::new(FakeNfcBackend::new());
        let manager = manager(&fake);
        manager.set_exclusive_mode(true).unwrap();
        assert!(!fake.system_handler_enabled());
        assert!(manager.is_exclusive());

        fake.fail(NfcCall::SetSystemHandlerEnable, NfcError::IllegalState);
        let err = manager.set_exclusive_mode(false).unwrap_err();
        assert_eq!(err, Error::Unknown("Failed to set exclusive mode.".to_string()));

        fake.clear_failures();
        drop(manager);
        // Teardown hands tags back to the system
        assert!(fake.system_handler_enabled());
    }
}
