use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use function_name::named;
use log::{debug, trace};

use crate::ble::{BleBackend, LowEnergyAdapter};
use crate::context::ContextManager;
use crate::dispatch::{idle_queue, Dispatcher, EventLoop};
use crate::fake::ble::FakeBleBackend;
use crate::fake::nfc::FakeNfcBackend;
use crate::nfc::{NfcBackend, NfcManager};
use crate::privilege::{AllowAll, PrivilegeGate};
use crate::{Error, Result};

/// Who drives the session's event loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopMode {
    /// The loop runs as a task on the current tokio runtime
    Spawn,
    /// The loop is handed out through [`Session::take_event_loop`] and the
    /// host pumps it
    Manual,
}

impl Default for LoopMode {
    fn default() -> Self {
        LoopMode::Spawn
    }
}

pub struct SessionConfig {
    ble_backend: Option<Arc<dyn BleBackend>>,
    nfc_backend: Option<Arc<dyn NfcBackend>>,
    gate: Option<Arc<dyn PrivilegeGate>>,
    loop_mode: LoopMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            ble_backend: None,
            nfc_backend: None,
            gate: None,
            loop_mode: LoopMode::default(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Without a backend the session runs against an in-memory fake
    pub fn set_ble_backend(&mut self, backend: Arc<dyn BleBackend>) -> &mut Self {
        self.ble_backend = Some(backend);
        self
    }

    pub fn set_nfc_backend(&mut self, backend: Arc<dyn NfcBackend>) -> &mut Self {
        self.nfc_backend = Some(backend);
        self
    }

    pub fn set_privilege_gate(&mut self, gate: Arc<dyn PrivilegeGate>) -> &mut Self {
        self.gate = Some(gate);
        self
    }

    pub fn set_loop_mode(&mut self, mode: LoopMode) -> &mut Self {
        self.loop_mode = mode;
        self
    }

    pub fn start(self) -> Result<Session> {
        Session::start(self)
    }
}

pub struct SessionInner {
    dispatcher: Dispatcher,
    event_loop: StdMutex<Option<EventLoop>>,
    contexts: ContextManager,
    ble_backend: Arc<dyn BleBackend>,
    nfc_backend: Arc<dyn NfcBackend>,
    gate: Arc<dyn PrivilegeGate>,
    le_adapter: StdMutex<Option<LowEnergyAdapter>>,
    nfc_manager: StdMutex<Option<NfcManager>>,
}

/// Owns one event loop and the subsystem singletons that post to it.
///
/// Subsystems are created on first use and live until the session is
/// dropped. Every subsystem is registered with [`Session::contexts`] so that
/// unloading a script context drops the registrations made from it.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}
impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for Session {}
impl Deref for Session {
    type Target = SessionInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("contexts", &self.contexts.len()).finish()
    }
}

impl Session {
    #[named]
    fn start(config: SessionConfig) -> Result<Session> {
        trace!("{}", function_name!());
        let (dispatcher, event_loop) = idle_queue();

        let event_loop = match config.loop_mode {
            LoopMode::Spawn => {
                let runtime = tokio::runtime::Handle::try_current()
                    .map_err(|_| Error::InvalidState("Spawned event loop needs a tokio runtime".to_string()))?;
                runtime.spawn(event_loop.run());
                None
            }
            LoopMode::Manual => Some(event_loop),
        };

        let ble_backend = config
            .ble_backend
            .unwrap_or_else(|| Arc::new(FakeBleBackend::new()));
        let nfc_backend = config
            .nfc_backend
            .unwrap_or_else(|| Arc::new(FakeNfcBackend::new()));
        let gate = config.gate.unwrap_or_else(|| Arc::new(AllowAll));

        debug!("Session started, loop mode = {:?}", config.loop_mode);
        Ok(Session {
            inner: Arc::new(SessionInner {
                dispatcher,
                event_loop: StdMutex::new(event_loop),
                contexts: ContextManager::new(),
                ble_backend,
                nfc_backend,
                gate,
                le_adapter: StdMutex::new(None),
                nfc_manager: StdMutex::new(None),
            }),
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    /// Only available once, and only in [`LoopMode::Manual`]
    pub fn take_event_loop(&self) -> Option<EventLoop> {
        self.event_loop.lock().unwrap().take()
    }

    /// The LE adapter, created on first call
    #[named]
    pub fn low_energy_adapter(&self) -> Result<LowEnergyAdapter> {
        trace!("{}", function_name!());
        let mut slot = self.le_adapter.lock().unwrap();
        if let Some(adapter) = slot.as_ref() {
            return Ok(adapter.clone());
        }

        let adapter = LowEnergyAdapter::new(self.ble_backend.clone(), self.dispatcher.clone(), self.gate.clone())?;
        self.contexts.add_observer(adapter.as_observer());
        *slot = Some(adapter.clone());
        Ok(adapter)
    }

    /// The NFC manager, created (and the native library initialized) on
    /// first call
    #[named]
    pub fn nfc_manager(&self) -> NfcManager {
        trace!("{}", function_name!());
        let mut slot = self.nfc_manager.lock().unwrap();
        if let Some(manager) = slot.as_ref() {
            return manager.clone();
        }

        let manager = NfcManager::new(self.nfc_backend.clone(), self.dispatcher.clone(), self.gate.clone());
        if let Some(observer) = manager.as_observer() {
            self.contexts.add_observer(observer);
        }
        *slot = Some(manager.clone());
        manager
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        trace!("Tearing down session");
        self.contexts.unload_all();
        self.le_adapter.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        self.nfc_manager.get_mut().unwrap_or_else(PoisonError::into_inner).take();
    }
}
