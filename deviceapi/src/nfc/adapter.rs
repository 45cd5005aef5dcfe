use std::fmt;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use function_name::named;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::callback::{Listener, Reply};
use crate::context::{ContextId, ContextObserver, ScriptContext};
use crate::dispatch::Dispatcher;
use crate::nfc::manager::NfcLibrary;
use crate::nfc::ndef::NdefMessage;
use crate::nfc::peer::{NfcPeer, PeerInner};
use crate::nfc::tag::NfcTag;
use crate::nfc::{
    CardEmulationCategory, CardEmulationMode, HceEventType, NfcBackend, NfcError, NfcEvent, NfcEventSink, NfcFeature,
    NfcResult, SeEventKind, SecureElementType, TagType,
};
use crate::pending::PendingOperationTable;
use crate::privilege::{self, PrivilegeGate};
use crate::registry::CallbackRegistry;
use crate::{Error, ListenerId, NativeHandle, RequestId, Result};

#[derive(Clone, Debug)]
pub enum TagEvent {
    Attached(NfcTag),
    Detached,
}

#[derive(Clone, Debug)]
pub enum PeerEvent {
    Attached(NfcPeer),
    Detached,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub aid: Vec<u8>,
    pub data: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HceEvent {
    pub event_type: HceEventType,
    pub apdu: Vec<u8>,
}

/// An application id registered for host card emulation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AidData {
    pub se_type: SecureElementType,
    pub aid: String,
    pub read_only: bool,
}

struct TagListener {
    filter: Vec<TagType>,
    listener: Listener<TagEvent>,
}

#[derive(Clone)]
struct TransactionListener {
    se_type: SecureElementType,
    listener: Listener<TransactionEvent>,
}

// A reply waiting for a native completion, keyed by the RequestId handed to
// the backend
pub(crate) enum NfcRequest {
    Powered(Reply<()>),
    ReadNdef(Reply<NdefMessage>),
    Transceive(Reply<Vec<u8>>),
    SendNdef(Reply<()>),
}

impl NfcRequest {
    pub(crate) fn context(&self) -> &ScriptContext {
        match self {
            NfcRequest::Powered(reply) | NfcRequest::SendNdef(reply) => reply.context(),
            NfcRequest::ReadNdef(reply) => reply.context(),
            NfcRequest::Transceive(reply) => reply.context(),
        }
    }

    pub(crate) fn fail(self, dispatcher: &Dispatcher, err: Error) {
        match self {
            NfcRequest::Powered(reply) => dispatcher.reply("nfc powered", reply, Err(err)),
            NfcRequest::ReadNdef(reply) => dispatcher.reply("nfc read ndef", reply, Err(err)),
            NfcRequest::Transceive(reply) => dispatcher.reply("nfc transceive", reply, Err(err)),
            NfcRequest::SendNdef(reply) => dispatcher.reply("nfc send ndef", reply, Err(err)),
        }
    }
}

pub(crate) struct PeerRoute {
    pub(crate) instance: u64,
    pub(crate) peer: Weak<PeerInner>,
}

// Public for the sake of implementing Deref, none of the state is public
pub struct NfcAdapterInner {
    pub(crate) backend: Arc<dyn NfcBackend>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) gate: Arc<dyn PrivilegeGate>,

    tag_listener: StdMutex<Option<TagListener>>,
    peer_listener: StdMutex<Option<Listener<PeerEvent>>>,

    // Held across the emptiness check and the native set/unset of the shared
    // SE event callback
    se_guard: StdMutex<()>,
    card_listeners: CallbackRegistry<Listener<CardEmulationMode>>,
    active_se_listeners: CallbackRegistry<Listener<SecureElementType>>,

    transaction_guard: StdMutex<()>,
    transaction_listeners: CallbackRegistry<TransactionListener>,

    hce_guard: StdMutex<()>,
    hce_listeners: CallbackRegistry<Listener<HceEvent>>,

    pub(crate) requests: PendingOperationTable<RequestId, NfcRequest>,
    next_request: AtomicU64,

    // Only one transceive may be in flight across all tags
    pub(crate) transceiving: PendingOperationTable<(), RequestId>,

    pub(crate) peers: DashMap<NativeHandle, PeerRoute>,
    pub(crate) next_instance: AtomicU64,

    // Tags and peers keep the adapter, and through it the native library,
    // alive after the manager is gone
    _library: Option<Arc<NfcLibrary>>,
}

/// The NFC adapter: radio power, tag and peer detection, card emulation,
/// secure element transactions and host card emulation.
#[derive(Clone)]
pub struct NfcAdapter {
    inner: Arc<NfcAdapterInner>,
}
impl PartialEq for NfcAdapter {
    fn eq(&self, other: &NfcAdapter) -> bool {
        Arc::<NfcAdapterInner>::ptr_eq(&self.inner, &other.inner)
    }
}
impl Eq for NfcAdapter {}
impl Hash for NfcAdapter {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::<NfcAdapterInner>::as_ptr(&self.inner), state);
    }
}
impl Deref for NfcAdapter {
    type Target = NfcAdapterInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
impl fmt::Debug for NfcAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NfcAdapter").field("powered", &self.powered()).finish()
    }
}

impl NfcAdapter {
    pub(crate) fn new(backend: Arc<dyn NfcBackend>, dispatcher: Dispatcher, gate: Arc<dyn PrivilegeGate>) -> Self {
        Self::with_library(backend, dispatcher, gate, None)
    }

    pub(crate) fn with_library(
        backend: Arc<dyn NfcBackend>, dispatcher: Dispatcher, gate: Arc<dyn PrivilegeGate>,
        library: Option<Arc<NfcLibrary>>,
    ) -> Self {
        let inner = Arc::new(NfcAdapterInner {
            backend,
            dispatcher,
            gate,
            tag_listener: StdMutex::new(None),
            peer_listener: StdMutex::new(None),
            se_guard: StdMutex::new(()),
            card_listeners: CallbackRegistry::new(),
            active_se_listeners: CallbackRegistry::new(),
            transaction_guard: StdMutex::new(()),
            transaction_listeners: CallbackRegistry::new(),
            hce_guard: StdMutex::new(()),
            hce_listeners: CallbackRegistry::new(),
            requests: PendingOperationTable::new("nfc-request"),
            next_request: AtomicU64::new(1),
            transceiving: PendingOperationTable::new("nfc-transceive"),
            peers: DashMap::new(),
            next_instance: AtomicU64::new(1),
            _library: library,
        });
        inner.backend.set_event_sink(Some(NfcEventSink {
            adapter: Arc::downgrade(&inner),
        }));
        debug!("NFC adapter created");
        NfcAdapter { inner }
    }

    pub(crate) fn wrap(inner: Arc<NfcAdapterInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn as_observer(&self) -> Weak<dyn ContextObserver> {
        let weak: Weak<NfcAdapterInner> = Arc::downgrade(&self.inner);
        weak
    }

    pub(crate) fn next_request_id(&self) -> RequestId {
        RequestId(self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn require(&self, feature: NfcFeature) -> Result<()> {
        if self.backend.is_supported(feature) {
            Ok(())
        } else {
            debug!("{:?} is not supported", feature);
            Err(Error::NotSupported("Not supported".to_string()))
        }
    }

    pub fn powered(&self) -> bool {
        self.backend.is_activated()
    }

    /// Switches the radio on or off. Asking for the current state succeeds
    /// without a native round trip.
    #[named]
    pub fn set_powered(&self, state: bool, reply: Reply<()>) -> Result<()> {
        trace!("{}: {}", function_name!(), state);
        self.gate.check(privilege::NFC_ADMIN)?;

        if self.backend.is_activated() == state {
            debug!("NFC is already {}", if state { "on" } else { "off" });
            self.dispatcher.reply("nfc powered", reply, Ok(()));
            return Ok(());
        }

        let request = self.next_request_id();
        self.requests.begin(request, NfcRequest::Powered(reply))?;
        if let Err(err) = self.backend.set_activation(state, request) {
            log::error!("nfc_manager_set_activation failed: {}", err);
            if let Some(pending) = self.requests.abort(&request) {
                pending.fail(&self.dispatcher, err.to_error());
            }
        }
        Ok(())
    }

    /// Tags are reported to `listener` while they are in range. An empty
    /// `filter` lets every tag type through.
    #[named]
    pub fn set_tag_listener(&self, filter: &[TagType], listener: Listener<TagEvent>) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::NFC_TAG)?;
        self.require(NfcFeature::Tag)?;

        let filter = if filter.is_empty() { TagType::ALL.to_vec() } else { filter.to_vec() };
        let previous = self.tag_listener.lock().unwrap().replace(TagListener { filter, listener });
        if previous.is_some() {
            trace!("Replaced the tag listener");
            return Ok(());
        }
        if let Err(err) = self.backend.set_tag_discovered_cb() {
            self.tag_listener.lock().unwrap().take();
            return Err(err.into_error("Failed to set tag listener"));
        }
        Ok(())
    }

    #[named]
    pub fn unset_tag_listener(&self) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::NFC_TAG)?;
        self.require(NfcFeature::Tag)?;

        if self.tag_listener.lock().unwrap().take().is_some() {
            self.backend.unset_tag_discovered_cb();
        }
        Ok(())
    }

    #[named]
    pub fn set_peer_listener(&self, listener: Listener<PeerEvent>) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::NFC_P2P)?;
        self.require(NfcFeature::P2p)?;

        if self.peer_listener.lock().unwrap().replace(listener).is_some() {
            trace!("Replaced the peer listener");
            return Ok(());
        }
        if let Err(err) = self.backend.set_p2p_target_discovered_cb() {
            self.peer_listener.lock().unwrap().take();
            return Err(err.into_error("Failed to set peer listener"));
        }
        Ok(())
    }

    #[named]
    pub fn unset_peer_listener(&self) -> Result<()> {
        trace!("{}", function_name!());
        self.gate.check(privilege::NFC_P2P)?;
        self.require(NfcFeature::P2p)?;

        if self.peer_listener.lock().unwrap().take().is_some() {
            self.backend.unset_p2p_target_discovered_cb();
        }
        Ok(())
    }

    pub fn card_emulation_mode(&self) -> Result<CardEmulationMode> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;
        self.backend
            .card_emulation_mode()
            .map_err(|err| err.into_error("Failed to get card emulation mode"))
    }

    #[named]
    pub fn set_card_emulation_mode(&self, mode: &str) -> Result<()> {
        trace!("{}: {}", function_name!(), mode);
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let mode = CardEmulationMode::parse(mode)
            .ok_or_else(|| Error::InvalidValues(format!("Invalid card emulation mode: {}", mode)))?;
        let current = self.card_emulation_mode()?;
        if current == mode {
            debug!("Card emulation mode is already {}", mode.as_str());
            return Ok(());
        }
        let result = match mode {
            CardEmulationMode::AlwaysOn => self.backend.enable_card_emulation(),
            CardEmulationMode::Off => self.backend.disable_card_emulation(),
        };
        result.map_err(|err| err.into_error("Failed to set card emulation mode"))
    }

    pub fn active_secure_element(&self) -> Result<SecureElementType> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;
        self.backend
            .se_type()
            .map_err(|err| err.into_error("Failed to get active secure element type"))
    }

    #[named]
    pub fn set_active_secure_element(&self, se_type: &str) -> Result<()> {
        trace!("{}: {}", function_name!(), se_type);
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let se_type = SecureElementType::parse(se_type)
            .ok_or_else(|| Error::InvalidValues(format!("Invalid secure element type: {}", se_type)))?;
        if self.active_secure_element()? == se_type {
            debug!("{} is already the active secure element", se_type.as_str());
            return Ok(());
        }
        self.backend
            .set_se_type(se_type)
            .map_err(|err| err.into_error("Failed to set active secure element type"))
    }

    // The card emulation and active SE listeners share one native callback,
    // set with the first listener of either kind
    fn add_se_listener(&self, subscribe: impl FnOnce() -> ListenerId) -> Result<ListenerId> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let _guard = self.se_guard.lock().unwrap();
        if self.card_listeners.is_empty() && self.active_se_listeners.is_empty() {
            trace!("Setting the SE event callback");
            self.backend
                .set_se_event_cb()
                .map_err(|err| err.into_error("Failed to set SE event callback"))?;
        }
        Ok(subscribe())
    }

    fn remove_se_listener(&self, unsubscribe: impl FnOnce() -> bool) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let _guard = self.se_guard.lock().unwrap();
        if unsubscribe() && self.card_listeners.is_empty() && self.active_se_listeners.is_empty() {
            trace!("Unsetting the SE event callback");
            self.backend.unset_se_event_cb();
        }
        Ok(())
    }

    pub fn add_card_emulation_mode_change_listener(&self, listener: Listener<CardEmulationMode>) -> Result<ListenerId> {
        let id = self.add_se_listener(|| self.card_listeners.subscribe(listener))?;
        debug!("Card emulation mode listener ID: {}", id);
        Ok(id)
    }

    pub fn remove_card_emulation_mode_change_listener(&self, id: ListenerId) -> Result<()> {
        self.remove_se_listener(|| self.card_listeners.unsubscribe(id))
    }

    pub fn add_active_secure_element_change_listener(
        &self, listener: Listener<SecureElementType>,
    ) -> Result<ListenerId> {
        let id = self.add_se_listener(|| self.active_se_listeners.subscribe(listener))?;
        debug!("Active secure element listener ID: {}", id);
        Ok(id)
    }

    pub fn remove_active_secure_element_change_listener(&self, id: ListenerId) -> Result<()> {
        self.remove_se_listener(|| self.active_se_listeners.unsubscribe(id))
    }

    /// Transactions are reported per secure element, only `ESE` and `UICC`
    /// have them
    #[named]
    pub fn add_transaction_event_listener(
        &self, se_type: &str, listener: Listener<TransactionEvent>,
    ) -> Result<ListenerId> {
        trace!("{}: {}", function_name!(), se_type);
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let se_type = match SecureElementType::parse(se_type) {
            Some(se_type @ SecureElementType::Ese) | Some(se_type @ SecureElementType::Uicc) => se_type,
            _ => return Err(Error::InvalidValues(format!("Invalid secure element type: {}", se_type))),
        };

        let _guard = self.transaction_guard.lock().unwrap();
        if self.transaction_listeners.count_where(|entry| entry.se_type == se_type) == 0 {
            self.backend
                .set_se_transaction_event_cb(se_type)
                .map_err(|err| err.into_error("Failed to set transaction event callback"))?;
        }
        let id = self.transaction_listeners.subscribe(TransactionListener { se_type, listener });
        debug!("Transaction listener ID: {}", id);
        Ok(id)
    }

    pub fn remove_transaction_event_listener(&self, id: ListenerId) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;

        let _guard = self.transaction_guard.lock().unwrap();
        let se_type = self
            .transaction_listeners
            .snapshot()
            .into_iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, entry)| entry.se_type);
        let se_type = match se_type {
            Some(se_type) => se_type,
            None => {
                debug!("Transaction listener {} is not registered", id);
                return Ok(());
            }
        };
        self.transaction_listeners.unsubscribe(id);
        if self.transaction_listeners.count_where(|entry| entry.se_type == se_type) == 0 {
            self.backend.unset_se_transaction_event_cb(se_type);
        }
        Ok(())
    }

    /// Lets the foreground application receive transactions before anyone
    /// else
    pub fn set_exclusive_mode_for_transaction(&self, mode: bool) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::CardEmulation)?;
        self.backend
            .set_transaction_fg_dispatch(mode)
            .map_err(|err| err.into_error("Failed to set exclusive mode for transaction"))
    }

    pub fn add_hce_event_listener(&self, listener: Listener<HceEvent>) -> Result<ListenerId> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;

        let _guard = self.hce_guard.lock().unwrap();
        if self.hce_listeners.is_empty() {
            self.backend
                .set_hce_event_cb()
                .map_err(|err| err.into_error("Failed to set HCE event callback"))?;
        }
        let id = self.hce_listeners.subscribe(listener);
        debug!("HCE listener ID: {}", id);
        Ok(id)
    }

    pub fn remove_hce_event_listener(&self, id: ListenerId) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;

        let _guard = self.hce_guard.lock().unwrap();
        if self.hce_listeners.unsubscribe(id) && self.hce_listeners.is_empty() {
            self.backend.unset_hce_event_cb();
        }
        Ok(())
    }

    #[named]
    pub fn send_host_apdu_response(&self, apdu: &[u8], reply: Reply<()>) -> Result<()> {
        trace!("{}: {} bytes", function_name!(), apdu.len());
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;

        let result = self.backend.hce_send_apdu_response(apdu).map_err(|err| {
            log::error!("nfc_hce_send_apdu_response failed: {}", err);
            err.to_error()
        });
        self.dispatcher.reply("hce apdu response", reply, result);
        Ok(())
    }

    pub fn is_activated_handler_for_aid(&self, se_type: &str, aid: &str) -> Result<bool> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;
        let se_type = parse_se_type(se_type)?;
        self.backend
            .is_activated_handler_for_aid(se_type, aid)
            .map_err(|err| err.into_error("Failed to check activated handler for AID"))
    }

    pub fn is_activated_handler_for_category(&self, se_type: &str, category: &str) -> Result<bool> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;
        let se_type = parse_se_type(se_type)?;
        let category = parse_category(category)?;
        self.backend
            .is_activated_handler_for_category(se_type, category)
            .map_err(|err| err.into_error("Failed to check activated handler for category"))
    }

    pub fn register_aid(&self, se_type: &str, aid: &str, category: &str) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;
        let se_type = parse_se_type(se_type)?;
        let category = parse_category(category)?;
        self.backend
            .register_aid(se_type, category, aid)
            .map_err(|err| err.into_error("Failed to register AID"))
    }

    pub fn unregister_aid(&self, se_type: &str, aid: &str, category: &str) -> Result<()> {
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;
        let se_type = parse_se_type(se_type)?;
        let category = parse_category(category)?;
        self.backend
            .unregister_aid(se_type, category, aid)
            .map_err(|err| err.into_error("Failed to unregister AID"))
    }

    fn registered_aids(&self, se_type: SecureElementType, category: CardEmulationCategory) -> Result<Vec<AidData>> {
        let count = self
            .backend
            .registered_aids_count(se_type, category)
            .map_err(|err| err.into_error("Failed to get the number of registered AIDs"))?;
        if count == 0 {
            return Err(Error::NotFound("Registered AID is not found".to_string()));
        }

        let mut aids = Vec::with_capacity(count);
        self.backend
            .foreach_registered_aids(se_type, category, &mut |aid, read_only| {
                aids.push(AidData { se_type, aid: aid.to_string(), read_only });
                true
            })
            .map_err(|err| err.into_error("Failed to get registered AIDs"))?;
        Ok(aids)
    }

    #[named]
    pub fn get_aids_for_category(&self, se_type: &str, category: &str, reply: Reply<Vec<AidData>>) -> Result<()> {
        trace!("{}: {} {}", function_name!(), se_type, category);
        self.gate.check(privilege::NFC_CARD_EMULATION)?;
        self.require(NfcFeature::Hce)?;
        let se_type = parse_se_type(se_type)?;
        let category = parse_category(category)?;

        let result = self.registered_aids(se_type, category);
        self.dispatcher.reply("hce aids", reply, result);
        Ok(())
    }

    /// The last NDEF message the device received, if any
    pub fn cached_message(&self) -> Result<Option<NdefMessage>> {
        self.gate.check(privilege::NFC_COMMON)?;
        match self.backend.cached_message() {
            Ok(Some(bytes)) => NdefMessage::from_bytes(&bytes).map(Some),
            Ok(None) | Err(NfcError::InvalidNdefMessage) | Err(NfcError::NoNdefMessage) => Ok(None),
            Err(err) => Err(err.into_error("Failed to get cached message")),
        }
    }

    // The trampoline for every native NFC callback. Nothing in here invokes
    // consumer code, deliveries are posted to the dispatcher.
    pub(crate) fn on_native_event(&self, event: NfcEvent) {
        match event {
            NfcEvent::ActivationCompleted { request, result } => {
                match self.requests.complete(&request) {
                    Some(NfcRequest::Powered(reply)) => {
                        let delivery = result.map_err(|err| err.to_error());
                        self.dispatcher.reply("nfc powered", reply, delivery);
                    }
                    Some(other) => self.fail_unexpected(request, other, "activation"),
                    None => {}
                }
            }
            NfcEvent::TagDiscovered { attached, tag } => self.on_tag_discovered(attached, tag),
            NfcEvent::TargetDiscovered { attached, target } => self.on_target_discovered(attached, target),
            NfcEvent::SeEvent(kind) => self.on_se_event(kind),
            NfcEvent::Transaction { se_type, aid, data } => {
                let event = TransactionEvent { aid, data };
                self.transaction_listeners.broadcast(
                    |entry| entry.se_type == se_type,
                    |_, entry| self.dispatcher.notify("nfc transaction", &entry.listener, event.clone()),
                );
            }
            NfcEvent::Hce { event, apdu } => {
                let event = HceEvent { event_type: event, apdu };
                self.hce_listeners.broadcast_all(|_, listener| {
                    self.dispatcher.notify("hce event", listener, event.clone())
                });
            }
            NfcEvent::TagReadCompleted { request, result } => self.on_read_completed(request, result),
            NfcEvent::TransceiveCompleted { request, result } => self.on_transceive_completed(request, result),
            NfcEvent::PeerDataReceived { target, message } => self.on_peer_data(target, message),
            NfcEvent::PeerSent { request, result } => {
                match self.requests.complete(&request) {
                    Some(NfcRequest::SendNdef(reply)) => {
                        let delivery = result.map_err(|err| {
                            let message = format!("Unknown error while nfc_p2p_send: {}", err);
                            log::error!("{}", message);
                            Error::Unknown(message)
                        });
                        self.dispatcher.reply("nfc send ndef", reply, delivery);
                    }
                    Some(other) => self.fail_unexpected(request, other, "p2p send"),
                    None => {}
                }
            }
        }
    }

    fn on_tag_discovered(&self, attached: bool, tag: NativeHandle) {
        debug!("Tag {} {}", tag, if attached { "attached" } else { "detached" });
        let (filter, listener) = match self.tag_listener.lock().unwrap().as_ref() {
            Some(current) => (current.filter.clone(), current.listener.clone()),
            None => {
                warn!("Tag event received without a tag listener");
                return;
            }
        };

        if !attached {
            self.dispatcher.notify("nfc tag", &listener, TagEvent::Detached);
            return;
        }
        let tag_type = self.backend.tag_type(tag).unwrap_or_else(|err| {
            warn!("Failed to get the type of tag {}: {}", tag, err);
            TagType::UnknownTarget
        });
        if !filter.contains(&tag_type) {
            trace!("Tag type {} is filtered out", tag_type.as_str());
            return;
        }
        let tag = NfcTag::new(self.clone(), tag);
        self.dispatcher.notify("nfc tag", &listener, TagEvent::Attached(tag));
    }

    fn on_target_discovered(&self, attached: bool, target: NativeHandle) {
        debug!("Target {} {}", target, if attached { "attached" } else { "detached" });
        let listener = match self.peer_listener.lock().unwrap().as_ref() {
            Some(listener) => listener.clone(),
            None => {
                warn!("Target event received without a peer listener");
                return;
            }
        };
        let event = if attached {
            PeerEvent::Attached(NfcPeer::new(self.clone(), target))
        } else {
            PeerEvent::Detached
        };
        self.dispatcher.notify("nfc peer", &listener, event);
    }

    fn on_se_event(&self, kind: SeEventKind) {
        match kind {
            SeEventKind::SeTypeChanged => match self.backend.se_type() {
                Ok(se_type) => {
                    self.active_se_listeners.broadcast_all(|_, listener| {
                        self.dispatcher.notify("nfc active se", listener, se_type)
                    });
                }
                Err(err) => log::error!("Failed to get the active secure element: {}", err),
            },
            SeEventKind::CardEmulationChanged => match self.backend.card_emulation_mode() {
                Ok(mode) => {
                    self.card_listeners.broadcast_all(|_, listener| {
                        self.dispatcher.notify("nfc card emulation", listener, mode)
                    });
                }
                Err(err) => log::error!("Failed to get the card emulation mode: {}", err),
            },
            SeEventKind::Other(code) => trace!("Ignoring SE event {}", code),
        }
    }

    fn on_read_completed(&self, request: RequestId, result: NfcResult<Vec<u8>>) {
        match self.requests.complete(&request) {
            Some(NfcRequest::ReadNdef(reply)) => {
                let delivery = match result {
                    Ok(bytes) => NdefMessage::from_bytes(&bytes),
                    Err(err) => Err(err.to_error()),
                };
                self.dispatcher.reply("nfc read ndef", reply, delivery);
            }
            Some(other) => self.fail_unexpected(request, other, "ndef read"),
            None => {}
        }
    }

    fn on_transceive_completed(&self, request: RequestId, result: NfcResult<Vec<u8>>) {
        // The slot is freed even when the reply went away with its context
        if !self.release_transceive(request) {
            warn!("Transceive {} completed but is not the one in progress", request);
        }
        match self.requests.complete(&request) {
            Some(NfcRequest::Transceive(reply)) => {
                let delivery = result.map_err(|err| {
                    log::error!("NFC transceive error: {}", err);
                    err.to_error()
                });
                self.dispatcher.reply("nfc transceive", reply, delivery);
            }
            Some(other) => self.fail_unexpected(request, other, "transceive"),
            None => {}
        }
    }

    // Only the transceive in flight frees the slot
    fn release_transceive(&self, request: RequestId) -> bool {
        !self.transceiving.remove_where(|_, current| *current == request).is_empty()
    }

    // The entry is already out of the table, its consumer must still hear
    // back exactly once
    fn fail_unexpected(&self, request: RequestId, pending: NfcRequest, completion: &str) {
        warn!("Unexpected {} completion for request {}", completion, request);
        if let NfcRequest::Transceive(_) = pending {
            self.release_transceive(request);
        }
        pending.fail(
            &self.dispatcher,
            Error::Unknown(format!("Unexpected {} completion", completion)),
        );
    }

    fn on_peer_data(&self, target: NativeHandle, bytes: Vec<u8>) {
        let peer = self.peers.get(&target).and_then(|route| route.peer.upgrade());
        let peer = match peer {
            Some(peer) => peer,
            None => {
                trace!("Data for target {} without a receive listener", target);
                return;
            }
        };
        match NdefMessage::from_bytes(&bytes) {
            Ok(message) => peer.deliver(&self.dispatcher, message),
            Err(err) => log::error!("Unknown error while getting raw data of message: {}", err),
        }
    }
}

fn parse_se_type(se_type: &str) -> Result<SecureElementType> {
    SecureElementType::parse(se_type)
        .ok_or_else(|| Error::InvalidValues(format!("Invalid secure element type: {}", se_type)))
}

fn parse_category(category: &str) -> Result<CardEmulationCategory> {
    CardEmulationCategory::parse(category)
        .ok_or_else(|| Error::InvalidValues(format!("Invalid card emulation category: {}", category)))
}

impl ContextObserver for NfcAdapterInner {
    fn on_context_unloaded(&self, context: ContextId) {
        let owned_by = |ctx: &ScriptContext| ctx.id() == context;

        let tag_owned = {
            let mut slot = self.tag_listener.lock().unwrap();
            match slot.as_ref() {
                Some(current) if owned_by(current.listener.context()) => slot.take().is_some(),
                _ => false,
            }
        };
        if tag_owned {
            debug!("Unsetting tag listener of unloaded {}", context);
            self.backend.unset_tag_discovered_cb();
        }

        let peer_owned = {
            let mut slot = self.peer_listener.lock().unwrap();
            match slot.as_ref() {
                Some(listener) if owned_by(listener.context()) => slot.take().is_some(),
                _ => false,
            }
        };
        if peer_owned {
            debug!("Unsetting peer listener of unloaded {}", context);
            self.backend.unset_p2p_target_discovered_cb();
        }

        {
            let _guard = self.se_guard.lock().unwrap();
            let removed = self.card_listeners.remove_where(|listener| owned_by(listener.context()))
                + self.active_se_listeners.remove_where(|listener| owned_by(listener.context()));
            if removed > 0 && self.card_listeners.is_empty() && self.active_se_listeners.is_empty() {
                self.backend.unset_se_event_cb();
            }
        }

        {
            let _guard = self.transaction_guard.lock().unwrap();
            for se_type in [SecureElementType::Ese, SecureElementType::Uicc].iter().copied() {
                let removed = self
                    .transaction_listeners
                    .remove_where(|entry| entry.se_type == se_type && owned_by(entry.listener.context()));
                if removed > 0 && self.transaction_listeners.count_where(|entry| entry.se_type == se_type) == 0 {
                    self.backend.unset_se_transaction_event_cb(se_type);
                }
            }
        }

        {
            let _guard = self.hce_guard.lock().unwrap();
            let removed = self.hce_listeners.remove_where(|listener| owned_by(listener.context()));
            if removed > 0 && self.hce_listeners.is_empty() {
                self.backend.unset_hce_event_cb();
            }
        }

        let dropped = self.requests.remove_where(|_, request| owned_by(request.context()));
        trace!("Dropped {} NFC requests of {}", dropped.len(), context);

        let peers: Vec<Arc<PeerInner>> = self.peers.iter().filter_map(|route| route.peer.upgrade()).collect();
        for peer in peers {
            peer.forget_context(context);
        }
    }
}

impl Drop for NfcAdapterInner {
    fn drop(&mut self) {
        trace!("Tearing down NFC adapter");
        self.backend.set_event_sink(None);

        if self.tag_listener.get_mut().map(|slot| slot.is_some()).unwrap_or(false) {
            self.backend.unset_tag_discovered_cb();
        }
        if self.peer_listener.get_mut().map(|slot| slot.is_some()).unwrap_or(false) {
            self.backend.unset_p2p_target_discovered_cb();
        }
        if !self.card_listeners.is_empty() || !self.active_se_listeners.is_empty() {
            self.backend.unset_se_event_cb();
        }
        for se_type in [SecureElementType::Ese, SecureElementType::Uicc].iter().copied() {
            if self.transaction_listeners.count_where(|entry| entry.se_type == se_type) > 0 {
                self.backend.unset_se_transaction_event_cb(se_type);
            }
        }
        if !self.hce_listeners.is_empty() {
            self.backend.unset_hce_event_cb();
        }
    }
}
