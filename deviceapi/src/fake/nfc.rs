use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;

use log::trace;

use crate::nfc::{
    CardEmulationCategory, CardEmulationMode, HceEventType, NfcBackend, NfcError, NfcEvent, NfcEventSink, NfcFeature,
    NfcResult, SeEventKind, SecureElementType, TagType,
};
use crate::{NativeHandle, RequestId};

/// Every call a [`FakeNfcBackend`] records, also used to pick which call
/// should fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NfcCall {
    Initialize,
    Deinitialize,
    SetSystemHandlerEnable,
    SetActivation,
    SetTagDiscoveredCb,
    UnsetTagDiscoveredCb,
    SetP2pTargetDiscoveredCb,
    UnsetP2pTargetDiscoveredCb,
    CardEmulationMode,
    EnableCardEmulation,
    DisableCardEmulation,
    SeType,
    SetSeType,
    SetSeEventCb,
    UnsetSeEventCb,
    SetSeTransactionEventCb,
    UnsetSeTransactionEventCb,
    SetTransactionFgDispatch,
    SetHceEventCb,
    UnsetHceEventCb,
    HceSendApduResponse,
    IsActivatedHandlerForAid,
    IsActivatedHandlerForCategory,
    RegisterAid,
    UnregisterAid,
    RegisteredAidsCount,
    ForeachRegisteredAids,
    CachedMessage,
    TagType,
    TagIsNdefSupported,
    TagNdefSize,
    TagForeachInformation,
    ConnectedTag,
    TagReadNdef,
    TagWriteNdef,
    TagTransceive,
    ConnectedTarget,
    P2pSetDataReceivedCb,
    P2pUnsetDataReceivedCb,
    P2pSend,
}

/// A tag to bring in range of the simulated radio
#[derive(Clone, Debug)]
pub struct FakeTag {
    pub tag_type: TagType,
    pub ndef_supported: bool,
    pub ndef_size: u32,
    pub properties: Vec<(String, Vec<u8>)>,
    /// The raw NDEF message stored on the tag, empty for none
    pub message: Vec<u8>,
}

impl Default for FakeTag {
    fn default() -> Self {
        FakeTag {
            tag_type: TagType::GenericTarget,
            ndef_supported: true,
            ndef_size: 0,
            properties: Vec::new(),
            message: Vec::new(),
        }
    }
}

struct Aid {
    se_type: SecureElementType,
    category: CardEmulationCategory,
    aid: String,
}

#[derive(Default)]
struct State {
    sink: Option<NfcEventSink>,
    unsupported: HashSet<NfcFeature>,
    initialized: bool,
    activated: bool,
    system_handler: bool,
    fg_dispatch: bool,
    auto_complete: bool,

    card_mode: Option<CardEmulationMode>,
    se_type: Option<SecureElementType>,

    tag_cb: bool,
    p2p_cb: bool,
    se_cb: bool,
    transaction_cbs: HashSet<SecureElementType>,
    hce_cb: bool,
    data_received_cbs: HashSet<NativeHandle>,

    failures: HashMap<NfcCall, NfcError>,
    calls: Vec<NfcCall>,

    next_handle: u64,
    tags: HashMap<NativeHandle, FakeTag>,
    connected_tag: Option<NativeHandle>,
    connected_target: Option<NativeHandle>,
    aids: Vec<Aid>,
    cached: Option<Vec<u8>>,

    pending_activations: Vec<(RequestId, bool)>,
    pending_reads: Vec<(NativeHandle, RequestId)>,
    pending_transceives: Vec<RequestId>,
    pending_sends: Vec<RequestId>,
    written: Vec<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    apdu_responses: Vec<Vec<u8>>,
}

impl State {
    fn allocate(&mut self) -> NativeHandle {
        self.next_handle += 1;
        NativeHandle(0x2000 + self.next_handle)
    }
}

/// An in-process stand-in for the native NFC SDK.
///
/// Every feature is supported and the radio starts off. Asynchronous
/// operations stay pending until a test completes them, unless
/// [`set_auto_complete`](Self::set_auto_complete) makes them complete from
/// inside the initiating call.
pub struct FakeNfcBackend {
    state: StdMutex<State>,
}

impl Default for FakeNfcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNfcBackend {
    pub fn new() -> Self {
        FakeNfcBackend {
            state: StdMutex::new(State {
                system_handler: true,
                card_mode: Some(CardEmulationMode::Off),
                se_type: Some(SecureElementType::Ese),
                ..Default::default()
            }),
        }
    }

    fn record(&self, call: NfcCall) -> NfcResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get(&call) {
            Some(err) => {
                trace!("Fake {:?} failing with {:?}", call, err);
                Err(*err)
            }
            None => Ok(()),
        }
    }

    pub fn fail(&self, call: NfcCall, err: NfcError) {
        self.state.lock().unwrap().failures.insert(call, err);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn unsupport(&self, feature: NfcFeature) {
        self.state.lock().unwrap().unsupported.insert(feature);
    }

    pub fn set_auto_complete(&self, auto_complete: bool) {
        self.state.lock().unwrap().auto_complete = auto_complete;
    }

    pub fn emit(&self, event: NfcEvent) {
        // Never call into the adapter with the state locked
        let sink = self.state.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.emit(event),
            None => trace!("Fake has no sink for {:?}", event),
        }
    }

    pub fn count(&self, call: NfcCall) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| **c == call).count()
    }

    /// Brings a tag in range, reported if a tag callback is set
    pub fn attach_tag(&self, tag: FakeTag) -> NativeHandle {
        let (handle, notify) = {
            let mut state = self.state.lock().unwrap();
            let handle = state.allocate();
            state.tags.insert(handle, tag);
            state.connected_tag = Some(handle);
            (handle, state.tag_cb)
        };
        if notify {
            self.emit(NfcEvent::TagDiscovered { attached: true, tag: handle });
        }
        handle
    }

    pub fn detach_tag(&self, tag: NativeHandle) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.connected_tag == Some(tag) {
                state.connected_tag = None;
            }
            state.tag_cb
        };
        if notify {
            self.emit(NfcEvent::TagDiscovered { attached: false, tag });
        }
    }

    pub fn attach_target(&self) -> NativeHandle {
        let (target, notify) = {
            let mut state = self.state.lock().unwrap();
            let target = state.allocate();
            state.connected_target = Some(target);
            (target, state.p2p_cb)
        };
        if notify {
            self.emit(NfcEvent::TargetDiscovered { attached: true, target });
        }
        target
    }

    pub fn detach_target(&self, target: NativeHandle) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.connected_target == Some(target) {
                state.connected_target = None;
            }
            state.p2p_cb
        };
        if notify {
            self.emit(NfcEvent::TargetDiscovered { attached: false, target });
        }
    }

    /// Completes every pending activation, returning how many there were
    pub fn complete_activation(&self, result: NfcResult<()>) -> usize {
        let pending = {
            let mut state = self.state.lock().unwrap();
            let pending = std::mem::take(&mut state.pending_activations);
            if result.is_ok() {
                if let Some((_, activate)) = pending.last() {
                    state.activated = *activate;
                }
            }
            pending
        };
        for (request, _) in pending.iter() {
            self.emit(NfcEvent::ActivationCompleted { request: *request, result });
        }
        pending.len()
    }

    /// Completes every pending NDEF read with the tag's stored message
    pub fn complete_pending_reads(&self) -> usize {
        let completions: Vec<(RequestId, NfcResult<Vec<u8>>)> = {
            let mut state = self.state.lock().unwrap();
            let pending = std::mem::take(&mut state.pending_reads);
            pending
                .into_iter()
                .map(|(tag, request)| (request, Self::stored_message(&state, tag)))
                .collect()
        };
        for (request, result) in completions.iter() {
            self.emit(NfcEvent::TagReadCompleted { request: *request, result: result.clone() });
        }
        completions.len()
    }

    fn stored_message(state: &State, tag: NativeHandle) -> NfcResult<Vec<u8>> {
        match state.tags.get(&tag) {
            Some(tag) if tag.message.is_empty() => Err(NfcError::NoNdefMessage),
            Some(tag) => Ok(tag.message.clone()),
            None => Err(NfcError::NoDevice),
        }
    }

    pub fn complete_transceives(&self, response: Vec<u8>) -> usize {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending_transceives);
        for request in pending.iter() {
            self.emit(NfcEvent::TransceiveCompleted { request: *request, result: Ok(response.clone()) });
        }
        pending.len()
    }

    pub fn complete_pending_sends(&self, result: NfcResult<()>) -> usize {
        let pending = std::mem::take(&mut self.state.lock().unwrap().pending_sends);
        for request in pending.iter() {
            self.emit(NfcEvent::PeerSent { request: *request, result });
        }
        pending.len()
    }

    pub fn receive_peer_data(&self, target: NativeHandle, message: Vec<u8>) {
        let notify = self.state.lock().unwrap().data_received_cbs.contains(&target);
        if notify {
            self.emit(NfcEvent::PeerDataReceived { target, message });
        }
    }

    /// Changes the card emulation mode as if another application did
    pub fn change_card_emulation_mode(&self, mode: CardEmulationMode) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            state.card_mode = Some(mode);
            state.se_cb
        };
        if notify {
            self.emit(NfcEvent::SeEvent(SeEventKind::CardEmulationChanged));
        }
    }

    pub fn change_se_type(&self, se_type: SecureElementType) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            state.se_type = Some(se_type);
            state.se_cb
        };
        if notify {
            self.emit(NfcEvent::SeEvent(SeEventKind::SeTypeChanged));
        }
    }

    pub fn emit_transaction(&self, se_type: SecureElementType, aid: Vec<u8>, data: Vec<u8>) {
        let notify = self.state.lock().unwrap().transaction_cbs.contains(&se_type);
        if notify {
            self.emit(NfcEvent::Transaction { se_type, aid, data });
        }
    }

    pub fn emit_hce(&self, event: HceEventType, apdu: Vec<u8>) {
        let notify = self.state.lock().unwrap().hce_cb;
        if notify {
            self.emit(NfcEvent::Hce { event, apdu });
        }
    }

    pub fn set_cached_message(&self, message: Option<Vec<u8>>) {
        self.state.lock().unwrap().cached = message;
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().initialized
    }

    pub fn system_handler_enabled(&self) -> bool {
        self.state.lock().unwrap().system_handler
    }

    pub fn fg_dispatch(&self) -> bool {
        self.state.lock().unwrap().fg_dispatch
    }

    pub fn has_sink(&self) -> bool {
        self.state.lock().unwrap().sink.is_some()
    }

    pub fn has_tag_cb(&self) -> bool {
        self.state.lock().unwrap().tag_cb
    }

    pub fn has_p2p_cb(&self) -> bool {
        self.state.lock().unwrap().p2p_cb
    }

    pub fn has_se_cb(&self) -> bool {
        self.state.lock().unwrap().se_cb
    }

    pub fn has_transaction_cb(&self, se_type: SecureElementType) -> bool {
        self.state.lock().unwrap().transaction_cbs.contains(&se_type)
    }

    pub fn has_hce_cb(&self) -> bool {
        self.state.lock().unwrap().hce_cb
    }

    pub fn has_data_received_cb(&self, target: NativeHandle) -> bool {
        self.state.lock().unwrap().data_received_cbs.contains(&target)
    }

    pub fn written_messages(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn sent_messages(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn apdu_responses(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().apdu_responses.clone()
    }
}

impl NfcBackend for FakeNfcBackend {
    fn set_event_sink(&self, sink: Option<NfcEventSink>) {
        self.state.lock().unwrap().sink = sink;
    }

    fn initialize(&self) -> NfcResult<()> {
        self.record(NfcCall::Initialize)?;
        self.state.lock().unwrap().initialized = true;
        Ok(())
    }

    fn deinitialize(&self) -> NfcResult<()> {
        self.record(NfcCall::Deinitialize)?;
        self.state.lock().unwrap().initialized = false;
        Ok(())
    }

    fn is_supported(&self, feature: NfcFeature) -> bool {
        !self.state.lock().unwrap().unsupported.contains(&feature)
    }

    fn set_system_handler_enable(&self, enable: bool) -> NfcResult<()> {
        self.record(NfcCall::SetSystemHandlerEnable)?;
        self.state.lock().unwrap().system_handler = enable;
        Ok(())
    }

    fn is_activated(&self) -> bool {
        self.state.lock().unwrap().activated
    }

    fn set_activation(&self, activate: bool, request: RequestId) -> NfcResult<()> {
        self.record(NfcCall::SetActivation)?;
        let auto_complete = {
            let mut state = self.state.lock().unwrap();
            state.pending_activations.push((request, activate));
            state.auto_complete
        };
        if auto_complete {
            self.complete_activation(Ok(()));
        }
        Ok(())
    }

    fn set_tag_discovered_cb(&self) -> NfcResult<()> {
        self.record(NfcCall::SetTagDiscoveredCb)?;
        self.state.lock().unwrap().tag_cb = true;
        Ok(())
    }

    fn unset_tag_discovered_cb(&self) {
        let _ = self.record(NfcCall::UnsetTagDiscoveredCb);
        self.state.lock().unwrap().tag_cb = false;
    }

    fn set_p2p_target_discovered_cb(&self) -> NfcResult<()> {
        self.record(NfcCall::SetP2pTargetDiscoveredCb)?;
        self.state.lock().unwrap().p2p_cb = true;
        Ok(())
    }

    fn unset_p2p_target_discovered_cb(&self) {
        let _ = self.record(NfcCall::UnsetP2pTargetDiscoveredCb);
        self.state.lock().unwrap().p2p_cb = false;
    }

    fn card_emulation_mode(&self) -> NfcResult<CardEmulationMode> {
        self.record(NfcCall::CardEmulationMode)?;
        self.state.lock().unwrap().card_mode.ok_or(NfcError::OperationFailed)
    }

    fn enable_card_emulation(&self) -> NfcResult<()> {
        self.record(NfcCall::EnableCardEmulation)?;
        self.state.lock().unwrap().card_mode = Some(CardEmulationMode::AlwaysOn);
        Ok(())
    }

    fn disable_card_emulation(&self) -> NfcResult<()> {
        self.record(NfcCall::DisableCardEmulation)?;
        self.state.lock().unwrap().card_mode = Some(CardEmulationMode::Off);
        Ok(())
    }

    fn se_type(&self) -> NfcResult<SecureElementType> {
        self.record(NfcCall::SeType)?;
        self.state.lock().unwrap().se_type.ok_or(NfcError::OperationFailed)
    }

    fn set_se_type(&self, se_type: SecureElementType) -> NfcResult<()> {
        self.record(NfcCall::SetSeType)?;
        self.state.lock().unwrap().se_type = Some(se_type);
        Ok(())
    }

    fn set_se_event_cb(&self) -> NfcResult<()> {
        self.record(NfcCall::SetSeEventCb)?;
        self.state.lock().unwrap().se_cb = true;
        Ok(())
    }

    fn unset_se_event_cb(&self) {
        let _ = self.record(NfcCall::UnsetSeEventCb);
        self.state.lock().unwrap().se_cb = false;
    }

    fn set_se_transaction_event_cb(&self, se_type: SecureElementType) -> NfcResult<()> {
        self.record(NfcCall::SetSeTransactionEventCb)?;
        self.state.lock().unwrap().transaction_cbs.insert(se_type);
        Ok(())
    }

    fn unset_se_transaction_event_cb(&self, se_type: SecureElementType) {
        let _ = self.record(NfcCall::UnsetSeTransactionEventCb);
        self.state.lock().unwrap().transaction_cbs.remove(&se_type);
    }

    fn set_transaction_fg_dispatch(&self, enable: bool) -> NfcResult<()> {
        self.record(NfcCall::SetTransactionFgDispatch)?;
        self.state.lock().unwrap().fg_dispatch = enable;
        Ok(())
    }

    fn set_hce_event_cb(&self) -> NfcResult<()> {
        self.record(NfcCall::SetHceEventCb)?;
        self.state.lock().unwrap().hce_cb = true;
        Ok(())
    }

    fn unset_hce_event_cb(&self) {
        let _ = self.record(NfcCall::UnsetHceEventCb);
        self.state.lock().unwrap().hce_cb = false;
    }

    fn hce_send_apdu_response(&self, apdu: &[u8]) -> NfcResult<()> {
        self.record(NfcCall::HceSendApduResponse)?;
        self.state.lock().unwrap().apdu_responses.push(apdu.to_vec());
        Ok(())
    }

    fn is_activated_handler_for_aid(&self, se_type: SecureElementType, aid: &str) -> NfcResult<bool> {
        self.record(NfcCall::IsActivatedHandlerForAid)?;
        let state = self.state.lock().unwrap();
        Ok(state.aids.iter().any(|entry| entry.se_type == se_type && entry.aid == aid))
    }

    fn is_activated_handler_for_category(
        &self, se_type: SecureElementType, category: CardEmulationCategory,
    ) -> NfcResult<bool> {
        self.record(NfcCall::IsActivatedHandlerForCategory)?;
        let state = self.state.lock().unwrap();
        Ok(state.aids.iter().any(|entry| entry.se_type == se_type && entry.category == category))
    }

    fn register_aid(&self, se_type: SecureElementType, category: CardEmulationCategory, aid: &str) -> NfcResult<()> {
        self.record(NfcCall::RegisterAid)?;
        self.state.lock().unwrap().aids.push(Aid { se_type, category, aid: aid.to_string() });
        Ok(())
    }

    fn unregister_aid(
        &self, se_type: SecureElementType, category: CardEmulationCategory, aid: &str,
    ) -> NfcResult<()> {
        self.record(NfcCall::UnregisterAid)?;
        let mut state = self.state.lock().unwrap();
        let before = state.aids.len();
        state
            .aids
            .retain(|entry| !(entry.se_type == se_type && entry.category == category && entry.aid == aid));
        if state.aids.len() == before {
            return Err(NfcError::InvalidParameter);
        }
        Ok(())
    }

    fn registered_aids_count(&self, se_type: SecureElementType, category: CardEmulationCategory) -> NfcResult<usize> {
        self.record(NfcCall::RegisteredAidsCount)?;
        let state = self.state.lock().unwrap();
        Ok(state
            .aids
            .iter()
            .filter(|entry| entry.se_type == se_type && entry.category == category)
            .count())
    }

    fn foreach_registered_aids(
        &self, se_type: SecureElementType, category: CardEmulationCategory,
        visitor: &mut dyn FnMut(&str, bool) -> bool,
    ) -> NfcResult<()> {
        self.record(NfcCall::ForeachRegisteredAids)?;
        let aids: Vec<String> = {
            let state = self.state.lock().unwrap();
            state
                .aids
                .iter()
                .filter(|entry| entry.se_type == se_type && entry.category == category)
                .map(|entry| entry.aid.clone())
                .collect()
        };
        for aid in aids.iter() {
            if !visitor(aid, false) {
                break;
            }
        }
        Ok(())
    }

    fn cached_message(&self) -> NfcResult<Option<Vec<u8>>> {
        self.record(NfcCall::CachedMessage)?;
        match self.state.lock().unwrap().cached.clone() {
            Some(message) => Ok(Some(message)),
            None => Err(NfcError::NoNdefMessage),
        }
    }

    fn tag_type(&self, tag: NativeHandle) -> NfcResult<TagType> {
        self.record(NfcCall::TagType)?;
        let state = self.state.lock().unwrap();
        state.tags.get(&tag).map(|tag| tag.tag_type).ok_or(NfcError::NoDevice)
    }

    fn tag_is_ndef_supported(&self, tag: NativeHandle) -> NfcResult<bool> {
        self.record(NfcCall::TagIsNdefSupported)?;
        let state = self.state.lock().unwrap();
        state.tags.get(&tag).map(|tag| tag.ndef_supported).ok_or(NfcError::NoDevice)
    }

    fn tag_ndef_size(&self, tag: NativeHandle) -> NfcResult<u32> {
        self.record(NfcCall::TagNdefSize)?;
        let state = self.state.lock().unwrap();
        state.tags.get(&tag).map(|tag| tag.ndef_size).ok_or(NfcError::NoDevice)
    }

    fn tag_foreach_information(
        &self, tag: NativeHandle, visitor: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> NfcResult<()> {
        self.record(NfcCall::TagForeachInformation)?;
        let properties = {
            let state = self.state.lock().unwrap();
            state.tags.get(&tag).map(|tag| tag.properties.clone()).ok_or(NfcError::NoDevice)?
        };
        for (key, value) in properties.iter() {
            if !visitor(key, value) {
                break;
            }
        }
        Ok(())
    }

    fn connected_tag(&self) -> NfcResult<Option<NativeHandle>> {
        self.record(NfcCall::ConnectedTag)?;
        Ok(self.state.lock().unwrap().connected_tag)
    }

    fn tag_read_ndef(&self, tag: NativeHandle, request: RequestId) -> NfcResult<()> {
        self.record(NfcCall::TagReadNdef)?;
        let auto_complete = {
            let mut state = self.state.lock().unwrap();
            state.pending_reads.push((tag, request));
            state.auto_complete
        };
        if auto_complete {
            self.complete_pending_reads();
        }
        Ok(())
    }

    fn tag_write_ndef(&self, tag: NativeHandle, message: &[u8]) -> NfcResult<()> {
        self.record(NfcCall::TagWriteNdef)?;
        let mut state = self.state.lock().unwrap();
        match state.tags.get_mut(&tag) {
            Some(tag) => tag.message = message.to_vec(),
            None => return Err(NfcError::NoDevice),
        }
        state.written.push(message.to_vec());
        Ok(())
    }

    fn tag_transceive(&self, _tag: NativeHandle, data: &[u8], request: RequestId) -> NfcResult<()> {
        self.record(NfcCall::TagTransceive)?;
        let auto_complete = {
            let mut state = self.state.lock().unwrap();
            state.pending_transceives.push(request);
            state.auto_complete
        };
        if auto_complete {
            self.complete_transceives(data.to_vec());
        }
        Ok(())
    }

    fn connected_target(&self) -> NfcResult<Option<NativeHandle>> {
        self.record(NfcCall::ConnectedTarget)?;
        Ok(self.state.lock().unwrap().connected_target)
    }

    fn p2p_set_data_received_cb(&self, target: NativeHandle) -> NfcResult<()> {
        self.record(NfcCall::P2pSetDataReceivedCb)?;
        self.state.lock().unwrap().data_received_cbs.insert(target);
        Ok(())
    }

    fn p2p_unset_data_received_cb(&self, target: NativeHandle) -> NfcResult<()> {
        self.record(NfcCall::P2pUnsetDataReceivedCb)?;
        self.state.lock().unwrap().data_received_cbs.remove(&target);
        Ok(())
    }

    fn p2p_send(&self, _target: NativeHandle, message: &[u8], request: RequestId) -> NfcResult<()> {
        self.record(NfcCall::P2pSend)?;
        let auto_complete = {
            let mut state = self.state.lock().unwrap();
            state.sent.push(message.to_vec());
            state.pending_sends.push(request);
            state.auto_complete
        };
        if auto_complete {
            self.complete_pending_sends(Ok(()));
        }
        Ok(())
    }
}
