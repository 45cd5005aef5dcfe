use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use function_name::named;
use log::{debug, trace, warn};

use crate::callback::{Listener, Reply};
use crate::context::ContextId;
use crate::dispatch::Dispatcher;
use crate::nfc::adapter::{NfcAdapter, NfcRequest, PeerRoute};
use crate::nfc::ndef::NdefMessage;
use crate::privilege;
use crate::{Error, NativeHandle, Result};

pub(crate) struct PeerInner {
    adapter: NfcAdapter,
    handle: NativeHandle,
    instance: u64,
    listener: StdMutex<Option<Listener<NdefMessage>>>,
}

impl PeerInner {
    pub(crate) fn deliver(&self, dispatcher: &Dispatcher, message: NdefMessage) {
        let listener = self.listener.lock().unwrap().clone();
        match listener {
            Some(listener) => dispatcher.notify("nfc peer receive", &listener, message),
            None => trace!("Peer {} has no receive listener", self.handle),
        }
    }

    fn unset_native(&self) {
        if let Err(err) = self.adapter.backend.p2p_unset_data_received_cb(self.handle) {
            log::error!("Error while unsetting ReceiveNDEFListener: {}", err);
        }
    }

    pub(crate) fn forget_context(&self, context: ContextId) {
        let owned = {
            let mut slot = self.listener.lock().unwrap();
            match slot.as_ref() {
                Some(listener) if listener.context().id() == context => slot.take().is_some(),
                _ => false,
            }
        };
        if owned {
            debug!("Unsetting receive listener of peer {} owned by {}", self.handle, context);
            self.unset_native();
        }
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        let instance = self.instance;
        self.adapter
            .peers
            .remove_if(&self.handle, |_, route| route.instance == instance);
        if self.listener.get_mut().map(|slot| slot.is_some()).unwrap_or(false) {
            self.unset_native();
        }
    }
}

/// A remote NFC device in peer-to-peer range
#[derive(Clone)]
pub struct NfcPeer {
    inner: Arc<PeerInner>,
}

impl fmt::Debug for NfcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NfcPeer").field("handle", &self.inner.handle).finish()
    }
}

impl NfcPeer {
    pub(crate) fn new(adapter: NfcAdapter, handle: NativeHandle) -> Self {
        let instance = adapter.next_instance.fetch_add(1, Ordering::Relaxed);
        NfcPeer {
            inner: Arc::new(PeerInner {
                adapter,
                handle,
                instance,
                listener: StdMutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self.inner.adapter.backend.connected_target() {
            Ok(connected) => connected == Some(self.inner.handle),
            Err(err) => {
                debug!("Failed to get the connected target: {}", err);
                false
            }
        }
    }

    /// Messages the peer sends are delivered to `listener`, replacing any
    /// previous one
    #[named]
    pub fn set_receive_ndef_listener(&self, listener: Listener<NdefMessage>) -> Result<()> {
        trace!("{}: {}", function_name!(), self.inner.handle);
        let adapter = &self.inner.adapter;
        adapter.gate.check(privilege::NFC_P2P)?;

        // Routed before the native call, data may arrive from inside it
        let previous = self.inner.listener.lock().unwrap().replace(listener);
        adapter.peers.insert(
            self.inner.handle,
            PeerRoute {
                instance: self.inner.instance,
                peer: Arc::downgrade(&self.inner),
            },
        );

        if let Err(err) = adapter.backend.p2p_set_data_received_cb(self.inner.handle) {
            log::error!("Failed to set callback: {}", err);
            *self.inner.listener.lock().unwrap() = previous;
            return Err(err.into_error("Failed to set callback"));
        }
        Ok(())
    }

    #[named]
    pub fn unset_receive_ndef_listener(&self) -> Result<()> {
        trace!("{}: {}", function_name!(), self.inner.handle);
        let adapter = &self.inner.adapter;
        adapter.gate.check(privilege::NFC_P2P)?;

        adapter
            .backend
            .p2p_unset_data_received_cb(self.inner.handle)
            .map_err(|err| err.into_error("Error while unsetting ReceiveNDEFListener"))?;
        if self.inner.listener.lock().unwrap().take().is_none() {
            warn!("Peer {} had no receive listener", self.inner.handle);
        }
        Ok(())
    }

    #[named]
    pub fn send_ndef(&self, message: &NdefMessage, reply: Reply<()>) -> Result<()> {
        trace!("{}: {}", function_name!(), self.inner.handle);
        let adapter = &self.inner.adapter;
        adapter.gate.check(privilege::NFC_P2P)?;

        let bytes = match message.to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => {
                adapter.dispatcher.reply(
                    "nfc send ndef",
                    reply,
                    Err(Error::InvalidValues("Message is not correct".to_string())),
                );
                return Ok(());
            }
        };

        let request = adapter.next_request_id();
        adapter.requests.begin(request, NfcRequest::SendNdef(reply))?;
        if let Err(err) = adapter.backend.p2p_send(self.inner.handle, &bytes, request) {
            let message = format!("Unknown error while nfc_p2p_send: {}", err);
            log::error!("{}", message);
            if let Some(pending) = adapter.requests.abort(&request) {
                pending.fail(&adapter.dispatcher, Error::Unknown(message));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextManager, ScriptContext};
    use crate::dispatch::{idle_queue, EventLoop};
    use crate::fake::nfc::{FakeNfcBackend, NfcCall};
    use crate::nfc::{NdefRecord, NfcError, PeerEvent};
    use crate::privilege::AllowAll;

    struct Fixture {
        fake: Arc<FakeNfcBackend>,
        event_loop: EventLoop,
        contexts: ContextManager,
        ctx: ScriptContext,
        peer: NfcPeer,
        target: NativeHandle,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeNfcBackend::new());
        let (dispatcher, mut event_loop) = idle_queue();
        let adapter = NfcAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll));
        let contexts = ContextManager::new();
        contexts.add_observer(adapter.as_observer());
        let ctx = contexts.create();

        let (listener, mut rx) = Listener::channel(&ctx);
        adapter.set_peer_listener(listener).unwrap();
        let target = fake.attach_target();
        event_loop.run_until_idle();
        let peer = match rx.try_recv().unwrap() {
            PeerEvent::Attached(peer) => peer,
            other => panic!("unexpected {:?}", other),
        };
        Fixture { fake, event_loop, contexts, ctx, peer, target }
    }

    fn message() -> NdefMessage {
        NdefMessage::new(vec![NdefRecord::mime("text/plain", b"ping")])
    }

    #[test]
    fn receives_messages_until_unset() {
        let mut f = fixture();
        assert!(f.peer.is_connected());
        let (listener, mut rx) = Listener::channel(&f.ctx);
        f.peer.set_receive_ndef_listener(listener).unwrap();
        assert!(f.fake.has_data_received_cb(f.target));

        f.fake.receive_peer_data(f.target, message().to_bytes().unwrap());
        // Garbage is dropped
        f.fake.receive_peer_data(f.target, vec![0xff]);
        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), message());
        assert!(rx.try_recv().is_err());

        f.peer.unset_receive_ndef_listener().unwrap();
        assert!(!f.fake.has_data_received_cb(f.target));
        f.fake.receive_peer_data(f.target, message().to_bytes().unwrap());
        f.event_loop.run_until_idle();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn failing_to_set_listener_keeps_previous() {
        let f = fixture();
        f.fake.fail(NfcCall::P2pSetDataReceivedCb, NfcError::IllegalState);
        let (listener, _rx) = Listener::channel(&f.ctx);
        let err = f.peer.set_receive_ndef_listener(listener).unwrap_err();
        assert_eq!(err, Error::Unknown("Failed to set callback".to_string()));
        assert!(f.peer.inner.listener.lock().unwrap().is_none());
    }

    #[test]
    fn send_ndef_reports_native_result() {
        let mut f = fixture();
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.peer.send_ndef(&message(), reply).unwrap();
        assert_eq!(f.fake.complete_pending_sends(Ok(())), 1);
        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(f.fake.sent_messages(), vec![message().to_bytes().unwrap()]);

        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.peer.send_ndef(&message(), reply).unwrap();
        f.fake.complete_pending_sends(Err(NfcError::TimedOut));
        f.event_loop.run_until_idle();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(Error::Unknown("Unknown error while nfc_p2p_send: Timeout error".to_string()))
        );
    }

    #[test]
    fn dropping_last_copy_unsets_native_callback() {
        let f = fixture();
        let (listener, _rx) = Listener::channel(&f.ctx);
        f.peer.set_receive_ndef_listener(listener).unwrap();
        let copy = f.peer.clone();
        let fake = f.fake.clone();
        let target = f.target;
        drop(f);
        assert!(fake.has_data_received_cb(target));
        drop(copy);
        assert!(!fake.has_data_received_cb(target));
    }

    #[test]
    fn unloading_context_forgets_receive_listener() {
        let f = fixture();
        let other = f.contexts.create();
        let (listener, _rx) = Listener::channel(&other);
        f.peer.set_receive_ndef_listener(listener).unwrap();
        f.contexts.unload(&f.ctx);
        assert!(f.fake.has_data_received_cb(f.target));
        f.contexts.unload(&other);
        assert!(!f.fake.has_data_received_cb(f.target));
    }
}
