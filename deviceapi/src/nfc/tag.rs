use std::collections::BTreeMap;
use std::fmt;

use function_name::named;
use log::{debug, trace};

use crate::callback::Reply;
use crate::context::ScriptContext;
use crate::nfc::adapter::{NfcAdapter, NfcRequest};
use crate::nfc::ndef::NdefMessage;
use crate::nfc::TagType;
use crate::privilege;
use crate::{Error, NativeHandle, Result};

/// A tag in range of the device, as reported to a tag listener
#[derive(Clone)]
pub struct NfcTag {
    adapter: NfcAdapter,
    handle: NativeHandle,
}

impl fmt::Debug for NfcTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NfcTag").field("handle", &self.handle).finish()
    }
}

impl NfcTag {
    pub(crate) fn new(adapter: NfcAdapter, handle: NativeHandle) -> Self {
        NfcTag { adapter, handle }
    }

    pub fn tag_type(&self) -> Result<TagType> {
        self.adapter.backend.tag_type(self.handle).map_err(|err| err.to_error())
    }

    pub fn is_supported_ndef(&self) -> Result<bool> {
        self.adapter
            .backend
            .tag_is_ndef_supported(self.handle)
            .map_err(|err| err.to_error())
    }

    pub fn ndef_size(&self) -> Result<u32> {
        self.adapter.backend.tag_ndef_size(self.handle).map_err(|err| err.to_error())
    }

    /// The tag's extra information, by key
    pub fn properties(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut properties = BTreeMap::new();
        self.adapter
            .backend
            .tag_foreach_information(self.handle, &mut |key, value| {
                properties.insert(key.to_string(), value.to_vec());
                true
            })
            .map_err(|err| err.to_error())?;
        Ok(properties)
    }

    /// Whether this is the tag the native layer currently has connected
    pub fn is_connected(&self) -> bool {
        match self.adapter.backend.connected_tag() {
            Ok(connected) => connected == Some(self.handle),
            Err(err) => {
                debug!("Failed to get the connected tag: {}", err);
                false
            }
        }
    }

    #[named]
    pub fn read_ndef(&self, reply: Reply<NdefMessage>) -> Result<()> {
        trace!("{}: {}", function_name!(), self.handle);
        self.adapter.gate.check(privilege::NFC_TAG)?;

        let request = self.adapter.next_request_id();
        self.adapter.requests.begin(request, NfcRequest::ReadNdef(reply))?;
        if let Err(err) = self.adapter.backend.tag_read_ndef(self.handle, request) {
            log::error!("nfc_tag_read_ndef failed: {}", err);
            if let Some(pending) = self.adapter.requests.abort(&request) {
                pending.fail(&self.adapter.dispatcher, err.to_error());
            }
        }
        Ok(())
    }

    /// The native write has no completion of its own, its result is posted
    /// to `reply` straight away
    #[named]
    pub fn write_ndef(&self, message: &NdefMessage, reply: Reply<()>) -> Result<()> {
        trace!("{}: {}", function_name!(), self.handle);
        self.adapter.gate.check(privilege::NFC_TAG)?;

        let result = match message.to_bytes() {
            Ok(bytes) => self.adapter.backend.tag_write_ndef(self.handle, &bytes).map_err(|err| {
                log::error!("nfc_tag_write_ndef failed: {}", err);
                err.to_error()
            }),
            Err(_) => Err(Error::InvalidValues("Message is not correct".to_string())),
        };
        self.adapter.dispatcher.reply("nfc write ndef", reply, result);
        Ok(())
    }

    /// Sends raw bytes to the tag. While another transceive is in flight the
    /// reply gets an `InvalidState` error.
    #[named]
    pub fn transceive(&self, data: &[u8], reply: Reply<Vec<u8>>) -> Result<()> {
        trace!("{}: {} bytes to {}", function_name!(), data.len(), self.handle);
        self.adapter.gate.check(privilege::NFC_TAG)?;

        let adapter = &self.adapter;
        let request = adapter.next_request_id();
        adapter.requests.begin(request, NfcRequest::Transceive(reply))?;

        if adapter.transceiving.begin((), request).is_err() {
            debug!("Transceive already in progress");
            if let Some(pending) = adapter.requests.abort(&request) {
                pending.fail(&adapter.dispatcher, Error::InvalidState("device is busy".to_string()));
            }
            return Ok(());
        }

        if let Err(err) = adapter.backend.tag_transceive(self.handle, data, request) {
            log::error!("NFC transceive error: {}", err);
            adapter.transceiving.abort(&());
            if let Some(pending) = adapter.requests.abort(&request) {
                pending.fail(&adapter.dispatcher, err.to_error());
            }
        }
        Ok(())
    }

    pub async fn read(&self, context: &ScriptContext) -> Result<NdefMessage> {
        let (reply, rx) = Reply::channel(context);
        self.read_ndef(reply)?;
        rx.await.map_err(|_| Error::Unknown("Read request was dropped".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::Listener;
    use crate::context::ContextManager;
    use crate::dispatch::{idle_queue, EventLoop};
    use crate::fake::nfc::{FakeNfcBackend, FakeTag, NfcCall};
    use crate::nfc::{NdefRecord, NfcError, NfcEvent, TagEvent};
    use crate::RequestId;
    use crate::privilege::AllowAll;
    use std::sync::Arc;

    struct Fixture {
        fake: Arc<FakeNfcBackend>,
        event_loop: EventLoop,
        ctx: ScriptContext,
        tag: NfcTag,
    }

    fn fixture(message: &NdefMessage) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let fake = Arc::new(FakeNfcBackend::new());
        let (dispatcher, mut event_loop) = idle_queue();
        let adapter = NfcAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll));
        let ctx = ContextManager::new().create();

        let (listener, mut rx) = Listener::channel(&ctx);
        adapter.set_tag_listener(&[], listener).unwrap();
        fake.attach_tag(FakeTag {
            tag_type: TagType::MifareUltra,
            ndef_supported: true,
            ndef_size: 48,
            properties: vec![("UID".to_string(), vec![0x04, 0x11])],
            message: message.to_bytes().unwrap(),
        });
        event_loop.run_until_idle();
        let tag = match rx.try_recv().unwrap() {
            TagEvent::Attached(tag) => tag,
            other => panic!("unexpected {:?}", other),
        };
        Fixture { fake, event_loop, ctx, tag }
    }

    fn message() -> NdefMessage {
        NdefMessage::new(vec![NdefRecord::text("hello", "en")])
    }

    #[test]
    fn properties_of_attached_tag() {
        let f = fixture(&message());
        assert_eq!(f.tag.tag_type().unwrap(), TagType::MifareUltra);
        assert!(f.tag.is_supported_ndef().unwrap());
        assert_eq!(f.tag.ndef_size().unwrap(), 48);
        assert_eq!(f.tag.properties().unwrap().get("UID"), Some(&vec![0x04, 0x11]));
        assert!(f.tag.is_connected());
    }

    #[test]
    fn read_ndef_resolves_with_message() {
        let mut f = fixture(&message());
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.read_ndef(reply).unwrap();
        assert_eq!(f.fake.complete_pending_reads(), 1);
        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(message()));
    }

    #[test]
    fn read_ndef_native_failure_is_posted() {
        let mut f = fixture(&message());
        f.fake.fail(NfcCall::TagReadNdef, NfcError::NotActivated);
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.read_ndef(reply).unwrap();
        f.event_loop.run_until_idle();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::ServiceNotAvailable(_))));
    }

    #[test]
    fn write_ndef_posts_result() {
        let mut f = fixture(&message());
        let written = NdefMessage::new(vec![NdefRecord::uri("https://tizen.org")]);
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.write_ndef(&written, reply).unwrap();
        f.event_loop.run_until_idle();
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(f.fake.written_messages(), vec![written.to_bytes().unwrap()]);

        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.write_ndef(&NdefMessage::default(), reply).unwrap();
        f.event_loop.run_until_idle();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::InvalidValues(_))));
    }

    #[test]
    fn second_transceive_is_busy() {
        let mut f = fixture(&message());
        let (first, mut first_rx) = Reply::channel(&f.ctx);
        let (second, mut second_rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30, 0x00], first).unwrap();
        f.tag.transceive(&[0x30, 0x04], second).unwrap();
        f.event_loop.run_until_idle();
        assert_eq!(second_rx.try_recv().unwrap(), Err(Error::InvalidState("device is busy".to_string())));

        assert_eq!(f.fake.complete_transceives(vec![0xaa]), 1);
        f.event_loop.run_until_idle();
        assert_eq!(first_rx.try_recv().unwrap(), Ok(vec![0xaa]));

        // Idle again
        let (third, _third_rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30, 0x08], third).unwrap();
        assert_eq!(f.fake.count(NfcCall::TagTransceive), 2);
    }

    #[test]
    fn failed_transceive_frees_the_slot() {
        let mut f = fixture(&message());
        f.fake.fail(NfcCall::TagTransceive, NfcError::IoError);
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30], reply).unwrap();
        f.event_loop.run_until_idle();
        assert!(matches!(rx.try_recv().unwrap(), Err(Error::Unknown(_))));

        f.fake.clear_failures();
        let (reply, _rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30], reply).unwrap();
        assert!(f.tag.adapter.transceiving.is_pending(&()));
    }

    #[test]
    fn stray_transceive_completion_keeps_the_slot_busy() {
        let mut f = fixture(&message());
        let (first, mut first_rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30, 0x00], first).unwrap();
        let in_flight = RequestId(1);
        assert!(f.tag.adapter.requests.is_pending(&in_flight));

        f.fake.emit(NfcEvent::TransceiveCompleted { request: RequestId(99), result: Ok(vec![0xee]) });
        assert!(f.tag.adapter.transceiving.is_pending(&()));
        let (second, mut second_rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30, 0x04], second).unwrap();
        f.event_loop.run_until_idle();
        assert_eq!(second_rx.try_recv().unwrap(), Err(Error::InvalidState("device is busy".to_string())));
        assert!(first_rx.try_recv().is_err());

        f.fake.emit(NfcEvent::TransceiveCompleted { request: in_flight, result: Ok(vec![0xaa]) });
        f.event_loop.run_until_idle();
        assert_eq!(first_rx.try_recv().unwrap(), Ok(vec![0xaa]));
        assert!(!f.tag.adapter.transceiving.is_pending(&()));
    }

    #[test]
    fn completion_of_the_wrong_kind_still_answers_the_request() {
        let mut f = fixture(&message());
        let (reply, mut rx) = Reply::channel(&f.ctx);
        f.tag.transceive(&[0x30], reply).unwrap();

        f.fake.emit(NfcEvent::PeerSent { request: RequestId(1), result: Ok(()) });
        f.event_loop.run_until_idle();
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(Error::Unknown("Unexpected p2p send completion".to_string()))
        );
        assert!(f.tag.adapter.requests.is_empty());
        assert!(!f.tag.adapter.transceiving.is_pending(&()));
    }

    #[tokio::test]
    async fn async_read_through_spawned_loop() {
        let fake = Arc::new(FakeNfcBackend::new());
        fake.set_auto_complete(true);
        let (dispatcher, event_loop) = idle_queue();
        tokio::spawn(event_loop.run());
        let adapter = NfcAdapter::new(fake.clone(), dispatcher, Arc::new(AllowAll));
        let ctx = ContextManager::new().create();

        let handle = fake.attach_tag(FakeTag { message: message().to_bytes().unwrap(), ..Default::default() });
        let tag = NfcTag::new(adapter, handle);
        assert_eq!(tag.read(&ctx).await.unwrap(), message());
    }
}
