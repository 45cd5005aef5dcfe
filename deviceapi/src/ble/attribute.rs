use log::{debug, trace};

use crate::ble::{BtError, LowEnergyAdapter, NativeResult};
use crate::callback::Reply;
use crate::context::ScriptContext;
use crate::handle::HandleWrapper;
use crate::privilege;
use crate::{Error, NativeHandle, RequestId, Result};

/// A read or write waiting for its native completion, keyed by the
/// [`RequestId`] given to the backend
pub(crate) enum GattRequest {
    Read(Reply<Vec<u8>>),
    Write(Reply<()>),
}

impl GattRequest {
    pub(crate) fn context(&self) -> &ScriptContext {
        match self {
            GattRequest::Read(reply) => reply.context(),
            GattRequest::Write(reply) => reply.context(),
        }
    }

    fn fail(self, adapter: &LowEnergyAdapter, error: Error) {
        match self {
            GattRequest::Read(reply) => adapter.dispatcher.reply("gatt read", reply, Err(error)),
            GattRequest::Write(reply) => adapter.dispatcher.reply("gatt write", reply, Err(error)),
        }
    }
}

/// What characteristics and descriptors have in common: a native attribute
/// handle that can be read and written, kept valid by a shared client.
#[derive(Clone)]
pub(crate) struct GattAttribute {
    pub(crate) adapter: LowEnergyAdapter,
    pub(crate) client: HandleWrapper,
    pub(crate) handle: NativeHandle,
}

impl GattAttribute {
    pub(crate) fn new(adapter: LowEnergyAdapter, client: HandleWrapper, handle: NativeHandle) -> Self {
        GattAttribute { adapter, client, handle }
    }

    pub(crate) fn uuid(&self) -> Result<String> {
        self.adapter
            .backend
            .gatt_uuid(self.handle)
            .map_err(|err| err.into_error("Failed to get UUID"))
    }

    // A disabled adapter is the one failure the caller sees directly, every
    // other native error is delivered through the request's callback
    fn start(&self, request: GattRequest, native: impl FnOnce(RequestId) -> NativeResult<()>) -> Result<()> {
        let id = self.adapter.next_request_id();
        self.adapter.requests.begin(id, request)?;
        trace!("GATT request {} on {}", id, self.handle);

        match native(id) {
            Ok(()) => Ok(()),
            Err(BtError::NotEnabled) => {
                self.adapter.requests.abort(&id);
                Err(Error::InvalidState("LE is currently not enabled".to_string()))
            }
            Err(err) => {
                debug!("GATT request {} failed to start: {}", id, err);
                if let Some(request) = self.adapter.requests.abort(&id) {
                    request.fail(&self.adapter, Error::Unknown(err.to_string()));
                }
                Ok(())
            }
        }
    }

    pub(crate) fn read_value(&self, reply: Reply<Vec<u8>>) -> Result<()> {
        self.adapter.gate.check(privilege::BLUETOOTH_ADMIN)?;
        let backend = self.adapter.backend.clone();
        let handle = self.handle;
        self.start(GattRequest::Read(reply), move |id| backend.read_value(handle, id))
    }

    pub(crate) fn write_value(&self, value: &[u8], reply: Reply<()>) -> Result<()> {
        self.adapter.gate.check(privilege::BLUETOOTH_ADMIN)?;

        // The value to write is staged on the attribute before the write starts
        match self.adapter.backend.set_value(self.handle, value) {
            Ok(()) => {}
            Err(BtError::NotEnabled) => {
                return Err(Error::InvalidState("LE is currently not enabled".to_string()))
            }
            Err(err) => {
                debug!("Failed to set value of {}: {}", self.handle, err);
                self.adapter
                    .dispatcher
                    .reply("gatt write", reply, Err(Error::Unknown(err.to_string())));
                return Ok(());
            }
        }

        let backend = self.adapter.backend.clone();
        let handle = self.handle;
        self.start(GattRequest::Write(reply), move |id| backend.write_value(handle, id))
    }

    pub(crate) async fn read(&self, context: &ScriptContext) -> Result<Vec<u8>> {
        let (reply, rx) = Reply::channel(context);
        self.read_value(reply)?;
        rx.await
            .map_err(|_| Error::Unknown("Read request was dropped".to_string()))?
    }

    pub(crate) async fn write(&self, context: &ScriptContext, value: &[u8]) -> Result<()> {
        let (reply, rx) = Reply::channel(context);
        self.write_value(value, reply)?;
        rx.await
            .map_err(|_| Error::Unknown("Write request was dropped".to_string()))?
    }
}
