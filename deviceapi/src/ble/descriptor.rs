use std::fmt;

use crate::ble::attribute::GattAttribute;
use crate::ble::LowEnergyAdapter;
use crate::callback::Reply;
use crate::context::ScriptContext;
use crate::handle::HandleWrapper;
use crate::{NativeHandle, Result};

#[derive(Clone)]
pub struct GattDescriptor {
    attribute: GattAttribute,
}

impl fmt::Debug for GattDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattDescriptor")
            .field("handle", &self.attribute.handle)
            .finish()
    }
}

impl GattDescriptor {
    pub(crate) fn new(adapter: LowEnergyAdapter, client: HandleWrapper, handle: NativeHandle) -> Self {
        GattDescriptor {
            attribute: GattAttribute::new(adapter, client, handle),
        }
    }

    pub fn uuid(&self) -> Result<String> {
        self.attribute.uuid()
    }

    pub fn read_value(&self, reply: Reply<Vec<u8>>) -> Result<()> {
        self.attribute.read_value(reply)
    }

    pub fn write_value(&self, value: &[u8], reply: Reply<()>) -> Result<()> {
        self.attribute.write_value(value, reply)
    }

    pub async fn read(&self, context: &ScriptContext) -> Result<Vec<u8>> {
        self.attribute.read(context).await
    }

    pub async fn write(&self, context: &ScriptContext, value: &[u8]) -> Result<()> {
        self.attribute.write(context, value).await
    }
}
