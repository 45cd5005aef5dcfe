use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod uuid;

pub mod context;
pub use context::{ContextId, ContextManager, ContextObserver, ScriptContext};

pub mod callback;
pub use callback::{Listener, Reply};

pub mod dispatch;
pub use dispatch::{DeferredJob, Dispatcher, EventLoop};

pub mod handle;
pub use handle::{HandleWrapper, ReleaseHooks};

pub mod registry;
pub use registry::CallbackRegistry;

pub mod pending;
pub use pending::PendingOperationTable;

pub mod privilege;
pub use privilege::{AllowAll, PrivilegeGate};

pub mod session;
pub use session::{LoopMode, Session, SessionConfig};

pub mod ble;
pub mod nfc;

pub mod fake;

/// An opaque identifier for a resource owned by a native SDK (a GATT client,
/// a GATT attribute, an advertiser, an NFC tag or peer...)
///
/// The value has no meaning outside of the backend that handed it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(pub u64);
impl fmt::Display for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identifies a listener within one [`CallbackRegistry`]
///
/// Ids are allocated from a simple counter and never reused, so a stale id
/// can never remove somebody else's listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(pub u64);
impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The typed stand-in for a native `user_data` pointer.
///
/// Facades hand a `RequestId` to the native layer when starting an
/// operation and the native completion comes back carrying the same id,
/// which is then looked up in a [`PendingOperationTable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);
impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MAC(u64);
impl fmt::Display for MAC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let bytes = u64::to_le_bytes(self.0);
        write!(f,
               "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
               bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5])
    }
}

/// The address of a remote Bluetooth device
///
/// Well formed 48 bit MAC addresses are parsed so that two spellings of the
/// same address (upper or lower case hex) compare equal. Anything else is kept
/// verbatim since native stacks are free to hand out other identifiers.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Address {
    MAC(MAC),
    String(String),
}
impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "{}", mac),
            Address::String(s) => write!(f, "{}", s),
        }
    }
}
impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::MAC(mac) => write!(f, "MAC:{}", mac),
            Address::String(s) => write!(f, "String:{}", s),
        }
    }
}

// No allocation on the 'not a MAC' path since plenty of valid addresses
// aren't MAC addresses.
fn try_u64_from_mac48_str(s: &str) -> Option<u64> {
    if !s.contains(':') {
        return None;
    }
    let mut parts = ArrayVec::<_, 6>::new();
    for part in s.split(':') {
        if parts.try_push(part).is_err() {
            return None;
        }
    }
    if parts.len() != 6 {
        return None;
    }
    let mut bytes = [0u8; 8];
    for (i, part) in parts.iter().enumerate() {
        if part.len() != 2 {
            return None;
        }
        bytes[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(u64::from_le_bytes(bytes))
}

impl FromStr for Address {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, std::convert::Infallible> {
        match try_u64_from_mac48_str(s) {
            Some(val) => Ok(Address::MAC(MAC(val))),
            None => Ok(Address::String(s.to_string())),
        }
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        match try_u64_from_mac48_str(s) {
            Some(val) => Address::MAC(MAC(val)),
            None => Address::String(s.to_string()),
        }
    }
}

/// Errors surfaced to consumers of the device APIs
///
/// Every public entry point reports failures with one of these kinds, never
/// with a backend specific type. The message is meant for humans and is
/// passed through to the script as the exception message.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    NotSupported(String),

    #[error("{0}")]
    ServiceNotAvailable(String),

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    InvalidValues(String),

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Security(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// The name of the exception type the scripting layer should raise
    pub fn name(&self) -> &'static str {
        match self {
            Error::InvalidState(_) => "InvalidStateError",
            Error::NotFound(_) => "NotFoundError",
            Error::NotSupported(_) => "NotSupportedError",
            Error::ServiceNotAvailable(_) => "ServiceNotAvailableError",
            Error::TypeMismatch(_) => "TypeMismatchError",
            Error::InvalidValues(_) => "InvalidValuesError",
            Error::QuotaExceeded(_) => "QuotaExceededError",
            Error::Security(_) => "SecurityError",
            Error::Unknown(_) => "UnknownError",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::InvalidState(msg)
            | Error::NotFound(msg)
            | Error::NotSupported(msg)
            | Error::ServiceNotAvailable(msg)
            | Error::TypeMismatch(msg)
            | Error::InvalidValues(msg)
            | Error::QuotaExceeded(msg)
            | Error::Security(msg)
            | Error::Unknown(msg) => msg,
        }
    }
}

// Internal failures that don't map onto a specific kind degrade to Unknown
// with a generic message, the details only go to the log.
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        log::error!("Internal failure: {:?}", err);
        Error::Unknown("Unknown error".to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
