//! NFC: the manager and adapter facades, tags, peers and the boundary to the
//! native NFC SDK.

use std::fmt;
use std::sync::Weak;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::{Error, NativeHandle, RequestId};

pub mod manager;
pub use manager::NfcManager;

pub mod adapter;
pub use adapter::{AidData, HceEvent, NfcAdapter, PeerEvent, TagEvent, TransactionEvent};

pub mod tag;
pub use tag::NfcTag;

pub mod peer;
pub use peer::NfcPeer;

pub mod ndef;
pub use ndef::{NdefMessage, NdefRecord, Tnf};

/// Error codes reported by the native NFC SDK
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NfcError {
    #[error("Input/output error")]
    IoError,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Timeout error")]
    TimedOut,
    #[error("Device is busy")]
    DeviceBusy,
    #[error("Not supported")]
    NotSupported,
    #[error("Operation failed")]
    OperationFailed,
    #[error("Invalid NDEF message")]
    InvalidNdefMessage,
    #[error("Invalid record type")]
    InvalidRecordType,
    #[error("No device connected")]
    NoDevice,
    #[error("NFC is not activated")]
    NotActivated,
    #[error("Already activated")]
    AlreadyActivated,
    #[error("Already deactivated")]
    AlreadyDeactivated,
    #[error("Tag is read only")]
    ReadOnlyNdef,
    #[error("No NDEF message")]
    NoNdefMessage,
    #[error("Not NDEF format")]
    NotNdefFormat,
    #[error("Security restricted")]
    SecurityRestricted,
    #[error("Permission denied")]
    PermissionDenied,
    #[error("Illegal state")]
    IllegalState,
    #[error("NFC is not initialized")]
    NotInitialized,
    #[error("Unknown Error")]
    Other(i32),
}

pub type NfcResult<T> = std::result::Result<T, NfcError>;

impl NfcError {
    /// Translates a native failure into the error kind scripts see, carrying
    /// `message`
    pub fn into_error(self, message: &str) -> Error {
        let message = message.to_string();
        match self {
            NfcError::NotSupported => Error::NotSupported(message),
            NfcError::InvalidParameter => Error::InvalidValues(message),
            NfcError::NotActivated => Error::ServiceNotAvailable(message),
            NfcError::SecurityRestricted | NfcError::PermissionDenied => Error::Security(message),
            NfcError::DeviceBusy => Error::InvalidState(message),
            _ => Error::Unknown(message),
        }
    }

    /// Like [`into_error`](Self::into_error), with the native message
    pub fn to_error(self) -> Error {
        self.into_error(&self.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecureElementType {
    Ese,
    Uicc,
    Hce,
}

impl SecureElementType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ESE" => Some(SecureElementType::Ese),
            "UICC" => Some(SecureElementType::Uicc),
            "HCE" => Some(SecureElementType::Hce),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecureElementType::Ese => "ESE",
            SecureElementType::Uicc => "UICC",
            SecureElementType::Hce => "HCE",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardEmulationMode {
    AlwaysOn,
    Off,
}

impl CardEmulationMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALWAYS_ON" => Some(CardEmulationMode::AlwaysOn),
            "OFF" => Some(CardEmulationMode::Off),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CardEmulationMode::AlwaysOn => "ALWAYS_ON",
            CardEmulationMode::Off => "OFF",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CardEmulationCategory {
    Payment,
    Other,
}

impl CardEmulationCategory {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PAYMENT" => Some(CardEmulationCategory::Payment),
            "OTHER" => Some(CardEmulationCategory::Other),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HceEventType {
    Deactivated,
    Activated,
    ApduReceived,
    Unknown,
}

impl HceEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HceEventType::Deactivated => "DEACTIVATED",
            HceEventType::Activated => "ACTIVATED",
            HceEventType::ApduReceived => "APDU_RECEIVED",
            HceEventType::Unknown => "UNKNOWN_EVENT_RECEIVED",
        }
    }
}

macro_rules! tag_types {
    ($($variant:ident => $name:literal,)*) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum TagType {
            $($variant,)*
        }

        impl TagType {
            pub const ALL: &'static [TagType] = &[$(TagType::$variant,)*];

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($name => Some(TagType::$variant),)*
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(TagType::$variant => $name,)*
                }
            }
        }
    };
}

tag_types! {
    GenericTarget => "GENERIC_TARGET",
    Iso14443A => "ISO14443_A",
    Iso14443_4A => "ISO14443_4A",
    Iso14443_3A => "ISO14443_3A",
    MifareMini => "MIFARE_MINI",
    Mifare1K => "MIFARE_1K",
    Mifare4K => "MIFARE_4K",
    MifareUltra => "MIFARE_ULTRA",
    MifareDesfire => "MIFARE_DESFIRE",
    Iso14443B => "ISO14443_B",
    Iso14443_4B => "ISO14443_4B",
    Iso14443BPrime => "ISO14443_BPRIME",
    Felica => "FELICA",
    Jewel => "JEWEL",
    Iso15693 => "ISO15693",
    UnknownTarget => "UNKNOWN_TARGET",
}

/// Optional parts of the NFC stack a device may lack
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NfcFeature {
    Nfc,
    Tag,
    P2p,
    CardEmulation,
    Hce,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeEventKind {
    SeTypeChanged,
    CardEmulationChanged,
    Other(i32),
}

/// Callbacks that the native NFC SDK delivers, typically from one of its
/// own threads.
#[derive(Clone, Debug)]
pub enum NfcEvent {
    ActivationCompleted {
        request: RequestId,
        result: NfcResult<()>,
    },
    TagDiscovered {
        attached: bool,
        tag: NativeHandle,
    },
    TargetDiscovered {
        attached: bool,
        target: NativeHandle,
    },
    SeEvent(SeEventKind),
    Transaction {
        se_type: SecureElementType,
        aid: Vec<u8>,
        data: Vec<u8>,
    },
    Hce {
        event: HceEventType,
        apdu: Vec<u8>,
    },
    TagReadCompleted {
        request: RequestId,
        result: NfcResult<Vec<u8>>,
    },
    TransceiveCompleted {
        request: RequestId,
        result: NfcResult<Vec<u8>>,
    },
    PeerDataReceived {
        target: NativeHandle,
        message: Vec<u8>,
    },
    PeerSent {
        request: RequestId,
        result: NfcResult<()>,
    },
}

/// The single trampoline through which a backend delivers native NFC
/// callbacks to the adapter. Holds the adapter weakly.
#[derive(Clone)]
pub struct NfcEventSink {
    pub(crate) adapter: Weak<adapter::NfcAdapterInner>,
}

impl fmt::Debug for NfcEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NfcEventSink").finish()
    }
}

impl NfcEventSink {
    pub fn emit(&self, event: NfcEvent) {
        match self.adapter.upgrade() {
            Some(inner) => NfcAdapter::wrap(inner).on_native_event(event),
            None => trace!("Dropping {:?}: adapter is gone", event),
        }
    }
}

/// The native NFC SDK as seen by the manager and adapter.
///
/// Asynchronous completions are reported through the [`NfcEventSink`],
/// which may be invoked from any thread and even before the initiating call
/// returns.
pub trait NfcBackend: Send + Sync {
    fn set_event_sink(&self, sink: Option<NfcEventSink>);

    fn initialize(&self) -> NfcResult<()>;
    fn deinitialize(&self) -> NfcResult<()>;
    fn is_supported(&self, feature: NfcFeature) -> bool;
    fn set_system_handler_enable(&self, enable: bool) -> NfcResult<()>;

    fn is_activated(&self) -> bool;
    fn set_activation(&self, activate: bool, request: RequestId) -> NfcResult<()>;

    fn set_tag_discovered_cb(&self) -> NfcResult<()>;
    fn unset_tag_discovered_cb(&self);
    fn set_p2p_target_discovered_cb(&self) -> NfcResult<()>;
    fn unset_p2p_target_discovered_cb(&self);

    fn card_emulation_mode(&self) -> NfcResult<CardEmulationMode>;
    fn enable_card_emulation(&self) -> NfcResult<()>;
    fn disable_card_emulation(&self) -> NfcResult<()>;
    fn se_type(&self) -> NfcResult<SecureElementType>;
    fn set_se_type(&self, se_type: SecureElementType) -> NfcResult<()>;

    fn set_se_event_cb(&self) -> NfcResult<()>;
    fn unset_se_event_cb(&self);
    fn set_se_transaction_event_cb(&self, se_type: SecureElementType) -> NfcResult<()>;
    fn unset_se_transaction_event_cb(&self, se_type: SecureElementType);
    fn set_transaction_fg_dispatch(&self, enable: bool) -> NfcResult<()>;

    fn set_hce_event_cb(&self) -> NfcResult<()>;
    fn unset_hce_event_cb(&self);
    fn hce_send_apdu_response(&self, apdu: &[u8]) -> NfcResult<()>;
    fn is_activated_handler_for_aid(&self, se_type: SecureElementType, aid: &str) -> NfcResult<bool>;
    fn is_activated_handler_for_category(
        &self, se_type: SecureElementType, category: CardEmulationCategory,
    ) -> NfcResult<bool>;
    fn register_aid(&self, se_type: SecureElementType, category: CardEmulationCategory, aid: &str) -> NfcResult<()>;
    fn unregister_aid(&self, se_type: SecureElementType, category: CardEmulationCategory, aid: &str)
        -> NfcResult<()>;
    fn registered_aids_count(&self, se_type: SecureElementType, category: CardEmulationCategory) -> NfcResult<usize>;
    /// The visitor gets each AID and whether it's read only
    fn foreach_registered_aids(
        &self, se_type: SecureElementType, category: CardEmulationCategory,
        visitor: &mut dyn FnMut(&str, bool) -> bool,
    ) -> NfcResult<()>;

    /// The raw bytes of the last NDEF message received, if any
    fn cached_message(&self) -> NfcResult<Option<Vec<u8>>>;

    fn tag_type(&self, tag: NativeHandle) -> NfcResult<TagType>;
    fn tag_is_ndef_supported(&self, tag: NativeHandle) -> NfcResult<bool>;
    fn tag_ndef_size(&self, tag: NativeHandle) -> NfcResult<u32>;
    fn tag_foreach_information(
        &self, tag: NativeHandle, visitor: &mut dyn FnMut(&str, &[u8]) -> bool,
    ) -> NfcResult<()>;
    fn connected_tag(&self) -> NfcResult<Option<NativeHandle>>;
    fn tag_read_ndef(&self, tag: NativeHandle, request: RequestId) -> NfcResult<()>;
    /// Completes synchronously, the native write has no completion callback
    fn tag_write_ndef(&self, tag: NativeHandle, message: &[u8]) -> NfcResult<()>;
    fn tag_transceive(&self, tag: NativeHandle, data: &[u8], request: RequestId) -> NfcResult<()>;

    fn connected_target(&self) -> NfcResult<Option<NativeHandle>>;
    fn p2p_set_data_received_cb(&self, target: NativeHandle) -> NfcResult<()>;
    fn p2p_unset_data_received_cb(&self, target: NativeHandle) -> NfcResult<()>;
    fn p2p_send(&self, target: NativeHandle, message: &[u8], request: RequestId) -> NfcResult<()>;
}
