use const_format::concatcp;

use crate::{Error, Result};

const PRIVILEGE_PREFIX: &str = "http://tizen.org/privilege/";

pub const BLUETOOTH_ADMIN: &str = concatcp!(PRIVILEGE_PREFIX, "bluetooth.admin");

pub const NFC_COMMON: &str = concatcp!(PRIVILEGE_PREFIX, "nfc.common");
pub const NFC_ADMIN: &str = concatcp!(PRIVILEGE_PREFIX, "nfc.admin");
pub const NFC_TAG: &str = concatcp!(PRIVILEGE_PREFIX, "nfc.tag");
pub const NFC_P2P: &str = concatcp!(PRIVILEGE_PREFIX, "nfc.p2p");
pub const NFC_CARD_EMULATION: &str = concatcp!(PRIVILEGE_PREFIX, "nfc.cardemulation");

/// Consulted synchronously before every public operation, before anything
/// is dispatched to a native SDK.
pub trait PrivilegeGate: Send + Sync {
    fn check(&self, privilege: &str) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;
impl PrivilegeGate for AllowAll {
    fn check(&self, _privilege: &str) -> Result<()> {
        Ok(())
    }
}

/// A gate that only grants an explicit set of privileges
#[derive(Debug, Default, Clone)]
pub struct GrantedPrivileges {
    granted: Vec<String>,
}

impl GrantedPrivileges {
    pub fn new<I, S>(privileges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GrantedPrivileges {
            granted: privileges.into_iter().map(Into::into).collect(),
        }
    }
}

impl PrivilegeGate for GrantedPrivileges {
    fn check(&self, privilege: &str) -> Result<()> {
        if self.granted.iter().any(|p| p == privilege) {
            Ok(())
        } else {
            Err(Error::Security(format!("Permission denied: {}", privilege)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_tizen_uris() {
        assert_eq!(BLUETOOTH_ADMIN, "http://tizen.org/privilege/bluetooth.admin");
        assert_eq!(NFC_CARD_EMULATION, "http://tizen.org/privilege/nfc.cardemulation");
    }

    #[test]
    fn granted_privileges_refuse_others() {
        let gate = GrantedPrivileges::new(vec![NFC_COMMON]);
        assert!(gate.check(NFC_COMMON).is_ok());
        assert!(matches!(gate.check(NFC_ADMIN), Err(Error::Security(_))));
        assert!(AllowAll.check(NFC_ADMIN).is_ok());
    }
}
