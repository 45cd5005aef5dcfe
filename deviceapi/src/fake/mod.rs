pub mod ble;
pub mod nfc;
