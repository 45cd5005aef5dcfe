use ::uuid::Uuid;

// 0000xxxx-0000-1000-8000-00805f9b34fb
const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;

fn expand_short(value: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((value as u128) << 96))
}

/// Parses the UUID spellings scripts are allowed to use: the 16 and 32 bit
/// short forms ("180d", "0000180d") as well as the full 128 bit form.
pub fn parse_bluetooth_uuid(s: &str) -> Option<Uuid> {
    let is_hex = !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit());
    match s.len() {
        4 | 8 if is_hex => u32::from_str_radix(s, 16).ok().map(expand_short),
        _ => Uuid::parse_str(s).ok(),
    }
}

/// Checks `s` is a Bluetooth UUID and returns it in the lowercase form the
/// native stack expects, keeping short forms short.
pub fn normalize_bluetooth_uuid(s: &str) -> Option<String> {
    let uuid = parse_bluetooth_uuid(s)?;
    match s.len() {
        4 | 8 => Some(s.to_ascii_lowercase()),
        _ => Some(uuid.to_hyphenated().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_forms_expand_to_base_uuid() {
        let full = parse_bluetooth_uuid("0000180d-0000-1000-8000-00805f9b34fb").unwrap();
        assert_eq!(parse_bluetooth_uuid("180D"), Some(full));
        assert_eq!(parse_bluetooth_uuid("0000180d"), Some(full));
        assert_eq!(
            parse_bluetooth_uuid("1234abcd").unwrap().to_hyphenated().to_string(),
            "1234abcd-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_bluetooth_uuid("18zz"), None);
        assert_eq!(parse_bluetooth_uuid(""), None);
        assert_eq!(normalize_bluetooth_uuid("not-a-uuid"), None);
    }

    #[test]
    fn normalize_keeps_short_forms() {
        assert_eq!(normalize_bluetooth_uuid("180D").as_deref(), Some("180d"));
        assert_eq!(
            normalize_bluetooth_uuid("0000180D-0000-1000-8000-00805F9B34FB").as_deref(),
            Some("0000180d-0000-1000-8000-00805f9b34fb")
        );
    }
}
