//! Advertisement filter for iFit equipment discovery.
//!
//! Device discovery / advertisement scanning itself is out of scope; this
//! module is the thin, pure filter the scan loop calls per
//! advertisement, plus the byte-reversal helpers that relate a displayed
//! 4-hex-digit BLE code to the manufacturer-data suffix.

/// Marker byte iFit equipment puts three bytes from the end of its
/// manufacturer data payload.
const MARKER_BYTE: u8 = 0xDD;

/// Returns the displayed 4-hex-digit BLE code embedded in `payload`, or
/// `None` if `payload` doesn't look like an iFit advertisement.
///
/// `payload[-3] == 0xDD`; the last two bytes, byte-reversed, are the
/// displayed code.
pub fn extract_ble_code(payload: &[u8]) -> Option<String> {
    if payload.len() < 3 {
        return None;
    }
    let n = payload.len();
    if payload[n - 3] != MARKER_BYTE {
        return None;
    }
    Some(format!("{:02X}{:02X}", payload[n - 1], payload[n - 2]))
}

/// Builds the manufacturer-data suffix that identifies a device advertising
/// displayed code `WXYZ`, i.e. `[0xDD, 0xYZ, 0xWX]`.
pub fn suffix_for_code(code: &str) -> Option<[u8; 3]> {
    if code.len() != 4 {
        return None;
    }
    let wx = u8::from_str_radix(&code[0..2], 16).ok()?;
    let yz = u8::from_str_radix(&code[2..4], 16).ok()?;
    Some([MARKER_BYTE, yz, wx])
}

/// Returns `true` if `payload` is an advertisement for the equipment
/// displaying `code`.
pub fn matches_code(payload: &[u8], code: &str) -> bool {
    let Some(suffix) = suffix_for_code(code) else {
        return false;
    };
    payload.ends_with(&suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_code_from_trailing_bytes() {
        // Displayed code "AB12": suffix is [0xDD, 0x12, 0xAB].
        let payload = [0x01, 0x02, 0xDD, 0x12, 0xAB];
        assert_eq!(extract_ble_code(&payload).as_deref(), Some("AB12"));
    }

    #[test]
    fn non_matching_marker_is_rejected() {
        let payload = [0x01, 0x02, 0x00, 0x12, 0xAB];
        assert_eq!(extract_ble_code(&payload), None);
    }

    #[test]
    fn matches_code_round_trips_with_suffix_for_code() {
        let suffix = suffix_for_code("AB12").unwrap();
        let mut payload = vec![0xAA, 0xBB];
        payload.extend_from_slice(&suffix);
        assert!(matches_code(&payload, "AB12"));
        assert!(!matches_code(&payload, "FFFF"));
    }
}
