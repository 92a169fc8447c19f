// =============================================================================
// EPC → QR Codec
// =============================================================================
//
// Converts the raw EPC hex string read by the gate's antennas into the
// canonical QR code string used by the POS. The encoding is a fixed
// two-character-hex-pair → letter substitution with trailing `F` padding
// stripped; anything outside the table passes through verbatim.
//
// Pure and total: no I/O, no panics, safe to call on untrusted input.
// =============================================================================

use std::collections::HashMap;
use std::sync::OnceLock;

/// Reverse mapping: EPC hex pair → letter, row-major A0..F0 → A..F, etc.
fn table() -> &'static HashMap<&'static str, char> {
    static TABLE: OnceLock<HashMap<&'static str, char>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let rows: [[&str; 6]; 5] = [
            ["A0", "B0", "C0", "D0", "E0", "F0"],
            ["A1", "B1", "C1", "D1", "E1", "F1"],
            ["A2", "B2", "C2", "D2", "E2", "F2"],
            ["A3", "B3", "C3", "D3", "E3", "F3"],
            ["A4", "B4", "", "", "", ""],
        ];
        let letters = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
        let mut map = HashMap::new();
        let mut letter_idx = 0usize;
        for row in rows {
            for pair in row {
                if pair.is_empty() {
                    continue;
                }
                map.insert(pair, letters[letter_idx] as char);
                letter_idx += 1;
            }
        }
        map
    })
}

/// Decode a raw EPC hex string to its canonical QR code.
///
/// 1. Uppercase, then strip trailing runs of `F` (padding).
/// 2. Scan left to right; a recognised two-char pair emits its letter and
///    advances two positions, otherwise the current char passes through
///    verbatim and the scan advances one position.
///
/// Empty input yields empty output. Re-decoding an already-decoded string is
/// not meaningful and is not attempted by callers.
pub fn decode(epc: &str) -> String {
    if epc.is_empty() {
        return String::new();
    }

    let upper = epc.to_uppercase();
    let trimmed = upper.trim_end_matches('F');
    if trimmed.is_empty() {
        return String::new();
    }

    let chars: Vec<char> = trimmed.chars().collect();
    let table = table();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;
    while i < chars.len() {
        if i + 1 < chars.len() {
            let pair: String = chars[i..i + 2].iter().collect();
            if let Some(letter) = table.get(pair.as_str()) {
                out.push(*letter);
                i += 2;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// True iff `epc` is a non-empty hex string of plausible tag length (8..=32).
pub fn is_valid_epc(epc: &str) -> bool {
    if epc.is_empty() || epc.len() < 8 || epc.len() > 32 {
        return false;
    }
    epc.chars().all(|c| c.is_ascii_hexdigit())
}

/// Normalize a raw EPC: uppercase and trim surrounding whitespace.
pub fn normalize_epc(epc: &str) -> String {
    epc.trim().to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_documented_vectors() {
        assert_eq!(decode("A0B0C01234FFFFFFFFFF"), "ABC1234");
        assert_eq!(decode("B3E0A3B3123"), "TEST123");
        assert_eq!(decode("A0B0C0D0E0F0"), "ABCDEF");
        assert_eq!(decode("123456789"), "123456789");
        assert_eq!(decode("A0B0C0D0E0F0FFFFFFFFFF"), "ABCDEF");
    }

    #[test]
    fn non_trailing_f_pairs_are_letters() {
        assert_eq!(decode("F0F0"), "FF");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        assert_eq!(decode(""), "");
    }

    #[test]
    fn all_padding_input_yields_empty_output() {
        assert_eq!(decode("FFFFFFFF"), "");
    }

    #[test]
    fn dangling_trailing_char_passes_through() {
        // Odd-length tail with no pair partner falls through verbatim.
        assert_eq!(decode("A0B"), "AB");
    }

    #[test]
    fn is_valid_epc_checks_hex_and_length() {
        assert!(is_valid_epc("A0B0C01234FFFFFFFFFF"));
        assert!(!is_valid_epc(""));
        assert!(!is_valid_epc("short"));
        assert!(!is_valid_epc("not-hex-at-all-zzzzz"));
    }

    #[test]
    fn normalize_epc_upcases_and_trims() {
        assert_eq!(normalize_epc("  a0b0c0  "), "A0B0C0");
    }
}
