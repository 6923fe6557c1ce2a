// This file is part of OpenSilky.
//
// OpenSilky is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// OpenSilky is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with OpenSilky.  If not, see <http://www.gnu.org/licenses/>.

// Shift-JIS helpers for the AI5WIN/AIWIN script formats. The engines
// distinguish two-byte (zenkaku) from one-byte (hankaku) text at the opcode
// level, so byte classification matters as much as conversion here.
//
// Note that the classification predicates are intentionally asymmetric,
// matching the engine: 0xFA-0xFC are zenkaku lead bytes, but they are *not*
// excluded from the hankaku range the VM accepts.

use anyhow::{bail, Result};
use encoding_rs::SHIFT_JIS;

fn in_range(b: u8, low: u8, high: u8) -> bool {
    b >= low && b <= high
}

/// Would the VM accept this byte as part of a one-byte (hankaku) string?
pub fn is_hankaku(b: u8) -> bool {
    !in_range(b, 0x81, 0x9f) && !in_range(b, 0xe0, 0xef)
}

/// Is this a lead byte of a two-byte (zenkaku) character?
pub fn is_zenkaku(b: u8) -> bool {
    in_range(b, 0x81, 0x9f) || in_range(b, 0xe0, 0xef) || in_range(b, 0xfa, 0xfc)
}

/// Do these two bytes form a valid Shift-JIS character?
pub fn pair_is_valid(hi: u8, lo: u8) -> bool {
    SHIFT_JIS
        .decode_without_bom_handling_and_without_replacement(&[hi, lo])
        .map(|s| s.chars().count() == 1)
        .unwrap_or(false)
}

/// Strict Shift-JIS to UTF-8 conversion; any invalid sequence is an error.
pub fn to_utf8(bytes: &[u8]) -> Result<String> {
    match SHIFT_JIS.decode_without_bom_handling_and_without_replacement(bytes) {
        Some(s) => Ok(s.into_owned()),
        None => bail!("invalid Shift-JIS sequence"),
    }
}

/// Strict UTF-8 to Shift-JIS conversion; unmappable characters are an error.
pub fn from_utf8(text: &str) -> Result<Vec<u8>> {
    let (bytes, _, had_errors) = SHIFT_JIS.encode(text);
    if had_errors {
        bail!("string is not representable in Shift-JIS: {:?}", text);
    }
    Ok(bytes.into_owned())
}

/// The encoded width of a single character: 1 for hankaku, 2 for zenkaku.
pub fn char_width(ch: char) -> Result<usize> {
    let mut utf8 = [0u8; 4];
    let bytes = from_utf8(ch.encode_utf8(&mut utf8))?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_ascii_as_hankaku() {
        assert!(is_hankaku(b'A'));
        assert!(!is_zenkaku(b'A'));
    }

    #[test]
    fn classifies_lead_bytes() {
        assert!(is_zenkaku(0x82));
        assert!(!is_hankaku(0x82));
        assert!(is_zenkaku(0xe0));
        // The 0xFA-0xFC oddity: zenkaku lead, yet inside the hankaku range.
        assert!(is_zenkaku(0xfa));
        assert!(is_hankaku(0xfa));
        // Half-width katakana are single bytes.
        assert!(is_hankaku(0xb1));
        assert!(!is_zenkaku(0xb1));
    }

    #[test]
    fn round_trips_kana() -> Result<()> {
        let sjis = [0x82u8, 0xa0, 0x82, 0xa2]; // あい
        let text = to_utf8(&sjis)?;
        assert_eq!(text, "あい");
        assert_eq!(from_utf8(&text)?, sjis);
        Ok(())
    }

    #[test]
    fn rejects_invalid_pairs() {
        assert!(pair_is_valid(0x82, 0xa0));
        assert!(!pair_is_valid(0x82, 0x00));
        assert!(to_utf8(&[0x82, 0x00]).is_err());
    }

    #[test]
    fn char_widths() -> Result<()> {
        assert_eq!(char_width('A')?, 1);
        assert_eq!(char_width('あ')?, 2);
        Ok(())
    }
}
