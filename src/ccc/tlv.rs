// BtCrab - GPL-3.0-or-later
// This file is part of BtCrab.
//
// Copyright (C) 2025 Daniel Freiermuth
//
// BtCrab is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// BtCrab is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with BtCrab.  If not, see <https://www.gnu.org/licenses/>.

//! Recursive BER-TLV walker.
//!
//! Tags are one byte, or two when the low five bits of the first byte are
//! all set. Lengths use the short form or the `0x81`/`0x82` long forms.
//! Running out of bytes ends the current nesting level with a `[Truncated]`
//! parameter; everything parsed before it is kept.

use super::dictionary::{TagDictionary, WalkState};
use super::CccParam;
use crate::parser::hex_upper;
use std::fmt;

pub const TRUNCATED: &str = "[Truncated]";

/// A one or two byte BER tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    value: u16,
    wide: bool,
}

impl Tag {
    pub const SEQUENCE: Self = Self::short(0x30);
    pub const STATUS_OBJECT: Self = Self::short(0xA0);
    pub const STATUS: Self = Self::short(0x83);

    pub const fn short(byte: u8) -> Self {
        Self {
            value: byte as u16,
            wide: false,
        }
    }

    pub const fn wide(value: u16) -> Self {
        Self { value, wide: true }
    }

    pub const fn value(self) -> u16 {
        self.value
    }

    pub const fn lead_byte(self) -> u8 {
        if self.wide {
            (self.value >> 8) as u8
        } else {
            self.value as u8
        }
    }

    /// Constructed tags the walker descends into
    pub fn is_container(self) -> bool {
        self.lead_byte() == 0x7F || self == Self::SEQUENCE || self == Self::STATUS_OBJECT
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.wide {
            write!(f, "{:04X}", self.value)
        } else {
            write!(f, "{:02X}", self.value)
        }
    }
}

/// Decode a TLV buffer into an ordered, indented parameter list.
///
/// The walk state starts fresh for every call; it is shared by all nesting
/// levels of this one walk.
pub fn decode_tlv(bytes: &[u8], dictionary: &dyn TagDictionary) -> Vec<CccParam> {
    profiling::scope!("decode_tlv");
    let mut state = WalkState::default();
    let mut params = Vec::new();
    walk(bytes, 0, dictionary, &mut state, &mut params);
    params
}

/// Same as [`decode_tlv`] but starting at a given depth and appending to
/// an existing list
pub fn decode_tlv_into(
    bytes: &[u8],
    depth: usize,
    dictionary: &dyn TagDictionary,
    state: &mut WalkState,
    params: &mut Vec<CccParam>,
) {
    walk(bytes, depth, dictionary, state, params);
}

enum Length {
    Value(usize),
    Truncated,
    Unsupported(u8),
}

fn read_length(bytes: &[u8], pos: &mut usize) -> Length {
    let Some(&first) = bytes.get(*pos) else {
        return Length::Truncated;
    };
    *pos += 1;
    match first {
        0x00..=0x7F => Length::Value(usize::from(first)),
        0x81 => match bytes.get(*pos) {
            Some(&len) => {
                *pos += 1;
                Length::Value(usize::from(len))
            }
            None => Length::Truncated,
        },
        0x82 => match bytes.get(*pos..*pos + 2) {
            Some(raw) => {
                *pos += 2;
                Length::Value(usize::from(u16::from_be_bytes([raw[0], raw[1]])))
            }
            None => Length::Truncated,
        },
        other => Length::Unsupported(other),
    }
}

fn walk(
    bytes: &[u8],
    depth: usize,
    dictionary: &dyn TagDictionary,
    state: &mut WalkState,
    params: &mut Vec<CccParam>,
) {
    let mut pos = 0;
    while pos < bytes.len() {
        let first = bytes[pos];
        if first == 0x00 || first == 0xFF {
            pos += 1;
            continue;
        }
        pos += 1;

        let tag = if first & 0x1F == 0x1F {
            let Some(&second) = bytes.get(pos) else {
                params.push(CccParam::new(depth, format!("Tag {first:02X}"), TRUNCATED));
                return;
            };
            pos += 1;
            Tag::wide(u16::from_be_bytes([first, second]))
        } else {
            Tag::short(first)
        };
        let label = dictionary.tag_label(tag);

        let len = match read_length(bytes, &mut pos) {
            Length::Value(len) => len,
            Length::Truncated => {
                params.push(CccParam::new(depth, label, TRUNCATED));
                return;
            }
            Length::Unsupported(byte) => {
                params.push(CccParam::new(
                    depth,
                    label,
                    format!("[Unsupported Length 0x{byte:02X}]"),
                ));
                return;
            }
        };

        let Some(value) = pos.checked_add(len).and_then(|end| bytes.get(pos..end)) else {
            tracing::trace!("TLV tag {tag} declares {len} bytes, {} left", bytes.len() - pos);
            params.push(CccParam::new(depth, label, TRUNCATED));
            return;
        };
        pos += len;

        if tag.is_container() {
            params.push(CccParam::new(depth, label, format!("{len} bytes")));
            walk(value, depth + 1, dictionary, state, params);
        } else {
            let rendered = dictionary.render_leaf(tag, value, state);
            params.push(CccParam::new(depth, label, rendered));
        }
    }
}

/// Fallback leaf rendering
pub fn render_hex(value: &[u8]) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        hex_upper(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccc::dictionary::{ApduTags, RkeTags};
    use crate::parser::parse_hex;

    fn decode_hex(hex: &str, dictionary: &dyn TagDictionary) -> Vec<CccParam> {
        decode_tlv(&parse_hex(hex).expect("valid hex"), dictionary)
    }

    #[test]
    fn test_long_form_length() {
        let params = decode_hex("30 81 05 80 01 01 81 00", &RkeTags);
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].label, "Sequence");
        assert_eq!(params[0].value, "5 bytes");
        assert_eq!(params[1].depth, 1);
        assert_eq!(params[1].label, "Function_ID");
        assert_eq!(params[2].depth, 1);
        assert_eq!(params[2].label, "Action_ID");
    }

    #[test]
    fn test_two_byte_length() {
        let mut bytes = vec![0x4D, 0x82, 0x01, 0x00];
        bytes.extend(std::iter::repeat_n(0xAB, 256));
        let params = decode_tlv(&bytes, &ApduTags);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].label, "Vehicle_ID");
        assert_eq!(params[0].value.len(), 512);
    }

    #[test]
    fn test_truncation_stops_current_level_only() {
        // Inner leaf claims 9 bytes, then the outer walk continues with 4C
        let params = decode_hex("30 03 86 09 01 4C 01 07", &ApduTags);
        let labels: Vec<&str> = params.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["Sequence", "Endpoint_ePK", "Transaction_ID"]);
        assert_eq!(params[1].value, TRUNCATED);
        assert_eq!(params[2].value, "07");
    }

    #[test]
    fn test_truncated_top_level_keeps_earlier_tags() {
        let params = decode_hex("4C 01 07 9D 10 01 02", &ApduTags);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, "07");
        assert_eq!(params[1].label, "Cryptogram");
        assert_eq!(params[1].value, TRUNCATED);
    }

    #[test]
    fn test_unsupported_length_form_stops_level() {
        let params = decode_hex("30 83 01 02 03 4C 01 07", &RkeTags);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].label, "Sequence");
        assert_eq!(params[0].value, "[Unsupported Length 0x83]");
    }

    #[test]
    fn test_truncated_length_bytes() {
        for hex in ["4C", "4C 81", "4C 82 01", "7F"] {
            let params = decode_hex(hex, &ApduTags);
            assert_eq!(params.last().map(|p| p.value.as_str()), Some(TRUNCATED), "{hex}");
        }
    }

    #[test]
    fn test_padding_and_wide_tags() {
        let params = decode_hex("00 FF 7F 49 03 86 01 AA 00", &ApduTags);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].label, "Public_Key");
        assert_eq!(params[1].label, "Endpoint_ePK");
        assert_eq!(params[1].value, "AA");
    }

    #[test]
    fn test_unknown_tag_falls_back_to_hex_label() {
        let params = decode_hex("5F 20 02 01 02", &ApduTags);
        assert_eq!(params[0].label, "Tag 5F20");
        assert_eq!(params[0].value, "0102");
    }

    #[test]
    fn test_container_tag_detection() {
        assert!(Tag::wide(0x7F49).is_container());
        assert!(Tag::SEQUENCE.is_container());
        assert!(Tag::STATUS_OBJECT.is_container());
        assert!(!Tag::STATUS.is_container());
        assert_eq!(Tag::wide(0x7F49).to_string(), "7F49");
    }
}
