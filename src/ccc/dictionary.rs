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

//! Tag dictionaries for the TLV walker.
//!
//! A dictionary names tags and renders leaf values. The RKE dictionary is
//! stateful within one walk: a Function-ID leaf selects the table used for
//! the Action-ID and Status leaves that follow it.

use super::tlv::{render_hex, Tag};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Mutable state of one TLV walk
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkState {
    /// Last Function-ID seen in this walk
    pub current_function: Option<u16>,
}

pub trait TagDictionary: Sync {
    fn name(&self) -> &'static str;

    fn tag_name(&self, tag: Tag) -> Option<&'static str>;

    /// Render a leaf value. May read or update the walk state.
    fn render_leaf(&self, tag: Tag, value: &[u8], state: &mut WalkState) -> String;

    fn tag_label(&self, tag: Tag) -> String {
        self.tag_name(tag)
            .or_else(|| common_tag_name(tag))
            .map_or_else(|| format!("Tag {tag}"), str::to_string)
    }
}

fn common_tag_name(tag: Tag) -> Option<&'static str> {
    match tag {
        Tag::SEQUENCE => Some("Sequence"),
        Tag::STATUS_OBJECT => Some("Status_Object"),
        Tag::STATUS => Some("Status"),
        _ => None,
    }
}

static GENERIC_STATUS: LazyLock<HashMap<u8, &'static str>> = LazyLock::new(|| {
    [
        (0x00, "Success"),
        (0x01, "Failure"),
        (0x02, "Not_Supported"),
        (0x03, "Busy"),
        (0x04, "Invalid_Parameter"),
        (0x05, "Not_Allowed"),
        (0x06, "Timeout"),
    ]
    .into_iter()
    .collect()
});

fn render_generic_status(value: &[u8]) -> String {
    match value {
        [code] => GENERIC_STATUS.get(code).map_or_else(
            || format!("0x{code:02X}"),
            |name| format!("{name} (0x{code:02X})"),
        ),
        _ => render_hex(value),
    }
}

/// Big-endian value of up to four bytes
fn be_value(value: &[u8]) -> Option<u32> {
    if value.is_empty() || value.len() > 4 {
        return None;
    }
    Some(value.iter().fold(0u32, |acc, byte| (acc << 8) | u32::from(*byte)))
}

// ============================================================================
// APDU dictionary
// ============================================================================

static APDU_TAGS: LazyLock<HashMap<Tag, &'static str>> = LazyLock::new(|| {
    [
        (Tag::short(0x4C), "Transaction_ID"),
        (Tag::short(0x4D), "Vehicle_ID"),
        (Tag::short(0x5C), "Protocol_Version"),
        (Tag::short(0x86), "Endpoint_ePK"),
        (Tag::short(0x87), "Vehicle_ePK"),
        (Tag::short(0x9D), "Cryptogram"),
        (Tag::short(0x9E), "Signature"),
        (Tag::wide(0x7F49), "Public_Key"),
    ]
    .into_iter()
    .collect()
});

/// Tags of Digital Key SE commands and responses
#[derive(Debug, Clone, Copy, Default)]
pub struct ApduTags;

impl TagDictionary for ApduTags {
    fn name(&self) -> &'static str {
        "APDU"
    }

    fn tag_name(&self, tag: Tag) -> Option<&'static str> {
        APDU_TAGS.get(&tag).copied()
    }

    fn render_leaf(&self, tag: Tag, value: &[u8], _state: &mut WalkState) -> String {
        match tag {
            Tag::STATUS => render_generic_status(value),
            t if t == Tag::short(0x5C) => value
                .chunks(2)
                .map(render_hex)
                .collect::<Vec<_>>()
                .join(", "),
            _ => render_hex(value),
        }
    }
}

// ============================================================================
// RKE dictionary
// ============================================================================

const FUNCTION_ID: Tag = Tag::short(0x80);
const ACTION_ID: Tag = Tag::short(0x81);

/// One remotely controllable vehicle function
#[derive(Debug)]
pub struct RkeFunction {
    pub name: &'static str,
    pub actions: &'static [(u8, &'static str)],
    pub statuses: &'static [(u8, &'static str)],
}

impl RkeFunction {
    fn action(&self, code: u8) -> Option<&'static str> {
        lookup(self.actions, code)
    }

    fn status(&self, code: u8) -> Option<&'static str> {
        lookup(self.statuses, code)
    }
}

fn lookup(table: &[(u8, &'static str)], code: u8) -> Option<&'static str> {
    table
        .iter()
        .find_map(|(candidate, name)| (*candidate == code).then_some(*name))
}

const LOCK_ACTIONS: &[(u8, &str)] = &[(0x00, "Unlock"), (0x01, "Lock")];
const LOCK_STATUSES: &[(u8, &str)] = &[(0x00, "Unlocked"), (0x01, "Locked")];
const OPEN_ACTIONS: &[(u8, &str)] = &[(0x00, "Close"), (0x01, "Open")];
const OPEN_STATUSES: &[(u8, &str)] = &[(0x00, "Closed"), (0x01, "Open"), (0x02, "Partially_Open")];

static RKE_FUNCTIONS: LazyLock<HashMap<u16, RkeFunction>> = LazyLock::new(|| {
    [
        (
            0x0001,
            RkeFunction {
                name: "Central_Locking",
                actions: LOCK_ACTIONS,
                statuses: LOCK_STATUSES,
            },
        ),
        (
            0x0002,
            RkeFunction {
                name: "Driver_Door_Locking",
                actions: LOCK_ACTIONS,
                statuses: LOCK_STATUSES,
            },
        ),
        (
            0x0010,
            RkeFunction {
                name: "Trunk",
                actions: &[(0x00, "Close"), (0x01, "Release")],
                statuses: OPEN_STATUSES,
            },
        ),
        (
            0x0011,
            RkeFunction {
                name: "Front_Trunk",
                actions: &[(0x00, "Close"), (0x01, "Release")],
                statuses: OPEN_STATUSES,
            },
        ),
        (
            0x0020,
            RkeFunction {
                name: "Charge_Port",
                actions: OPEN_ACTIONS,
                statuses: OPEN_STATUSES,
            },
        ),
        (
            0x0030,
            RkeFunction {
                name: "Panic_Alarm",
                actions: &[(0x00, "Stop"), (0x01, "Trigger")],
                statuses: &[(0x00, "Inactive"), (0x01, "Active")],
            },
        ),
        (
            0x0040,
            RkeFunction {
                name: "Windows",
                actions: OPEN_ACTIONS,
                statuses: OPEN_STATUSES,
            },
        ),
        (
            0x0050,
            RkeFunction {
                name: "Remote_Start",
                actions: &[(0x00, "Stop"), (0x01, "Start")],
                statuses: &[(0x00, "Off"), (0x01, "Running")],
            },
        ),
    ]
    .into_iter()
    .collect()
});

pub fn rke_function(id: u16) -> Option<&'static RkeFunction> {
    RKE_FUNCTIONS.get(&id)
}

static RKE_TAGS: LazyLock<HashMap<Tag, &'static str>> = LazyLock::new(|| {
    [
        (FUNCTION_ID, "Function_ID"),
        (ACTION_ID, "Action_ID"),
        (Tag::short(0x84), "Request_ID"),
        (Tag::short(0x88), "Function_Status"),
        (Tag::wide(0x7F70), "RKE_Action_Request"),
        (Tag::wide(0x7F72), "Vehicle_Status_Change"),
        (Tag::wide(0x7F73), "Function_Status_Report"),
    ]
    .into_iter()
    .collect()
});

/// Tags of Remote Keyless Entry requests and vehicle status events
#[derive(Debug, Clone, Copy, Default)]
pub struct RkeTags;

impl RkeTags {
    fn render_function(value: &[u8], state: &mut WalkState) -> String {
        let Some(id) = be_value(value).and_then(|v| u16::try_from(v).ok()) else {
            return render_hex(value);
        };
        state.current_function = Some(id);
        rke_function(id).map_or_else(
            || format!("0x{id:04X} (Unknown Function)"),
            |function| format!("0x{id:04X} ({})", function.name),
        )
    }

    fn render_coded(
        value: &[u8],
        state: &WalkState,
        pick: fn(&RkeFunction, u8) -> Option<&'static str>,
        fallback: fn(&[u8]) -> String,
    ) -> String {
        let [code] = value else {
            return fallback(value);
        };
        state
            .current_function
            .and_then(rke_function)
            .and_then(|function| pick(function, *code))
            .map_or_else(|| fallback(value), |name| format!("{name} (0x{code:02X})"))
    }
}

impl TagDictionary for RkeTags {
    fn name(&self) -> &'static str {
        "RKE"
    }

    fn tag_name(&self, tag: Tag) -> Option<&'static str> {
        RKE_TAGS.get(&tag).copied()
    }

    fn render_leaf(&self, tag: Tag, value: &[u8], state: &mut WalkState) -> String {
        match tag {
            FUNCTION_ID => Self::render_function(value, state),
            ACTION_ID => Self::render_coded(value, state, RkeFunction::action, render_hex),
            Tag::STATUS => {
                Self::render_coded(value, state, RkeFunction::status, render_generic_status)
            }
            _ => render_hex(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ccc::tlv::decode_tlv;

    #[test]
    fn test_status_follows_current_function() {
        let params = decode_tlv(&[0x80, 0x02, 0x00, 0x01, 0x83, 0x01, 0x00], &RkeTags);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, "0x0001 (Central_Locking)");
        assert_eq!(params[1].label, "Status");
        assert_eq!(params[1].value, "Unlocked (0x00)");
    }

    #[test]
    fn test_status_without_function_uses_generic_table() {
        let params = decode_tlv(&[0x83, 0x01, 0x00], &RkeTags);
        assert_eq!(params[0].value, "Success (0x00)");
    }

    #[test]
    fn test_function_switch_inside_one_walk() {
        let params = decode_tlv(
            &[
                0x80, 0x02, 0x00, 0x01, 0x81, 0x01, 0x01, // lock
                0x80, 0x02, 0x00, 0x10, 0x81, 0x01, 0x01, 0x83, 0x01, 0x01,
            ],
            &RkeTags,
        );
        let values: Vec<&str> = params.iter().map(|p| p.value.as_str()).collect();
        assert_eq!(
            values,
            vec![
                "0x0001 (Central_Locking)",
                "Lock (0x01)",
                "0x0010 (Trunk)",
                "Release (0x01)",
                "Open (0x01)",
            ]
        );
    }

    #[test]
    fn test_state_does_not_leak_between_walks() {
        decode_tlv(&[0x80, 0x02, 0x00, 0x01], &RkeTags);
        let params = decode_tlv(&[0x83, 0x01, 0x01], &RkeTags);
        assert_eq!(params[0].value, "Failure (0x01)");
    }

    #[test]
    fn test_unknown_function() {
        let params = decode_tlv(&[0x80, 0x02, 0x12, 0x34, 0x81, 0x01, 0x00], &RkeTags);
        assert_eq!(params[0].value, "0x1234 (Unknown Function)");
        assert_eq!(params[1].value, "00");
    }

    #[test]
    fn test_apdu_names_and_status() {
        let apdu = ApduTags;
        assert_eq!(apdu.tag_label(Tag::short(0x87)), "Vehicle_ePK");
        assert_eq!(apdu.tag_label(Tag::STATUS), "Status");
        assert_eq!(apdu.tag_label(Tag::short(0x99)), "Tag 99");
        let params = decode_tlv(&[0x5C, 0x04, 0x01, 0x00, 0x02, 0x00], &apdu);
        assert_eq!(params[0].value, "0100, 0200");
    }
}
