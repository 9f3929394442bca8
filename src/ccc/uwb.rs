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

//! Fixed-layout decoders for UWB Ranging Service messages.
//!
//! Every subtype is a flat list of fields at fixed offsets. Bytes after the
//! last declared field are always reported as `Data (Remaining)`.

use super::tlv::{render_hex, TRUNCATED};
use super::CccParam;

#[derive(Debug, Clone, Copy)]
enum Field {
    U8(&'static str),
    BeU16(&'static str),
    BeU32(&'static str),
    LeU64(&'static str),
    Bitmask8(&'static str),
    BeBitmask32(&'static str),
    Channels(&'static str),
    PulseShape(&'static str),
    Enum(&'static str, &'static [(u8, &'static str)]),
}

impl Field {
    const fn label(self) -> &'static str {
        match self {
            Self::U8(label)
            | Self::BeU16(label)
            | Self::BeU32(label)
            | Self::LeU64(label)
            | Self::Bitmask8(label)
            | Self::BeBitmask32(label)
            | Self::Channels(label)
            | Self::PulseShape(label)
            | Self::Enum(label, _) => label,
        }
    }

    const fn width(self) -> usize {
        match self {
            Self::U8(_)
            | Self::Bitmask8(_)
            | Self::Channels(_)
            | Self::PulseShape(_)
            | Self::Enum(..) => 1,
            Self::BeU16(_) => 2,
            Self::BeU32(_) | Self::BeBitmask32(_) => 4,
            Self::LeU64(_) => 8,
        }
    }

    fn render(self, raw: &[u8]) -> String {
        let be = raw.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        match self {
            Self::U8(_) | Self::BeU16(_) | Self::BeU32(_) => be.to_string(),
            Self::LeU64(_) => {
                let le = raw.iter().rev().fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
                format!("{le} (0x{le:016X})")
            }
            Self::Bitmask8(_) => format!("0x{be:02X}"),
            Self::BeBitmask32(_) => format!("0x{be:08X}"),
            Self::Channels(_) => render_channels(raw[0]),
            Self::PulseShape(_) => format!(
                "0x{:02X} (Initiator: {}, Responder: {})",
                raw[0],
                raw[0] >> 4,
                raw[0] & 0x0F
            ),
            Self::Enum(_, values) => {
                let code = raw[0];
                values
                    .iter()
                    .find(|(candidate, _)| *candidate == code)
                    .map_or_else(
                        || format!("Unknown (0x{code:02X})"),
                        |(_, name)| format!("{name} (0x{code:02X})"),
                    )
            }
        }
    }
}

fn render_channels(mask: u8) -> String {
    let mut channels = Vec::new();
    if mask & 0x01 != 0 {
        channels.push("Ch5");
    }
    if mask & 0x02 != 0 {
        channels.push("Ch9");
    }
    if channels.is_empty() {
        format!("0x{mask:02X}")
    } else {
        format!("0x{mask:02X} ({})", channels.join(", "))
    }
}

const RESPONSE_CODES: &[(u8, &str)] = &[
    (0x00, "Success"),
    (0x01, "Failure"),
    (0x02, "Session_Not_Found"),
    (0x03, "Busy"),
];

const TEARDOWN_REASONS: &[(u8, &str)] = &[
    (0x00, "Unspecified"),
    (0x01, "Terminated_By_Vehicle"),
    (0x02, "Terminated_By_Device"),
    (0x03, "Timeout"),
    (0x04, "Key_Revoked"),
];

const PROTOCOL_VERSION: Field = Field::BeU16("Selected_DK_Protocol_Version");
const CONFIG_ID: Field = Field::BeU16("Selected_UWB_Config_Id");
const PULSE_SHAPE: Field = Field::PulseShape("Selected_PulseShape_Combo");
const SESSION_ID: Field = Field::BeU32("UWB_Session_Id");
const CHANNEL_BITMASK: Field = Field::Channels("Channel_Bitmask");
const RAN_MULTIPLIER: Field = Field::U8("RAN_Multiplier");
const STS_INDEX0: Field = Field::BeU32("STS_Index0");
const UWB_TIME0: Field = Field::LeU64("UWB_Time0");

struct Layout {
    subtype: u8,
    name: &'static str,
    fields: &'static [Field],
}

const LAYOUTS: &[Layout] = &[
    Layout {
        subtype: 0x01,
        name: "Ranging_Capability_RQ",
        fields: &[PROTOCOL_VERSION, CONFIG_ID, PULSE_SHAPE],
    },
    Layout {
        subtype: 0x02,
        name: "Ranging_Capability_RS",
        fields: &[PROTOCOL_VERSION, CONFIG_ID, PULSE_SHAPE, CHANNEL_BITMASK],
    },
    Layout {
        subtype: 0x03,
        name: "Ranging_Session_RQ",
        fields: &[PROTOCOL_VERSION, CONFIG_ID, PULSE_SHAPE, SESSION_ID, CHANNEL_BITMASK],
    },
    Layout {
        subtype: 0x04,
        name: "Ranging_Session_RS",
        fields: &[
            RAN_MULTIPLIER,
            Field::Bitmask8("Slot_Bitmask"),
            Field::BeBitmask32("SYNC_Code_Index_Bitmask"),
            CHANNEL_BITMASK,
            Field::Bitmask8("Hopping_Config_Bitmask"),
        ],
    },
    Layout {
        subtype: 0x05,
        name: "Ranging_Session_Setup_RQ",
        fields: &[
            RAN_MULTIPLIER,
            Field::U8("Number_Chaps_per_Slot"),
            Field::U8("Number_Responder_Nodes"),
            Field::U8("Number_Slots_per_Round"),
            Field::BeU32("SYNC_Code_Index"),
            Field::Bitmask8("Selected_Hopping_Config_Bitmask"),
        ],
    },
    Layout {
        subtype: 0x06,
        name: "Ranging_Session_Setup_RS",
        fields: &[
            STS_INDEX0,
            UWB_TIME0,
            Field::BeU32("HOP_Mode_Key"),
            Field::U8("SYNC_Code_Index"),
        ],
    },
    Layout {
        subtype: 0x07,
        name: "Ranging_Suspend_RQ",
        fields: &[SESSION_ID],
    },
    Layout {
        subtype: 0x08,
        name: "Ranging_Suspend_RS",
        fields: &[Field::Enum("Suspend_Response", RESPONSE_CODES)],
    },
    Layout {
        subtype: 0x09,
        name: "Ranging_Recovery_RQ",
        fields: &[SESSION_ID, STS_INDEX0, UWB_TIME0],
    },
    Layout {
        subtype: 0x0A,
        name: "Ranging_Recovery_RS",
        fields: &[Field::Enum("Recovery_Response", RESPONSE_CODES)],
    },
    Layout {
        subtype: 0x0B,
        name: "Configurable_Ranging_Recovery_RQ",
        fields: &[SESSION_ID, STS_INDEX0, UWB_TIME0, RAN_MULTIPLIER],
    },
    Layout {
        subtype: 0x0C,
        name: "Configurable_Ranging_Recovery_RS",
        fields: &[Field::Enum("Recovery_Response", RESPONSE_CODES)],
    },
    Layout {
        subtype: 0x0D,
        name: "Ranging_Session_Teardown_RQ",
        fields: &[SESSION_ID, Field::Enum("Teardown_Reason", TEARDOWN_REASONS)],
    },
];

fn layout(subtype: u8) -> Option<&'static Layout> {
    LAYOUTS.iter().find(|layout| layout.subtype == subtype)
}

pub fn message_name(subtype: u8) -> Option<&'static str> {
    layout(subtype).map(|layout| layout.name)
}

/// Decode a UWB Ranging Service payload by subtype.
///
/// Unknown subtypes render the whole payload as the remaining tail.
pub fn decode(subtype: u8, payload: &[u8]) -> Vec<CccParam> {
    profiling::scope!("uwb::decode");
    let fields = layout(subtype).map_or(&[][..], |layout| layout.fields);

    let mut params = Vec::with_capacity(fields.len() + 1);
    let mut pos = 0;
    for field in fields {
        let end = pos + field.width();
        let Some(raw) = payload.get(pos..end) else {
            params.push(CccParam::new(0, field.label(), TRUNCATED));
            break;
        };
        params.push(CccParam::new(0, field.label(), field.render(raw)));
        pos = end;
    }

    if pos < payload.len() {
        params.push(CccParam::new(0, "Data (Remaining)", render_hex(&payload[pos..])));
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find<'a>(params: &'a [CccParam], label: &str) -> &'a str {
        params
            .iter()
            .find(|p| p.label == label)
            .map(|p| p.value.as_str())
            .unwrap_or_else(|| panic!("missing {label}"))
    }

    #[test]
    fn test_session_rq_fields() {
        let payload = [0x01, 0x00, 0x00, 0x01, 0x25, 0x00, 0x00, 0x30, 0x39, 0x03];
        let params = decode(0x03, &payload);
        assert_eq!(params.len(), 5);
        assert_eq!(find(&params, "Selected_DK_Protocol_Version"), "256");
        assert_eq!(find(&params, "Selected_UWB_Config_Id"), "1");
        assert_eq!(
            find(&params, "Selected_PulseShape_Combo"),
            "0x25 (Initiator: 2, Responder: 5)"
        );
        assert_eq!(find(&params, "UWB_Session_Id"), "12345");
        assert_eq!(find(&params, "Channel_Bitmask"), "0x03 (Ch5, Ch9)");
    }

    #[test]
    fn test_setup_rs_mixed_endianness() {
        let mut payload = vec![0x00, 0x00, 0x00, 0x10];
        payload.extend_from_slice(&[0x01, 0, 0, 0, 0, 0, 0, 0]);
        payload.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x09]);
        let params = decode(0x06, &payload);
        assert_eq!(find(&params, "STS_Index0"), "16");
        assert_eq!(find(&params, "UWB_Time0"), "1 (0x0000000000000001)");
        assert_eq!(find(&params, "HOP_Mode_Key"), "3735928559");
        assert_eq!(find(&params, "SYNC_Code_Index"), "9");
    }

    #[test]
    fn test_trailing_bytes_are_kept() {
        let params = decode(0x07, &[0x00, 0x00, 0x00, 0x01, 0xAA, 0xBB]);
        assert_eq!(find(&params, "UWB_Session_Id"), "1");
        assert_eq!(find(&params, "Data (Remaining)"), "AABB");
    }

    #[test]
    fn test_short_payload_marks_truncation() {
        let params = decode(0x0D, &[0x00, 0x00, 0x01]);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].value, TRUNCATED);
        assert_eq!(params[1].label, "Data (Remaining)");
        assert_eq!(params[1].value, "000001");
    }

    #[test]
    fn test_enums_and_unknown_subtype() {
        let params = decode(0x0D, &[0, 0, 0, 7, 0x02]);
        assert_eq!(find(&params, "Teardown_Reason"), "Terminated_By_Device (0x02)");
        let params = decode(0x08, &[0x7F]);
        assert_eq!(find(&params, "Suspend_Response"), "Unknown (0x7F)");

        let params = decode(0x42, &[0x01, 0x02]);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].value, "0102");
        assert_eq!(message_name(0x42), None);
    }
}
