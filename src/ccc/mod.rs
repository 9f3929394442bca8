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

//! CCC Digital Key messages.
//!
//! A message is `type`, `subtype` and a payload. The payload is decoded on
//! first access and the result cached, so long message lists stay cheap
//! until somebody looks at them.

pub mod dictionary;
pub mod tlv;
pub mod uwb;

use crate::parser::packet::{Direction, Endpoint, FileId};
use crate::parser::{hex_spaced, hex_upper};
use chrono::{DateTime, Utc};
use dictionary::{ApduTags, RkeTags, TagDictionary, WalkState};
use serde::{Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;
use tlv::{decode_tlv, decode_tlv_into, TRUNCATED};

pub const MAX_MESSAGE_TYPE: u8 = 0x06;

const TYPE_FRAMEWORK: u8 = 0x00;
const TYPE_SE: u8 = 0x01;
const TYPE_UWB_RANGING: u8 = 0x02;
const TYPE_DK_EVENT: u8 = 0x03;
const TYPE_VEHICLE_OEM: u8 = 0x04;
const TYPE_SUPPLEMENTARY: u8 = 0x05;
const TYPE_HEAD_UNIT_PAIRING: u8 = 0x06;

const SE_APDU_RQ: u8 = 0x0B;
const SE_APDU_RS: u8 = 0x0C;

/// One labelled line of a decoded payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CccParam {
    /// Nesting level inside the TLV tree
    pub depth: usize,
    pub label: String,
    pub value: String,
}

impl CccParam {
    pub fn new(depth: usize, label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            depth,
            label: label.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for CccParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:indent$}{}: {}", "", self.label, self.value, indent = self.depth * 2)
    }
}

/// Result of decoding a payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CccDecoded {
    /// Inner message label, e.g. `APDU_RQ` or `RKE_Request`
    pub message: String,
    pub params: Vec<CccParam>,
}

/// Where a message was found
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CccOrigin {
    Capture { file: FileId, sequence: u32 },
    TextLog { file: String, line: usize },
}

impl fmt::Display for CccOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capture { file, sequence } => write!(f, "capture {} #{sequence}", file.0),
            Self::TextLog { file, line } => write!(f, "{file}:{line}"),
        }
    }
}

/// A CCC Digital Key message with a lazily decoded payload
#[derive(Debug, Clone)]
pub struct CccMessage {
    pub origin: CccOrigin,
    pub timestamp: Option<DateTime<Utc>>,
    pub direction: Direction,
    /// Remote party; provisional endpoints are resolved by the backfill pass
    pub peer: Endpoint,
    pub message_type: u8,
    pub subtype: u8,
    pub payload: Vec<u8>,
    decoded: OnceLock<CccDecoded>,
}

impl CccMessage {
    pub fn new(
        origin: CccOrigin,
        timestamp: Option<DateTime<Utc>>,
        direction: Direction,
        peer: Endpoint,
        message_type: u8,
        subtype: u8,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            origin,
            timestamp,
            direction,
            peer,
            message_type,
            subtype,
            payload,
            decoded: OnceLock::new(),
        }
    }

    /// Split raw message bytes into type, subtype and payload.
    ///
    /// Returns `None` when fewer than two bytes are present or the type is
    /// outside the known range.
    pub fn from_bytes(
        origin: CccOrigin,
        timestamp: Option<DateTime<Utc>>,
        direction: Direction,
        peer: Endpoint,
        bytes: &[u8],
    ) -> Option<Self> {
        let [message_type, subtype, payload @ ..] = bytes else {
            return None;
        };
        if *message_type > MAX_MESSAGE_TYPE {
            return None;
        }
        Some(Self::new(
            origin,
            timestamp,
            direction,
            peer,
            *message_type,
            *subtype,
            payload.to_vec(),
        ))
    }

    pub fn type_name(&self) -> &'static str {
        message_type_name(self.message_type)
    }

    /// Subtype label; DK event notifications are named by their category
    pub fn subtype_name(&self) -> String {
        subtype_name(self.message_type, self.subtype)
            .map_or_else(|| format!("Unknown (0x{:02X})", self.subtype), str::to_string)
    }

    pub fn payload_hex(&self) -> String {
        hex_upper(&self.payload)
    }

    /// Decoded payload, computed on first access
    pub fn decoded(&self) -> &CccDecoded {
        self.decoded
            .get_or_init(|| decode_payload(self.message_type, self.subtype, &self.payload))
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded.get().is_some()
    }

    /// Multi-line rendering for the command-line front end
    pub fn describe(&self) -> String {
        let decoded = self.decoded();
        let arrow = match self.direction {
            Direction::HostToController => "->",
            Direction::ControllerToHost => "<-",
        };
        let when = self
            .timestamp
            .map_or_else(|| "-".to_string(), |ts| ts.format("%m-%d %H:%M:%S%.3f").to_string());
        let mut out = format!(
            "{when} [{}] {arrow} {} {} / {} ({})",
            self.origin,
            self.peer,
            self.type_name(),
            self.subtype_name(),
            decoded.message
        );
        for param in &decoded.params {
            out.push_str("\n    ");
            out.push_str(&param.to_string());
        }
        out
    }
}

impl PartialEq for CccMessage {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin
            && self.timestamp == other.timestamp
            && self.direction == other.direction
            && self.peer == other.peer
            && self.message_type == other.message_type
            && self.subtype == other.subtype
            && self.payload == other.payload
    }
}

impl Serialize for CccMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            origin: &'a CccOrigin,
            timestamp: Option<DateTime<Utc>>,
            direction: Direction,
            peer: Endpoint,
            message_type: u8,
            type_name: &'static str,
            subtype: u8,
            subtype_name: String,
            payload: String,
            decoded: &'a CccDecoded,
        }

        Wire {
            origin: &self.origin,
            timestamp: self.timestamp,
            direction: self.direction,
            peer: self.peer,
            message_type: self.message_type,
            type_name: self.type_name(),
            subtype: self.subtype,
            subtype_name: self.subtype_name(),
            payload: hex_spaced(&self.payload),
            decoded: self.decoded(),
        }
        .serialize(serializer)
    }
}

// ============================================================================
// Message dictionaries
// ============================================================================

pub fn message_type_name(message_type: u8) -> &'static str {
    match message_type {
        TYPE_FRAMEWORK => "Framework",
        TYPE_SE => "SE",
        TYPE_UWB_RANGING => "UWB_Ranging_Service",
        TYPE_DK_EVENT => "DK_Event_Notification",
        TYPE_VEHICLE_OEM => "Vehicle_OEM_App",
        TYPE_SUPPLEMENTARY => "Supplementary_Service",
        TYPE_HEAD_UNIT_PAIRING => "Head_Unit_Pairing",
        _ => "Unknown",
    }
}

const FRAMEWORK_MESSAGES: &[(u8, &str)] = &[
    (0x01, "Request_Capability"),
    (0x02, "Capability_Response"),
    (0x0D, "Request_Owner_Pairing"),
];

const SE_MESSAGES: &[(u8, &str)] = &[(SE_APDU_RQ, "APDU_RQ"), (SE_APDU_RS, "APDU_RS")];

const DK_EVENT_MESSAGES: &[(u8, &str)] = &[(0x01, "DK_Event_Notification")];

const VEHICLE_OEM_MESSAGES: &[(u8, &str)] = &[(0x01, "Vehicle_OEM_App_Message")];

const SUPPLEMENTARY_MESSAGES: &[(u8, &str)] = &[
    (0x0D, "Time_Sync"),
    (0x0E, "First_Approach_RQ"),
    (0x0F, "First_Approach_RS"),
];

const HEAD_UNIT_PAIRING_MESSAGES: &[(u8, &str)] = &[
    (0x01, "Head_Unit_Pairing_RQ"),
    (0x02, "Head_Unit_Pairing_RS"),
];

const DK_EVENT_CATEGORIES: &[(u8, &str)] = &[
    (0x01, "Command_Complete"),
    (0x02, "Ranging_Session_Status_Changed"),
    (0x03, "Device_Ranging_Intent"),
    (0x04, "Vehicle_Status_Changed"),
    (0x05, "RKE_Request"),
];

const RKE_CATEGORIES: &[u8] = &[0x04, 0x05];

fn find_name(table: &[(u8, &'static str)], code: u8) -> Option<&'static str> {
    table
        .iter()
        .find_map(|(candidate, name)| (*candidate == code).then_some(*name))
}

pub fn subtype_name(message_type: u8, subtype: u8) -> Option<&'static str> {
    match message_type {
        TYPE_FRAMEWORK => find_name(FRAMEWORK_MESSAGES, subtype),
        TYPE_SE => find_name(SE_MESSAGES, subtype),
        TYPE_UWB_RANGING => uwb::message_name(subtype),
        TYPE_DK_EVENT => find_name(DK_EVENT_MESSAGES, subtype),
        TYPE_VEHICLE_OEM => find_name(VEHICLE_OEM_MESSAGES, subtype),
        TYPE_SUPPLEMENTARY => find_name(SUPPLEMENTARY_MESSAGES, subtype),
        TYPE_HEAD_UNIT_PAIRING => find_name(HEAD_UNIT_PAIRING_MESSAGES, subtype),
        _ => None,
    }
}

// ============================================================================
// Payload decoding
// ============================================================================

/// Drop a leading big-endian length field when it matches the bytes after it
pub fn strip_length_header(payload: &[u8]) -> (&[u8], Option<u16>) {
    if let [hi, lo, rest @ ..] = payload {
        let declared = u16::from_be_bytes([*hi, *lo]);
        if usize::from(declared) == rest.len() {
            return (rest, Some(declared));
        }
    }
    (payload, None)
}

/// Decode a payload for the given type and subtype
pub fn decode_payload(message_type: u8, subtype: u8, payload: &[u8]) -> CccDecoded {
    profiling::scope!("decode_payload");
    let (body, declared) = strip_length_header(payload);
    let mut params = Vec::new();
    if let Some(len) = declared {
        params.push(CccParam::new(0, "Length", len.to_string()));
    }

    let message = match message_type {
        TYPE_SE => {
            match subtype {
                SE_APDU_RQ => decode_command_apdu(body, &mut params),
                SE_APDU_RS => decode_response_apdu(body, &mut params),
                _ => params.extend(decode_tlv(body, &ApduTags)),
            }
            subtype_label(message_type, subtype)
        }
        TYPE_UWB_RANGING => {
            params.extend(uwb::decode(subtype, body));
            subtype_label(message_type, subtype)
        }
        TYPE_DK_EVENT => decode_dk_event(body, &mut params),
        TYPE_VEHICLE_OEM => {
            if !body.is_empty() {
                params.push(CccParam::new(0, "Data", hex_upper(body)));
            }
            subtype_label(message_type, subtype)
        }
        _ => {
            params.extend(decode_tlv(body, &ApduTags));
            subtype_label(message_type, subtype)
        }
    };

    CccDecoded { message, params }
}

fn subtype_label(message_type: u8, subtype: u8) -> String {
    subtype_name(message_type, subtype).map_or_else(|| format!("0x{subtype:02X}"), str::to_string)
}

fn decode_dk_event(body: &[u8], params: &mut Vec<CccParam>) -> String {
    let Some((&category, rest)) = body.split_first() else {
        params.push(CccParam::new(0, "Event_Category", TRUNCATED));
        return "DK_Event_Notification".to_string();
    };
    let name = find_name(DK_EVENT_CATEGORIES, category);
    params.push(CccParam::new(
        0,
        "Event_Category",
        format!("{} (0x{category:02X})", name.unwrap_or("Unknown")),
    ));

    let dictionary: &dyn TagDictionary = if RKE_CATEGORIES.contains(&category) {
        &RkeTags
    } else {
        &ApduTags
    };
    tracing::trace!("DK event 0x{category:02X} decoded with {} tags", dictionary.name());
    params.extend(decode_tlv(rest, dictionary));
    name.map_or_else(|| format!("Event 0x{category:02X}"), str::to_string)
}

fn instruction_name(ins: u8) -> &'static str {
    match ins {
        0xA4 => "SELECT",
        0x80 => "AUTH0",
        0x81 => "AUTH1",
        0x71 => "EXCHANGE",
        0x3C => "CONTROL FLOW",
        0x6C => "CREATE RANGING KEY",
        _ => "Unknown",
    }
}

fn status_word_name(sw: u16) -> &'static str {
    match sw {
        0x9000 => "Success",
        0x6400 => "No specific diagnosis",
        0x6700 => "Wrong length",
        0x6982 => "Security status not satisfied",
        0x6985 => "Conditions of use not satisfied",
        0x6A80 => "Incorrect data",
        0x6A82 => "File not found",
        0x6A88 => "Referenced data not found",
        0x6D00 => "Instruction not supported",
        0x6E00 => "Class not supported",
        _ => "Unknown",
    }
}

/// Command APDU: header, optional Lc-prefixed TLV body, optional Le
fn decode_command_apdu(body: &[u8], params: &mut Vec<CccParam>) {
    let [cla, ins, p1, p2, rest @ ..] = body else {
        params.push(CccParam::new(0, "APDU", TRUNCATED));
        return;
    };
    params.push(CccParam::new(0, "CLA", format!("0x{cla:02X}")));
    params.push(CccParam::new(
        0,
        "INS",
        format!("0x{ins:02X} ({})", instruction_name(*ins)),
    ));
    params.push(CccParam::new(0, "P1", format!("0x{p1:02X}")));
    params.push(CccParam::new(0, "P2", format!("0x{p2:02X}")));

    let (lc, data_start) = match rest {
        [] => return,
        [le] => {
            params.push(CccParam::new(0, "Le", format!("0x{le:02X}")));
            return;
        }
        [0x00, hi, lo] => {
            let le = u16::from_be_bytes([*hi, *lo]);
            params.push(CccParam::new(0, "Le", format!("0x{le:04X}")));
            return;
        }
        [0x00, hi, lo, ..] => (usize::from(u16::from_be_bytes([*hi, *lo])), 3),
        [lc, ..] => (usize::from(*lc), 1),
    };
    params.push(CccParam::new(0, "Lc", lc.to_string()));

    let Some(data) = rest.get(data_start..data_start + lc) else {
        params.push(CccParam::new(0, "Data", TRUNCATED));
        return;
    };
    let mut state = WalkState::default();
    decode_tlv_into(data, 1, &ApduTags, &mut state, params);

    let trailer = &rest[data_start + lc..];
    if !trailer.is_empty() {
        params.push(CccParam::new(0, "Le", hex_upper(trailer)));
    }
}

/// Response APDU: TLV body followed by a two-byte status word
fn decode_response_apdu(body: &[u8], params: &mut Vec<CccParam>) {
    let [data @ .., sw1, sw2] = body else {
        params.push(CccParam::new(0, "Status_Word", TRUNCATED));
        return;
    };
    params.extend(decode_tlv(data, &ApduTags));
    let sw = u16::from_be_bytes([*sw1, *sw2]);
    params.push(CccParam::new(
        0,
        "Status_Word",
        format!("{sw:04X} ({})", status_word_name(sw)),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(bytes: &[u8]) -> CccMessage {
        CccMessage::from_bytes(
            CccOrigin::TextLog {
                file: "log.txt".into(),
                line: 1,
            },
            None,
            Direction::HostToController,
            Endpoint::Unknown,
            bytes,
        )
        .expect("valid message")
    }

    #[test]
    fn test_from_bytes_rejects_short_or_unknown_type() {
        let origin = CccOrigin::Capture {
            file: FileId(0),
            sequence: 1,
        };
        let make = |bytes: &[u8]| {
            CccMessage::from_bytes(
                origin.clone(),
                None,
                Direction::HostToController,
                Endpoint::Unknown,
                bytes,
            )
        };
        assert!(make(&[0x01]).is_none());
        assert!(make(&[0x07, 0x01]).is_none());
        assert!(make(&[0x02, 0x07]).is_some());
    }

    #[test]
    fn test_decode_is_lazy_and_memoized() {
        let msg = message(&[0x02, 0x07, 0x00, 0x00, 0x00, 0x05]);
        assert!(!msg.is_decoded());
        let first = msg.decoded() as *const CccDecoded;
        assert!(msg.is_decoded());
        assert_eq!(first, msg.decoded() as *const CccDecoded);
        assert_eq!(msg.decoded().message, "Ranging_Suspend_RQ");
        assert_eq!(msg.decoded().params[0].value, "5");
    }

    #[test]
    fn test_length_header_is_stripped() {
        let msg = message(&[0x02, 0x07, 0x00, 0x04, 0x00, 0x00, 0x00, 0x05]);
        let decoded = msg.decoded();
        assert_eq!(decoded.params[0].label, "Length");
        assert_eq!(decoded.params[1].value, "5");
        assert_eq!(decoded.params.len(), 2);
    }

    #[test]
    fn test_rke_event_uses_rke_dictionary() {
        let msg = message(&[0x03, 0x01, 0x05, 0x80, 0x02, 0x00, 0x01, 0x83, 0x01, 0x00]);
        let decoded = msg.decoded();
        assert_eq!(decoded.message, "RKE_Request");
        assert_eq!(decoded.params[0].value, "RKE_Request (0x05)");
        assert_eq!(decoded.params[2].value, "Unlocked (0x00)");
    }

    #[test]
    fn test_command_apdu() {
        // AUTH0 with a Transaction_ID body and Le
        let msg = message(&[
            0x01, 0x0B, 0x80, 0x80, 0x00, 0x00, 0x03, 0x4C, 0x01, 0x07, 0x00,
        ]);
        let decoded = msg.decoded();
        assert_eq!(decoded.message, "APDU_RQ");
        let rendered: Vec<String> = decoded.params.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "CLA: 0x80",
                "INS: 0x80 (AUTH0)",
                "P1: 0x00",
                "P2: 0x00",
                "Lc: 3",
                "  Transaction_ID: 07",
                "Le: 00",
            ]
        );
    }

    #[test]
    fn test_command_apdu_extended_le_without_data() {
        let msg = message(&[0x01, 0x0B, 0x80, 0x71, 0x00, 0x00, 0x00, 0x01, 0x00]);
        let rendered: Vec<String> = msg.decoded().params.iter().map(ToString::to_string).collect();
        assert_eq!(
            rendered,
            vec![
                "CLA: 0x80",
                "INS: 0x71 (EXCHANGE)",
                "P1: 0x00",
                "P2: 0x00",
                "Le: 0x0100",
            ]
        );
    }

    #[test]
    fn test_response_apdu_status_word() {
        let msg = message(&[0x01, 0x0C, 0x30, 0x04, 0xA0, 0x02, 0x83, 0x00, 0x90, 0x00]);
        let decoded = msg.decoded();
        let last = decoded.params.last().expect("status word");
        assert_eq!(last.value, "9000 (Success)");
        assert_eq!(decoded.params[0].label, "Sequence");
        assert_eq!(decoded.params[1].label, "Status_Object");
        assert_eq!(decoded.params[2].depth, 2);
    }

    #[test]
    fn test_unknown_subtype_label() {
        let msg = message(&[0x00, 0x7E]);
        assert_eq!(msg.subtype_name(), "Unknown (0x7E)");
        assert_eq!(msg.type_name(), "Framework");
        assert!(msg.decoded().params.is_empty());
    }

    #[test]
    fn test_serialized_message_includes_decode() {
        let msg = message(&[0x02, 0x08, 0x00]);
        let json = serde_json::to_value(&msg).expect("serializable");
        assert_eq!(json["type_name"], "UWB_Ranging_Service");
        assert_eq!(json["decoded"]["params"][0]["value"], "Success (0x00)");
        assert_eq!(json["origin"]["kind"], "text_log");
    }
}
