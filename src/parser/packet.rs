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

//! Decoded packet model shared by the capture reader, the HCI interpreter
//! and the orchestrator.

use crate::ccc::CccMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Addresses
// ============================================================================

/// A Bluetooth device address, stored most significant byte first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    /// Build an address from the little-endian wire layout used by HCI.
    ///
    /// Returns `None` unless `bytes` holds exactly six bytes.
    #[must_use]
    pub fn from_le_slice(bytes: &[u8]) -> Option<Self> {
        let mut addr: [u8; 6] = bytes.try_into().ok()?;
        addr.reverse();
        Some(Self(addr))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// Error returned when a textual address is not six colon separated hex bytes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid Bluetooth address: {0}")]
pub struct ParseBdAddrError(String);

impl FromStr for BdAddr {
    type Err = ParseBdAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut addr = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in &mut addr {
            let part = parts.next().ok_or_else(|| ParseBdAddrError(s.to_string()))?;
            if part.len() != 2 {
                return Err(ParseBdAddrError(s.to_string()));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseBdAddrError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseBdAddrError(s.to_string()));
        }
        Ok(Self(addr))
    }
}

impl Serialize for BdAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BdAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Index of a capture within one load request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileId(pub usize);

/// Identity of one capture buffer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureFile {
    pub id: FileId,
    pub name: String,
}

/// Transfer direction taken from bit 0 of the record flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    HostToController,
    ControllerToHost,
}

impl Direction {
    #[must_use]
    pub const fn from_flags(flags: u32) -> Self {
        if flags & 1 == 0 {
            Self::HostToController
        } else {
            Self::ControllerToHost
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostToController => f.write_str("Host -> Controller"),
            Self::ControllerToHost => f.write_str("Controller -> Host"),
        }
    }
}

/// One raw capture record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub file: FileId,
    /// 1-based position within the owning capture; 0 is reserved for meta rows
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub original_length: u32,
    pub cumulative_drops: u32,
    #[serde(serialize_with = "crate::parser::serialize_hex")]
    pub data: Vec<u8>,
}

// ============================================================================
// Decoded packets
// ============================================================================

/// Coarse HCI packet class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PacketClass {
    Command,
    Event,
    AclData,
    /// Unrecognised packet indicator (`None` for an empty record)
    Unknown(Option<u8>),
    /// Synthetic row that opens each capture's group
    Meta,
}

impl fmt::Display for PacketClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("HCI Cmd"),
            Self::Event => f.write_str("HCI Evt"),
            Self::AclData => f.write_str("ACL Data"),
            Self::Unknown(Some(byte)) => write!(f, "Unknown (0x{byte:02x})"),
            Self::Unknown(None) => f.write_str("Unknown"),
            Self::Meta => f.write_str("META"),
        }
    }
}

/// Protocol layers a packet touches, used for layer filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolTag {
    Cmd,
    Evt,
    Acl,
    L2cap,
    Att,
    Smp,
}

/// Source or destination of a packet.
///
/// `Handle` and `Local` are provisional: the backfill pass may turn them into
/// `Peer` once the connection table or the local identity is known. Every
/// other variant is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Fixed role label for the host side of a command
    Host,
    /// Fixed role label for the controller
    Controller,
    /// The capturing device before its own address is known
    Local,
    Peer(BdAddr),
    /// Remote side of a connection whose peer address is not known yet
    Handle(u16),
    Unknown,
}

impl Endpoint {
    #[must_use]
    pub const fn is_provisional(&self) -> bool {
        matches!(self, Self::Handle(_) | Self::Local)
    }

    #[must_use]
    pub const fn address(&self) -> Option<BdAddr> {
        match self {
            Self::Peer(addr) => Some(*addr),
            Self::Host | Self::Controller | Self::Local | Self::Handle(_) | Self::Unknown => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host | Self::Local => f.write_str("Host"),
            Self::Controller => f.write_str("Controller"),
            Self::Peer(addr) => addr.fmt(f),
            Self::Handle(handle) => write!(f, "Handle 0x{handle:x}"),
            Self::Unknown => f.write_str("Unknown"),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A frame together with its interpretation
#[derive(Debug, Clone, Serialize)]
pub struct DecodedPacket {
    #[serde(flatten)]
    pub frame: Frame,
    pub class: PacketClass,
    pub tags: Vec<ProtocolTag>,
    pub summary: String,
    pub source: Endpoint,
    pub destination: Endpoint,
    /// Connection handle for ACL traffic
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<u16>,
    /// Digital Key message carried by this frame, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccc: Option<CccMessage>,
}

impl DecodedPacket {
    /// Header row announcing the start of a capture in the merged list
    #[must_use]
    pub fn meta(file: &CaptureFile) -> Self {
        Self {
            frame: Frame {
                file: file.id,
                sequence: 0,
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                direction: Direction::HostToController,
                original_length: 0,
                cumulative_drops: 0,
                data: Vec::new(),
            },
            class: PacketClass::Meta,
            tags: Vec::new(),
            summary: format!("File: {}", file.name),
            source: Endpoint::Unknown,
            destination: Endpoint::Unknown,
            handle: None,
            ccc: None,
        }
    }

    #[must_use]
    pub fn has_tag(&self, tag: ProtocolTag) -> bool {
        self.tags.contains(&tag)
    }

    /// One-line rendering used by the command-line front end
    #[must_use]
    pub fn format_line(&self) -> String {
        if self.class == PacketClass::Meta {
            return format!("--- {} ---", self.summary);
        }
        format!(
            "#{:<6} {} {} -> {} [{}] {}",
            self.frame.sequence,
            self.frame.timestamp.format("%m-%d %H:%M:%S%.3f"),
            self.source,
            self.destination,
            self.class,
            self.summary
        )
    }
}

// ============================================================================
// Side-channel records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum KeyType {
    #[serde(rename = "LTK")]
    Ltk,
    #[serde(rename = "IRK")]
    Irk,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ltk => f.write_str("LTK"),
            Self::Irk => f.write_str("IRK"),
        }
    }
}

/// Key material seen on the wire. Consumers deduplicate by `key_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityKeyRecord {
    pub file: FileId,
    pub handle: u16,
    /// Who the key belongs to, as known when the key was seen
    pub owner: Endpoint,
    pub key_type: KeyType,
    /// 32 uppercase hex characters
    pub key_value: String,
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
}

/// Live entry of the handle table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionRecord {
    pub file: FileId,
    pub handle: u16,
    pub address: BdAddr,
    /// Sequence number of the connection complete event
    pub established_at: u32,
}

/// Role byte of an LE connection complete event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkRole {
    Central,
    Peripheral,
    Other(u8),
}

impl From<u8> for LinkRole {
    fn from(value: u8) -> Self {
        match value {
            0x00 => Self::Central,
            0x01 => Self::Peripheral,
            other => Self::Other(other),
        }
    }
}

/// Parameter block shared by the legacy and enhanced LE connection complete events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeConnectionParams {
    pub status: u8,
    pub role: LinkRole,
    pub peer_address_type: u8,
    pub local_rpa: Option<BdAddr>,
    pub peer_rpa: Option<BdAddr>,
    /// Connection interval in units of 1.25 ms
    pub interval: u16,
    pub latency: u16,
    /// Supervision timeout in units of 10 ms
    pub supervision_timeout: u16,
    pub clock_accuracy: u8,
}

impl LeConnectionParams {
    #[must_use]
    pub fn interval_ms(&self) -> f64 {
        f64::from(self.interval) * 1.25
    }

    #[must_use]
    pub fn supervision_timeout_ms(&self) -> u32 {
        u32::from(self.supervision_timeout) * 10
    }

    /// Pipe separated `Label: value` rendering
    #[must_use]
    pub fn describe(&self, handle: u16) -> String {
        let status = if self.status == 0 {
            "Success (connection established)".to_string()
        } else {
            format!("Error 0x{:02x}", self.status)
        };
        let role = match self.role {
            LinkRole::Central => "Central (0x00)".to_string(),
            LinkRole::Peripheral => "Peripheral (0x01)".to_string(),
            LinkRole::Other(value) => format!("Reserved (0x{value:02x})"),
        };
        let addr_type = match self.peer_address_type {
            0x00 => "Public Device Address (0x00)".to_string(),
            0x01 => "Random Device Address (0x01)".to_string(),
            0x02 => "Public Identity Address (0x02)".to_string(),
            0x03 => "Random Identity Address (0x03)".to_string(),
            other => format!("Reserved (0x{other:02x})"),
        };

        let mut parts = vec![
            format!("Status: {status}"),
            format!("Handle: 0x{handle:04x}"),
            format!("Role: {role}"),
            format!("Peer Addr Type: {addr_type}"),
        ];
        if let (Some(local), Some(peer)) = (self.local_rpa, self.peer_rpa) {
            parts.push(format!("Local RPA: {local}"));
            parts.push(format!("Peer RPA: {peer}"));
        }
        parts.push(format!(
            "Interval: {:.2}ms (0x{:04x} x 1.25ms)",
            self.interval_ms(),
            self.interval
        ));
        parts.push(format!("Latency: {}", self.latency));
        parts.push(format!(
            "Timeout: {}ms (0x{:04x} x 10ms)",
            self.supervision_timeout_ms(),
            self.supervision_timeout
        ));
        let clock = if self.role == LinkRole::Central {
            "Not applicable for Central".to_string()
        } else {
            format!("0x{:02x}", self.clock_accuracy)
        };
        parts.push(format!("Clock: {clock}"));
        parts.join(" | ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
pub enum ConnectionEventKind {
    /// Parameter block is absent when the event was too short to carry it
    Connect { params: Option<LeConnectionParams> },
    Disconnect { status: u8, reason: u8, reason_text: String },
}

/// Connection lifecycle notification streamed beside the packet list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub file: FileId,
    pub sequence: u32,
    pub timestamp: DateTime<Utc>,
    pub handle: u16,
    /// Peer at the time of the event; `None` for a disconnect of an untracked handle
    pub address: Option<BdAddr>,
    #[serde(flatten)]
    pub kind: ConnectionEventKind,
}

impl ConnectionEvent {
    #[must_use]
    pub fn parameters(&self) -> String {
        match &self.kind {
            ConnectionEventKind::Connect { params: Some(params) } => params.describe(self.handle),
            ConnectionEventKind::Connect { params: None } => {
                format!("Handle: 0x{:04x}", self.handle)
            }
            ConnectionEventKind::Disconnect {
                status,
                reason_text,
                ..
            } => {
                let status = if *status == 0 {
                    "Success (0x00)".to_string()
                } else {
                    format!("Error 0x{status:02x}")
                };
                format!(
                    "Status: {status} | Reason: {reason_text} | Handle: 0x{:04x}",
                    self.handle
                )
            }
        }
    }
}

/// Out-of-band notification emitted while a capture is being decoded.
///
/// These may arrive in any order relative to the packet chunks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SideEvent {
    Key(SecurityKeyRecord),
    Connection(ConnectionEvent),
    LocalIdentity { file: FileId, address: BdAddr },
}
