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

//! HCI packet interpreter.
//!
//! Classifies each record by its packet indicator byte and descends through
//! ACL into L2CAP, ATT and SMP. Connection state, the local identity and
//! pending side events live in a [`DecodeContext`] owned by one decode task.
//! Records that are too short for their structure get a `Malformed` summary;
//! nothing here returns an error.

use super::hex_upper;
use super::packet::{
    BdAddr, ConnectionEvent, ConnectionEventKind, DecodedPacket, Direction, Endpoint, FileId,
    Frame, KeyType, LeConnectionParams, PacketClass, ProtocolTag, SecurityKeyRecord, SideEvent,
};
use super::tables;
use crate::ccc::{CccMessage, CccOrigin};
use crate::core::tracker::ConnectionTracker;

const HCI_COMMAND: u8 = 0x01;
const HCI_ACL_DATA: u8 = 0x02;
const HCI_EVENT: u8 = 0x04;

const MALFORMED: &str = "Malformed";

const ATT_WRITE_REQ: u8 = 0x12;
const ATT_WRITE_CMD: u8 = 0x52;
const ATT_NOTIFICATION: u8 = 0x1B;
const ATT_INDICATION: u8 = 0x1D;

/// Channels that carry CCC Digital Key messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CccChannels {
    /// Treat LE credit based channels (CID 0x0040-0x007F) as the DK channel
    pub dynamic_l2cap: bool,
    /// ATT attribute handles whose values carry DK messages
    pub att_handles: Vec<u16>,
}

impl CccChannels {
    const fn is_dynamic_cid(&self, cid: u16) -> bool {
        self.dynamic_l2cap && cid >= 0x0040 && cid <= 0x007F
    }
}

/// Interpretation of one record before it is joined with its frame
struct Interpretation {
    class: PacketClass,
    tags: Vec<ProtocolTag>,
    summary: String,
    source: Endpoint,
    destination: Endpoint,
    handle: Option<u16>,
    ccc: Option<CccMessage>,
}

impl Interpretation {
    fn new(class: PacketClass, source: Endpoint, destination: Endpoint) -> Self {
        Self {
            class,
            tags: Vec::new(),
            summary: String::new(),
            source,
            destination,
            handle: None,
            ccc: None,
        }
    }

    fn malformed(mut self) -> Self {
        MALFORMED.clone_into(&mut self.summary);
        self
    }
}

/// Per-task decoding state, threaded through every record of one capture
#[derive(Debug)]
pub struct DecodeContext {
    tracker: ConnectionTracker,
    local_identity: Option<BdAddr>,
    discovered_identity: Option<BdAddr>,
    ccc: CccChannels,
    events: Vec<SideEvent>,
}

impl DecodeContext {
    pub fn new(file: FileId, local_identity: Option<BdAddr>, ccc: CccChannels) -> Self {
        Self {
            tracker: ConnectionTracker::new(file),
            local_identity,
            discovered_identity: None,
            ccc,
            events: Vec::new(),
        }
    }

    pub const fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    pub fn into_tracker(self) -> ConnectionTracker {
        self.tracker
    }

    /// Local address as currently known (hint or discovered)
    pub const fn local_identity(&self) -> Option<BdAddr> {
        self.local_identity
    }

    /// Address disclosed by a Read BD_ADDR completion inside this capture
    pub const fn discovered_identity(&self) -> Option<BdAddr> {
        self.discovered_identity
    }

    /// Side events produced since the last drain
    pub fn drain_events(&mut self) -> std::vec::Drain<'_, SideEvent> {
        self.events.drain(..)
    }

    const fn local_endpoint(&self) -> Endpoint {
        match self.local_identity {
            Some(addr) => Endpoint::Peer(addr),
            None => Endpoint::Local,
        }
    }

    fn remote_endpoint(&self, handle: u16) -> Endpoint {
        self.tracker
            .peer(handle)
            .map_or(Endpoint::Handle(handle), Endpoint::Peer)
    }

    /// Interpret one record
    pub fn interpret(&mut self, frame: Frame) -> DecodedPacket {
        profiling::scope!("DecodeContext::interpret");

        let interpretation = match frame.data.first().copied() {
            Some(HCI_COMMAND) => self.command(&frame),
            Some(HCI_ACL_DATA) => self.acl(&frame),
            Some(HCI_EVENT) => self.event(&frame),
            Some(other) => {
                let mut it = Interpretation::new(
                    PacketClass::Unknown(Some(other)),
                    Endpoint::Unknown,
                    Endpoint::Unknown,
                );
                it.summary = "Unknown packet type".to_string();
                it
            }
            None => {
                let mut it = Interpretation::new(
                    PacketClass::Unknown(None),
                    Endpoint::Unknown,
                    Endpoint::Unknown,
                );
                it.summary = "Empty Packet".to_string();
                it
            }
        };

        tracing::trace!(
            "#{} {}: {}",
            frame.sequence,
            interpretation.class,
            interpretation.summary
        );

        DecodedPacket {
            frame,
            class: interpretation.class,
            tags: interpretation.tags,
            summary: interpretation.summary,
            source: interpretation.source,
            destination: interpretation.destination,
            handle: interpretation.handle,
            ccc: interpretation.ccc,
        }
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn command(&mut self, frame: &Frame) -> Interpretation {
        let d = &frame.data;
        let mut it = Interpretation::new(PacketClass::Command, Endpoint::Host, Endpoint::Controller);
        it.tags.push(ProtocolTag::Cmd);
        if d.len() < 4 {
            return it.malformed();
        }

        let ocf = u16::from(d[1]) | (u16::from(d[2] & 0x03) << 8);
        let ogf = u16::from(d[2] >> 2) & 0x3F;
        let opcode = (ogf << 10) | ocf;
        let param_len = d[3];

        self.extract_command_ltk(frame, opcode);

        it.summary = format!("{}, Len: {param_len}", tables::command_label(opcode));
        it
    }

    /// LTKs handed to the controller by LE Start Encryption and LE LTK Request Reply
    fn extract_command_ltk(&mut self, frame: &Frame, opcode: u16) {
        let d = &frame.data;
        let key = match opcode {
            tables::OP_LE_START_ENCRYPTION if d.len() >= 32 => &d[16..32],
            tables::OP_LE_LTK_REQUEST_REPLY if d.len() >= 22 => &d[6..22],
            _ => return,
        };
        let handle = u16::from_le_bytes([d[4], d[5]]) & 0x0FFF;
        self.emit_key(frame, handle, self.remote_endpoint(handle), KeyType::Ltk, key);
    }

    fn emit_key(&mut self, frame: &Frame, handle: u16, owner: Endpoint, key_type: KeyType, key: &[u8]) {
        tracing::debug!("{key_type} for handle 0x{handle:04x} at #{}", frame.sequence);
        self.events.push(SideEvent::Key(SecurityKeyRecord {
            file: frame.file,
            handle,
            owner,
            key_type,
            key_value: hex_upper(key),
            sequence: frame.sequence,
            timestamp: frame.timestamp,
        }));
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    fn event(&mut self, frame: &Frame) -> Interpretation {
        let d = &frame.data;
        let mut it = Interpretation::new(PacketClass::Event, Endpoint::Controller, self.local_endpoint());
        it.tags.push(ProtocolTag::Evt);
        if d.len() < 3 {
            return it.malformed();
        }

        let code = d[1];
        let length = d[2];
        it.summary = format!("{}, Len: {length}", tables::event_name(code).unwrap_or("Unknown Event"));

        match code {
            tables::EVT_DISCONNECT_COMPLETE if d.len() >= 7 => self.disconnect_complete(frame, &mut it),
            tables::EVT_COMMAND_COMPLETE if d.len() >= 7 => self.command_complete(frame, &mut it),
            tables::EVT_COMMAND_STATUS if d.len() >= 7 => {
                let status = d[3];
                let opcode = u16::from_le_bytes([d[5], d[6]]);
                let status = if status == 0 {
                    "OK".to_string()
                } else {
                    format!("Error 0x{status:02x}")
                };
                it.summary.push_str(&format!(
                    " (Status: {status} for {})",
                    command_reference(opcode)
                ));
            }
            tables::EVT_LE_META if d.len() >= 4 => self.le_meta(frame, &mut it),
            _ => {}
        }
        it
    }

    fn disconnect_complete(&mut self, frame: &Frame, it: &mut Interpretation) {
        let d = &frame.data;
        let status = d[3];
        let handle = u16::from_le_bytes([d[4], d[5]]) & 0x0FFF;
        let reason = d[6];
        let reason_text = tables::disconnect_reason(reason);

        let address = self.tracker.disconnect(handle).map(|record| record.address);
        it.summary
            .push_str(&format!(" (Handle: 0x{handle:x}, Reason: {reason_text})"));

        tracing::debug!(
            "Disconnect handle 0x{handle:04x} ({}) reason 0x{reason:02x}",
            address.map_or_else(|| "untracked".to_string(), |a| a.to_string())
        );
        self.events.push(SideEvent::Connection(ConnectionEvent {
            file: frame.file,
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            handle,
            address,
            kind: ConnectionEventKind::Disconnect {
                status,
                reason,
                reason_text,
            },
        }));
    }

    fn command_complete(&mut self, frame: &Frame, it: &mut Interpretation) {
        let d = &frame.data;
        let opcode = u16::from_le_bytes([d[4], d[5]]);
        it.summary
            .push_str(&format!(" (for {})", command_reference(opcode)));

        if opcode != tables::OP_READ_BD_ADDR || d.len() < 13 || d[6] != 0 {
            return;
        }
        let Some(address) = BdAddr::from_le_slice(&d[7..13]) else {
            return;
        };
        it.summary.push_str(&format!(" [Read BD_ADDR: {address}]"));
        it.destination = Endpoint::Peer(address);

        if self.discovered_identity != Some(address) {
            tracing::info!("Local address discovered: {address}");
            self.discovered_identity = Some(address);
            self.local_identity = Some(address);
            self.events.push(SideEvent::LocalIdentity {
                file: frame.file,
                address,
            });
        }
    }

    fn le_meta(&mut self, frame: &Frame, it: &mut Interpretation) {
        let d = &frame.data;
        let sub_event = d[3];
        it.summary.push_str(&format!(
            " > {}",
            tables::le_meta_name(sub_event).unwrap_or("Unknown Sub-event")
        ));

        let enhanced = match sub_event {
            tables::LE_CONNECTION_COMPLETE => false,
            tables::LE_ENHANCED_CONNECTION_COMPLETE => true,
            _ => return,
        };
        if d.len() < 15 {
            MALFORMED.clone_into(&mut it.summary);
            return;
        }
        let Some(peer) = BdAddr::from_le_slice(&d[9..15]) else {
            return;
        };
        let status = d[4];
        let handle = u16::from_le_bytes([d[5], d[6]]) & 0x0FFF;
        let params = connection_params(d, enhanced);

        if status == 0 {
            self.tracker.connect(handle, peer, frame.sequence);
        } else {
            tracing::debug!("Connection to {peer} failed with status 0x{status:02x}");
        }
        it.summary
            .push_str(&format!(" (Handle: 0x{handle:x}, Peer: {peer})"));

        self.events.push(SideEvent::Connection(ConnectionEvent {
            file: frame.file,
            sequence: frame.sequence,
            timestamp: frame.timestamp,
            handle,
            address: Some(peer),
            kind: ConnectionEventKind::Connect { params },
        }));
    }

    // ------------------------------------------------------------------------
    // ACL data
    // ------------------------------------------------------------------------

    fn acl(&mut self, frame: &Frame) -> Interpretation {
        let d = &frame.data;
        let mut it = Interpretation::new(PacketClass::AclData, Endpoint::Host, Endpoint::Controller);
        it.tags.push(ProtocolTag::Acl);
        if d.len() < 5 {
            return it.malformed();
        }

        let handle = (u16::from(d[2] & 0x0F) << 8) | u16::from(d[1]);
        let data_len = u16::from_le_bytes([d[3], d[4]]);
        let remote = self.remote_endpoint(handle);
        let local = self.local_endpoint();
        (it.source, it.destination) = match frame.direction {
            Direction::HostToController => (local, remote),
            Direction::ControllerToHost => (remote, local),
        };
        it.handle = Some(handle);
        it.summary = format!("Len: {data_len}");

        if d.len() < 9 {
            return it;
        }
        it.tags.push(ProtocolTag::L2cap);
        let l2cap_len = u16::from_le_bytes([d[5], d[6]]);
        let cid = u16::from_le_bytes([d[7], d[8]]);
        it.summary.push_str(&format!(
            ", L2CAP Len: {l2cap_len}, CID: {}",
            tables::cid_label(cid)
        ));

        match cid {
            tables::CID_ATT if d.len() >= 10 => self.att(frame, remote, &mut it),
            tables::CID_SMP if d.len() >= 10 => self.smp(frame, handle, &mut it),
            cid if self.ccc.is_dynamic_cid(cid) => {
                let sdu = &d[9..];
                let body = match sdu {
                    [lo, hi, rest @ ..] if usize::from(u16::from_le_bytes([*lo, *hi])) == rest.len() => rest,
                    _ => sdu,
                };
                it.ccc = ccc_message(frame, remote, body);
            }
            _ => {}
        }
        if let Some(ccc) = &it.ccc {
            it.summary.push_str(&format!(
                " > CCC: {} / {}",
                ccc.type_name(),
                ccc.subtype_name()
            ));
        }
        it
    }

    fn att(&self, frame: &Frame, remote: Endpoint, it: &mut Interpretation) {
        let d = &frame.data;
        it.tags.push(ProtocolTag::Att);
        let opcode = d[9];
        it.summary
            .push_str(&format!(" > ATT: {}", tables::att_label(opcode)));

        let carries_value = matches!(
            opcode,
            ATT_WRITE_REQ | ATT_WRITE_CMD | ATT_NOTIFICATION | ATT_INDICATION
        );
        if !carries_value || d.len() < 12 {
            return;
        }
        let attribute = u16::from_le_bytes([d[10], d[11]]);
        if self.ccc.att_handles.contains(&attribute) {
            it.ccc = ccc_message(frame, remote, &d[12..]);
        }
    }

    fn smp(&mut self, frame: &Frame, handle: u16, it: &mut Interpretation) {
        let d = &frame.data;
        it.tags.push(ProtocolTag::Smp);
        let code = d[9];
        it.summary
            .push_str(&format!(" > SMP: {}", tables::smp_label(code)));

        if d.len() < 26 {
            return;
        }
        let (key_type, marker) = match code {
            tables::SMP_ENCRYPTION_INFO => (KeyType::Ltk, " [LTK Found]"),
            tables::SMP_IDENTITY_INFO => (KeyType::Irk, " [IRK Found]"),
            _ => return,
        };
        it.summary.push_str(marker);
        // The distributing side owns the key
        self.emit_key(frame, handle, it.source, key_type, &d[10..26]);
    }
}

fn command_reference(opcode: u16) -> String {
    tables::command_name(opcode).map_or_else(|| format!("0x{opcode:04x}"), str::to_string)
}

fn ccc_message(frame: &Frame, remote: Endpoint, bytes: &[u8]) -> Option<CccMessage> {
    CccMessage::from_bytes(
        CccOrigin::Capture {
            file: frame.file,
            sequence: frame.sequence,
        },
        Some(frame.timestamp),
        frame.direction,
        remote,
        bytes,
    )
}

/// Parameter block of a legacy or enhanced LE connection complete event.
///
/// Returns `None` if the event ends before the supervision timeout.
fn connection_params(d: &[u8], enhanced: bool) -> Option<LeConnectionParams> {
    let le16 = |at: usize| u16::from_le_bytes([d[at], d[at + 1]]);
    let (block, rpas) = if enhanced {
        let rpas = BdAddr::from_le_slice(d.get(15..21)?).zip(BdAddr::from_le_slice(d.get(21..27)?));
        (27, rpas)
    } else {
        (15, None)
    };
    if d.len() < block + 6 {
        return None;
    }
    Some(LeConnectionParams {
        status: d[4],
        role: d[7].into(),
        peer_address_type: d[8],
        local_rpa: rpas.map(|(local, _)| local),
        peer_rpa: rpas.map(|(_, peer)| peer),
        interval: le16(block),
        latency: le16(block + 2),
        supervision_timeout: le16(block + 4),
        clock_accuracy: d.get(block + 6).copied().unwrap_or(0),
    })
}

#[cfg(test)]
pub(crate) mod test_frames {
    //! Builders for raw HCI records used across the crate's tests

    pub fn read_bd_addr_cmd() -> Vec<u8> {
        vec![0x01, 0x09, 0x10, 0x00]
    }

    /// Command Complete for Read BD_ADDR; `addr` is in display order
    pub fn read_bd_addr_complete(addr: [u8; 6]) -> Vec<u8> {
        let mut d = vec![0x04, 0x0E, 0x0A, 0x01, 0x09, 0x10, 0x00];
        d.extend(addr.iter().rev());
        d
    }

    /// Legacy LE Connection Complete
    pub fn le_connection_complete(handle: u16, addr: [u8; 6]) -> Vec<u8> {
        let [lo, hi] = handle.to_le_bytes();
        let mut d = vec![0x04, 0x3E, 0x13, 0x01, 0x00, lo, hi, 0x01, 0x00];
        d.extend(addr.iter().rev());
        d.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0xF4, 0x01, 0x05]);
        d
    }

    pub fn disconnect_complete(handle: u16, reason: u8) -> Vec<u8> {
        let [lo, hi] = handle.to_le_bytes();
        vec![0x04, 0x05, 0x04, 0x00, lo, hi, reason]
    }

    /// ACL frame on a given L2CAP channel
    pub fn acl(handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
        let [h_lo, h_hi] = handle.to_le_bytes();
        let l2cap_len = payload.len() as u16;
        let [l_lo, l_hi] = l2cap_len.to_le_bytes();
        let [a_lo, a_hi] = (l2cap_len + 4).to_le_bytes();
        let [c_lo, c_hi] = cid.to_le_bytes();
        let mut d = vec![0x02, h_lo, 0x20 | (h_hi & 0x0F), a_lo, a_hi, l_lo, l_hi, c_lo, c_hi];
        d.extend_from_slice(payload);
        d
    }
}

#[cfg(test)]
mod tests {
    use super::test_frames::*;
    use super::*;
    use chrono::{DateTime, Utc};

    const PEER_A: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x01];
    const PEER_B: [u8; 6] = [0xAA, 0xBB, 0xCC, 0x00, 0x00, 0x02];
    const LOCAL: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    struct Harness {
        ctx: DecodeContext,
        next: u32,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_channels(CccChannels::default())
        }

        fn with_channels(ccc: CccChannels) -> Self {
            Self {
                ctx: DecodeContext::new(FileId(0), None, ccc),
                next: 1,
            }
        }

        fn feed(&mut self, direction: Direction, data: Vec<u8>) -> DecodedPacket {
            let frame = Frame {
                file: FileId(0),
                sequence: self.next,
                timestamp: DateTime::<Utc>::UNIX_EPOCH,
                direction,
                original_length: data.len() as u32,
                cumulative_drops: 0,
                data,
            };
            self.next += 1;
            self.ctx.interpret(frame)
        }

        fn rx(&mut self, data: Vec<u8>) -> DecodedPacket {
            self.feed(Direction::ControllerToHost, data)
        }

        fn tx(&mut self, data: Vec<u8>) -> DecodedPacket {
            self.feed(Direction::HostToController, data)
        }

        fn events(&mut self) -> Vec<SideEvent> {
            self.ctx.drain_events().collect()
        }
    }

    #[test]
    fn test_read_bd_addr_discovery() {
        let mut h = Harness::new();
        let cmd = h.tx(read_bd_addr_cmd());
        assert_eq!(cmd.class, PacketClass::Command);
        assert_eq!(cmd.summary, "Read BD_ADDR, Len: 0");
        assert_eq!(cmd.source, Endpoint::Host);
        assert_eq!(cmd.destination, Endpoint::Controller);

        let evt = h.rx(read_bd_addr_complete(LOCAL));
        assert!(evt.summary.contains("Read BD_ADDR"));
        assert!(evt.summary.ends_with("[Read BD_ADDR: 11:22:33:44:55:66]"));
        assert_eq!(evt.destination, Endpoint::Peer(BdAddr(LOCAL)));
        assert_eq!(h.ctx.local_identity(), Some(BdAddr(LOCAL)));
        assert_eq!(
            h.events(),
            vec![SideEvent::LocalIdentity {
                file: FileId(0),
                address: BdAddr(LOCAL)
            }]
        );
    }

    #[test]
    fn test_handle_lifecycle_and_reuse() {
        let mut h = Harness::new();
        h.rx(le_connection_complete(0x40, PEER_A));
        let first = h.rx(acl(0x40, 0x04, &[0x1B, 0x03, 0x00]));
        assert_eq!(first.source, Endpoint::Peer(BdAddr(PEER_A)));

        let disc = h.rx(disconnect_complete(0x40, 0x13));
        assert!(disc.summary.contains("Remote User Terminated Connection"));
        assert_eq!(h.ctx.tracker().peer(0x40), None);

        let orphan = h.rx(acl(0x40, 0x04, &[0x1B, 0x03, 0x00]));
        assert_eq!(orphan.source, Endpoint::Handle(0x40));

        h.rx(le_connection_complete(0x40, PEER_B));
        let second = h.tx(acl(0x40, 0x04, &[0x52, 0x03, 0x00]));
        assert_eq!(second.destination, Endpoint::Peer(BdAddr(PEER_B)));
        assert_eq!(second.source, Endpoint::Local);

        let events = h.events();
        let disconnect = events
            .iter()
            .find_map(|e| match e {
                SideEvent::Connection(ConnectionEvent {
                    kind: ConnectionEventKind::Disconnect { reason_text, .. },
                    address,
                    ..
                }) => Some((reason_text.clone(), *address)),
                _ => None,
            })
            .expect("disconnect event");
        assert_eq!(disconnect.0, "Remote User Terminated Connection");
        assert_eq!(disconnect.1, Some(BdAddr(PEER_A)));
    }

    #[test]
    fn test_interleaved_handles_resolve_independently() {
        for order in [[0x40u16, 0x41], [0x41, 0x40]] {
            let mut h = Harness::new();
            for handle in order {
                let peer = if handle == 0x40 { PEER_A } else { PEER_B };
                h.rx(le_connection_complete(handle, peer));
            }
            let a = h.rx(acl(0x40, 0x04, &[0x0A, 0x03, 0x00]));
            let b = h.rx(acl(0x41, 0x04, &[0x0A, 0x03, 0x00]));
            let a2 = h.tx(acl(0x40, 0x04, &[0x0B]));
            assert_eq!(a.source, Endpoint::Peer(BdAddr(PEER_A)));
            assert_eq!(b.source, Endpoint::Peer(BdAddr(PEER_B)));
            assert_eq!(a2.destination, Endpoint::Peer(BdAddr(PEER_A)));
        }
    }

    #[test]
    fn test_irk_extraction() {
        let mut h = Harness::new();
        h.rx(le_connection_complete(0x40, PEER_A));
        h.events();

        let mut smp = vec![0x08];
        smp.extend(0x10u8..0x20);
        let pkt = h.rx(acl(0x40, 0x06, &smp));
        assert!(pkt.has_tag(ProtocolTag::Smp));
        assert!(pkt.summary.contains("Identity Info (IRK)"));
        assert!(pkt.summary.ends_with("[IRK Found]"));

        let events = h.events();
        assert_eq!(events.len(), 1);
        let SideEvent::Key(key) = &events[0] else {
            panic!("expected key event, got {events:?}");
        };
        assert_eq!(key.key_type, KeyType::Irk);
        assert_eq!(key.key_value, "101112131415161718191A1B1C1D1E1F");
        assert_eq!(key.key_value.len(), 32);
        assert_eq!(key.owner, Endpoint::Peer(BdAddr(PEER_A)));
        assert_eq!(
            serde_json::to_value(key).expect("serializable")["key_type"],
            "IRK"
        );
    }

    #[test]
    fn test_short_smp_key_is_not_extracted() {
        let mut h = Harness::new();
        let pkt = h.rx(acl(0x40, 0x06, &[0x06, 0x01, 0x02]));
        assert!(pkt.summary.contains("Encryption Info (LTK)"));
        assert!(!pkt.summary.contains("[LTK Found]"));
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_ltk_from_start_encryption() {
        let mut h = Harness::new();
        h.rx(le_connection_complete(0x40, PEER_A));
        h.events();

        // handle, rand (8), ediv (2), ltk (16)
        let mut cmd = vec![0x01, 0x19, 0x20, 0x1C, 0x40, 0x00];
        cmd.extend([0u8; 10]);
        cmd.extend(0xA0u8..0xB0);
        let pkt = h.tx(cmd);
        assert_eq!(pkt.summary, "LE Start Encryption, Len: 28");

        let events = h.events();
        let [SideEvent::Key(key)] = events.as_slice() else {
            panic!("expected one key event, got {events:?}");
        };
        assert_eq!(key.key_type, KeyType::Ltk);
        assert_eq!(key.key_value, "A0A1A2A3A4A5A6A7A8A9AAABACADAEAF");
        assert_eq!(key.owner, Endpoint::Peer(BdAddr(PEER_A)));
    }

    #[test]
    fn test_ltk_from_request_reply_untracked_handle() {
        let mut h = Harness::new();
        let mut cmd = vec![0x01, 0x1A, 0x20, 0x12, 0x41, 0x00];
        cmd.extend(0x00u8..0x10);
        h.tx(cmd);
        let events = h.events();
        let [SideEvent::Key(key)] = events.as_slice() else {
            panic!("expected one key event, got {events:?}");
        };
        assert_eq!(key.owner, Endpoint::Handle(0x41));
        assert_eq!(key.key_value, "000102030405060708090A0B0C0D0E0F");
    }

    #[test]
    fn test_enhanced_connection_complete_offsets() {
        let mut h = Harness::new();
        let mut evt = vec![0x04, 0x3E, 0x1F, 0x0A, 0x00, 0x42, 0x00, 0x00, 0x01];
        evt.extend(PEER_B.iter().rev());
        evt.extend([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        evt.extend([0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F]);
        evt.extend([0x28, 0x00, 0x01, 0x00, 0xC8, 0x00, 0x00]);
        let pkt = h.rx(evt);
        assert!(pkt.summary.contains("LE Enhanced Connection Complete"));
        assert!(pkt.summary.contains("Peer: AA:BB:CC:00:00:02"));
        assert_eq!(h.ctx.tracker().peer(0x42), Some(BdAddr(PEER_B)));

        let events = h.events();
        let [SideEvent::Connection(ConnectionEvent {
            kind: ConnectionEventKind::Connect { params: Some(params) },
            ..
        })] = events.as_slice()
        else {
            panic!("expected connect event, got {events:?}");
        };
        assert_eq!(params.interval, 0x28);
        assert_eq!(params.latency, 1);
        assert_eq!(params.supervision_timeout, 0xC8);
        assert_eq!(params.local_rpa.map(|a| a.to_string()).as_deref(), Some("06:05:04:03:02:01"));
        assert_eq!(params.peer_rpa.map(|a| a.to_string()).as_deref(), Some("0F:0E:0D:0C:0B:0A"));
    }

    #[test]
    fn test_short_connection_complete_is_malformed() {
        let mut h = Harness::new();
        let pkt = h.rx(vec![0x04, 0x3E, 0x05, 0x01, 0x00, 0x40, 0x00, 0x00]);
        assert_eq!(pkt.summary, "Malformed");
        assert_eq!(pkt.class, PacketClass::Event);
        assert!(h.ctx.tracker().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_failed_connection_is_not_tracked() {
        let mut h = Harness::new();
        let mut evt = le_connection_complete(0x40, PEER_A);
        evt[4] = 0x3E;
        h.rx(evt);
        assert!(h.ctx.tracker().is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_records() {
        let mut h = Harness::new();
        assert_eq!(h.tx(vec![0x01, 0x03]).summary, "Malformed");
        assert_eq!(h.rx(vec![0x04, 0x0E]).summary, "Malformed");
        let acl_short = h.rx(vec![0x02, 0x40, 0x20]);
        assert_eq!(acl_short.summary, "Malformed");
        assert_eq!(acl_short.class, PacketClass::AclData);

        let unknown = h.rx(vec![0x09, 0x01]);
        assert_eq!(unknown.class, PacketClass::Unknown(Some(0x09)));
        assert_eq!(unknown.class.to_string(), "Unknown (0x09)");
        assert_eq!(unknown.source, Endpoint::Unknown);
        assert_eq!(h.rx(vec![0xFE]).class.to_string(), "Unknown (0xfe)");

        let empty = h.rx(Vec::new());
        assert_eq!(empty.class, PacketClass::Unknown(None));
        assert!(h.events().is_empty());
    }

    #[test]
    fn test_unknown_opcode_and_command_status() {
        let mut h = Harness::new();
        assert_eq!(
            h.tx(vec![0x01, 0x4D, 0xFC, 0x00]).summary,
            "Unknown OpCode: 0xfc4d, Len: 0"
        );
        let status = h.rx(vec![0x04, 0x0F, 0x04, 0x00, 0x01, 0x0D, 0x20]);
        assert_eq!(
            status.summary,
            "Command Status, Len: 4 (Status: OK for LE Create Connection)"
        );
    }

    #[test]
    fn test_ccc_on_dynamic_channel() {
        let mut h = Harness::with_channels(CccChannels {
            dynamic_l2cap: true,
            att_handles: Vec::new(),
        });
        h.rx(le_connection_complete(0x40, PEER_A));
        // SDU length prefix, then type 0x02 / subtype 0x07 and a session id
        let pkt = h.rx(acl(0x40, 0x0041, &[0x06, 0x00, 0x02, 0x07, 0x00, 0x00, 0x00, 0x09]));
        let ccc = pkt.ccc.as_ref().expect("ccc message");
        assert_eq!(ccc.message_type, 0x02);
        assert_eq!(ccc.subtype, 0x07);
        assert_eq!(ccc.peer, Endpoint::Peer(BdAddr(PEER_A)));
        assert!(pkt.summary.ends_with(" > CCC: UWB_Ranging_Service / Ranging_Suspend_RQ"));
    }

    #[test]
    fn test_ccc_on_configured_att_handle() {
        let mut h = Harness::with_channels(CccChannels {
            dynamic_l2cap: false,
            att_handles: vec![0x0021],
        });
        let pkt = h.tx(acl(0x40, 0x04, &[0x52, 0x21, 0x00, 0x03, 0x01, 0x05]));
        let ccc = pkt.ccc.as_ref().expect("ccc message");
        assert_eq!(ccc.message_type, 0x03);
        assert_eq!(ccc.peer, Endpoint::Handle(0x40));

        let other = h.tx(acl(0x40, 0x04, &[0x52, 0x22, 0x00, 0x03, 0x01, 0x05]));
        assert!(other.ccc.is_none());
        let dynamic = h.rx(acl(0x40, 0x0041, &[0x02, 0x07]));
        assert!(dynamic.ccc.is_none());
    }
}
