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

//! Connection handle tracking and address backfill.
//!
//! Each decode task owns one [`ConnectionTracker`]. When every task is done
//! the orchestrator folds the per-task tables into a [`ConnectionTable`] and
//! runs [`Backfill`] over the merged packet list.

use crate::parser::packet::{BdAddr, ConnectionRecord, DecodedPacket, Endpoint, FileId};
use indexmap::IndexMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap;

/// Live handle → peer table of a single capture
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    file: FileId,
    live: IndexMap<u16, ConnectionRecord>,
}

impl ConnectionTracker {
    pub fn new(file: FileId) -> Self {
        Self {
            file,
            live: IndexMap::new(),
        }
    }

    /// Register a connection. Returns the record it replaced, if the handle
    /// was still marked live.
    pub fn connect(&mut self, handle: u16, address: BdAddr, sequence: u32) -> Option<ConnectionRecord> {
        let record = ConnectionRecord {
            file: self.file,
            handle,
            address,
            established_at: sequence,
        };
        let previous = self.live.insert(handle, record);
        if let Some(prev) = &previous {
            tracing::debug!(
                "Handle 0x{handle:04x} reconnected without disconnect ({} -> {address})",
                prev.address
            );
        }
        previous
    }

    /// Drop a connection. The handle may be reused afterwards.
    pub fn disconnect(&mut self, handle: u16) -> Option<ConnectionRecord> {
        self.live.shift_remove(&handle)
    }

    pub fn peer(&self, handle: u16) -> Option<BdAddr> {
        self.live.get(&handle).map(|record| record.address)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn into_records(self) -> Vec<ConnectionRecord> {
        self.live.into_values().collect()
    }
}

/// Merged table of every capture, keyed by (capture, handle).
///
/// Handles are only meaningful within the capture that assigned them, so
/// two files never collide.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    records: IndexMap<(FileId, u16), ConnectionRecord>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, records: impl IntoIterator<Item = ConnectionRecord>) {
        for record in records {
            self.records.insert((record.file, record.handle), record);
        }
    }

    pub fn get(&self, file: FileId, handle: u16) -> Option<&ConnectionRecord> {
        self.records.get(&(file, handle))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.values()
    }
}

impl Serialize for ConnectionTable {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.records.values())
    }
}

/// Rewrites provisional endpoints once the full table is known.
///
/// Only `Handle` and `Local` endpoints are touched; anything already resolved
/// is left as it is.
#[derive(Debug)]
pub struct Backfill<'a> {
    table: &'a ConnectionTable,
    identities: HashMap<FileId, BdAddr>,
    fallback_identity: Option<BdAddr>,
}

impl<'a> Backfill<'a> {
    pub fn new(table: &'a ConnectionTable) -> Self {
        Self {
            table,
            identities: HashMap::new(),
            fallback_identity: None,
        }
    }

    /// Identity discovered inside one capture
    #[must_use]
    pub fn with_file_identity(mut self, file: FileId, address: BdAddr) -> Self {
        self.identities.insert(file, address);
        self
    }

    /// Identity used for captures that never disclosed their own address
    #[must_use]
    pub fn with_fallback_identity(mut self, address: Option<BdAddr>) -> Self {
        self.fallback_identity = address;
        self
    }

    pub fn resolve(&self, file: FileId, endpoint: Endpoint) -> Endpoint {
        match endpoint {
            Endpoint::Handle(handle) => self
                .table
                .get(file, handle)
                .map_or(endpoint, |record| Endpoint::Peer(record.address)),
            Endpoint::Local => self
                .identities
                .get(&file)
                .copied()
                .or(self.fallback_identity)
                .map_or(endpoint, Endpoint::Peer),
            Endpoint::Host
            | Endpoint::Controller
            | Endpoint::Peer(_)
            | Endpoint::Unknown => endpoint,
        }
    }

    /// Resolve the endpoints of one packet. Returns whether anything changed.
    pub fn apply(&self, packet: &mut DecodedPacket) -> bool {
        let file = packet.frame.file;
        let source = self.resolve(file, packet.source);
        let destination = self.resolve(file, packet.destination);
        let mut changed = source != packet.source || destination != packet.destination;
        packet.source = source;
        packet.destination = destination;

        if let Some(ccc) = packet.ccc.as_mut() {
            let peer = self.resolve(file, ccc.peer);
            changed |= peer != ccc.peer;
            ccc.peer = peer;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::packet::{CaptureFile, PacketClass};

    fn addr(last: u8) -> BdAddr {
        BdAddr([0x11, 0x22, 0x33, 0x44, 0x55, last])
    }

    #[test]
    fn test_disconnect_removes_handle() {
        let mut tracker = ConnectionTracker::new(FileId(0));
        tracker.connect(0x40, addr(1), 10);
        assert_eq!(tracker.peer(0x40), Some(addr(1)));

        let removed = tracker.disconnect(0x40).expect("was live");
        assert_eq!(removed.address, addr(1));
        assert_eq!(tracker.peer(0x40), None);
        assert!(tracker.is_empty());

        tracker.connect(0x40, addr(2), 30);
        assert_eq!(tracker.peer(0x40), Some(addr(2)));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_tables_are_scoped_per_file() {
        let mut first = ConnectionTracker::new(FileId(0));
        first.connect(0x40, addr(1), 5);
        let mut second = ConnectionTracker::new(FileId(1));
        second.connect(0x40, addr(2), 7);

        let mut table = ConnectionTable::new();
        table.merge(first.into_records());
        table.merge(second.into_records());

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(FileId(0), 0x40).map(|r| r.address), Some(addr(1)));
        assert_eq!(table.get(FileId(1), 0x40).map(|r| r.address), Some(addr(2)));
    }

    #[test]
    fn test_backfill_only_touches_provisional_endpoints() {
        let mut tracker = ConnectionTracker::new(FileId(0));
        tracker.connect(0x41, addr(9), 3);
        let mut table = ConnectionTable::new();
        table.merge(tracker.into_records());

        let local = addr(0xAA);
        let backfill = Backfill::new(&table).with_fallback_identity(Some(local));

        let mut packet = DecodedPacket::meta(&CaptureFile {
            id: FileId(0),
            name: "a".into(),
        });
        packet.class = PacketClass::AclData;
        packet.source = Endpoint::Handle(0x41);
        packet.destination = Endpoint::Local;
        assert!(backfill.apply(&mut packet));
        assert_eq!(packet.source, Endpoint::Peer(addr(9)));
        assert_eq!(packet.destination, Endpoint::Peer(local));

        // Already resolved and fixed labels stay put
        packet.source = Endpoint::Peer(addr(3));
        packet.destination = Endpoint::Controller;
        assert!(!backfill.apply(&mut packet));
        assert_eq!(packet.source, Endpoint::Peer(addr(3)));

        // Unknown handle keeps its placeholder
        assert_eq!(
            backfill.resolve(FileId(0), Endpoint::Handle(0x99)),
            Endpoint::Handle(0x99)
        );
    }

    #[test]
    fn test_file_identity_wins_over_fallback() {
        let table = ConnectionTable::new();
        let backfill = Backfill::new(&table)
            .with_file_identity(FileId(1), addr(1))
            .with_fallback_identity(Some(addr(2)));
        assert_eq!(backfill.resolve(FileId(1), Endpoint::Local), Endpoint::Peer(addr(1)));
        assert_eq!(backfill.resolve(FileId(0), Endpoint::Local), Endpoint::Peer(addr(2)));
    }

    #[test]
    fn test_table_serializes_as_sequence() {
        let mut table = ConnectionTable::new();
        table.merge([ConnectionRecord {
            file: FileId(0),
            handle: 0x40,
            address: addr(1),
            established_at: 12,
        }]);
        let json = serde_json::to_value(&table).expect("serializable");
        assert_eq!(json[0]["address"], "11:22:33:44:55:01");
        assert_eq!(json[0]["established_at"], 12);
    }
}
