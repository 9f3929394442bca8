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

//! BTSnoop (Bluetooth HCI log) container reader.
//!
//! Walks the 16-byte file header and the 24-byte record headers of an
//! in-memory capture. All header fields are big-endian. A capture that ends
//! in the middle of a record keeps every record read so far.

use super::packet::{Direction, FileId, Frame};
use crate::error::{DecodeError, Result};
use chrono::{DateTime, Utc};

pub const BTSNOOP_MAGIC: &[u8; 8] = b"btsnoop\0";

const FILE_HEADER_LEN: usize = 16;
const RECORD_HEADER_LEN: usize = 24;

/// Microseconds between 0000-01-01 (the BTSnoop epoch) and 1970-01-01
pub const BTSNOOP_EPOCH_DELTA_MICROS: u64 = 0x00dc_ddb3_0f2f_8000;

/// Version and datalink fields of the file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtsnoopHeader {
    pub version: u32,
    pub datalink: u32,
}

/// Convert a BTSnoop timestamp to calendar time.
///
/// Values that cannot be represented fall back to the Unix epoch.
pub fn timestamp_from_micros(micros: u64) -> DateTime<Utc> {
    i64::try_from(micros)
        .ok()
        .and_then(|m| m.checked_sub(BTSNOOP_EPOCH_DELTA_MICROS as i64))
        .and_then(DateTime::from_timestamp_micros)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Iterator over the records of one capture buffer
#[derive(Debug)]
pub struct BtsnoopReader<'a> {
    file: FileId,
    buffer: &'a [u8],
    header: BtsnoopHeader,
    offset: usize,
    next_sequence: u32,
    truncated: bool,
}

impl<'a> BtsnoopReader<'a> {
    /// Validate the file header and position the reader on the first record.
    ///
    /// Fails with [`DecodeError::InvalidContainer`] when the magic token is
    /// missing or the header is incomplete.
    pub fn new(file: FileId, name: &str, buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < FILE_HEADER_LEN || !buffer.starts_with(BTSNOOP_MAGIC) {
            return Err(DecodeError::InvalidContainer {
                name: name.to_string(),
            });
        }

        let header = BtsnoopHeader {
            version: be_u32(buffer, 8),
            datalink: be_u32(buffer, 12),
        };
        tracing::debug!(
            "{name}: BTSnoop version={} datalink={}",
            header.version,
            header.datalink
        );

        Ok(Self {
            file,
            buffer,
            header,
            offset: FILE_HEADER_LEN,
            next_sequence: 1,
            truncated: false,
        })
    }

    pub const fn header(&self) -> BtsnoopHeader {
        self.header
    }

    /// Whether reading stopped on an incomplete trailing record
    pub const fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Byte offset of the next record header
    pub const fn offset(&self) -> usize {
        self.offset
    }
}

impl Iterator for BtsnoopReader<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        profiling::scope!("BtsnoopReader::next");

        let remaining = self.buffer.len().saturating_sub(self.offset);
        if remaining == 0 {
            return None;
        }
        if remaining < RECORD_HEADER_LEN {
            self.truncated = true;
            self.offset = self.buffer.len();
            return None;
        }

        let at = self.offset;
        let original_length = be_u32(self.buffer, at);
        let included_length = be_u32(self.buffer, at + 4) as usize;
        let flags = be_u32(self.buffer, at + 8);
        let cumulative_drops = be_u32(self.buffer, at + 12);
        let timestamp_micros = be_u64(self.buffer, at + 16);

        let data_start = at + RECORD_HEADER_LEN;
        let Some(data_end) = data_start
            .checked_add(included_length)
            .filter(|&end| end <= self.buffer.len())
        else {
            self.truncated = true;
            self.offset = self.buffer.len();
            return None;
        };

        let frame = Frame {
            file: self.file,
            sequence: self.next_sequence,
            timestamp: timestamp_from_micros(timestamp_micros),
            direction: Direction::from_flags(flags),
            original_length,
            cumulative_drops,
            data: self.buffer[data_start..data_end].to_vec(),
        };

        self.offset = data_end;
        self.next_sequence += 1;
        Some(frame)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Builds synthetic captures for tests across the crate
    pub struct CaptureBuilder {
        bytes: Vec<u8>,
    }

    impl CaptureBuilder {
        pub fn new() -> Self {
            let mut bytes = BTSNOOP_MAGIC.to_vec();
            bytes.extend_from_slice(&1u32.to_be_bytes());
            bytes.extend_from_slice(&1002u32.to_be_bytes());
            Self { bytes }
        }

        /// Append a record; `unix_micros` is converted to the BTSnoop epoch
        pub fn record(mut self, flags: u32, unix_micros: u64, data: &[u8]) -> Self {
            let len = data.len() as u32;
            self.bytes.extend_from_slice(&len.to_be_bytes());
            self.bytes.extend_from_slice(&len.to_be_bytes());
            self.bytes.extend_from_slice(&flags.to_be_bytes());
            self.bytes.extend_from_slice(&0u32.to_be_bytes());
            self.bytes
                .extend_from_slice(&(unix_micros + BTSNOOP_EPOCH_DELTA_MICROS).to_be_bytes());
            self.bytes.extend_from_slice(data);
            self
        }

        pub fn sent(self, unix_micros: u64, data: &[u8]) -> Self {
            self.record(0, unix_micros, data)
        }

        pub fn received(self, unix_micros: u64, data: &[u8]) -> Self {
            self.record(1, unix_micros, data)
        }

        pub fn build(self) -> Vec<u8> {
            self.bytes
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::CaptureBuilder;
    use super::*;

    #[test]
    fn test_rejects_bad_magic() {
        let buffer = b"notsnoop\0\0\0\x01\0\0\x03\xea".to_vec();
        let err = BtsnoopReader::new(FileId(0), "bad.log", &buffer).expect_err("must reject");
        assert!(matches!(err, DecodeError::InvalidContainer { .. }));
    }

    #[test]
    fn test_rejects_short_header() {
        let err = BtsnoopReader::new(FileId(0), "short.log", b"btsnoop\0").expect_err("short");
        assert!(matches!(err, DecodeError::InvalidContainer { .. }));
    }

    #[test]
    fn test_reads_records_in_order_with_timestamps() {
        let base = 1_700_000_000_000_000u64;
        let capture = CaptureBuilder::new()
            .sent(base, &[0x01, 0x03, 0x0C, 0x00])
            .received(base + 1_500, &[0x04, 0x0E, 0x04, 0x01, 0x03, 0x0C, 0x00])
            .received(base + 2_000_250, &[0x02, 0x40, 0x20, 0x00, 0x00])
            .build();

        let reader = BtsnoopReader::new(FileId(3), "ok.log", &capture).expect("valid");
        assert_eq!(reader.header().datalink, 1002);
        let frames: Vec<Frame> = reader.collect();

        assert_eq!(frames.len(), 3);
        let sequences: Vec<u32> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(frames[0].direction, Direction::HostToController);
        assert_eq!(frames[1].direction, Direction::ControllerToHost);
        assert_eq!(frames[2].file, FileId(3));

        let expected_ms = [base / 1000, (base + 1_500) / 1000, (base + 2_000_250) / 1000];
        for (frame, ms) in frames.iter().zip(expected_ms) {
            assert_eq!(frame.timestamp.timestamp_millis(), ms as i64);
        }
    }

    #[test]
    fn test_truncated_payload_keeps_earlier_records() {
        let mut capture = CaptureBuilder::new()
            .sent(0, &[0x01, 0x03, 0x0C, 0x00])
            .sent(10, &[0x01, 0x09, 0x10, 0x00])
            .build();
        // Drop the last two payload bytes of the second record
        capture.truncate(capture.len() - 2);

        let mut reader = BtsnoopReader::new(FileId(0), "cut.log", &capture).expect("valid");
        let first = reader.next().expect("first record");
        assert_eq!(first.data, vec![0x01, 0x03, 0x0C, 0x00]);
        assert!(reader.next().is_none());
        assert!(reader.is_truncated());
    }

    #[test]
    fn test_truncated_record_header() {
        let mut capture = CaptureBuilder::new().sent(0, &[0x01, 0x03, 0x0C, 0x00]).build();
        capture.extend_from_slice(&[0, 0, 0, 4, 0, 0]);

        let mut reader = BtsnoopReader::new(FileId(0), "cut.log", &capture).expect("valid");
        assert!(reader.next().is_some());
        assert!(reader.next().is_none());
        assert!(reader.is_truncated());
    }

    #[test]
    fn test_epoch_conversion() {
        let ts = timestamp_from_micros(BTSNOOP_EPOCH_DELTA_MICROS + 1_000_000);
        assert_eq!(ts.timestamp(), 1);
        assert_eq!(timestamp_from_micros(u64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
