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

//! Text log side channel.
//!
//! Android logs carry CCC Digital Key traffic as hex dumps
//! (`Sending: [..]` / `Received: [..]`) next to a `BleConnection/<addr>`
//! tag, and sometimes the result of Read BD_ADDR. Only those two things are
//! extracted; the rest of the log is ignored.

use super::packet::{BdAddr, Direction, Endpoint};
use super::parse_hex;
use crate::ccc::{CccMessage, CccOrigin};
use chrono::{DateTime, Datelike, NaiveDateTime, Utc};
use fancy_regex::Regex;
use std::sync::LazyLock;

// Just extract timestamp - everything after it is the message
static LOGCAT_TIMESTAMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}\.\d{3})\s+(.*)$").expect("valid regex literal")
});

// Matches: == dumpstate: 2025-11-27 14:08:01 ==
static DUMPSTATE_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"==\s*dumpstate:\s*(\d{4})-\d{2}-\d{2}\s+\d{2}:\d{2}:\d{2}")
        .expect("valid regex literal")
});

// Bugreport file names carry the capture date
static FILE_NAME_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4})-\d{2}-\d{2}").expect("valid regex literal"));

static CCC_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Sending|Received):\s*\[([0-9a-fA-F]+)\]").expect("valid regex literal")
});

static BLE_CONNECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)BleConnection/([0-9A-F:]+)").expect("valid regex literal")
});

static READ_BD_ADDR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Read BD_ADDR.*return: ((?:[0-9A-F]{2}:){5}[0-9A-F]{2})")
        .expect("valid regex literal")
});

/// Detect the year from bugreport header lines
/// Scans the provided content (should be first few KB) for dumpstate header
pub fn detect_year_from_header(content: &str) -> Option<i32> {
    // Only scan first ~50 lines for efficiency
    for line in content.lines().take(50) {
        if let Ok(Some(caps)) = DUMPSTATE_HEADER.captures(line) {
            if let Ok(year) = caps[1].parse::<i32>() {
                tracing::info!("Detected year {year} from bugreport dumpstate header");
                return Some(year);
            }
        }
    }
    None
}

/// Year for logcat timestamps: dumpstate header, then a date in the file
/// name, then the current year
pub fn detect_year(name: &str, content: &str) -> i32 {
    detect_year_from_header(content)
        .or_else(|| {
            FILE_NAME_DATE
                .captures(name)
                .ok()
                .flatten()
                .and_then(|caps| caps[1].parse().ok())
        })
        .unwrap_or_else(|| Utc::now().year())
}

fn parse_logcat_timestamp(s: &str, year: i32) -> Option<DateTime<Utc>> {
    // Logcat format: MM-DD HH:MM:SS.mmm (no year!)
    let timestamp_str = format!("{year}-{s}");
    NaiveDateTime::parse_from_str(&timestamp_str, "%Y-%m-%d %H:%M:%S%.3f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Timestamp of a logcat line, if it has one
pub fn line_timestamp(line: &str, year: i32) -> Option<DateTime<Utc>> {
    let caps = LOGCAT_TIMESTAMP.captures(line).ok().flatten()?;
    parse_logcat_timestamp(&caps[1], year)
}

/// What a text log contributed
#[derive(Debug, Default)]
pub struct TextLogScan {
    pub ccc_messages: Vec<CccMessage>,
    /// Last Read BD_ADDR result in the log
    pub local_identity: Option<BdAddr>,
    pub lines: usize,
}

/// Extract a CCC message from one line.
///
/// Only lines naming a `BleConnection/<addr>` count; other components log
/// the same bytes again without the address.
pub fn parse_ccc_line(name: &str, line_number: usize, line: &str, year: i32) -> Option<CccMessage> {
    let marker = CCC_MARKER.captures(line).ok().flatten()?;
    let address = BLE_CONNECTION.captures(line).ok().flatten()?;
    let bytes = parse_hex(&marker[2])?;
    let [message_type, subtype, payload @ ..] = bytes.as_slice() else {
        return None;
    };

    let direction = if &marker[1] == "Sending" {
        Direction::HostToController
    } else {
        Direction::ControllerToHost
    };
    let peer = address[1]
        .parse::<BdAddr>()
        .map_or(Endpoint::Unknown, Endpoint::Peer);

    Some(CccMessage::new(
        CccOrigin::TextLog {
            file: name.to_string(),
            line: line_number,
        },
        line_timestamp(line, year),
        direction,
        peer,
        *message_type,
        *subtype,
        payload.to_vec(),
    ))
}

/// Read BD_ADDR result logged by the Bluetooth stack
pub fn parse_local_address(line: &str) -> Option<BdAddr> {
    let caps = READ_BD_ADDR.captures(line).ok().flatten()?;
    caps[1].parse().ok()
}

/// Scan a whole text log
pub fn scan_text_log(name: &str, content: &str) -> TextLogScan {
    profiling::scope!("scan_text_log");
    let start = std::time::Instant::now();
    let year = detect_year(name, content);

    let mut scan = TextLogScan::default();
    for (idx, line) in content.lines().enumerate() {
        scan.lines += 1;
        if let Some(address) = parse_local_address(line) {
            scan.local_identity = Some(address);
        }
        if let Some(message) = parse_ccc_line(name, idx + 1, line, year) {
            scan.ccc_messages.push(message);
        }
    }

    tracing::info!(
        "{name}: scanned {} lines in {:?}, {} CCC messages",
        scan.lines,
        start.elapsed(),
        scan.ccc_messages.len()
    );
    scan
}
