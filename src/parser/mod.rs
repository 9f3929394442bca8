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

pub mod btsnoop;
pub mod hci;
pub mod logcat;
pub mod packet;
pub mod tables;

use serde::Serializer;
use std::fmt::Write as _;

/// Kind of input detected for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    /// Binary BTSnoop capture
    Btsnoop,
    /// Text log that may carry CCC hex markers
    TextLog,
}

/// Detect the input kind by sniffing the first bytes of a file
pub fn detect_input(content: &[u8]) -> InputKind {
    if content.starts_with(btsnoop::BTSNOOP_MAGIC) {
        tracing::debug!("Detected BTSnoop magic");
        return InputKind::Btsnoop;
    }
    InputKind::TextLog
}

/// Uppercase hex without separators, as used for key values
pub fn hex_upper(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02X}");
    }
    out
}

/// Lowercase space separated hex, as shown in the data column
pub fn hex_spaced(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (idx, byte) in bytes.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Parse a hex string, ignoring whitespace.
///
/// Returns `None` for non-hex characters or an odd digit count.
pub fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks_exact(2)
        .map(|pair| {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            Some((hi * 16 + lo) as u8)
        })
        .collect()
}

pub(crate) fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex_spaced(bytes))
}
