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

//! Bluetooth HCI trace decoding.
//!
//! Reads BTSnoop captures and Android text logs, labels HCI, L2CAP, ATT and
//! SMP traffic, tracks connections and extracted keys, and decodes CCC
//! Digital Key messages.

pub mod ccc;
pub mod config;
pub mod core;
pub mod error;
pub mod parser;

pub use crate::config::DecoderConfig;
pub use crate::core::{decode_blocking, DecodeSnapshot, LoadRequest, Orchestrator};
pub use crate::error::{DecodeError, Result};
