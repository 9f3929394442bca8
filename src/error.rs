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

use thiserror::Error;

/// File-scoped failures. Per-record and per-TLV problems never reach this
/// type; they are rendered into the decoded output instead.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("{name}: not a BTSnoop capture (bad magic)")]
    InvalidContainer { name: String },

    #[error("{name}: no records could be decoded")]
    EmptyCapture { name: String },

    #[error("{name}: decode task failed: {reason}")]
    TaskFailed { name: String, reason: String },

    #[error("load was superseded by a newer one")]
    Superseded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DecodeError>;
