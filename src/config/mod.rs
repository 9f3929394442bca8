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

use crate::error::{DecodeError, Result};
use crate::parser::hci::CccChannels;
use crate::parser::packet::BdAddr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_BACKFILL_YIELD_INTERVAL: usize = 20_000;

const fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

const fn default_backfill_yield_interval() -> usize {
    DEFAULT_BACKFILL_YIELD_INTERVAL
}

const fn default_true() -> bool {
    true
}

/// Decoder settings stored in the config directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderConfig {
    /// Decoded packets per streamed chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Iterations between cooperative yields in post-processing loops
    #[serde(default = "default_backfill_yield_interval")]
    pub backfill_yield_interval: usize,

    /// Look for Digital Key messages on LE credit based channels
    #[serde(default = "default_true")]
    pub ccc_dynamic_channels: bool,

    /// ATT handles whose values carry Digital Key messages
    #[serde(default)]
    pub ccc_att_handles: Vec<u16>,

    /// Own address to use when a capture never reports it
    #[serde(default)]
    pub local_address: Option<BdAddr>,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            backfill_yield_interval: DEFAULT_BACKFILL_YIELD_INTERVAL,
            ccc_dynamic_channels: true,
            ccc_att_handles: Vec::new(),
            local_address: None,
        }
    }
}

impl DecoderConfig {
    /// Get the path to the global config file
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("btcrab").join("config.json"))
    }

    /// Load config from disk, returning defaults if not found
    pub fn load() -> Self {
        Self::config_path().map_or_else(Self::default, |path| Self::load_from(&path))
    }

    /// Load from an explicit path; unreadable or invalid files give defaults
    pub fn load_from(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("No config found at {path:?}, using defaults");
            return Self::default();
        }
        match std::fs::read_to_string(path)
            .map_err(DecodeError::from)
            .and_then(|contents| serde_json::from_str::<Self>(&contents).map_err(DecodeError::from))
        {
            Ok(config) => {
                tracing::info!("Loaded config from {path:?}");
                config.sanitized()
            }
            Err(e) => {
                tracing::warn!("Ignoring config at {path:?}: {e}");
                Self::default()
            }
        }
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| DecodeError::Config("Could not determine config directory".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Saved config to {path:?}");
        Ok(())
    }

    /// Replace zero sizes with defaults
    #[must_use]
    pub fn sanitized(mut self) -> Self {
        if self.chunk_size == 0 {
            self.chunk_size = DEFAULT_CHUNK_SIZE;
        }
        if self.backfill_yield_interval == 0 {
            self.backfill_yield_interval = DEFAULT_BACKFILL_YIELD_INTERVAL;
        }
        self
    }

    pub fn ccc_channels(&self) -> CccChannels {
        CccChannels {
            dynamic_l2cap: self.ccc_dynamic_channels,
            att_handles: self.ccc_att_handles.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = DecoderConfig::load_from(&dir.path().join("config.json"));
        assert_eq!(config, DecoderConfig::default());
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.backfill_yield_interval, 20_000);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = DecoderConfig {
            chunk_size: 50,
            ccc_att_handles: vec![0x21],
            local_address: Some("11:22:33:44:55:66".parse().expect("address")),
            ..DecoderConfig::default()
        };
        config.save_to(&path).expect("save");
        assert_eq!(DecoderConfig::load_from(&path), config);
    }

    #[test]
    fn test_partial_and_invalid_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{"chunk_size": 0, "ccc_dynamic_channels": false}"#).expect("write");
        let config = DecoderConfig::load_from(&path);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
        assert!(!config.ccc_dynamic_channels);

        std::fs::write(&path, "not json").expect("write");
        assert_eq!(DecoderConfig::load_from(&path), DecoderConfig::default());
    }

    #[test]
    fn test_ccc_channels() {
        let config = DecoderConfig {
            ccc_att_handles: vec![0x10, 0x11],
            ..DecoderConfig::default()
        };
        let channels = config.ccc_channels();
        assert!(channels.dynamic_l2cap);
        assert_eq!(channels.att_handles, vec![0x10, 0x11]);
    }
}
