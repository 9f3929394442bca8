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

//! Load generations.
//!
//! Every load bumps the counter and hands a token to its tasks. Results are
//! applied only while the token still matches; anything older is dropped
//! without an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Owned by whoever starts loads. Cloning shares the same counter.
#[derive(Debug, Clone, Default)]
pub struct GenerationCounter {
    current: Arc<AtomicU64>,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation, invalidating every outstanding token
    pub fn advance(&self) -> GenerationToken {
        let generation = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!("Starting load generation {generation}");
        GenerationToken {
            generation,
            current: Arc::clone(&self.current),
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }
}

/// Read-only view handed to decode tasks
#[derive(Debug, Clone)]
pub struct GenerationToken {
    generation: u64,
    current: Arc<AtomicU64>,
}

impl GenerationToken {
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst) == self.generation
    }
}
