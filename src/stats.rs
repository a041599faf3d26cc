// Copyright 2019-2021 Contributors to the ddoc-cache project.
// This file is part of ddoc-cache.

// ddoc-cache is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// ddoc-cache is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with ddoc-cache.  If not, see <http://www.gnu.org/licenses/>.

use std::sync::atomic::{AtomicU64, Ordering};

/// Increment-only counters for cache outcomes.
///
/// `recovery` counts the reads served by calling recovery directly, bypassing
/// the cache: the cache was full, or the entry died under the reader's feet.
#[derive(Debug, Default)]
pub struct CacheStats {
	hit: AtomicU64,
	miss: AtomicU64,
	recovery: AtomicU64,
}

impl CacheStats {
	pub(crate) fn hit(&self) {
		self.hit.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn miss(&self) {
		self.miss.fetch_add(1, Ordering::Relaxed);
	}

	pub(crate) fn recovery(&self) {
		self.recovery.fetch_add(1, Ordering::Relaxed);
	}

	pub fn hits(&self) -> u64 {
		self.hit.load(Ordering::Relaxed)
	}

	pub fn misses(&self) -> u64 {
		self.miss.load(Ordering::Relaxed)
	}

	pub fn recoveries(&self) -> u64 {
		self.recovery.load(Ordering::Relaxed)
	}
}
