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

//! Bounded LRU cache for design documents in a clustered document database.
//!
//! Resolving a design document is expensive (it fetches from a shard and may
//! run custom recovery logic) and is requested by many concurrent readers.
//! This crate keeps recently used documents in memory behind a [`CacheKey`]
//! capability: a bounded LRU in which every entry is its own actor owning one
//! in-flight recovery, a periodic refresh timer and the readers waiting on
//! it. Concurrent misses coalesce into a single recovery per key, database
//! creation or deletion evicts everything cached for it, and eviction and
//! refresh directives fan out to the rest of the cluster through a
//! [`Broadcaster`].

#![forbid(unsafe_code)]

mod actors;
mod broadcast;
mod error;
mod events;
mod index;
mod key;
#[cfg(feature = "logging")]
pub mod logger;
mod stats;

pub use self::actors::{Builder, CacheConfig, DdocCache};
pub use self::broadcast::{Broadcaster, Directive, LocalBroadcaster};
pub use self::error::{CacheError, Result};
pub use self::events::{shard_dbname, CacheEvent, DbEvent, DbEventKind, EventSource};
pub use self::key::CacheKey;
pub use self::stats::CacheStats;
