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

//! Database lifecycle notifications consumed by the cache, and the lifecycle
//! events it publishes for observers.

/// What happened to a shard, as reported by the subscription source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbEventKind {
	Created,
	Deleted,
	/// Content changed; the cache refreshes on its own schedule instead.
	Updated,
}

/// A notification about one shard file.
#[derive(Debug, Clone)]
pub struct DbEvent {
	pub shard: String,
	pub kind: DbEventKind,
}

impl DbEvent {
	pub fn new(shard: impl Into<String>, kind: DbEventKind) -> Self {
		Self { shard: shard.into(), kind }
	}
}

/// Source of database lifecycle notifications. The coordinator resubscribes
/// whenever its current subscription dies, so `subscribe` may be called more
/// than once per cache.
pub trait EventSource: Send + Sync + 'static {
	fn subscribe(&self) -> flume::Receiver<DbEvent>;
}

/// flume receivers are multi-consumer, so one doubles as its own source.
impl EventSource for flume::Receiver<DbEvent> {
	fn subscribe(&self) -> flume::Receiver<DbEvent> {
		self.clone()
	}
}

/// Logical database name of a shard file name.
///
/// `shards/00000000-1fffffff/abc.1565267006` maps to `abc`; names that do not
/// look like shard files pass through unchanged.
pub fn shard_dbname(shard: &str) -> &str {
	let name = match shard.strip_prefix("shards/") {
		Some(rest) => rest.splitn(2, '/').nth(1).unwrap_or(rest),
		None => shard,
	};
	match name.rfind('.') {
		Some(dot) if dot + 1 < name.len() && name[dot + 1..].bytes().all(|b| b.is_ascii_digit()) => &name[..dot],
		_ => name,
	}
}

/// Lifecycle events the cache publishes, mostly for test observation.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent<K> {
	/// An entry actor was admitted for the key.
	Started(K),
	/// A fast-path hit was folded into the recency order.
	Accessed(K),
	/// First value written for the key.
	Inserted(K),
	/// A refresh produced a new version.
	Updated(K),
	/// A refresh produced the version already cached.
	UpdateNoop(K),
	/// The entry's rows were deleted.
	Removed(K),
	/// Admission was refused; the reader recovered directly.
	Full(K),
	/// Every entry of the database was evicted.
	Evicted(String),
	/// An eviction arrived for a database with no cached entries.
	EvictNoop(String),
	/// The event subscription died; a new one is being set up.
	EvictorDied,
}

/// Best-effort publisher; a cache built without an observer drops everything.
pub(crate) struct EventSink<K> {
	tx: Option<flume::Sender<CacheEvent<K>>>,
}

impl<K> EventSink<K> {
	pub(crate) fn new(tx: Option<flume::Sender<CacheEvent<K>>>) -> Self {
		Self { tx }
	}

	pub(crate) fn emit(&self, event: CacheEvent<K>) {
		if let Some(tx) = &self.tx {
			let _ = tx.send(event);
		}
	}
}
