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

//! Main entrypoint for ddoc-cache. `Builder::start` spawns the coordinator
//! and directive plumbing; the returned handle carries the read fast path.

pub(crate) mod workers;

use std::{
	sync::{atomic::Ordering, Arc},
	time::Duration,
};

use arc_swap::ArcSwap;
use serde::Deserialize;
use xtra::prelude::*;

use crate::{
	broadcast::{Broadcaster, Directive, LocalBroadcaster},
	error::{CacheError, Result},
	events::{CacheEvent, EventSink, EventSource},
	index::{CacheIndex, EntryHandle, LruIndex},
	key::CacheKey,
	stats::CacheStats,
};
use self::workers::{coordinator, coordinator::LruCoordinator, entry};

/// Provides parameters that are passed in from the user.
#[derive(Clone, Debug, Deserialize)]
pub struct CacheConfig {
	/// Maximum number of resident entries. Re-read on every admission, so a
	/// running cache picks up changes installed via `reconfigure`.
	#[serde(default = "default_max_size")]
	pub max_size: usize,
	/// How long an idle entry waits before re-running recovery, in
	/// milliseconds.
	#[serde(default = "default_refresh_interval")]
	pub refresh_interval_ms: u64,
}

impl Default for CacheConfig {
	fn default() -> Self {
		Self { max_size: default_max_size(), refresh_interval_ms: default_refresh_interval() }
	}
}

impl CacheConfig {
	pub(crate) fn refresh_interval(&self) -> Duration {
		Duration::from_millis(self.refresh_interval_ms)
	}
}

const fn default_max_size() -> usize {
	1000
}

const fn default_refresh_interval() -> u64 {
	67_000
}

/// Provides context that every actor and the fast path share.
pub(crate) struct CacheContext<K: CacheKey> {
	pub(crate) index: CacheIndex<K>,
	pub(crate) lru: LruIndex<K>,
	pub(crate) config: ArcSwap<CacheConfig>,
	pub(crate) stats: CacheStats,
	pub(crate) events: EventSink<K>,
}

pub struct Builder<K: CacheKey> {
	config: CacheConfig,
	source: Option<Arc<dyn EventSource>>,
	broadcaster: Option<Arc<dyn Broadcaster>>,
	events: Option<flume::Sender<CacheEvent<K>>>,
}

impl<K: CacheKey> Builder<K> {
	/// Subscribe to database lifecycle notifications; created and deleted
	/// databases have their cached entries evicted.
	#[must_use]
	pub fn event_source(mut self, source: impl EventSource) -> Self {
		self.source = Some(Arc::new(source));
		self
	}

	/// Fan evictions and refreshes out to the rest of the cluster. Without
	/// one, directives stay on this node.
	#[must_use]
	pub fn broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
		self.broadcaster = Some(broadcaster);
		self
	}

	/// Publish lifecycle events on `tx`, mostly useful to tests.
	#[must_use]
	pub fn events(mut self, tx: flume::Sender<CacheEvent<K>>) -> Self {
		self.events = Some(tx);
		self
	}

	/// Spawn the cache and hand back its handle.
	pub fn start(self) -> DdocCache<K> {
		let shared = Arc::new(CacheContext {
			index: CacheIndex::new(),
			lru: LruIndex::new(),
			config: ArcSwap::new(Arc::new(self.config)),
			stats: CacheStats::default(),
			events: EventSink::new(self.events),
		});

		let (directive_tx, directive_rx) = flume::unbounded();
		let broadcaster =
			self.broadcaster.unwrap_or_else(|| Arc::new(LocalBroadcaster::new(directive_tx.clone())));

		let coordinator = LruCoordinator::new(shared.clone(), broadcaster, self.source).spawn();

		// drain directives, local loopback and remote peers alike, into the
		// coordinator; ends once the coordinator is gone
		let coord = coordinator.clone();
		let directives = smol::Task::spawn(async move {
			while let Ok(directive) = directive_rx.recv_async().await {
				let forwarded = match directive {
					Directive::Evict { dbname } => coord.do_send(coordinator::DoEvict { dbname }),
					Directive::Refresh { dbname, ddoc_ids } => {
						coord.do_send(coordinator::DoRefresh { dbname, ddoc_ids })
					}
				};
				if forwarded.is_err() {
					break;
				}
			}
		});

		DdocCache { shared, coordinator, directive_tx, _directives: Arc::new(directives) }
	}
}

/// Handle to a running design-document cache. Cloning is cheap; clones share
/// the same cache.
pub struct DdocCache<K: CacheKey> {
	shared: Arc<CacheContext<K>>,
	coordinator: Address<LruCoordinator<K>>,
	directive_tx: flume::Sender<Directive>,
	_directives: Arc<smol::Task<()>>,
}

impl<K: CacheKey> Clone for DdocCache<K> {
	fn clone(&self) -> Self {
		Self {
			shared: self.shared.clone(),
			coordinator: self.coordinator.clone(),
			directive_tx: self.directive_tx.clone(),
			_directives: self._directives.clone(),
		}
	}
}

impl<K: CacheKey> DdocCache<K> {
	pub fn builder(config: CacheConfig) -> Builder<K> {
		Builder { config, source: None, broadcaster: None, events: None }
	}

	/// Resolve `key`, preferring the cached value.
	///
	/// Misses are coalesced: while a recovery is in flight every reader of
	/// the key waits on it, and exactly one recovery runs. Structural
	/// trouble (cache full, entry evicted mid-call) is invisible here; such
	/// readers recover directly and get the same kind of answer.
	pub async fn open(&self, key: K) -> Result<K::Value> {
		match self.shared.index.lookup(&key) {
			Some(record) => match (record.handle, record.val) {
				(Some(handle), Some(val)) => {
					self.shared.stats.hit();
					if !handle.touch_pending.swap(true, Ordering::AcqRel) {
						let _ = handle.addr.do_send(entry::Accessed);
					}
					val
				}
				(Some(handle), None) => {
					self.shared.stats.miss();
					self.entry_open(handle, &key).await
				}
				_ => self.start_entry(key).await,
			},
			None => self.start_entry(key).await,
		}
	}

	async fn start_entry(&self, key: K) -> Result<K::Value> {
		match self.coordinator.send(coordinator::Start { key: key.clone() }).await {
			Ok(Ok(handle)) => {
				self.shared.stats.miss();
				self.entry_open(handle, &key).await
			}
			Ok(Err(CacheError::Full)) => self.recover_direct(&key).await,
			Ok(Err(err)) => Err(err),
			// coordinator gone; the cache is dead but readers need not be
			Err(_) => self.recover_direct(&key).await,
		}
	}

	async fn entry_open(&self, handle: EntryHandle<K>, key: &K) -> Result<K::Value> {
		match handle.addr.send(entry::Open { key: key.clone() }).await {
			Ok(reply) => match reply.await {
				Ok(outcome) => outcome,
				// the entry died before replying; its successor repopulates
				Err(_canceled) => self.recover_direct(key).await,
			},
			Err(_disconnected) => self.recover_direct(key).await,
		}
	}

	async fn recover_direct(&self, key: &K) -> Result<K::Value> {
		self.shared.stats.recovery();
		key.recover().await
	}

	/// Drop every cached entry of `dbname`, cluster-wide.
	pub async fn evict(&self, dbname: impl Into<String>) -> Result<()> {
		self.coordinator.send(coordinator::Evict { dbname: dbname.into() }).await?;
		Ok(())
	}

	/// Ask every node to re-run recovery for the listed design documents of
	/// `dbname`. Keys with an unknown identifier are always included.
	pub async fn refresh(&self, dbname: impl Into<String>, ddoc_ids: Vec<String>) -> Result<()> {
		self.coordinator.send(coordinator::Refresh { dbname: dbname.into(), ddoc_ids }).await?;
		Ok(())
	}

	/// Install a new configuration. The size limit applies from the next
	/// admission; resident entries above a lowered limit drain one per
	/// admission rather than all at once.
	pub fn reconfigure(&self, config: CacheConfig) {
		self.shared.config.store(Arc::new(config));
	}

	pub fn stats(&self) -> &CacheStats {
		&self.shared.stats
	}

	/// Number of resident entries.
	pub fn len(&self) -> usize {
		self.shared.index.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Whether a live entry exists for `key`.
	pub fn contains(&self, key: &K) -> bool {
		self.shared.index.contains(key)
	}

	/// Injection point for directives arriving from peer nodes; hand its
	/// clones to whatever transport feeds this node.
	pub fn directives(&self) -> flume::Sender<Directive> {
		self.directive_tx.clone()
	}

	/// Tear the cache down, shutting down every entry actor.
	pub async fn shutdown(&self) -> Result<()> {
		self.coordinator.send(coordinator::Die).await?;
		Ok(())
	}
}
