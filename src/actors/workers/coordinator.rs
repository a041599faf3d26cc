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

//! The serialized admission and eviction side of the cache. Entry actors
//! evolve in parallel; everything that changes which entries exist goes
//! through this actor, so trimming never races another admission.

use std::{
	sync::{atomic::AtomicBool, Arc},
	time::Duration,
};

use hashbrown::HashMap;
use xtra::prelude::*;

use crate::{
	actors::{workers::entry, CacheContext},
	broadcast::{Broadcaster, Directive},
	error::{CacheError, Result},
	events::{shard_dbname, CacheEvent, DbEventKind, EventSource},
	index::{EntryHandle, EntryId},
	key::CacheKey,
};

/// Wait before resubscribing after the event subscription dies, so a source
/// that is gone for good cannot spin the coordinator.
const EVICTOR_RETRY: Duration = Duration::from_secs(1);

pub(crate) struct LruCoordinator<K: CacheKey> {
	shared: Arc<CacheContext<K>>,
	broadcaster: Arc<dyn Broadcaster>,
	source: Option<Arc<dyn EventSource>>,
	/// entry id → key for every live entry actor
	pids: HashMap<EntryId, K>,
	/// dbname → ddocid → key → handle, for O(1) database eviction and
	/// (db, ddocid) refresh. The `None` ddocid bucket holds keys whose
	/// identifier is unknown at publish time.
	dbs: HashMap<String, HashMap<Option<String>, HashMap<K, EntryHandle<K>>>>,
	size: usize,
	evictor: Option<smol::Task<()>>,
	next_id: u64,
}

impl<K: CacheKey> LruCoordinator<K> {
	pub(crate) fn new(
		shared: Arc<CacheContext<K>>,
		broadcaster: Arc<dyn Broadcaster>,
		source: Option<Arc<dyn EventSource>>,
	) -> Self {
		Self {
			shared,
			broadcaster,
			source,
			pids: HashMap::new(),
			dbs: HashMap::new(),
			size: 0,
			evictor: None,
			next_id: 0,
		}
	}

	/// Drain database lifecycle notifications into eviction requests.
	/// Created and deleted shards both invalidate whatever is cached for the
	/// logical database; everything else is ignored.
	fn spawn_evictor(&mut self, ctx: &mut Context<Self>, delay: Option<Duration>) {
		let source = match &self.source {
			Some(source) => source.clone(),
			None => return,
		};
		let addr = ctx.address().expect("coordinator is running").downgrade();
		self.evictor = Some(smol::Task::spawn(async move {
			if let Some(delay) = delay {
				smol::Timer::new(delay).await;
			}
			let rx = source.subscribe();
			while let Ok(event) = rx.recv_async().await {
				match event.kind {
					DbEventKind::Created | DbEventKind::Deleted => {
						let dbname = shard_dbname(&event.shard).to_owned();
						if addr.do_send(Evict { dbname }).is_err() {
							return;
						}
					}
					_ => {}
				}
			}
			let _ = addr.do_send(EvictorDied);
		}));
	}

	/// Make room for one admission. At capacity the coldest entry goes; with
	/// a zero limit, or nothing evictable, admission is refused.
	async fn trim(&mut self, max_size: usize) -> Result<()> {
		if max_size == 0 {
			return Err(CacheError::Full);
		}
		if self.size < max_size {
			return Ok(());
		}
		match self.shared.lru.first() {
			Some(item) => {
				self.remove_entry(&item.key, item.id).await;
				// the entry deletes its own item on shutdown; this only
				// matters when the actor died without cleaning up
				self.shared.lru.remove(&item);
				Ok(())
			}
			None => Err(CacheError::Full),
		}
	}

	/// Tear down one entry. The id is unlinked first so the actor's exit
	/// notification, should it race us, finds nothing left to prune.
	async fn remove_entry(&mut self, key: &K, id: EntryId) {
		let unlinked = self.pids.remove(&id).is_some();
		if let Some(handle) = self.unrecord(key, id) {
			if handle.addr.send(entry::Shutdown).await.is_err() {
				// already dead; make sure its row is gone
				self.shared.index.delete_matching(key, id);
			}
		}
		if unlinked {
			self.size = self.size.saturating_sub(1);
		}
	}

	/// Drop the `dbs` bookkeeping for `(key, id)`, returning the handle if
	/// that exact pairing was recorded. A mismatching id means a newer actor
	/// took over the key; its bookkeeping stays.
	fn unrecord(&mut self, key: &K, id: EntryId) -> Option<EntryHandle<K>> {
		let ddoc = key.ddocid().map(str::to_owned);
		let ddocs = self.dbs.get_mut(key.dbname())?;
		let mut removed = None;
		if let Some(keys) = ddocs.get_mut(&ddoc) {
			if keys.get(key).map(|h| h.id) == Some(id) {
				removed = keys.remove(key);
			}
			if keys.is_empty() {
				ddocs.remove(&ddoc);
			}
		}
		if ddocs.is_empty() {
			self.dbs.remove(key.dbname());
		}
		removed
	}

	fn record(&mut self, key: &K, handle: EntryHandle<K>) {
		self.pids.insert(handle.id, key.clone());
		self.dbs
			.entry(key.dbname().to_owned())
			.or_insert_with(HashMap::new)
			.entry(key.ddocid().map(str::to_owned))
			.or_insert_with(HashMap::new)
			.insert(key.clone(), handle);
		self.size += 1;
	}
}

#[async_trait::async_trait]
impl<K: CacheKey> Actor for LruCoordinator<K> {
	async fn started(&mut self, ctx: &mut Context<Self>) {
		self.spawn_evictor(ctx, None);
	}
}

/// Admit (or look up) the entry actor for a key. Synchronous: the caller
/// needs the handle before it can enlist as a waiter.
pub(crate) struct Start<K: CacheKey> {
	pub(crate) key: K,
}

impl<K: CacheKey> Message for Start<K> {
	type Result = Result<EntryHandle<K>>;
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Start<K>> for LruCoordinator<K> {
	async fn handle(&mut self, msg: Start<K>, ctx: &mut Context<Self>) -> Result<EntryHandle<K>> {
		let key = msg.key;
		if let Some(handle) = self.shared.index.handle(&key) {
			return Ok(handle);
		}
		// the limit is re-read on every admission so it can change live
		let max_size = self.shared.config.load().max_size;
		if let Err(err) = self.trim(max_size).await {
			log::debug!("no room to admit {:?}", key);
			self.shared.events.emit(CacheEvent::Full(key));
			return Err(err);
		}

		let id = EntryId::new(self.next_id);
		self.next_id += 1;
		let touch_pending = Arc::new(AtomicBool::new(false));

		// row first, then actor: the opener's value write expects a row
		self.shared.index.insert_if_absent(key.clone());
		let coordinator = ctx.address().expect("coordinator is running").downgrade();
		let entry = entry::Entry::new(id, key.clone(), touch_pending.clone(), coordinator, self.shared.clone());
		let addr = entry.spawn();
		let handle = EntryHandle { id, addr, touch_pending };
		self.shared.index.attach(&key, handle.clone());
		self.record(&key, handle.clone());
		self.shared.events.emit(CacheEvent::Started(key));
		Ok(handle)
	}
}

/// Locally originated eviction; fanned out to the whole cluster.
pub(crate) struct Evict {
	pub(crate) dbname: String,
}

impl Message for Evict {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Evict> for LruCoordinator<K> {
	async fn handle(&mut self, msg: Evict, _: &mut Context<Self>) {
		if let Err(err) = self.broadcaster.broadcast(Directive::Evict { dbname: msg.dbname }) {
			log::error!("failed to broadcast eviction: {}", err);
		}
	}
}

/// Locally originated refresh; fanned out to the whole cluster.
pub(crate) struct Refresh {
	pub(crate) dbname: String,
	pub(crate) ddoc_ids: Vec<String>,
}

impl Message for Refresh {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Refresh> for LruCoordinator<K> {
	async fn handle(&mut self, msg: Refresh, _: &mut Context<Self>) {
		let directive = Directive::Refresh { dbname: msg.dbname, ddoc_ids: msg.ddoc_ids };
		if let Err(err) = self.broadcaster.broadcast(directive) {
			log::error!("failed to broadcast refresh: {}", err);
		}
	}
}

/// Apply an eviction, whichever node it originated on.
pub(crate) struct DoEvict {
	pub(crate) dbname: String,
}

impl Message for DoEvict {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<DoEvict> for LruCoordinator<K> {
	async fn handle(&mut self, msg: DoEvict, _: &mut Context<Self>) {
		match self.dbs.remove(&msg.dbname) {
			Some(ddocs) => {
				log::debug!("evicting all entries for {}", msg.dbname);
				for (_, keys) in ddocs {
					for (key, handle) in keys {
						self.pids.remove(&handle.id);
						if handle.addr.send(entry::Shutdown).await.is_err() {
							self.shared.index.delete_matching(&key, handle.id);
						}
						self.size = self.size.saturating_sub(1);
					}
				}
				self.shared.events.emit(CacheEvent::Evicted(msg.dbname));
			}
			None => self.shared.events.emit(CacheEvent::EvictNoop(msg.dbname)),
		}
	}
}

/// Apply a refresh, whichever node it originated on.
pub(crate) struct DoRefresh {
	pub(crate) dbname: String,
	pub(crate) ddoc_ids: Vec<String>,
}

impl Message for DoRefresh {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<DoRefresh> for LruCoordinator<K> {
	async fn handle(&mut self, msg: DoRefresh, _: &mut Context<Self>) {
		let ddocs = match self.dbs.get(&msg.dbname) {
			Some(ddocs) => ddocs,
			None => return,
		};
		// unknown-identifier keys are refreshed by every database-wide
		// refresh, so the None bucket is always prepended
		let targets = std::iter::once(None).chain(msg.ddoc_ids.into_iter().map(Some));
		for ddoc in targets {
			if let Some(keys) = ddocs.get(&ddoc) {
				for handle in keys.values() {
					let _ = handle.addr.do_send(entry::Refresh);
				}
			}
		}
	}
}

/// An entry terminated on its own (failed first fetch or failed refresh).
/// No-op when the coordinator already unlinked the id itself.
pub(crate) struct EntryExited {
	pub(crate) id: EntryId,
}

impl Message for EntryExited {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<EntryExited> for LruCoordinator<K> {
	async fn handle(&mut self, msg: EntryExited, _: &mut Context<Self>) {
		if let Some(key) = self.pids.remove(&msg.id) {
			self.unrecord(&key, msg.id);
			self.size = self.size.saturating_sub(1);
		}
	}
}

struct EvictorDied;

impl Message for EvictorDied {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<EvictorDied> for LruCoordinator<K> {
	async fn handle(&mut self, _: EvictorDied, ctx: &mut Context<Self>) {
		log::warn!("database event subscription died; resubscribing");
		self.shared.events.emit(CacheEvent::EvictorDied);
		self.spawn_evictor(ctx, Some(EVICTOR_RETRY));
	}
}

/// Tear the whole cache down: every entry is shut down, the event
/// subscription is dropped and the coordinator stops.
pub(crate) struct Die;

impl Message for Die {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Die> for LruCoordinator<K> {
	async fn handle(&mut self, _: Die, ctx: &mut Context<Self>) {
		self.evictor = None;
		let dbs = std::mem::take(&mut self.dbs);
		for (_, ddocs) in dbs {
			for (_, keys) in ddocs {
				for (_, handle) in keys {
					let _ = handle.addr.send(entry::Shutdown).await;
				}
			}
		}
		self.pids.clear();
		self.size = 0;
		ctx.stop();
	}
}
