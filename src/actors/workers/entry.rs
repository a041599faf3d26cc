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

//! One actor per cached key. The actor owns the single opener/timer slot, the
//! list of readers waiting on an in-flight recovery, its row's value and its
//! own item in the eviction order.

use std::{
	panic::AssertUnwindSafe,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Instant,
};

use futures::{channel::oneshot, FutureExt};
use xtra::prelude::*;

use crate::{
	actors::{workers::coordinator, CacheContext},
	error::{CacheError, Result},
	events::CacheEvent,
	index::{EntryId, LruItem, ValueUpdate},
	key::CacheKey,
};

/// The one slot for background work: either a recovery is in flight or the
/// refresh timer is armed, never both. Dropping a task cancels it.
enum OpenerSlot {
	Task(smol::Task<()>),
	Timer(smol::Task<()>),
	Empty,
}

pub(crate) struct Entry<K: CacheKey> {
	id: EntryId,
	key: K,
	shared: Arc<CacheContext<K>>,
	coordinator: xtra::WeakAddress<coordinator::LruCoordinator<K>>,
	touch_pending: Arc<AtomicBool>,
	val: Option<Result<K::Value>>,
	opener: OpenerSlot,
	/// `None` once the entry has failed terminally; late readers then fall
	/// through to direct recovery at the call site.
	waiters: Option<Vec<oneshot::Sender<Result<K::Value>>>>,
	ts: Option<Instant>,
}

impl<K: CacheKey> Entry<K> {
	pub(crate) fn new(
		id: EntryId,
		key: K,
		touch_pending: Arc<AtomicBool>,
		coordinator: xtra::WeakAddress<coordinator::LruCoordinator<K>>,
		shared: Arc<CacheContext<K>>,
	) -> Self {
		Self {
			id,
			key,
			shared,
			coordinator,
			touch_pending,
			val: None,
			opener: OpenerSlot::Empty,
			waiters: Some(Vec::new()),
			ts: None,
		}
	}

	fn spawn_opener(&self, ctx: &mut Context<Self>) -> smol::Task<()> {
		let key = self.key.clone();
		let addr = ctx.address().expect("entry is running");
		smol::Task::spawn(async move {
			// a panicking recovery is a failed recovery, not a dead executor
			let outcome = match AssertUnwindSafe(key.recover()).catch_unwind().await {
				Ok(outcome) => outcome,
				Err(_) => Err(CacheError::RecoverPanic),
			};
			let _ = addr.do_send(OpenerDone(outcome));
		})
	}

	fn spawn_refresh_timer(&self, ctx: &mut Context<Self>) -> smol::Task<()> {
		let addr = ctx.address().expect("entry is running");
		let interval = self.shared.config.load().refresh_interval();
		smol::Task::spawn(async move {
			smol::Timer::new(interval).await;
			let _ = addr.do_send(Refresh);
		})
	}

	/// Fold this entry into the eviction order at the current instant,
	/// replacing whatever older item it had.
	fn install_lru(&mut self) {
		let now = Instant::now();
		if let Some(old) = self.ts {
			self.shared.lru.remove(&LruItem { ts: old, key: self.key.clone(), id: self.id });
		}
		self.shared.lru.insert(LruItem { ts: now, key: self.key.clone(), id: self.id });
		self.ts = Some(now);
	}

	/// Delete this entry's index row and LRU item. Either may already be
	/// gone when the coordinator's eviction ran first.
	fn remove_tables(&mut self) {
		self.shared.index.delete_matching(&self.key, self.id);
		if let Some(ts) = self.ts.take() {
			self.shared.lru.remove(&LruItem { ts, key: self.key.clone(), id: self.id });
		}
		self.shared.events.emit(CacheEvent::Removed(self.key.clone()));
	}
}

#[async_trait::async_trait]
impl<K: CacheKey> Actor for Entry<K> {
	async fn started(&mut self, ctx: &mut Context<Self>) {
		self.opener = OpenerSlot::Task(self.spawn_opener(ctx));
	}
}

/// Resolve the cached value, or enlist until the in-flight recovery
/// completes. The reply channel is awaited by the caller outside the actor,
/// so the actor keeps processing messages while readers wait.
pub(crate) struct Open<K: CacheKey> {
	pub(crate) key: K,
}

impl<K: CacheKey> Message for Open<K> {
	type Result = oneshot::Receiver<Result<K::Value>>;
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Open<K>> for Entry<K> {
	async fn handle(&mut self, msg: Open<K>, _: &mut Context<Self>) -> oneshot::Receiver<Result<K::Value>> {
		debug_assert_eq!(msg.key, self.key);
		let (tx, rx) = oneshot::channel();
		match (&self.val, &mut self.waiters) {
			(Some(val), _) => {
				let _ = tx.send(val.clone());
			}
			(None, Some(waiters)) => waiters.push(tx),
			// terminally failed with nothing cached: dropping the sender
			// routes the caller to direct recovery
			(None, None) => {}
		}
		rx
	}
}

/// A fast-path hit was just served; fold it into the recency order.
pub(crate) struct Accessed;

impl Message for Accessed {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Accessed> for Entry<K> {
	async fn handle(&mut self, _: Accessed, _: &mut Context<Self>) {
		// re-arm before touching: hits from here on need a new message
		self.touch_pending.store(false, Ordering::Release);
		self.shared.events.emit(CacheEvent::Accessed(self.key.clone()));
		if self.ts.is_some() {
			self.install_lru();
		}
	}
}

/// Re-run recovery now. Kills an opener already in flight and cancels an
/// armed timer; enqueuing it twice just restarts the fetch.
pub(crate) struct Refresh;

impl Message for Refresh {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Refresh> for Entry<K> {
	async fn handle(&mut self, _: Refresh, ctx: &mut Context<Self>) {
		self.opener = OpenerSlot::Task(self.spawn_opener(ctx));
	}
}

/// Synchronous removal on behalf of the coordinator.
pub(crate) struct Shutdown;

impl Message for Shutdown {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<Shutdown> for Entry<K> {
	async fn handle(&mut self, _: Shutdown, ctx: &mut Context<Self>) {
		log::debug!("shutting down entry for {:?}", self.key);
		// kills the live opener or cancels the timer; buffered waiters are
		// dropped and their callers recover directly
		self.opener = OpenerSlot::Empty;
		self.remove_tables();
		ctx.stop();
	}
}

struct OpenerDone<K: CacheKey>(Result<K::Value>);

impl<K: CacheKey> Message for OpenerDone<K> {
	type Result = ();
}

#[async_trait::async_trait]
impl<K: CacheKey> Handler<OpenerDone<K>> for Entry<K> {
	async fn handle(&mut self, done: OpenerDone<K>, ctx: &mut Context<Self>) {
		match done.0 {
			Ok(value) => {
				if let Some(waiters) = self.waiters.as_mut() {
					for waiter in waiters.drain(..) {
						let _ = waiter.send(Ok(value.clone()));
					}
				}
				match self.shared.index.set_value(&self.key, self.id, Ok(value.clone())) {
					ValueUpdate::Inserted => self.shared.events.emit(CacheEvent::Inserted(self.key.clone())),
					ValueUpdate::Updated => self.shared.events.emit(CacheEvent::Updated(self.key.clone())),
					ValueUpdate::Noop => self.shared.events.emit(CacheEvent::UpdateNoop(self.key.clone())),
					// a newer actor owns the row; this one is on its way out
					ValueUpdate::Stale => {}
				}
				self.val = Some(Ok(value));
				self.install_lru();
				self.opener = OpenerSlot::Timer(self.spawn_refresh_timer(ctx));
			}
			Err(err) => {
				log::debug!("recovery for {:?} failed: {}", self.key, err);
				if let Some(waiters) = self.waiters.take() {
					for waiter in waiters {
						let _ = waiter.send(Err(err.clone()));
					}
				}
				self.opener = OpenerSlot::Empty;
				self.remove_tables();
				let _ = self.coordinator.do_send(coordinator::EntryExited { id: self.id });
				ctx.stop();
			}
		}
	}
}
