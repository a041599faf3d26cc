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

//! The two tables shared between the fast path and the actors: the key index
//! and the eviction order. Writer discipline: the coordinator attaches an
//! entry handle exactly once, each entry actor is the sole writer of its own
//! row's value and of its own LRU item, and every delete is qualified by
//! `(key, entry id)` so a stale actor can never take out a newer actor's row.

use std::{
	collections::BTreeSet,
	sync::{atomic::AtomicBool, Arc},
	time::Instant,
};

use hashbrown::HashMap;
use parking_lot::RwLock;
use xtra::Address;

use crate::{actors::workers::entry::Entry, error::Result, key::CacheKey};

/// Identity of one entry actor, minted by the coordinator. Plays the role a
/// process id plays elsewhere: addresses carry no identity of their own, so
/// the id is what match-qualifies deletes and breaks LRU ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct EntryId(u64);

impl EntryId {
	pub(crate) fn new(id: u64) -> Self {
		Self(id)
	}
}

/// Shared handle to a live entry actor.
///
/// `touch_pending` arms the coalesced LRU touch: the fast path only sends
/// `Accessed` when it flips the flag, and the entry clears it again before
/// performing a single LRU update, so a burst of hits costs one mutation.
pub(crate) struct EntryHandle<K: CacheKey> {
	pub(crate) id: EntryId,
	pub(crate) addr: Address<Entry<K>>,
	pub(crate) touch_pending: Arc<AtomicBool>,
}

impl<K: CacheKey> Clone for EntryHandle<K> {
	fn clone(&self) -> Self {
		Self { id: self.id, addr: self.addr.clone(), touch_pending: self.touch_pending.clone() }
	}
}

/// One row of the key index. `handle` is `None` only for the placeholder the
/// coordinator inserts before the actor attaches; `val` is `None` until the
/// first recovery completes.
pub(crate) struct EntryRecord<K: CacheKey> {
	pub(crate) handle: Option<EntryHandle<K>>,
	pub(crate) val: Option<Result<K::Value>>,
}

impl<K: CacheKey> Clone for EntryRecord<K> {
	fn clone(&self) -> Self {
		Self { handle: self.handle.clone(), val: self.val.clone() }
	}
}

/// Outcome of an entry writing its recovered value into its row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueUpdate {
	/// First value this row has seen.
	Inserted,
	/// The recovery produced a new version.
	Updated,
	/// The recovery produced the version already cached.
	Noop,
	/// The row is owned by a newer actor (or gone); nothing was written.
	Stale,
}

/// Key → record mapping with concurrent lookup on the read path.
pub(crate) struct CacheIndex<K: CacheKey> {
	rows: RwLock<HashMap<K, EntryRecord<K>>>,
}

impl<K: CacheKey> CacheIndex<K> {
	pub(crate) fn new() -> Self {
		Self { rows: RwLock::new(HashMap::new()) }
	}

	pub(crate) fn lookup(&self, key: &K) -> Option<EntryRecord<K>> {
		self.rows.read().get(key).cloned()
	}

	/// The live handle for `key`, if an actor is attached.
	pub(crate) fn handle(&self, key: &K) -> Option<EntryHandle<K>> {
		self.rows.read().get(key).and_then(|row| row.handle.clone())
	}

	/// Reserve a row for `key` ahead of the actor attaching to it.
	pub(crate) fn insert_if_absent(&self, key: K) {
		self.rows.write().entry(key).or_insert(EntryRecord { handle: None, val: None });
	}

	/// Bind the freshly spawned actor to its row. Called once per admission,
	/// by the coordinator only.
	pub(crate) fn attach(&self, key: &K, handle: EntryHandle<K>) {
		if let Some(row) = self.rows.write().get_mut(key) {
			row.handle = Some(handle);
		}
	}

	/// Write a recovered value into the row owned by `(key, id)`.
	pub(crate) fn set_value(&self, key: &K, id: EntryId, val: Result<K::Value>) -> ValueUpdate {
		let mut rows = self.rows.write();
		match rows.get_mut(key) {
			Some(row) if row.handle.as_ref().map(|h| h.id) == Some(id) => {
				let update = match (&row.val, &val) {
					(None, _) => ValueUpdate::Inserted,
					(Some(Ok(old)), Ok(new)) if old == new => ValueUpdate::Noop,
					_ => ValueUpdate::Updated,
				};
				if update != ValueUpdate::Noop {
					row.val = Some(val);
				}
				update
			}
			_ => ValueUpdate::Stale,
		}
	}

	/// Remove the row for `key` iff it is still owned by `id`. Both the
	/// coordinator's eviction path and the actor's own cleanup call this;
	/// whichever runs second finds nothing to do.
	pub(crate) fn delete_matching(&self, key: &K, id: EntryId) -> bool {
		let mut rows = self.rows.write();
		match rows.get(key) {
			Some(row) if row.handle.as_ref().map(|h| h.id) == Some(id) => {
				rows.remove(key);
				true
			}
			_ => false,
		}
	}

	/// Number of rows with an attached actor.
	pub(crate) fn len(&self) -> usize {
		self.rows.read().values().filter(|row| row.handle.is_some()).count()
	}

	pub(crate) fn contains(&self, key: &K) -> bool {
		self.rows.read().get(key).map(|row| row.handle.is_some()).unwrap_or(false)
	}
}

/// One element of the eviction order. The derived ordering compares
/// `(ts, key, id)`, so two actors never alias even on a timestamp collision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct LruItem<K: CacheKey> {
	pub(crate) ts: Instant,
	pub(crate) key: K,
	pub(crate) id: EntryId,
}

/// Ordered set of live entries by last access. The minimum item is the
/// eviction candidate.
pub(crate) struct LruIndex<K: CacheKey> {
	items: RwLock<BTreeSet<LruItem<K>>>,
}

impl<K: CacheKey> LruIndex<K> {
	pub(crate) fn new() -> Self {
		Self { items: RwLock::new(BTreeSet::new()) }
	}

	pub(crate) fn insert(&self, item: LruItem<K>) {
		self.items.write().insert(item);
	}

	/// Exact-triple removal; absent items are tolerated.
	pub(crate) fn remove(&self, item: &LruItem<K>) -> bool {
		self.items.write().remove(item)
	}

	pub(crate) fn first(&self) -> Option<LruItem<K>> {
		self.items.read().iter().next().cloned()
	}

	pub(crate) fn len(&self) -> usize {
		self.items.read().len()
	}
}
