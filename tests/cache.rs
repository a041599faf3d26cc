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

use std::{
	cmp,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use ddoc_cache::{
	CacheConfig, CacheError, CacheEvent, CacheKey, DbEvent, DbEventKind, DdocCache, Result,
};

static INIT: Lazy<()> = Lazy::new(|| {
	let _ = pretty_env_logger::try_init();
});

const SHORT: Duration = Duration::from_secs(2);

/// Stand-in for the shard fetch behind one key: counts recoveries, can be
/// slowed down and can be made to fail.
#[derive(Debug)]
struct Backend {
	calls: AtomicU64,
	value: Mutex<u64>,
	delay: Duration,
	fail: AtomicBool,
}

impl Backend {
	fn new(value: u64) -> Arc<Self> {
		Self::with_delay(value, Duration::from_millis(0))
	}

	fn with_delay(value: u64, delay: Duration) -> Arc<Self> {
		Arc::new(Self {
			calls: AtomicU64::new(0),
			value: Mutex::new(value),
			delay,
			fail: AtomicBool::new(false),
		})
	}

	fn calls(&self) -> u64 {
		self.calls.load(Ordering::SeqCst)
	}

	fn set_value(&self, value: u64) {
		*self.value.lock() = value;
	}

	fn set_fail(&self, fail: bool) {
		self.fail.store(fail, Ordering::SeqCst);
	}
}

#[derive(Clone, Debug)]
struct TestKey {
	dbname: String,
	ddocid: Option<String>,
	backend: Arc<Backend>,
}

impl TestKey {
	fn new(dbname: &str, ddocid: Option<&str>, backend: Arc<Backend>) -> Self {
		Self { dbname: dbname.to_owned(), ddocid: ddocid.map(str::to_owned), backend }
	}
}

// key identity is (dbname, ddocid); the backend is a test fixture
impl PartialEq for TestKey {
	fn eq(&self, other: &Self) -> bool {
		(&self.dbname, &self.ddocid) == (&other.dbname, &other.ddocid)
	}
}

impl Eq for TestKey {}

impl PartialOrd for TestKey {
	fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl Ord for TestKey {
	fn cmp(&self, other: &Self) -> cmp::Ordering {
		(&self.dbname, &self.ddocid).cmp(&(&other.dbname, &other.ddocid))
	}
}

impl std::hash::Hash for TestKey {
	fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
		self.dbname.hash(state);
		self.ddocid.hash(state);
	}
}

#[async_trait::async_trait]
impl CacheKey for TestKey {
	type Value = u64;

	fn dbname(&self) -> &str {
		&self.dbname
	}

	fn ddocid(&self) -> Option<&str> {
		self.ddocid.as_deref()
	}

	async fn recover(&self) -> Result<u64> {
		if self.backend.delay > Duration::from_millis(0) {
			smol::Timer::new(self.backend.delay).await;
		}
		self.backend.calls.fetch_add(1, Ordering::SeqCst);
		if self.backend.fail.load(Ordering::SeqCst) {
			let err = std::io::Error::new(std::io::ErrorKind::NotFound, "ddoc missing");
			return Err(CacheError::recover(err));
		}
		Ok(*self.backend.value.lock())
	}
}

fn config(max_size: usize, refresh_ms: u64) -> CacheConfig {
	CacheConfig { max_size, refresh_interval_ms: refresh_ms }
}

/// Drain events until one matches, or the timeout runs out.
fn wait_for<F>(rx: &flume::Receiver<CacheEvent<TestKey>>, timeout: Duration, mut pred: F) -> bool
where
	F: FnMut(&CacheEvent<TestKey>) -> bool,
{
	let deadline = Instant::now() + timeout;
	loop {
		let now = Instant::now();
		if now >= deadline {
			return false;
		}
		match rx.recv_timeout(deadline - now) {
			Ok(event) => {
				if pred(&event) {
					return true;
				}
			}
			Err(_) => return false,
		}
	}
}

async fn wait_until(timeout: Duration, f: impl Fn() -> bool) -> bool {
	let deadline = Instant::now() + timeout;
	while Instant::now() < deadline {
		if f() {
			return true;
		}
		smol::Timer::new(Duration::from_millis(10)).await;
	}
	f()
}

#[test]
fn miss_then_hit() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> = DdocCache::builder(config(10, 60_000)).events(ev_tx).start();
		let backend = Backend::new(7);
		let k1 = TestKey::new("db-a", Some("validate"), backend.clone());

		assert_eq!(cache.open(k1.clone()).await.unwrap(), 7);
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Started(k1.clone())));
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Inserted(k1.clone())));
		assert_eq!(cache.stats().misses(), 1);

		// let the entry finish publishing its value
		smol::Timer::new(Duration::from_millis(20)).await;
		assert_eq!(cache.open(k1.clone()).await.unwrap(), 7);
		assert_eq!(cache.stats().hits(), 1);
		assert_eq!(backend.calls(), 1);
		// the second open must not admit a second entry
		assert!(!wait_for(&ev_rx, Duration::from_millis(100), |e| matches!(e, CacheEvent::Started(_))));

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn concurrent_misses_coalesce() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let cache: DdocCache<TestKey> = DdocCache::builder(config(10, 60_000)).start();
		let backend = Backend::with_delay(11, Duration::from_millis(200));
		let key = TestKey::new("db-b", None, backend.clone());

		let readers: Vec<_> = (0..100)
			.map(|_| {
				let cache = cache.clone();
				let key = key.clone();
				smol::Task::spawn(async move { cache.open(key).await })
			})
			.collect();
		for reader in readers {
			assert_eq!(reader.await.unwrap(), 11);
		}
		assert_eq!(backend.calls(), 1);

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn oldest_entry_is_evicted_at_capacity() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> = DdocCache::builder(config(2, 60_000)).events(ev_tx).start();
		let k1 = TestKey::new("db-1", Some("a"), Backend::new(1));
		let k2 = TestKey::new("db-2", Some("b"), Backend::new(2));
		let k3 = TestKey::new("db-3", Some("c"), Backend::new(3));

		assert_eq!(cache.open(k1.clone()).await.unwrap(), 1);
		assert_eq!(cache.open(k2.clone()).await.unwrap(), 2);
		// entries enter the recency order as their recoveries complete
		smol::Timer::new(Duration::from_millis(20)).await;
		assert_eq!(cache.open(k3.clone()).await.unwrap(), 3);

		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Removed(k1.clone())));
		assert!(!cache.contains(&k1));
		assert!(cache.contains(&k2));
		assert!(cache.contains(&k3));
		assert_eq!(cache.len(), 2);

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn idle_entries_refresh_on_a_timer() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> = DdocCache::builder(config(1, 50)).events(ev_tx).start();
		let backend = Backend::new(1);
		let key = TestKey::new("db-r", Some("views"), backend.clone());

		assert_eq!(cache.open(key.clone()).await.unwrap(), 1);
		smol::Timer::new(Duration::from_millis(120)).await;
		// at least the initial fetch plus one timer-driven refresh
		assert!(backend.calls() >= 2, "expected a refresh, saw {} calls", backend.calls());
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::UpdateNoop(key.clone())));

		// a refresh that finds a new version replaces the cached one
		backend.set_value(42);
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Updated(key.clone())));
		assert_eq!(cache.open(key.clone()).await.unwrap(), 42);

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn database_deletion_evicts_its_entries() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (db_tx, db_rx) = flume::unbounded();
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> =
			DdocCache::builder(config(10, 60_000)).events(ev_tx).event_source(db_rx).start();
		let k1 = TestKey::new("dbv", Some("a"), Backend::new(1));
		let k2 = TestKey::new("dbv", None, Backend::new(2));

		assert_eq!(cache.open(k1.clone()).await.unwrap(), 1);
		assert_eq!(cache.open(k2.clone()).await.unwrap(), 2);
		assert_eq!(cache.len(), 2);

		db_tx
			.send(DbEvent::new("shards/00000000-1fffffff/dbv.1565267006", DbEventKind::Deleted))
			.unwrap();

		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Evicted("dbv".to_owned())));
		assert!(!cache.contains(&k1));
		assert!(!cache.contains(&k2));
		assert_eq!(cache.len(), 0);

		// a second deletion finds nothing cached
		db_tx
			.send(DbEvent::new("shards/00000000-1fffffff/dbv.1565267006", DbEventKind::Deleted))
			.unwrap();
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::EvictNoop("dbv".to_owned())));

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn zero_capacity_bypasses_the_cache() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> = DdocCache::builder(config(0, 60_000)).events(ev_tx).start();
		let backend = Backend::new(9);
		let key = TestKey::new("db-f", Some("filters"), backend.clone());

		assert_eq!(cache.open(key.clone()).await.unwrap(), 9);
		assert_eq!(cache.stats().recoveries(), 1);
		assert_eq!(backend.calls(), 1);
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Full(key.clone())));
		assert_eq!(cache.len(), 0);
		assert!(!wait_for(&ev_rx, Duration::from_millis(100), |e| matches!(e, CacheEvent::Started(_))));

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn failed_recovery_surfaces_and_does_not_stick() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> = DdocCache::builder(config(10, 60_000)).events(ev_tx).start();
		let backend = Backend::with_delay(5, Duration::from_millis(20));
		let key = TestKey::new("db-e", Some("broken"), backend.clone());
		backend.set_fail(true);

		let err = cache.open(key.clone()).await.unwrap_err();
		assert!(matches!(err, CacheError::Recover(_)));
		assert_eq!(backend.calls(), 1);
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::Removed(key.clone())));
		assert_eq!(cache.len(), 0);

		// the failure is not cached; the next open starts over
		backend.set_fail(false);
		assert_eq!(cache.open(key.clone()).await.unwrap(), 5);
		assert_eq!(backend.calls(), 2);

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn refresh_targets_listed_and_unidentified_keys() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let cache: DdocCache<TestKey> = DdocCache::builder(config(10, 60_000)).start();
		let ba = Backend::new(1);
		let bb = Backend::new(2);
		let bn = Backend::new(3);
		let ka = TestKey::new("db-rd", Some("a"), ba.clone());
		let kb = TestKey::new("db-rd", Some("b"), bb.clone());
		let kn = TestKey::new("db-rd", None, bn.clone());

		assert_eq!(cache.open(ka.clone()).await.unwrap(), 1);
		assert_eq!(cache.open(kb.clone()).await.unwrap(), 2);
		assert_eq!(cache.open(kn.clone()).await.unwrap(), 3);

		cache.refresh("db-rd", vec!["a".to_owned()]).await.unwrap();

		// the listed ddoc and the unidentified key refresh; "b" does not
		assert!(wait_until(SHORT, || ba.calls() == 2 && bn.calls() == 2).await);
		smol::Timer::new(Duration::from_millis(50)).await;
		assert_eq!(bb.calls(), 1);

		cache.shutdown().await.unwrap();
	});
}

#[test]
fn dead_event_subscription_is_reported() {
	Lazy::force(&INIT);
	smol::block_on(async {
		let (db_tx, db_rx) = flume::unbounded::<DbEvent>();
		let (ev_tx, ev_rx) = flume::unbounded();
		let cache: DdocCache<TestKey> =
			DdocCache::builder(config(10, 60_000)).events(ev_tx).event_source(db_rx).start();

		drop(db_tx);
		assert!(wait_for(&ev_rx, SHORT, |e| e == &CacheEvent::EvictorDied));

		cache.shutdown().await.unwrap();
	});
}
