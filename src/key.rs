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

use std::{fmt::Debug, hash::Hash};

use crate::error::Result;

/// Per-variant capability the cache resolves keys through.
///
/// A key is an opaque tagged value; users typically implement this on an enum
/// whose variants distinguish the kinds of cached lookup (a full design
/// document, a compiled view, ...). Two keys are equal iff tag and argument
/// are equal, which the derived `Eq`/`Hash` of such an enum already provides.
///
/// `Ord` is required because keys participate in the eviction order as
/// tie-breakers; `PartialEq` on the value lets the cache tell a refresh that
/// changed nothing from one that produced a new version.
#[async_trait::async_trait]
pub trait CacheKey: Clone + Eq + Ord + Hash + Debug + Send + Sync + 'static {
	type Value: Clone + PartialEq + Debug + Send + Sync + 'static;

	/// Logical database this key belongs to.
	fn dbname(&self) -> &str;

	/// Design document identifier, if the variant knows one at publish time.
	/// `None` keys are matched by every database-wide refresh.
	fn ddocid(&self) -> Option<&str>;

	/// Produce the value. Expensive; the cache guarantees at most one
	/// concurrent invocation per live entry, no matter how many readers ask.
	async fn recover(&self) -> Result<Self::Value>;
}
