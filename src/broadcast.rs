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

//! Cluster fan-out seam. Locally originated evictions and refreshes are
//! re-broadcast to every node, the local one included so one code path
//! handles both, and each node applies them through its directive channel.

use crate::error::Result;

/// A maintenance instruction applied by every node's cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
	/// Drop every cached entry of the database.
	Evict { dbname: String },
	/// Re-run recovery for the listed design documents of the database.
	/// Keys with an unknown identifier are always included.
	Refresh { dbname: String, ddoc_ids: Vec<String> },
}

/// Delivers a directive to the cache of every cluster node. Implementations
/// must have dispatched to the local node by the time `broadcast` returns;
/// remote delivery is best-effort.
pub trait Broadcaster: Send + Sync + 'static {
	fn broadcast(&self, directive: Directive) -> Result<()>;
}

/// Single-node broadcaster: the local directive channel is the only peer.
pub struct LocalBroadcaster {
	local: flume::Sender<Directive>,
}

impl LocalBroadcaster {
	pub(crate) fn new(local: flume::Sender<Directive>) -> Self {
		Self { local }
	}
}

impl Broadcaster for LocalBroadcaster {
	fn broadcast(&self, directive: Directive) -> Result<()> {
		self.local.send(directive)?;
		Ok(())
	}
}
