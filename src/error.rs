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

use std::sync::Arc;

use thiserror::Error;

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Design-Document Cache Error Enum
///
/// Cloneable on purpose: a single recovery failure is fanned out verbatim to
/// every waiter enlisted on the entry that produced it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
	/// The user-supplied recovery for a key failed.
	#[error("{0}")]
	Recover(Arc<dyn std::error::Error + Send + Sync + 'static>),

	/// The recovery task panicked instead of returning.
	#[error("design document recovery panicked")]
	RecoverPanic,

	/// No entry can be admitted: the size limit is zero, or every resident
	/// entry is still warming up and nothing can be evicted.
	#[error("cache is full")]
	Full,

	// actor and channel error
	#[error("trying to send to disconnected actor")]
	Disconnected,
	#[error("sending on a disconnected channel")]
	Channel,
}

impl CacheError {
	/// Wrap a foreign error as a recovery failure.
	pub fn recover<E>(err: E) -> Self
	where
		E: std::error::Error + Send + Sync + 'static,
	{
		CacheError::Recover(Arc::new(err))
	}
}

impl From<xtra::Disconnected> for CacheError {
	fn from(_: xtra::Disconnected) -> Self {
		Self::Disconnected
	}
}

impl<T> From<flume::SendError<T>> for CacheError {
	fn from(_: flume::SendError<T>) -> Self {
		Self::Channel
	}
}
