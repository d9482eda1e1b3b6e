// Copyright 2020-2026 Simserve developers.
// This file is part of Simserve.

// Simserve is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Simserve is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Simserve.  If not, see <http://www.gnu.org/licenses/>.

//! General-purpose reader/writer locks keyed by arbitrary values.
//!
//! The lock table is sharded by key hash; each shard and each [`Locker`]
//! has its own monitor and there is no global lock. Requests that cannot
//! be granted immediately join a waiter queue ordered by the requesting
//! operation's start time, so locks tied to older operations jump ahead
//! of newer arrivals. Blocked attempts are checked for cycles in the
//! waits-for graph and a victim is told to abort rather than letting the
//! deadlock stand until a timeout fires.
//!
//! Monitor discipline, preserved by every code path in this crate:
//!
//! 1. A thread holds at most one locker monitor and one shard monitor at
//!    a time.
//! 2. When both are held, the locker monitor is acquired first.
//! 3. `Lock` values are only mutated under their shard's monitor.
//! 4. No call made while a shard monitor is held acquires another shard
//!    monitor or a locker monitor.
//!
//! Debug builds assert these rules on every acquisition.

#[macro_use]
extern crate log;

use std::fmt::Debug;
use std::hash::Hash;
use std::time::{SystemTime, UNIX_EPOCH};

mod lock;
mod locker;
mod manager;
pub(crate) mod order;

pub use lock::LockRequest;
pub use locker::{ConflictKind, LockConflict, Locker};
pub use manager::LockManager;

/// Keys a lock table can be indexed by.
pub trait LockKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> LockKey for T {}

/// Sorts after every real timestamp: a request made "right now" defers to
/// all requests carrying the start time of an older operation.
pub const NO_TIMESTAMP: u64 = u64::MAX;

/// Computes `now + timeout` in milliseconds, saturating instead of
/// wrapping. A saturated deadline means "never time out".
pub fn deadline_after(now: u64, timeout: u64) -> u64 {
    now.saturating_add(timeout)
}

/// Milliseconds since the Unix epoch, the clock all lock deadlines and
/// request start times are measured against.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
