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

//! Per-node in-memory cache of name→object bindings.
//!
//! Besides positive entries, the cache carries *negative range*
//! information: each entry can record the greatest lower key below which
//! every name up to the entry's own key is known to be unbound. A "does
//! this name exist?" query can then be answered locally even for names
//! that were never cached, as long as a cached neighbor's range brackets
//! them.
//!
//! Entries step through a small state machine (fetching, cached for read
//! or write, writing back, decached) guarded by a per-entry monitor.
//! Operations that change the relationship between neighboring entries
//! hold a pending-previous interlock on the later entry, so that range
//! claims are never read or written while the interval they describe is
//! in flux.
//!
//! [`BindingStore`] ties the cache to the keyed lock manager and the
//! reliable request queue: reads fetch through a [`BindingAuthority`]
//! under a per-name lock, and write-backs and removals travel to the
//! server over the queue.

#[macro_use]
extern crate log;

use std::time::{SystemTime, UNIX_EPOCH};

mod cache;
mod entry;
mod error;
mod key;
mod store;

pub use cache::{BindingCache, CacheConfig, GetResult};
pub use entry::{BindState, BindingEntry, EntryState, PendingPreviousGuard};
pub use error::Error;
pub use key::BindingKey;
pub use store::{
    decode_write_request, BindingAuthority, BindingStore, FetchReply, GetOutcome, TxnContext,
    WriteOp,
};

/// Value marking an entry whose binding has been removed; only ever seen
/// in the decached state.
pub const REMOVED_VALUE: i64 = -1;

/// Reserved value of the upper sentinel entry; never considered bound.
pub const LAST_VALUE: i64 = -2;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
