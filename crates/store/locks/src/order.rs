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

//! Per-thread bookkeeping that asserts the crate's monitor discipline.
//!
//! Each acquisition site obtains a token before locking the monitor; the
//! token records what the thread held at that point and restores it when
//! dropped. Violations of the acquisition rules panic in debug builds and
//! cost nothing in release builds.

use std::cell::Cell;

#[derive(Clone, Copy, Default)]
struct Held {
    locker: Option<u64>,
    shard: Option<usize>,
}

thread_local! {
    static HELD: Cell<Held> = const { Cell::new(Held { locker: None, shard: None }) };
}

/// Token for a held locker monitor. Must be created before the monitor is
/// locked and dropped after its guard.
pub(crate) struct LockerHold {
    prev: Held,
}

/// Token for a held shard monitor.
pub(crate) struct ShardHold {
    prev: Held,
}

pub(crate) fn locker_acquired(id: u64) -> LockerHold {
    HELD.with(|held| {
        let cur = held.get();
        debug_assert!(
            cur.shard.is_none(),
            "locker monitor {} acquired while holding shard monitor {:?}",
            id,
            cur.shard
        );
        debug_assert!(
            cur.locker.is_none(),
            "locker monitor {} acquired while holding locker monitor {:?}",
            id,
            cur.locker
        );
        held.set(Held {
            locker: Some(id),
            ..cur
        });
        LockerHold { prev: cur }
    })
}

pub(crate) fn shard_acquired(index: usize) -> ShardHold {
    HELD.with(|held| {
        let cur = held.get();
        debug_assert!(
            cur.shard.is_none(),
            "shard monitor {} acquired while holding shard monitor {:?}",
            index,
            cur.shard
        );
        held.set(Held {
            shard: Some(index),
            ..cur
        });
        ShardHold { prev: cur }
    })
}

impl Drop for LockerHold {
    fn drop(&mut self) {
        HELD.with(|held| held.set(self.prev));
    }
}

impl Drop for ShardHold {
    fn drop(&mut self) {
        HELD.with(|held| held.set(self.prev));
    }
}
