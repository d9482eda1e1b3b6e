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

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use parking_lot::{Condvar, Mutex};

use crate::{deadline_after, order, LockKey};

static NEXT_LOCKER_ID: AtomicU64 = AtomicU64::new(1);

/// Why a lock attempt did not produce a grant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    /// The lock was unavailable and the caller asked not to wait. The
    /// request stays queued; complete it with `wait_for_lock`.
    Blocked,
    /// The wait reached the locker's deadline.
    Timeout,
    /// The locker was picked as the victim of a waits-for cycle. This
    /// conflict is permanent; the locker must be discarded.
    Deadlock,
    /// The wait was cancelled by [`Locker::interrupt`].
    Interrupted,
}

/// Describes a denied lock attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockConflict<K: LockKey> {
    /// What kind of denial occurred.
    pub kind: ConflictKind,
    /// The key the attempt was for.
    pub key: K,
    /// The id of a locker on the other side of the conflict, when one is
    /// known: the first incompatible owner for `Blocked`, another member
    /// of the cycle for `Deadlock`.
    pub conflicting_locker: Option<u64>,
}

/// A lock attempt that has been queued but not yet granted.
#[derive(Clone, Debug)]
pub(crate) struct PendingAttempt<K: LockKey> {
    pub(crate) key: K,
    pub(crate) for_write: bool,
    pub(crate) requested_start: u64,
}

pub(crate) struct LockerState<K: LockKey> {
    pub(crate) conflict: Option<LockConflict<K>>,
    pub(crate) waiting_for: Option<PendingAttempt<K>>,
}

/// A transaction-scoped entity that owns and waits for locks.
///
/// A locker may have at most one lock attempt in flight. Its monitor
/// protects the `conflict` and `waiting_for` slots and is the condition
/// the locker's thread parks on while blocked.
pub struct Locker<K: LockKey> {
    id: u64,
    timeout_override: Option<u64>,
    pub(crate) state: Mutex<LockerState<K>>,
    pub(crate) cond: Condvar,
}

impl<K: LockKey> Locker<K> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A locker whose waits use `timeout` milliseconds instead of the
    /// manager's default.
    pub fn with_timeout(timeout: u64) -> Self {
        Self::build(Some(timeout))
    }

    fn build(timeout_override: Option<u64>) -> Self {
        Locker {
            id: NEXT_LOCKER_ID.fetch_add(1, AtomicOrdering::SeqCst),
            timeout_override,
            state: Mutex::new(LockerState {
                conflict: None,
                waiting_for: None,
            }),
            cond: Condvar::new(),
        }
    }

    /// Process-unique id, used for logging and deadlock victim tie-breaks.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The moment a wait started at `now` should give up.
    pub fn lock_timeout_time(&self, now: u64, default_timeout: u64) -> u64 {
        deadline_after(now, self.timeout_override.unwrap_or(default_timeout))
    }

    /// Snapshot of the locker's current conflict, if any.
    pub fn conflict(&self) -> Option<LockConflict<K>> {
        let _hold = order::locker_acquired(self.id);
        self.state.lock().conflict.clone()
    }

    /// Cooperatively cancels a wait in progress. The blocked thread
    /// returns an `Interrupted` conflict from its lock or wait call.
    /// Has no effect if the locker is not waiting or already has a
    /// conflict recorded.
    pub fn interrupt(&self) {
        let _hold = order::locker_acquired(self.id);
        let mut state = self.state.lock();
        if state.conflict.is_none() {
            if let Some(attempt) = &state.waiting_for {
                trace!(target: "locks", "interrupting locker {} waiting for {:?}", self.id, attempt.key);
                state.conflict = Some(LockConflict {
                    kind: ConflictKind::Interrupted,
                    key: attempt.key.clone(),
                    conflicting_locker: None,
                });
                self.cond.notify_all();
            }
        }
    }
}

impl<K: LockKey> Default for Locker<K> {
    fn default() -> Self {
        Self::new()
    }
}
