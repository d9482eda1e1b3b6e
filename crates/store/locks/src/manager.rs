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

use std::{
    collections::{hash_map::DefaultHasher, HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;

use crate::lock::{Attempt, Lock, LockRequest};
use crate::locker::{ConflictKind, LockConflict, Locker, PendingAttempt};
use crate::{now_millis, order, LockKey};

/// The sharded lock table.
///
/// Locks are materialized lazily on first request and dropped once their
/// owner and waiter lists both drain. All timing is in milliseconds.
pub struct LockManager<K: LockKey> {
    lock_timeout: u64,
    key_maps: Vec<Mutex<HashMap<K, Lock<K>>>>,
}

struct PathNode<K: LockKey> {
    locker: Arc<Locker<K>>,
    attempt: PendingAttempt<K>,
}

impl<K: LockKey> LockManager<K> {
    /// Creates a manager whose waits give up after `lock_timeout`
    /// milliseconds, with the table split across `num_key_maps` shards.
    ///
    /// Panics if either argument is zero.
    pub fn new(lock_timeout: u64, num_key_maps: usize) -> Self {
        assert!(lock_timeout > 0, "lock timeout must be greater than zero");
        assert!(
            num_key_maps > 0,
            "number of key maps must be greater than zero"
        );
        debug!(target: "locks", "creating lock manager: timeout {lock_timeout} ms, {num_key_maps} shards");
        LockManager {
            lock_timeout,
            key_maps: (0..num_key_maps)
                .map(|_| Mutex::new(HashMap::new()))
                .collect(),
        }
    }

    /// A manager with one shard per CPU.
    pub fn with_default_shards(lock_timeout: u64) -> Self {
        Self::new(lock_timeout, ::num_cpus::get().max(1))
    }

    pub fn lock_timeout(&self) -> u64 {
        self.lock_timeout
    }

    fn map_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.key_maps.len()
    }

    /// Acquires `key` for `locker`, waiting up to the locker's deadline.
    /// Returns `None` on grant, otherwise the conflict that ended the
    /// attempt.
    ///
    /// Panics if the locker has been marked for deadlock abort or already
    /// has an attempt in flight.
    pub fn lock(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start: u64,
    ) -> Option<LockConflict<K>> {
        match self.attempt_lock(locker, key, for_write, requested_start) {
            None => None,
            Some(_) => self.wait_for_lock_internal(locker),
        }
    }

    /// Like [`lock`](Self::lock) but never blocks: an unavailable lock
    /// yields a `Blocked` conflict and leaves the request queued, to be
    /// completed by [`wait_for_lock`](Self::wait_for_lock).
    pub fn lock_no_wait(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start: u64,
    ) -> Option<LockConflict<K>> {
        match self.attempt_lock(locker, key, for_write, requested_start) {
            None => None,
            Some(blocked) => {
                // a cycle found by the attempt's own check may have picked
                // this locker as the victim; surface that instead
                if self.deadlock_marked(locker) {
                    self.wait_for_lock_internal(locker)
                } else {
                    Some(blocked)
                }
            }
        }
    }

    /// Completes a queued attempt begun by a `Blocked` result from
    /// [`lock_no_wait`](Self::lock_no_wait).
    ///
    /// Panics if the locker has no attempt in flight.
    pub fn wait_for_lock(&self, locker: &Arc<Locker<K>>) -> Option<LockConflict<K>> {
        self.wait_for_lock_internal(locker)
    }

    /// Releases `locker`'s ownership of `key`, promoting newly
    /// compatible waiters.
    pub fn release_lock(&self, locker: &Arc<Locker<K>>, key: &K) {
        self.release_internal(locker, key, false);
    }

    /// Converts write ownership of `key` back to read ownership,
    /// promoting newly compatible waiters. Used by the store once a
    /// write-back no longer needs exclusion.
    pub fn downgrade(&self, locker: &Arc<Locker<K>>, key: &K) {
        self.release_internal(locker, key, true);
    }

    /// Snapshot of the current owners of `key`.
    pub fn get_owners(&self, key: &K) -> Vec<LockRequest<K>> {
        let index = self.map_index(key);
        let _hold = order::shard_acquired(index);
        let map = self.key_maps[index].lock();
        map.get(key).map(Lock::owners_snapshot).unwrap_or_default()
    }

    /// Snapshot of the current waiters for `key`, in queue order.
    pub fn get_waiters(&self, key: &K) -> Vec<LockRequest<K>> {
        let index = self.map_index(key);
        let _hold = order::shard_acquired(index);
        let map = self.key_maps[index].lock();
        map.get(key)
            .map(Lock::waiters_snapshot)
            .unwrap_or_default()
    }

    /// Runs the grant algorithm, queueing the request when it cannot be
    /// granted. Returns `None` on grant, `Some(Blocked)` when queued.
    fn attempt_lock(
        &self,
        locker: &Arc<Locker<K>>,
        key: K,
        for_write: bool,
        requested_start: u64,
    ) -> Option<LockConflict<K>> {
        let blocked = {
            let _hold = order::locker_acquired(locker.id());
            let mut state = locker.state.lock();
            if let Some(conflict) = &state.conflict {
                if conflict.kind == ConflictKind::Deadlock {
                    panic!(
                        "locker {} must abort: it was chosen as a deadlock victim",
                        locker.id()
                    );
                }
                // a Timeout or Interrupted conflict from a completed
                // attempt is cleared by the next attempt
                state.conflict = None;
            }
            assert!(
                state.waiting_for.is_none(),
                "locker {} already has a lock attempt in flight",
                locker.id()
            );

            let attempt = {
                let index = self.map_index(&key);
                let _shard = order::shard_acquired(index);
                let mut map = self.key_maps[index].lock();
                map.entry(key.clone())
                    .or_insert_with(Lock::new)
                    .attempt(locker, for_write, requested_start)
            };
            match attempt {
                Attempt::Granted => {
                    trace!(target: "locks", "locker {} granted {:?} for_write={}", locker.id(), key, for_write);
                    None
                }
                Attempt::Waiting { conflicting } => {
                    trace!(target: "locks", "locker {} blocked on {:?} by locker {}", locker.id(), key, conflicting);
                    state.waiting_for = Some(PendingAttempt {
                        key: key.clone(),
                        for_write,
                        requested_start,
                    });
                    Some(LockConflict {
                        kind: ConflictKind::Blocked,
                        key,
                        conflicting_locker: Some(conflicting),
                    })
                }
            }
        };
        if blocked.is_some() {
            self.check_deadlock(locker);
        }
        blocked
    }

    fn deadlock_marked(&self, locker: &Arc<Locker<K>>) -> bool {
        let _hold = order::locker_acquired(locker.id());
        let state = locker.state.lock();
        matches!(
            &state.conflict,
            Some(c) if c.kind == ConflictKind::Deadlock
        )
    }

    /// The wait loop. Parks on the locker's monitor until the request is
    /// granted, the deadline passes, or a conflict is recorded by the
    /// deadlock checker or an interrupt.
    fn wait_for_lock_internal(&self, locker: &Arc<Locker<K>>) -> Option<LockConflict<K>> {
        let _hold = order::locker_acquired(locker.id());
        let mut state = locker.state.lock();
        let attempt = match &state.waiting_for {
            Some(attempt) => attempt.clone(),
            None => panic!("locker {} has no lock attempt to wait for", locker.id()),
        };
        let stop = locker.lock_timeout_time(now_millis(), self.lock_timeout);
        let conflict = loop {
            if let Some(conflict) = state.conflict.clone() {
                // deadlock marks are permanent; anything else is consumed
                if conflict.kind != ConflictKind::Deadlock {
                    state.conflict = None;
                }
                break conflict;
            }
            let now = now_millis();
            if now >= stop {
                // a promotion may have raced the deadline
                if self.granted_while_waiting(locker, &attempt) {
                    state.waiting_for = None;
                    return None;
                }
                break LockConflict {
                    kind: ConflictKind::Timeout,
                    key: attempt.key.clone(),
                    conflicting_locker: None,
                };
            }
            if self.granted_while_waiting(locker, &attempt) {
                state.waiting_for = None;
                return None;
            }
            locker
                .cond
                .wait_for(&mut state, Duration::from_millis(stop - now));
        };

        trace!(target: "locks", "locker {} wait for {:?} ended: {:?}", locker.id(), attempt.key, conflict.kind);
        let promoted = {
            let index = self.map_index(&attempt.key);
            let _shard = order::shard_acquired(index);
            let mut map = self.key_maps[index].lock();
            match map.get_mut(&attempt.key) {
                Some(lock) => {
                    let promoted = lock.flush_waiter(locker);
                    if lock.is_unused() {
                        map.remove(&attempt.key);
                    }
                    promoted
                }
                None => Vec::new(),
            }
        };
        state.waiting_for = None;
        drop(state);
        drop(_hold);
        self.notify_lockers(promoted);
        Some(conflict)
    }

    fn granted_while_waiting(&self, locker: &Arc<Locker<K>>, attempt: &PendingAttempt<K>) -> bool {
        let index = self.map_index(&attempt.key);
        let _shard = order::shard_acquired(index);
        let map = self.key_maps[index].lock();
        map.get(&attempt.key)
            .is_some_and(|lock| lock.owned_by(locker, attempt.for_write))
    }

    fn release_internal(&self, locker: &Arc<Locker<K>>, key: &K, downgrade: bool) {
        let promoted = {
            let index = self.map_index(key);
            let _shard = order::shard_acquired(index);
            let mut map = self.key_maps[index].lock();
            match map.get_mut(key) {
                Some(lock) => {
                    let promoted = lock.release(locker, downgrade);
                    if lock.is_unused() {
                        map.remove(key);
                    }
                    promoted
                }
                None => Vec::new(),
            }
        };
        self.notify_lockers(promoted);
    }

    /// Wakes promoted lockers. Called with no monitors held.
    fn notify_lockers(&self, promoted: Vec<Arc<Locker<K>>>) {
        for locker in promoted {
            let _hold = order::locker_acquired(locker.id());
            let _state = locker.state.lock();
            locker.cond.notify_all();
        }
    }

    /// Walks the waits-for graph from `start` looking for a cycle. When
    /// one is found, the youngest member by requested start time (ties
    /// broken by locker id) is marked with a permanent `Deadlock`
    /// conflict and woken.
    fn check_deadlock(&self, start: &Arc<Locker<K>>) {
        let mut path = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(start.id());
        if let Some(pos) = self.find_cycle(start, &mut path, &mut visited) {
            let cycle = &path[pos..];
            let victim = cycle
                .iter()
                .max_by(|a, b| {
                    a.attempt
                        .requested_start
                        .cmp(&b.attempt.requested_start)
                        .then(a.locker.id().cmp(&b.locker.id()))
                })
                .expect("a cycle has at least two members");
            let other = cycle
                .iter()
                .find(|n| n.locker.id() != victim.locker.id())
                .expect("a cycle has at least two members");
            debug!(
                target: "locks",
                "deadlock: cycle of {} lockers, victim {} waiting for {:?}",
                cycle.len(),
                victim.locker.id(),
                victim.attempt.key
            );
            let _hold = order::locker_acquired(victim.locker.id());
            let mut state = victim.locker.state.lock();
            // the cycle may have been broken by a grant since the walk
            if state.conflict.is_none() && state.waiting_for.is_some() {
                state.conflict = Some(LockConflict {
                    kind: ConflictKind::Deadlock,
                    key: victim.attempt.key.clone(),
                    conflicting_locker: Some(other.locker.id()),
                });
                victim.locker.cond.notify_all();
            }
        }
    }

    /// Depth-first search over "waiter → owner of the awaited lock"
    /// edges, snapshotting each monitor briefly and holding none across
    /// an edge. Returns the path index where a cycle closes.
    fn find_cycle(
        &self,
        cur: &Arc<Locker<K>>,
        path: &mut Vec<PathNode<K>>,
        visited: &mut HashSet<u64>,
    ) -> Option<usize> {
        let attempt = {
            let _hold = order::locker_acquired(cur.id());
            let state = cur.state.lock();
            match &state.waiting_for {
                Some(attempt) => attempt.clone(),
                None => return None,
            }
        };
        path.push(PathNode {
            locker: cur.clone(),
            attempt: attempt.clone(),
        });
        let owners = {
            let index = self.map_index(&attempt.key);
            let _shard = order::shard_acquired(index);
            let map = self.key_maps[index].lock();
            map.get(&attempt.key)
                .map(Lock::owner_lockers)
                .unwrap_or_default()
        };
        for owner in owners {
            if Arc::ptr_eq(&owner, cur) {
                // an upgrade request waits on other owners, not itself
                continue;
            }
            if let Some(pos) = path.iter().position(|n| n.locker.id() == owner.id()) {
                return Some(pos);
            }
            if !visited.insert(owner.id()) {
                continue;
            }
            if let Some(pos) = self.find_cycle(&owner, path, visited) {
                return Some(pos);
            }
        }
        path.pop();
        None
    }
}
