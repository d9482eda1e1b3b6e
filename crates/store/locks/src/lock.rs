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

use std::sync::Arc;

use crate::locker::Locker;
use crate::LockKey;

/// One locker's interest in a lock, either as an owner or as a waiter.
#[derive(Clone)]
pub struct LockRequest<K: LockKey> {
    pub(crate) locker: Arc<Locker<K>>,
    pub(crate) for_write: bool,
    /// Set when the locker already owns read access and is queued to
    /// convert it to write access.
    pub(crate) upgrade: bool,
    pub(crate) requested_start: u64,
}

impl<K: LockKey> LockRequest<K> {
    pub fn locker_id(&self) -> u64 {
        self.locker.id()
    }

    pub fn for_write(&self) -> bool {
        self.for_write
    }

    pub fn requested_start(&self) -> u64 {
        self.requested_start
    }
}

/// Outcome of a grant attempt, decided under the shard monitor.
pub(crate) enum Attempt {
    Granted,
    /// Queued behind the first incompatible owner.
    Waiting { conflicting: u64 },
}

/// The owner list and waiter queue for one key.
///
/// Lock values are mutated only under the owning shard's monitor; they
/// have no synchronization of their own. Invariants: owners are mutually
/// compatible (all readers, or a single writer) and no waiter is
/// compatible with the full owner set.
pub(crate) struct Lock<K: LockKey> {
    owners: Vec<LockRequest<K>>,
    waiters: Vec<LockRequest<K>>,
}

impl<K: LockKey> Lock<K> {
    pub(crate) fn new() -> Self {
        Lock {
            owners: Vec::new(),
            waiters: Vec::new(),
        }
    }

    fn owner_position(&self, locker: &Arc<Locker<K>>) -> Option<usize> {
        self.owners
            .iter()
            .position(|o| Arc::ptr_eq(&o.locker, locker))
    }

    /// Attempts to grant `locker` the requested access, queueing it as a
    /// waiter otherwise. An owner re-requesting access it already has is
    /// granted immediately; a sole reader requesting write access is
    /// upgraded in place.
    pub(crate) fn attempt(
        &mut self,
        locker: &Arc<Locker<K>>,
        for_write: bool,
        requested_start: u64,
    ) -> Attempt {
        if let Some(pos) = self.owner_position(locker) {
            if self.owners[pos].for_write || !for_write {
                return Attempt::Granted;
            }
            if self.owners.len() == 1 {
                self.owners[pos].for_write = true;
                return Attempt::Granted;
            }
            let conflicting = self
                .owners
                .iter()
                .find(|o| !Arc::ptr_eq(&o.locker, locker))
                .map(|o| o.locker.id())
                .expect("more than one owner implies another locker");
            self.insert_waiter(LockRequest {
                locker: locker.clone(),
                for_write: true,
                upgrade: true,
                requested_start,
            });
            return Attempt::Waiting { conflicting };
        }

        let compatible =
            self.owners.is_empty() || (!for_write && self.owners.iter().all(|o| !o.for_write));
        if compatible {
            self.owners.push(LockRequest {
                locker: locker.clone(),
                for_write,
                upgrade: false,
                requested_start,
            });
            return Attempt::Granted;
        }

        let conflicting = if for_write {
            self.owners[0].locker.id()
        } else {
            self.owners
                .iter()
                .find(|o| o.for_write)
                .map(|o| o.locker.id())
                .expect("incompatible read request implies a write owner")
        };
        self.insert_waiter(LockRequest {
            locker: locker.clone(),
            for_write,
            upgrade: false,
            requested_start,
        });
        Attempt::Waiting { conflicting }
    }

    /// Queue position is by ascending requested start time; requests with
    /// no timestamp sort after all timestamped ones, and equal timestamps
    /// keep arrival order.
    fn insert_waiter(&mut self, request: LockRequest<K>) {
        let pos = self
            .waiters
            .iter()
            .position(|w| w.requested_start > request.requested_start)
            .unwrap_or(self.waiters.len());
        self.waiters.insert(pos, request);
    }

    /// Whether `locker` currently owns the lock with at least the
    /// requested access.
    pub(crate) fn owned_by(&self, locker: &Arc<Locker<K>>, for_write: bool) -> bool {
        self.owners
            .iter()
            .any(|o| Arc::ptr_eq(&o.locker, locker) && (o.for_write || !for_write))
    }

    /// Releases (or downgrades to read) `locker`'s ownership and promotes
    /// the longest compatible prefix of waiters. Returns the lockers to
    /// notify once the shard monitor has been dropped.
    pub(crate) fn release(
        &mut self,
        locker: &Arc<Locker<K>>,
        downgrade: bool,
    ) -> Vec<Arc<Locker<K>>> {
        let pos = match self.owner_position(locker) {
            Some(pos) => pos,
            None => return Vec::new(),
        };
        if downgrade {
            if !self.owners[pos].for_write {
                return Vec::new();
            }
            self.owners[pos].for_write = false;
        } else {
            self.owners.remove(pos);
        }
        self.promote()
    }

    /// Removes `locker` from the waiter queue, promoting anything its
    /// departure unblocked.
    pub(crate) fn flush_waiter(&mut self, locker: &Arc<Locker<K>>) -> Vec<Arc<Locker<K>>> {
        let before = self.waiters.len();
        self.waiters.retain(|w| !Arc::ptr_eq(&w.locker, locker));
        if self.waiters.len() == before {
            return Vec::new();
        }
        self.promote()
    }

    fn promote(&mut self) -> Vec<Arc<Locker<K>>> {
        let mut granted = Vec::new();
        while let Some(waiter) = self.waiters.first() {
            let compatible = if waiter.upgrade {
                self.owners.len() == 1 && Arc::ptr_eq(&self.owners[0].locker, &waiter.locker)
            } else if waiter.for_write {
                self.owners.is_empty()
            } else {
                self.owners.iter().all(|o| !o.for_write)
            };
            if !compatible {
                break;
            }
            let waiter = self.waiters.remove(0);
            let locker = waiter.locker.clone();
            if waiter.upgrade {
                self.owners[0].for_write = true;
            } else {
                self.owners.push(waiter);
            }
            granted.push(locker);
        }
        granted
    }

    pub(crate) fn is_unused(&self) -> bool {
        self.owners.is_empty() && self.waiters.is_empty()
    }

    pub(crate) fn owners_snapshot(&self) -> Vec<LockRequest<K>> {
        self.owners.clone()
    }

    pub(crate) fn waiters_snapshot(&self) -> Vec<LockRequest<K>> {
        self.waiters.clone()
    }

    pub(crate) fn owner_lockers(&self) -> Vec<Arc<Locker<K>>> {
        self.owners.iter().map(|o| o.locker.clone()).collect()
    }
}
