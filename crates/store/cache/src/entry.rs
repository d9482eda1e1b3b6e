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

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::{now_millis, BindingKey, Error};

/// Where an entry stands in its life cycle.
///
/// Decached is absorbing: a key must get a fresh entry to be cached
/// again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// A fetch for read access is in flight.
    FetchingRead,
    /// A fetch for write access is in flight.
    FetchingWrite,
    /// Cached with read access.
    CachedRead,
    /// Cached with write access.
    CachedWrite,
    /// A write-back is in flight ahead of eviction.
    Writing,
    /// Evicted. Terminal.
    Decached,
}

/// Whether a name referenced by a range claim is known bound or unbound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindState {
    Bound,
    Unbound,
}

#[derive(Debug)]
pub(crate) struct EntryInner {
    pub(crate) state: EntryState,
    /// `None` while a fetch is in flight; the reserved removed value
    /// only in the decached state.
    pub(crate) value: Option<i64>,
    /// The transaction whose activity last touched the entry.
    pub(crate) context_id: u64,
    /// Lowest key such that every name strictly between it and this
    /// entry's key is known unbound.
    pub(crate) previous_key: Option<BindingKey>,
    /// Whether the previous key itself is known unbound.
    pub(crate) previous_key_unbound: bool,
    /// An operation concerning the immediately preceding entry is in
    /// flight; neighbor-dependent operations must wait.
    pub(crate) pending_previous: bool,
}

/// One cached binding, with its own monitor.
///
/// The monitor (`inner` plus the `changed` condition) protects every
/// mutable field. Waits against it carry a deadline and surface
/// [`Error::Timeout`] rather than blocking forever.
#[derive(Debug)]
pub struct BindingEntry {
    pub(crate) key: BindingKey,
    pub(crate) inner: Mutex<EntryInner>,
    pub(crate) changed: Condvar,
}

impl BindingEntry {
    pub(crate) fn new(
        key: BindingKey,
        state: EntryState,
        value: Option<i64>,
        context_id: u64,
    ) -> Self {
        BindingEntry {
            key,
            inner: Mutex::new(EntryInner {
                state,
                value,
                context_id,
                previous_key: None,
                previous_key_unbound: false,
                pending_previous: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn key(&self) -> &BindingKey {
        &self.key
    }

    pub fn state(&self) -> EntryState {
        self.inner.lock().state
    }

    pub fn value(&self) -> Option<i64> {
        self.inner.lock().value
    }

    pub fn context_id(&self) -> u64 {
        self.inner.lock().context_id
    }

    /// The current range claim: `(previous_key, previous_key_unbound)`.
    pub fn previous_key(&self) -> Option<(BindingKey, bool)> {
        let inner = self.inner.lock();
        inner
            .previous_key
            .clone()
            .map(|p| (p, inner.previous_key_unbound))
    }

    pub fn pending_previous(&self) -> bool {
        self.inner.lock().pending_previous
    }

    /// Whether `q` is known to be unbound from this entry's range claim:
    /// `q` lies strictly below this entry's key and strictly above the
    /// previous key, or equals a previous key that is itself known
    /// unbound.
    pub fn known_unbound(&self, q: &BindingKey) -> bool {
        let inner = self.inner.lock();
        known_unbound_locked(&inner, &self.key, q)
    }

    /// Replaces the range claim outright, first waiting out any
    /// operation holding the pending-previous interlock.
    pub fn set_previous_key(
        &self,
        previous_key: BindingKey,
        previous_key_unbound: bool,
        deadline: u64,
    ) -> Result<(), Error> {
        assert!(
            previous_key < self.key,
            "previous key {previous_key} must sort below entry key {}",
            self.key
        );
        let mut inner = self.inner.lock();
        self.await_pending_clear(&mut inner, deadline)?;
        inner.previous_key = Some(previous_key);
        inner.previous_key_unbound = previous_key_unbound;
        self.changed.notify_all();
        Ok(())
    }

    /// Merges a new claim about `claimed` into the entry's range
    /// information and reports whether anything changed:
    ///
    /// - with no existing claim, any `claimed` below this key is
    ///   accepted;
    /// - a lower `claimed` widens the interval and replaces the claim;
    /// - an equal `claimed` can only add the knowledge that the previous
    ///   key itself is unbound;
    /// - a known-*bound* name tightens the unbound interval from the
    ///   left.
    ///
    /// Idempotent when replayed with identical arguments. Callers hold
    /// the pending-previous interlock when the claim concerns an
    /// interval under mutation, so this does not wait.
    pub fn update_previous_key(&self, claimed: BindingKey, bind_state: BindState) -> bool {
        if claimed >= self.key {
            return false;
        }
        let claimed_unbound = bind_state == BindState::Unbound;
        let mut inner = self.inner.lock();
        let changed = match inner.previous_key.clone() {
            None => {
                inner.previous_key = Some(claimed);
                inner.previous_key_unbound = claimed_unbound;
                true
            }
            Some(previous) => {
                if claimed < previous {
                    inner.previous_key = Some(claimed);
                    inner.previous_key_unbound = claimed_unbound;
                    true
                } else if claimed == previous && !inner.previous_key_unbound && claimed_unbound {
                    inner.previous_key_unbound = true;
                    true
                } else if !claimed_unbound
                    && (claimed != previous || inner.previous_key_unbound)
                {
                    inner.previous_key = Some(claimed);
                    inner.previous_key_unbound = false;
                    true
                } else {
                    false
                }
            }
        };
        if changed {
            trace!(
                target: "bindcache",
                "entry {} previous key now {:?} (unbound: {})",
                self.key,
                inner.previous_key,
                inner.previous_key_unbound
            );
            self.changed.notify_all();
        }
        changed
    }

    /// Updates the cached value of a write-cached entry.
    pub fn set_value(&self, value: i64) {
        assert!(value >= 0, "binding values are non-negative object ids");
        let mut inner = self.inner.lock();
        assert!(
            inner.state == EntryState::CachedWrite,
            "entry {} must be cached for write to take a new value, not {:?}",
            self.key,
            inner.state
        );
        inner.value = Some(value);
    }

    /// Claims the pending-previous interlock. The flag must not already
    /// be set; operations serialize on it through
    /// [`BindingCache::begin_previous_update`](crate::BindingCache::begin_previous_update).
    pub(crate) fn set_pending_previous(&self) {
        let mut inner = self.inner.lock();
        assert!(
            !inner.pending_previous,
            "entry {} already has a pending previous-entry operation",
            self.key
        );
        inner.pending_previous = true;
    }

    pub(crate) fn clear_pending_previous(&self) {
        let mut inner = self.inner.lock();
        assert!(
            inner.pending_previous,
            "entry {} has no pending previous-entry operation to clear",
            self.key
        );
        inner.pending_previous = false;
        self.changed.notify_all();
    }

    /// Waits until no operation holds the pending-previous interlock,
    /// up to `deadline` (milliseconds since the epoch).
    pub(crate) fn await_pending_clear(
        &self,
        inner: &mut MutexGuard<EntryInner>,
        deadline: u64,
    ) -> Result<(), Error> {
        while inner.pending_previous {
            let now = now_millis();
            if now >= deadline {
                debug!(target: "bindcache", "timed out waiting on pending previous of {}", self.key);
                return Err(Error::Timeout);
            }
            self.changed
                .wait_for(inner, Duration::from_millis(deadline - now));
        }
        Ok(())
    }

    /// Moves the entry to `to`, enforcing the legal transitions.
    pub(crate) fn transition_locked(&self, inner: &mut EntryInner, to: EntryState) {
        use EntryState::*;
        let legal = matches!(
            (inner.state, to),
            (FetchingRead, CachedRead)
                | (FetchingRead, FetchingWrite)
                | (FetchingWrite, CachedWrite)
                | (CachedRead, CachedWrite)
                | (CachedWrite, Writing)
                | (CachedRead, Decached)
                | (CachedWrite, Decached)
                | (Writing, Decached)
                | (FetchingRead, Decached)
                | (FetchingWrite, Decached)
        );
        assert!(
            legal,
            "entry {} cannot move from {:?} to {:?}",
            self.key, inner.state, to
        );
        trace!(target: "bindcache", "entry {} {:?} -> {:?}", self.key, inner.state, to);
        inner.state = to;
        self.changed.notify_all();
    }
}

/// Releases the pending-previous interlock on drop, waking waiters even
/// when the holding operation bails out early.
pub struct PendingPreviousGuard {
    entry: Arc<BindingEntry>,
}

impl PendingPreviousGuard {
    pub(crate) fn new(entry: Arc<BindingEntry>) -> Self {
        PendingPreviousGuard { entry }
    }

    /// The later entry whose neighbor relationship is being changed.
    pub fn entry(&self) -> &Arc<BindingEntry> {
        &self.entry
    }
}

impl Drop for PendingPreviousGuard {
    fn drop(&mut self) {
        self.entry.clear_pending_previous();
    }
}

pub(crate) fn known_unbound_locked(inner: &EntryInner, key: &BindingKey, q: &BindingKey) -> bool {
    match &inner.previous_key {
        None => false,
        Some(previous) => {
            q < key && (previous < q || (previous == q && inner.previous_key_unbound))
        }
    }
}
