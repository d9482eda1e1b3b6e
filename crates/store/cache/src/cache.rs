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
    collections::BTreeMap,
    ops::Bound,
    sync::Arc,
    time::Duration,
};

use parking_lot::RwLock;
use simserve_locks::deadline_after;

use crate::entry::known_unbound_locked;
use crate::{
    now_millis, BindingEntry, BindingKey, EntryState, Error, PendingPreviousGuard, LAST_VALUE,
    REMOVED_VALUE,
};

/// Binding cache configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Milliseconds an operation may wait on an entry monitor before
    /// surfacing a timeout.
    pub lock_timeout: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig { lock_timeout: 2_000 }
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum GetResult {
    /// Cached in a state compatible with the requested access.
    Cached(Arc<BindingEntry>),
    /// Not cached, but a neighbor's range claim proves the name unbound;
    /// no server round-trip is needed.
    KnownUnbound,
    /// Cached for read when write access was requested; the caller must
    /// obtain write rights from the server.
    NeedsUpgrade(Arc<BindingEntry>),
    /// An in-flight operation already covers the key; wait for the entry
    /// to settle and retry.
    Blocked(Arc<BindingEntry>),
    /// Nothing cached and nothing known; the caller must fetch.
    Unknown,
}

/// The ordered index of cached bindings.
///
/// The index itself is a reader/writer-locked ordered map, which keeps
/// predecessor and successor lookups logarithmic; no wait ever happens
/// under the index lock. Per-entry monitors carry all blocking.
///
/// A cache always holds exactly one entry for the upper sentinel key,
/// created at construction; it anchors range claims for names above
/// every cached binding and is never evicted.
pub struct BindingCache {
    lock_timeout: u64,
    map: RwLock<BTreeMap<BindingKey, Arc<BindingEntry>>>,
}

impl BindingCache {
    pub fn new(config: CacheConfig) -> Self {
        assert!(
            config.lock_timeout > 0,
            "lock timeout must be greater than zero"
        );
        let mut map = BTreeMap::new();
        map.insert(
            BindingKey::Last,
            Arc::new(BindingEntry::new(
                BindingKey::Last,
                EntryState::CachedRead,
                Some(LAST_VALUE),
                0,
            )),
        );
        debug!(target: "bindcache", "creating binding cache, lock timeout {} ms", config.lock_timeout);
        BindingCache {
            lock_timeout: config.lock_timeout,
            map: RwLock::new(map),
        }
    }

    pub fn lock_timeout(&self) -> u64 {
        self.lock_timeout
    }

    /// Number of entries in the index, the sentinel included.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        // the sentinel is always present
        self.len() <= 1
    }

    /// Looks up `key` for the requested access, waiting out any
    /// pending-previous interlock that covers it.
    ///
    /// `context_id` marks the entry as recently used by that transaction
    /// when the lookup succeeds.
    pub fn get(
        &self,
        key: &BindingKey,
        for_write: bool,
        context_id: u64,
    ) -> Result<GetResult, Error> {
        assert!(!key.is_sentinel(), "bindings are looked up by name");
        let deadline = deadline_after(now_millis(), self.lock_timeout);
        loop {
            let exact = { self.map.read().get(key).cloned() };
            if let Some(entry) = exact {
                let mut inner = entry.inner.lock();
                if inner.pending_previous {
                    entry.await_pending_clear(&mut inner, deadline)?;
                    continue;
                }
                use EntryState::*;
                let result = match inner.state {
                    Decached => None,
                    FetchingRead | FetchingWrite => Some(GetResult::Blocked(entry.clone())),
                    Writing if for_write => Some(GetResult::Blocked(entry.clone())),
                    CachedRead if for_write => Some(GetResult::NeedsUpgrade(entry.clone())),
                    CachedRead | CachedWrite | Writing => {
                        inner.context_id = context_id;
                        Some(GetResult::Cached(entry.clone()))
                    }
                };
                if let Some(result) = result {
                    return Ok(result);
                }
                // decached: the key is effectively absent
            }
            // absent; the next entry's range claim may still answer
            let next = match self.next_entry(key) {
                Some(next) => next,
                None => return Ok(GetResult::Unknown),
            };
            let mut inner = next.inner.lock();
            if inner.state == EntryState::Decached {
                continue;
            }
            if inner.pending_previous {
                next.await_pending_clear(&mut inner, deadline)?;
                continue;
            }
            let unbound = known_unbound_locked(&inner, &next.key, key);
            return Ok(if unbound {
                GetResult::KnownUnbound
            } else {
                GetResult::Unknown
            });
        }
    }

    /// Creates the in-flight placeholder for a server fetch of `key`.
    /// Lookups of the key return [`GetResult::Blocked`] until the fetch
    /// [`install`](Self::install)s a value or is
    /// [`cancel_fetch`](Self::cancel_fetch)ed.
    pub fn begin_fetch(
        &self,
        key: BindingKey,
        for_write: bool,
        context_id: u64,
    ) -> Result<Arc<BindingEntry>, Error> {
        assert!(!key.is_sentinel(), "only named bindings are fetched");
        let mut map = self.map.write();
        if let Some(existing) = map.get(&key) {
            if existing.state() != EntryState::Decached {
                return Err(Error::InvalidState(format!(
                    "entry {key} is already cached or in flight"
                )));
            }
        }
        let state = if for_write {
            EntryState::FetchingWrite
        } else {
            EntryState::FetchingRead
        };
        let entry = Arc::new(BindingEntry::new(key.clone(), state, None, context_id));
        map.insert(key, entry.clone());
        Ok(entry)
    }

    /// Abandons an in-flight fetch, decaching the placeholder. Used when
    /// the fetch fails or reports the name unbound.
    pub fn cancel_fetch(&self, key: &BindingKey) -> Result<(), Error> {
        let mut map = self.map.write();
        let entry = map
            .get(key)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no fetch in flight for {key}")))?;
        let mut inner = entry.inner.lock();
        match inner.state {
            EntryState::FetchingRead | EntryState::FetchingWrite => {
                entry.transition_locked(&mut inner, EntryState::Decached);
                inner.value = Some(REMOVED_VALUE);
                drop(inner);
                map.remove(key);
                Ok(())
            }
            state => Err(Error::InvalidState(format!(
                "entry {key} is {state:?}, not in flight"
            ))),
        }
    }

    /// Creates or upgrades the entry for `key` with a value from the
    /// server (or from a local binding creation over a known-unbound
    /// name).
    pub fn install(
        &self,
        key: BindingKey,
        value: i64,
        for_write: bool,
        context_id: u64,
    ) -> Result<Arc<BindingEntry>, Error> {
        assert!(!key.is_sentinel(), "only named bindings can be installed");
        assert!(value >= 0, "binding values are non-negative object ids");
        let mut map = self.map.write();
        if let Some(existing) = map.get(&key).cloned() {
            let mut inner = existing.inner.lock();
            use EntryState::*;
            match inner.state {
                FetchingRead => {
                    if for_write {
                        existing.transition_locked(&mut inner, FetchingWrite);
                        existing.transition_locked(&mut inner, CachedWrite);
                    } else {
                        existing.transition_locked(&mut inner, CachedRead);
                    }
                }
                FetchingWrite => {
                    existing.transition_locked(&mut inner, CachedWrite);
                }
                CachedRead => {
                    if for_write {
                        existing.transition_locked(&mut inner, CachedWrite);
                    }
                }
                CachedWrite => {}
                Writing => {
                    return Err(Error::InvalidState(format!(
                        "entry {key} has a write-back in flight"
                    )));
                }
                Decached => {
                    // a fresh entry replaces the dead one below
                    drop(inner);
                    let entry = Arc::new(BindingEntry::new(
                        key.clone(),
                        if for_write { CachedWrite } else { CachedRead },
                        Some(value),
                        context_id,
                    ));
                    map.insert(key, entry.clone());
                    return Ok(entry);
                }
            }
            inner.value = Some(value);
            inner.context_id = context_id;
            drop(inner);
            return Ok(existing);
        }
        let state = if for_write {
            EntryState::CachedWrite
        } else {
            EntryState::CachedRead
        };
        let entry = Arc::new(BindingEntry::new(
            key.clone(),
            state,
            Some(value),
            context_id,
        ));
        map.insert(key, entry.clone());
        Ok(entry)
    }

    /// Marks a write-cached entry as writing back ahead of eviction.
    pub fn begin_writeback(&self, key: &BindingKey) -> Result<Arc<BindingEntry>, Error> {
        let map = self.map.read();
        let entry = map
            .get(key)
            .ok_or_else(|| Error::InvalidState(format!("entry {key} is not cached")))?;
        let mut inner = entry.inner.lock();
        if inner.state != EntryState::CachedWrite {
            return Err(Error::InvalidState(format!(
                "entry {key} is {:?}, not cached for write",
                inner.state
            )));
        }
        entry.transition_locked(&mut inner, EntryState::Writing);
        Ok(entry.clone())
    }

    /// Decaches `key` and drops it from the index. Waits out any
    /// pending-previous operation referencing the entry; the caller is
    /// responsible for ensuring no lock is held on the key.
    ///
    /// Returns false when nothing was cached.
    pub fn evict(&self, key: &BindingKey, deadline: u64) -> Result<bool, Error> {
        assert!(
            *key != BindingKey::Last,
            "the upper sentinel entry is never evicted"
        );
        loop {
            let entry = match { self.map.read().get(key).cloned() } {
                Some(entry) => entry,
                None => return Ok(false),
            };
            {
                let mut inner = entry.inner.lock();
                if inner.pending_previous {
                    entry.await_pending_clear(&mut inner, deadline)?;
                    continue;
                }
                match inner.state {
                    EntryState::Decached => return Ok(false),
                    EntryState::FetchingRead | EntryState::FetchingWrite => {
                        return Err(Error::InvalidState(format!(
                            "entry {key} is being fetched and cannot be evicted"
                        )));
                    }
                    _ => {
                        entry.transition_locked(&mut inner, EntryState::Decached);
                        inner.value = Some(REMOVED_VALUE);
                    }
                }
            }
            let mut map = self.map.write();
            // an install may already have replaced the dead entry
            if map
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &entry))
            {
                map.remove(key);
            }
            debug!(target: "bindcache", "evicted {key}");
            return Ok(true);
        }
    }

    /// The cached entry with the greatest key strictly below `key`,
    /// skipping decached entries.
    pub fn lower_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        let map = self.map.read();
        for (_, entry) in map
            .range((Bound::Unbounded, Bound::Excluded(key)))
            .rev()
        {
            if entry.state() != EntryState::Decached {
                return Some(entry.clone());
            }
        }
        None
    }

    /// The cached entry with the least key strictly above `key`,
    /// skipping decached entries.
    pub(crate) fn next_entry(&self, key: &BindingKey) -> Option<Arc<BindingEntry>> {
        let map = self.map.read();
        for (_, entry) in map.range((Bound::Excluded(key), Bound::Unbounded)) {
            if entry.state() != EntryState::Decached {
                return Some(entry.clone());
            }
        }
        None
    }

    /// Claims the pending-previous interlock on the entry immediately
    /// above `key`, waiting out a previous holder. The guard's entry is
    /// the later neighbor of whatever mutation the caller is about to
    /// perform between `key` and it.
    pub fn begin_previous_update(
        &self,
        key: &BindingKey,
        deadline: u64,
    ) -> Result<PendingPreviousGuard, Error> {
        loop {
            let next = self.next_entry(key).ok_or_else(|| {
                Error::InvalidState(format!("no entry above {key}; the upper sentinel is missing"))
            })?;
            let mut inner = next.inner.lock();
            if inner.state == EntryState::Decached {
                continue;
            }
            if inner.pending_previous {
                next.await_pending_clear(&mut inner, deadline)?;
                // the neighbor may have changed while we waited
                continue;
            }
            inner.pending_previous = true;
            drop(inner);
            trace!(target: "bindcache", "pending previous set on {}", next.key);
            return Ok(PendingPreviousGuard::new(next));
        }
    }

    /// Waits until `entry` leaves its in-flight state (a fetch or a
    /// write-back), up to `deadline`.
    pub fn await_stable(&self, entry: &Arc<BindingEntry>, deadline: u64) -> Result<(), Error> {
        let mut inner = entry.inner.lock();
        loop {
            match inner.state {
                EntryState::FetchingRead | EntryState::FetchingWrite | EntryState::Writing => {
                    let now = now_millis();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    entry
                        .changed
                        .wait_for(&mut inner, Duration::from_millis(deadline - now));
                }
                _ => return Ok(()),
            }
        }
    }

    /// Verifies the cache invariants entry by entry, awaiting each
    /// entry's pending-previous interlock first. Violations are fatal.
    pub fn check_consistency(&self) -> Result<(), Error> {
        let deadline = deadline_after(now_millis(), self.lock_timeout);
        let entries: Vec<Arc<BindingEntry>> = { self.map.read().values().cloned().collect() };
        let mut sentinels = 0;
        for entry in &entries {
            let claim = self.check_entry(entry, &mut sentinels, deadline)?;
            if let Some((previous, previous_unbound)) = claim {
                if let Some(lower) = self.lower_entry(&entry.key) {
                    let lower_key = lower.key().clone();
                    if lower_key > previous {
                        return Err(Error::InvalidState(format!(
                            "range claim on {} skips the cached entry {lower_key}",
                            entry.key
                        )));
                    }
                    if lower_key == previous
                        && previous_unbound
                        && lower.value().is_some_and(|v| v >= 0)
                    {
                        return Err(Error::InvalidState(format!(
                            "{lower_key} is cached and bound but claimed unbound by {}",
                            entry.key
                        )));
                    }
                }
            }
        }
        if sentinels != 1 {
            return Err(Error::InvalidState(format!(
                "expected exactly one upper sentinel entry, found {sentinels}"
            )));
        }
        Ok(())
    }

    fn check_entry(
        &self,
        entry: &Arc<BindingEntry>,
        sentinels: &mut usize,
        deadline: u64,
    ) -> Result<Option<(BindingKey, bool)>, Error> {
        let mut inner = entry.inner.lock();
        entry.await_pending_clear(&mut inner, deadline)?;
        match &entry.key {
            BindingKey::First => {
                return Err(Error::InvalidState(
                    "the lower sentinel must never be cached".into(),
                ));
            }
            BindingKey::Last => {
                *sentinels += 1;
                if inner.value != Some(LAST_VALUE) {
                    return Err(Error::InvalidState(format!(
                        "upper sentinel carries value {:?}",
                        inner.value
                    )));
                }
            }
            BindingKey::Name(_) => {
                if inner.state != EntryState::Decached && inner.value == Some(REMOVED_VALUE) {
                    return Err(Error::InvalidState(format!(
                        "entry {} carries the removed marker while {:?}",
                        entry.key, inner.state
                    )));
                }
            }
        }
        if let Some(previous) = &inner.previous_key {
            if previous >= &entry.key {
                return Err(Error::InvalidState(format!(
                    "entry {} claims previous key {previous} at or above itself",
                    entry.key
                )));
            }
        }
        Ok(inner
            .previous_key
            .clone()
            .map(|p| (p, inner.previous_key_unbound)))
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, entry: BindingEntry) -> Arc<BindingEntry> {
        let entry = Arc::new(entry);
        self.map
            .write()
            .insert(entry.key.clone(), entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BindState, LAST_VALUE};
    use assert_matches::assert_matches;
    use std::{thread, time::Duration};

    fn cache() -> BindingCache {
        let _ = ::env_logger::builder().is_test(true).try_init();
        BindingCache::new(CacheConfig::default())
    }

    fn key(name: &str) -> BindingKey {
        BindingKey::for_name(name)
    }

    fn far_deadline() -> u64 {
        now_millis() + 60_000
    }

    #[test]
    fn fresh_cache_has_only_the_sentinel() {
        let cache = cache();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 1);
        let last = cache.next_entry(&key("anything")).unwrap();
        assert_eq!(*last.key(), BindingKey::Last);
        assert_eq!(last.value(), Some(LAST_VALUE));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn install_then_get_round_trips() {
        let cache = cache();
        cache.install(key("player"), 100, false, 1).unwrap();
        match cache.get(&key("player"), false, 2).unwrap() {
            GetResult::Cached(entry) => {
                assert_eq!(entry.value(), Some(100));
                assert_eq!(entry.state(), EntryState::CachedRead);
                // the lookup refreshed the recency context
                assert_eq!(entry.context_id(), 2);
            }
            _ => panic!("expected a cached entry"),
        }
        cache.check_consistency().unwrap();
    }

    #[test]
    fn negative_range_answers_locally() {
        let cache = cache();
        let entry = cache.install(key("m"), 100, false, 1).unwrap();
        entry
            .set_previous_key(key("a"), true, far_deadline())
            .unwrap();
        // any name inside ("a", "m") is known unbound with no round-trip
        assert_matches!(
            cache.get(&key("f"), false, 1).unwrap(),
            GetResult::KnownUnbound
        );
        assert_matches!(
            cache.get(&key("a"), false, 1).unwrap(),
            GetResult::KnownUnbound
        );
        // outside the claimed interval nothing is known
        assert_matches!(cache.get(&key("0"), false, 1).unwrap(), GetResult::Unknown);
        assert_matches!(cache.get(&key("z"), false, 1).unwrap(), GetResult::Unknown);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn last_sentinel_anchors_upper_range_claims() {
        let cache = cache();
        let last = cache.next_entry(&key("zzz")).unwrap();
        last.update_previous_key(key("tail"), BindState::Unbound);
        assert_matches!(
            cache.get(&key("zzz"), false, 1).unwrap(),
            GetResult::KnownUnbound
        );
        assert!(last.known_unbound(&key("tail")));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn write_access_requires_upgrade() {
        let cache = cache();
        cache.install(key("obj"), 5, false, 1).unwrap();
        assert_matches!(
            cache.get(&key("obj"), true, 1).unwrap(),
            GetResult::NeedsUpgrade(_)
        );
        cache.install(key("obj"), 5, true, 1).unwrap();
        assert_matches!(cache.get(&key("obj"), true, 1).unwrap(), GetResult::Cached(_));
    }

    #[test]
    fn fetch_placeholder_blocks_lookups() {
        let cache = cache();
        let entry = cache.begin_fetch(key("obj"), false, 1).unwrap();
        assert_eq!(entry.state(), EntryState::FetchingRead);
        assert_eq!(entry.value(), None);
        assert_matches!(cache.get(&key("obj"), false, 1).unwrap(), GetResult::Blocked(_));

        cache.install(key("obj"), 9, false, 1).unwrap();
        assert_matches!(cache.get(&key("obj"), false, 1).unwrap(), GetResult::Cached(_));
    }

    #[test]
    fn cancelled_fetch_leaves_no_trace() {
        let cache = cache();
        cache.begin_fetch(key("obj"), true, 1).unwrap();
        cache.cancel_fetch(&key("obj")).unwrap();
        assert_matches!(cache.get(&key("obj"), false, 1).unwrap(), GetResult::Unknown);
        cache.check_consistency().unwrap();
    }

    #[test]
    fn duplicate_fetch_is_rejected() {
        let cache = cache();
        cache.begin_fetch(key("obj"), false, 1).unwrap();
        assert_matches!(
            cache.begin_fetch(key("obj"), false, 1),
            Err(Error::InvalidState(_))
        );
    }

    #[test]
    fn writeback_then_evict_follows_the_state_machine() {
        let cache = cache();
        cache.install(key("obj"), 4, true, 1).unwrap();
        let entry = cache.begin_writeback(&key("obj")).unwrap();
        assert_eq!(entry.state(), EntryState::Writing);
        // still readable while writing back
        assert_matches!(cache.get(&key("obj"), false, 1).unwrap(), GetResult::Cached(_));
        // but a writer has to wait for the entry to settle
        assert_matches!(cache.get(&key("obj"), true, 1).unwrap(), GetResult::Blocked(_));

        assert!(cache.evict(&key("obj"), far_deadline()).unwrap());
        assert_eq!(entry.state(), EntryState::Decached);
        assert_eq!(entry.value(), Some(crate::REMOVED_VALUE));
        assert_matches!(cache.get(&key("obj"), false, 1).unwrap(), GetResult::Unknown);
        // evicting again reports nothing cached
        assert!(!cache.evict(&key("obj"), far_deadline()).unwrap());
    }

    #[test]
    fn evicting_a_fetching_entry_is_an_error() {
        let cache = cache();
        cache.begin_fetch(key("obj"), false, 1).unwrap();
        assert_matches!(
            cache.evict(&key("obj"), far_deadline()),
            Err(Error::InvalidState(_))
        );
    }

    #[test]
    fn lower_entry_skips_decached_entries() {
        let cache = cache();
        cache.install(key("a"), 1, false, 1).unwrap();
        cache.install(key("m"), 2, false, 1).unwrap();
        // a decached entry lingering in the index must be invisible
        let dead = BindingEntry::new(key("g"), EntryState::CachedRead, Some(3), 0);
        {
            let mut inner = dead.inner.lock();
            dead.transition_locked(&mut inner, EntryState::Decached);
            inner.value = Some(crate::REMOVED_VALUE);
        }
        cache.insert_raw(dead);

        let lower = cache.lower_entry(&key("z")).unwrap();
        assert_eq!(*lower.key(), key("m"));
        let lower = cache.lower_entry(&key("m")).unwrap();
        assert_eq!(*lower.key(), key("a"), "the decached entry was skipped");
        assert!(cache.lower_entry(&key("a")).is_none());
    }

    #[test]
    fn pending_previous_blocks_neighbor_operations() {
        let cache = Arc::new(cache());
        let entry = cache.install(key("m"), 100, false, 1).unwrap();

        let guard = cache
            .begin_previous_update(&key("k"), far_deadline())
            .unwrap();
        assert!(Arc::ptr_eq(guard.entry(), &entry));
        assert!(entry.pending_previous());

        // a concurrent claim update must wait for the insert to finish
        let contender = {
            let entry = entry.clone();
            thread::spawn(move || {
                entry.set_previous_key(key("k"), true, now_millis() + 10_000)
            })
        };
        // simulate the slow insert of "k" behind the interlock
        thread::sleep(Duration::from_millis(200));
        assert!(!contender.is_finished(), "claim update must be interlocked");
        cache.install(key("k"), 7, false, 1).unwrap();
        drop(guard);

        contender.join().unwrap().unwrap();
        assert_eq!(entry.previous_key(), Some((key("k"), true)));
        cache.check_consistency().unwrap();
    }

    #[test]
    fn pending_previous_times_out_past_the_deadline() {
        let cache = cache();
        let entry = cache.install(key("m"), 100, false, 1).unwrap();
        let _guard = cache
            .begin_previous_update(&key("k"), far_deadline())
            .unwrap();
        assert_eq!(
            entry.set_previous_key(key("k"), true, now_millis() + 100),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn get_waits_out_the_interlock() {
        let cache = Arc::new(cache());
        let entry = cache.install(key("m"), 100, false, 1).unwrap();
        entry
            .set_previous_key(key("a"), true, far_deadline())
            .unwrap();
        let guard = cache
            .begin_previous_update(&key("f"), far_deadline())
            .unwrap();

        let reader = {
            let cache = cache.clone();
            thread::spawn(move || cache.get(&key("f"), false, 2))
        };
        thread::sleep(Duration::from_millis(100));
        assert!(!reader.is_finished(), "reads must wait for the interlock");
        drop(guard);
        assert_matches!(reader.join().unwrap().unwrap(), GetResult::KnownUnbound);
    }

    #[test]
    fn consistency_check_rejects_skipped_entries() {
        let cache = cache();
        cache.install(key("g"), 1, false, 1).unwrap();
        let entry = cache.install(key("m"), 2, false, 1).unwrap();
        // claim (a, m) unbound even though g is cached inside it
        entry
            .set_previous_key(key("a"), true, far_deadline())
            .unwrap();
        assert_matches!(cache.check_consistency(), Err(Error::InvalidState(_)));
    }

    #[test]
    fn consistency_check_rejects_bound_names_claimed_unbound() {
        let cache = cache();
        cache.install(key("g"), 1, false, 1).unwrap();
        let entry = cache.install(key("m"), 2, false, 1).unwrap();
        // g is cached and bound, so claiming it unbound is corrupt
        entry
            .set_previous_key(key("g"), true, far_deadline())
            .unwrap();
        assert_matches!(cache.check_consistency(), Err(Error::InvalidState(_)));
    }

    #[test]
    fn consistency_check_accepts_adjacent_claims() {
        let cache = cache();
        cache.install(key("g"), 1, false, 1).unwrap();
        let entry = cache.install(key("m"), 2, false, 1).unwrap();
        entry
            .set_previous_key(key("g"), false, far_deadline())
            .unwrap();
        cache.check_consistency().unwrap();
    }

    #[test]
    #[should_panic(expected = "never evicted")]
    fn evicting_the_sentinel_is_fatal() {
        let cache = cache();
        let _ = cache.evict(&BindingKey::Last, far_deadline());
    }

    #[test]
    fn random_install_order_keeps_the_index_sorted() {
        use rand::seq::SliceRandom;
        let cache = cache();
        let mut names: Vec<String> = (0..50).map(|i| format!("obj-{i:02}")).collect();
        names.shuffle(&mut rand::thread_rng());
        for (i, name) in names.iter().enumerate() {
            cache
                .install(BindingKey::for_name(name), i as i64, false, 1)
                .unwrap();
        }
        // walking lower_entry from the sentinel visits every entry in
        // descending key order
        let mut cursor = BindingKey::Last;
        let mut seen = Vec::new();
        while let Some(entry) = cache.lower_entry(&cursor) {
            cursor = entry.key().clone();
            seen.push(cursor.clone());
        }
        let expected: Vec<BindingKey> = (0..50)
            .rev()
            .map(|i| BindingKey::for_name(&format!("obj-{i:02}")))
            .collect();
        assert_eq!(seen, expected);
        cache.check_consistency().unwrap();
    }
}
