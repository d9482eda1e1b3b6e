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

//! The transaction-facing store over the binding cache.
//!
//! A lookup is served from the cache when possible, including negative
//! answers backed by range claims. A miss takes the per-name lock,
//! fetches through the [`BindingAuthority`], and installs the reply,
//! recording whatever range information the authority volunteered.
//! Mutations go the other way: they update the cache under the lock and
//! ship the change to the server over the reliable request queue, whose
//! acknowledgment confirms durability.

use std::{
    io::{self, Read},
    sync::{
        atomic::{AtomicU64, Ordering as AtomicOrdering},
        mpsc, Arc,
    },
};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use simserve_locks::{deadline_after, ConflictKind, LockConflict, LockManager, Locker};
use simserve_queue::{self as queue, RequestQueueClient};

use crate::{
    now_millis, BindState, BindingCache, BindingEntry, BindingKey, EntryState, Error, GetResult,
    PendingPreviousGuard,
};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

const OP_PUT: u8 = 1;
const OP_REMOVE: u8 = 2;

/// Transaction-scoped context: the locker that owns this transaction's
/// locks, its recency id, and the start time its lock requests carry for
/// wait-queue fairness.
pub struct TxnContext {
    locker: Arc<Locker<BindingKey>>,
    context_id: u64,
    requested_start: u64,
}

impl TxnContext {
    pub fn new() -> Self {
        TxnContext {
            locker: Arc::new(Locker::new()),
            context_id: NEXT_CONTEXT_ID.fetch_add(1, AtomicOrdering::SeqCst),
            requested_start: now_millis(),
        }
    }

    pub fn locker(&self) -> &Arc<Locker<BindingKey>> {
        &self.locker
    }

    pub fn context_id(&self) -> u64 {
        self.context_id
    }
}

impl Default for TxnContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a binding lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GetOutcome {
    Bound(i64),
    Unbound,
}

/// What the authority knows about a name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchReply {
    /// The bound value, when the name is bound.
    pub value: Option<i64>,
    /// When the name is unbound, the next bound name after it and its
    /// value, if any exists. Everything between the queried name and it
    /// is unbound, which is what the cache records as a range claim.
    pub next_name: Option<(String, i64)>,
}

/// The server-side source of truth for reads. Writes do not go through
/// here; they travel over the request queue.
pub trait BindingAuthority: Send + Sync + 'static {
    fn get_binding(&self, name: &str, for_write: bool) -> Result<FetchReply, Error>;
}

/// A mutation shipped to the server over the request queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { name: String, value: i64 },
    Remove { name: String },
}

/// Decodes a request-queue payload produced by the store's write-back
/// path; the server side's request handler applies the result.
pub fn decode_write_request(payload: &[u8]) -> io::Result<WriteOp> {
    let mut reader = payload;
    let op = reader.read_u8()?;
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > payload.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("name length {len} exceeds payload"),
        ));
    }
    let mut name = vec![0; len];
    reader.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "binding name is not utf-8"))?;
    match op {
        OP_PUT => {
            let value = reader.read_i64::<BigEndian>()?;
            Ok(WriteOp::Put { name, value })
        }
        OP_REMOVE => Ok(WriteOp::Remove { name }),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown write op {op}"),
        )),
    }
}

fn encode_put(name: &str, value: i64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 13);
    payload.write_u8(OP_PUT).expect("writing to a buffer cannot fail");
    payload
        .write_u32::<BigEndian>(name.len() as u32)
        .expect("writing to a buffer cannot fail");
    payload.extend_from_slice(name.as_bytes());
    payload
        .write_i64::<BigEndian>(value)
        .expect("writing to a buffer cannot fail");
    payload
}

fn encode_remove(name: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(name.len() + 5);
    payload
        .write_u8(OP_REMOVE)
        .expect("writing to a buffer cannot fail");
    payload
        .write_u32::<BigEndian>(name.len() as u32)
        .expect("writing to a buffer cannot fail");
    payload.extend_from_slice(name.as_bytes());
    payload
}

/// A write-back awaiting its acknowledgment.
struct StoreWriteRequest {
    payload: Vec<u8>,
    done: mpsc::Sender<Result<(), queue::Error>>,
}

impl queue::Request for StoreWriteRequest {
    fn payload(&self) -> Vec<u8> {
        self.payload.clone()
    }

    fn completed(self: Box<Self>, result: Result<(), queue::Error>) {
        self.done.send(result).ok();
    }
}

/// The data-flow seam between the cache, the lock manager, and the
/// request queue.
pub struct BindingStore {
    cache: Arc<BindingCache>,
    locks: Arc<LockManager<BindingKey>>,
    authority: Arc<dyn BindingAuthority>,
    queue: RequestQueueClient,
}

impl BindingStore {
    pub fn new(
        cache: Arc<BindingCache>,
        locks: Arc<LockManager<BindingKey>>,
        authority: Arc<dyn BindingAuthority>,
        queue: RequestQueueClient,
    ) -> Self {
        BindingStore {
            cache,
            locks,
            authority,
            queue,
        }
    }

    pub fn cache(&self) -> &Arc<BindingCache> {
        &self.cache
    }

    /// Looks up `name` for reading, fetching on a miss.
    pub fn get_binding(&self, txn: &TxnContext, name: &str) -> Result<GetOutcome, Error> {
        self.get_internal(txn, name, false)
    }

    /// Looks up `name` with write intent, acquiring write rights from
    /// the server when only read rights are cached.
    pub fn get_binding_for_update(&self, txn: &TxnContext, name: &str) -> Result<GetOutcome, Error> {
        self.get_internal(txn, name, true)
    }

    fn get_internal(
        &self,
        txn: &TxnContext,
        name: &str,
        for_write: bool,
    ) -> Result<GetOutcome, Error> {
        let key = BindingKey::for_name(name);
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        loop {
            match self.cache.get(&key, for_write, txn.context_id)? {
                GetResult::Cached(entry) => {
                    let value = entry.value().ok_or_else(|| {
                        Error::InvalidState(format!("cached entry {key} has no value"))
                    })?;
                    return Ok(GetOutcome::Bound(value));
                }
                GetResult::KnownUnbound => return Ok(GetOutcome::Unbound),
                GetResult::NeedsUpgrade(_) => self.upgrade(txn, name, &key)?,
                GetResult::Blocked(entry) => self.cache.await_stable(&entry, deadline)?,
                GetResult::Unknown => self.fetch(txn, name, &key, for_write)?,
            }
            if now_millis() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Binds `name` to `value` in the cache with write access. The
    /// binding reaches the server when the entry is written back.
    pub fn put_binding(&self, txn: &TxnContext, name: &str, value: i64) -> Result<(), Error> {
        let key = BindingKey::for_name(name);
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        loop {
            match self.cache.get(&key, true, txn.context_id)? {
                GetResult::Cached(entry) => {
                    entry.set_value(value);
                    return Ok(());
                }
                GetResult::NeedsUpgrade(_) => self.upgrade(txn, name, &key)?,
                GetResult::Blocked(entry) => self.cache.await_stable(&entry, deadline)?,
                GetResult::KnownUnbound => {
                    let created = self.with_lock(txn, &key, true, || {
                        match self.cache.get(&key, true, txn.context_id)? {
                            GetResult::KnownUnbound => {
                                let guard = self.cache.begin_previous_update(&key, deadline)?;
                                self.cache.install(key.clone(), value, true, txn.context_id)?;
                                note_bound_neighbor(guard.entry(), &key);
                                Ok(true)
                            }
                            _ => Ok(false),
                        }
                    })?;
                    if created {
                        return Ok(());
                    }
                }
                GetResult::Unknown => self.fetch(txn, name, &key, true)?,
            }
            if now_millis() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Removes the binding for `name`, shipping the removal to the
    /// server and folding the freed interval into the next entry's range
    /// claim. Returns whether a binding existed.
    pub fn remove_binding(&self, txn: &TxnContext, name: &str) -> Result<bool, Error> {
        let key = BindingKey::for_name(name);
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        loop {
            match self.cache.get(&key, true, txn.context_id)? {
                GetResult::Cached(_) => {
                    let removed = self.with_lock(txn, &key, true, || {
                        let entry = match self.cache.get(&key, true, txn.context_id)? {
                            GetResult::Cached(entry) => entry,
                            _ => return Ok(None),
                        };
                        let guard = self.cache.begin_previous_update(&key, deadline)?;
                        self.send_write(encode_remove(name))?;
                        let own_claim = entry.previous_key();
                        self.cache.evict(&key, deadline)?;
                        coalesce_after_removal(&guard, &key, own_claim);
                        Ok(Some(true))
                    })?;
                    if let Some(result) = removed {
                        return Ok(result);
                    }
                }
                GetResult::NeedsUpgrade(_) => self.upgrade(txn, name, &key)?,
                GetResult::Blocked(entry) => self.cache.await_stable(&entry, deadline)?,
                GetResult::KnownUnbound => return Ok(false),
                GetResult::Unknown => self.fetch(txn, name, &key, true)?,
            }
            if now_millis() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Evicts `name` from the cache, writing a dirty entry back to the
    /// server first.
    pub fn evict_binding(&self, txn: &TxnContext, name: &str) -> Result<(), Error> {
        let key = BindingKey::for_name(name);
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        loop {
            match self.cache.get(&key, false, txn.context_id)? {
                GetResult::Cached(_) => {
                    let done = self.with_lock(txn, &key, true, || {
                        let entry = match self.cache.get(&key, false, txn.context_id)? {
                            GetResult::Cached(entry) => entry,
                            _ => return Ok(false),
                        };
                        match entry.state() {
                            EntryState::CachedWrite => {
                                let value = entry.value().ok_or_else(|| {
                                    Error::InvalidState(format!("cached entry {key} has no value"))
                                })?;
                                self.cache.begin_writeback(&key)?;
                                self.send_write(encode_put(name, value))?;
                                self.cache.evict(&key, deadline)?;
                            }
                            EntryState::CachedRead => {
                                self.cache.evict(&key, deadline)?;
                            }
                            EntryState::Writing => {
                                // a write-back already failed for this
                                // entry; its value never reached the
                                // server and must not be dropped
                                return Err(Error::InvalidState(format!(
                                    "entry {key} has an unconfirmed write-back"
                                )));
                            }
                            state => {
                                return Err(Error::InvalidState(format!(
                                    "entry {key} cannot be evicted while {state:?}"
                                )));
                            }
                        }
                        Ok(true)
                    })?;
                    if done {
                        return Ok(());
                    }
                }
                GetResult::NeedsUpgrade(_) => {
                    unreachable!("read lookups never require an upgrade")
                }
                GetResult::Blocked(entry) => self.cache.await_stable(&entry, deadline)?,
                GetResult::KnownUnbound | GetResult::Unknown => return Ok(()),
            }
            if now_millis() >= deadline {
                return Err(Error::Timeout);
            }
        }
    }

    /// Fetches `name` from the authority under the per-name lock and
    /// installs the result, including any negative-range information.
    fn fetch(
        &self,
        txn: &TxnContext,
        name: &str,
        key: &BindingKey,
        for_write: bool,
    ) -> Result<(), Error> {
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        self.with_lock(txn, key, for_write, || {
            // the binding may have been cached while we waited for the lock
            if !matches!(
                self.cache.get(key, for_write, txn.context_id)?,
                GetResult::Unknown
            ) {
                return Ok(());
            }
            let guard = self.cache.begin_previous_update(key, deadline)?;
            self.cache.begin_fetch(key.clone(), for_write, txn.context_id)?;
            let reply = match self.authority.get_binding(name, for_write) {
                Ok(reply) => reply,
                Err(e) => {
                    self.cache.cancel_fetch(key)?;
                    return Err(e);
                }
            };
            trace!(target: "bindcache", "fetched {key}: {reply:?}");
            match reply.value {
                Some(value) => {
                    self.cache.install(key.clone(), value, for_write, txn.context_id)?;
                    note_bound_neighbor(guard.entry(), key);
                }
                None => {
                    self.cache.cancel_fetch(key)?;
                    self.record_unbound(txn, key, reply.next_name, &guard)?;
                }
            }
            Ok(())
        })
    }

    /// Records that `key` is unbound. The claim lands on the next bound
    /// name the authority reported, installing it if it is not cached
    /// yet, and otherwise on the next cached entry, which the interlock
    /// guard already covers.
    fn record_unbound(
        &self,
        txn: &TxnContext,
        key: &BindingKey,
        next_name: Option<(String, i64)>,
        guard: &PendingPreviousGuard,
    ) -> Result<(), Error> {
        if let Some((next_name, next_value)) = next_name {
            let next_key = BindingKey::for_name(&next_name);
            if *key < next_key && next_key < *guard.entry().key() {
                let next_entry =
                    self.cache
                        .install(next_key.clone(), next_value, false, txn.context_id)?;
                next_entry.update_previous_key(key.clone(), BindState::Unbound);
                note_bound_neighbor(guard.entry(), &next_key);
                return Ok(());
            }
        }
        // everything from the queried name up to the guarded neighbor is
        // unbound
        guard
            .entry()
            .update_previous_key(key.clone(), BindState::Unbound);
        Ok(())
    }

    /// Obtains write rights for an entry cached read-only.
    fn upgrade(&self, txn: &TxnContext, name: &str, key: &BindingKey) -> Result<(), Error> {
        let deadline = deadline_after(now_millis(), self.cache.lock_timeout());
        self.with_lock(txn, key, true, || {
            match self.cache.get(key, true, txn.context_id)? {
                GetResult::NeedsUpgrade(_) => {}
                _ => return Ok(()),
            }
            let reply = self.authority.get_binding(name, true)?;
            match reply.value {
                Some(value) => {
                    self.cache.install(key.clone(), value, true, txn.context_id)?;
                }
                None => {
                    // the binding vanished on the server; drop the stale entry
                    self.cache.evict(key, deadline)?;
                }
            }
            Ok(())
        })
    }

    fn with_lock<R>(
        &self,
        txn: &TxnContext,
        key: &BindingKey,
        for_write: bool,
        op: impl FnOnce() -> Result<R, Error>,
    ) -> Result<R, Error> {
        if let Some(conflict) =
            self.locks
                .lock(&txn.locker, key.clone(), for_write, txn.requested_start)
        {
            debug!(target: "bindcache", "lock conflict on {key}: {:?}", conflict.kind);
            return Err(conflict_error(conflict));
        }
        let result = op();
        self.locks.release_lock(&txn.locker, key);
        result
    }

    /// Ships a write to the server and waits for its acknowledgment.
    fn send_write(&self, payload: Vec<u8>) -> Result<(), Error> {
        let (done, wait) = mpsc::channel();
        self.queue
            .add_request(Box::new(StoreWriteRequest { payload, done }))?;
        match wait.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::InvalidState(
                "write-back completion was dropped".into(),
            )),
        }
    }
}

/// After installing a bound entry inside a neighbor's claimed interval,
/// tightens the neighbor's claim so it no longer skips the new entry.
fn note_bound_neighbor(neighbor: &Arc<BindingEntry>, installed: &BindingKey) {
    if neighbor
        .previous_key()
        .is_some_and(|(previous, _)| previous < *installed)
    {
        neighbor.update_previous_key(installed.clone(), BindState::Bound);
    }
}

/// After removing the entry at `removed`, extends the next entry's
/// range claim across the freed interval. Only an adjacent claim (one
/// anchored exactly at the removed key) can be extended; anything else
/// would fabricate knowledge about the gap in between.
fn coalesce_after_removal(
    guard: &PendingPreviousGuard,
    removed: &BindingKey,
    own_claim: Option<(BindingKey, bool)>,
) {
    let next = guard.entry();
    match next.previous_key() {
        Some((anchor, _)) if anchor == *removed => {}
        _ => return,
    }
    next.update_previous_key(removed.clone(), BindState::Unbound);
    if let Some((previous, previous_unbound)) = own_claim {
        let state = if previous_unbound {
            BindState::Unbound
        } else {
            BindState::Bound
        };
        next.update_previous_key(previous, state);
    }
}

fn conflict_error(conflict: LockConflict<BindingKey>) -> Error {
    match conflict.kind {
        ConflictKind::Timeout => Error::Timeout,
        ConflictKind::Deadlock => Error::Deadlock,
        ConflictKind::Interrupted => Error::Interrupted,
        ConflictKind::Blocked => Error::Blocked,
    }
}
