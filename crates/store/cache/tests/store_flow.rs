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

//! End-to-end flows through the store: cache, lock manager, authority,
//! and the write-back path over a real request queue.

use std::{
    collections::{BTreeMap, HashSet},
    ops::Bound,
    sync::Arc,
};

use parking_lot::Mutex;

use simserve_cache::{
    decode_write_request, BindingAuthority, BindingCache, BindingStore, CacheConfig, Error,
    FetchReply, GetOutcome, TxnContext, WriteOp,
};
use simserve_locks::LockManager;
use simserve_queue::{
    Config, HandlerError, RequestHandler, RequestQueueClient, RequestQueueListener,
    RequestQueueServer, ServerDispatcher, TcpConnector,
};

const NODE: i64 = 9;

/// In-memory stand-in for the central store's read side.
struct MapAuthority {
    bindings: Arc<Mutex<BTreeMap<String, i64>>>,
    calls: Arc<Mutex<Vec<(String, bool)>>>,
}

impl BindingAuthority for MapAuthority {
    fn get_binding(&self, name: &str, for_write: bool) -> Result<FetchReply, Error> {
        self.calls.lock().push((name.to_string(), for_write));
        let map = self.bindings.lock();
        match map.get(name) {
            Some(value) => Ok(FetchReply {
                value: Some(*value),
                next_name: None,
            }),
            None => {
                let next = map
                    .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
                    .next()
                    .map(|(next_name, value)| (next_name.clone(), *value));
                Ok(FetchReply {
                    value: None,
                    next_name: next,
                })
            }
        }
    }
}

/// Applies write-backs shipped over the request queue to the same map
/// the authority reads.
struct BackendHandler {
    bindings: Arc<Mutex<BTreeMap<String, i64>>>,
    protected: HashSet<String>,
}

impl RequestHandler for BackendHandler {
    fn perform_request(&mut self, payload: &[u8]) -> Result<(), HandlerError> {
        match decode_write_request(payload)? {
            WriteOp::Put { name, value } => {
                if self.protected.contains(&name) {
                    return Err(HandlerError::Failed(format!("{name} is protected")));
                }
                self.bindings.lock().insert(name, value);
                Ok(())
            }
            WriteOp::Remove { name } => {
                if self.protected.contains(&name) {
                    return Err(HandlerError::Failed(format!("{name} is protected")));
                }
                self.bindings.lock().remove(&name);
                Ok(())
            }
        }
    }
}

struct SingleNodeDispatcher {
    server: Arc<RequestQueueServer>,
}

impl ServerDispatcher for SingleNodeDispatcher {
    fn server_for_node(&self, node_id: i64) -> Option<Arc<RequestQueueServer>> {
        (node_id == self.server.node_id()).then(|| self.server.clone())
    }
}

struct Fixture {
    _listener: RequestQueueListener,
    store: BindingStore,
    bindings: Arc<Mutex<BTreeMap<String, i64>>>,
    calls: Arc<Mutex<Vec<(String, bool)>>>,
}

fn fixture(initial: &[(&str, i64)], protected: &[&str]) -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let bindings = Arc::new(Mutex::new(
        initial
            .iter()
            .map(|(name, value)| (name.to_string(), *value))
            .collect::<BTreeMap<_, _>>(),
    ));
    let calls = Arc::new(Mutex::new(Vec::new()));

    let server = Arc::new(RequestQueueServer::new(
        NODE,
        Box::new(BackendHandler {
            bindings: bindings.clone(),
            protected: protected.iter().map(|name| name.to_string()).collect(),
        }),
        0,
        Default::default(),
        Box::new(|_| {}),
    ));
    let listener = RequestQueueListener::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(SingleNodeDispatcher { server }),
    )
    .unwrap();
    let queue = RequestQueueClient::new(
        NODE,
        Box::new(TcpConnector::new(listener.local_addr())),
        Config::default(),
        Box::new(|_| {}),
    )
    .unwrap();

    let store = BindingStore::new(
        Arc::new(BindingCache::new(CacheConfig { lock_timeout: 5_000 })),
        Arc::new(LockManager::new(5_000, 4)),
        Arc::new(MapAuthority {
            bindings: bindings.clone(),
            calls: calls.clone(),
        }),
        queue,
    );
    Fixture {
        _listener: listener,
        store,
        bindings,
        calls,
    }
}

impl Fixture {
    fn fetch_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[test]
fn fetches_are_cached_after_the_first_miss() {
    let fixture = fixture(&[("player:fred", 17)], &[]);
    let txn = TxnContext::new();

    assert_eq!(
        fixture.store.get_binding(&txn, "player:fred").unwrap(),
        GetOutcome::Bound(17)
    );
    assert_eq!(fixture.fetch_count(), 1);
    assert_eq!(
        fixture.store.get_binding(&txn, "player:fred").unwrap(),
        GetOutcome::Bound(17)
    );
    assert_eq!(fixture.fetch_count(), 1, "second lookup must be local");
    fixture.store.cache().check_consistency().unwrap();
}

#[test]
fn negative_ranges_answer_misses_locally() {
    let fixture = fixture(&[("a", 1), ("m", 2)], &[]);
    let txn = TxnContext::new();

    // "f" is unbound; the authority volunteers "m" as the next bound
    // name, which the cache records as a range claim
    assert_eq!(
        fixture.store.get_binding(&txn, "f").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(fixture.fetch_count(), 1);

    // anything else inside ("f", "m") is now known unbound for free
    assert_eq!(
        fixture.store.get_binding(&txn, "g").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(
        fixture.store.get_binding(&txn, "h").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(fixture.fetch_count(), 1, "range hits must stay local");

    // "m" itself came along with the range claim
    assert_eq!(
        fixture.store.get_binding(&txn, "m").unwrap(),
        GetOutcome::Bound(2)
    );
    assert_eq!(fixture.fetch_count(), 1);

    // below the claimed interval the cache knows nothing
    assert_eq!(
        fixture.store.get_binding(&txn, "b").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(fixture.fetch_count(), 2);
    fixture.store.cache().check_consistency().unwrap();
}

#[test]
fn dirty_entries_write_back_through_the_queue() {
    let fixture = fixture(&[("hero", 7)], &[]);
    let txn = TxnContext::new();

    assert_eq!(
        fixture.store.get_binding_for_update(&txn, "hero").unwrap(),
        GetOutcome::Bound(7)
    );
    fixture.store.put_binding(&txn, "hero", 8).unwrap();
    // the new value is cached, not yet durable
    assert_eq!(fixture.bindings.lock().get("hero"), Some(&7));

    fixture.store.evict_binding(&txn, "hero").unwrap();
    assert_eq!(fixture.bindings.lock().get("hero"), Some(&8));

    // gone from the cache: the next lookup goes to the authority
    let before = fixture.fetch_count();
    assert_eq!(
        fixture.store.get_binding(&txn, "hero").unwrap(),
        GetOutcome::Bound(8)
    );
    assert_eq!(fixture.fetch_count(), before + 1);
    fixture.store.cache().check_consistency().unwrap();
}

#[test]
fn created_bindings_can_be_removed_without_round_trips() {
    let fixture = fixture(&[("a", 1), ("z", 9)], &[]);
    let txn = TxnContext::new();

    // learn that ("m", "z") is unbound
    assert_eq!(
        fixture.store.get_binding(&txn, "m").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(fixture.fetch_count(), 1);

    // creating over a known-unbound name needs no fetch
    fixture.store.put_binding(&txn, "p", 55).unwrap();
    assert_eq!(
        fixture.store.get_binding(&txn, "p").unwrap(),
        GetOutcome::Bound(55)
    );
    assert_eq!(fixture.fetch_count(), 1);

    // removing it folds the interval back into the range claim
    assert!(fixture.store.remove_binding(&txn, "p").unwrap());
    assert_eq!(
        fixture.store.get_binding(&txn, "p").unwrap(),
        GetOutcome::Unbound
    );
    assert_eq!(fixture.fetch_count(), 1, "the removal left no blind spot");
    assert!(!fixture.bindings.lock().contains_key("p"));
    fixture.store.cache().check_consistency().unwrap();
}

#[test]
fn server_side_removal_failures_leave_the_cache_intact() {
    let fixture = fixture(&[("vault", 3)], &["vault"]);
    let txn = TxnContext::new();

    assert_eq!(
        fixture.store.get_binding_for_update(&txn, "vault").unwrap(),
        GetOutcome::Bound(3)
    );
    match fixture.store.remove_binding(&txn, "vault") {
        Err(Error::RequestFailed(message)) => assert!(message.contains("protected")),
        other => panic!("expected a server-side failure, got {other:?}"),
    }
    // the binding survives on both sides
    assert_eq!(
        fixture.store.get_binding(&txn, "vault").unwrap(),
        GetOutcome::Bound(3)
    );
    assert_eq!(fixture.bindings.lock().get("vault"), Some(&3));
    fixture.store.cache().check_consistency().unwrap();
}

#[test]
fn failed_write_backs_never_discard_the_entry() {
    let fixture = fixture(&[("vault", 3)], &["vault"]);
    let txn = TxnContext::new();

    assert_eq!(
        fixture.store.get_binding_for_update(&txn, "vault").unwrap(),
        GetOutcome::Bound(3)
    );
    fixture.store.put_binding(&txn, "vault", 4).unwrap();

    // the server rejects the write-back, so the eviction must not happen
    match fixture.store.evict_binding(&txn, "vault") {
        Err(Error::RequestFailed(message)) => assert!(message.contains("protected")),
        other => panic!("expected a server-side failure, got {other:?}"),
    }
    assert_eq!(fixture.bindings.lock().get("vault"), Some(&3));

    // the undelivered value stays readable and refuses to be dropped
    assert_eq!(
        fixture.store.get_binding(&txn, "vault").unwrap(),
        GetOutcome::Bound(4)
    );
    match fixture.store.evict_binding(&txn, "vault") {
        Err(Error::InvalidState(message)) => assert!(message.contains("unconfirmed write-back")),
        other => panic!("expected the retry to be refused, got {other:?}"),
    }
    assert_eq!(
        fixture.store.get_binding(&txn, "vault").unwrap(),
        GetOutcome::Bound(4)
    );
}

#[test]
fn write_intent_upgrades_a_read_cached_entry() {
    let fixture = fixture(&[("obj", 5)], &[]);
    let txn = TxnContext::new();

    assert_eq!(
        fixture.store.get_binding(&txn, "obj").unwrap(),
        GetOutcome::Bound(5)
    );
    assert_eq!(
        fixture.store.get_binding_for_update(&txn, "obj").unwrap(),
        GetOutcome::Bound(5)
    );
    assert_eq!(
        fixture.calls.lock().clone(),
        vec![("obj".to_string(), false), ("obj".to_string(), true)],
        "the upgrade must go back to the authority with write intent"
    );
    // once upgraded, further write lookups are local
    assert_eq!(
        fixture.store.get_binding_for_update(&txn, "obj").unwrap(),
        GetOutcome::Bound(5)
    );
    assert_eq!(fixture.fetch_count(), 2);
    fixture.store.cache().check_consistency().unwrap();
}
