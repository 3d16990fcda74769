//! End-to-end exercises of the literal §8 scenarios against a real
//! on-disk SQLite database, driving the same validator -> writer ->
//! query/dispatch path the connection layer calls. Each test owns its
//! own `TempDir` so databases never collide across parallel test runs.
use nostr_relay_core::config::{AllowListEntry, Authorization};
use nostr_relay_core::db::Storage;
use nostr_relay_core::dispatch;
use nostr_relay_core::event::Event;
use nostr_relay_core::filter::FilterSet;
use nostr_relay_core::query::{self, QueryOutcome};
use nostr_relay_core::registry::{EventSink, Registry};
use nostr_relay_core::validator;
use nostr_relay_core::writer::{self, WriteOutcome};

use async_trait::async_trait;
use secp256k1::rand::rngs::OsRng;
use secp256k1::{KeyPair, Secp256k1, XOnlyPublicKey};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn open_store() -> (tempfile::TempDir, Storage) {
    let dir = tempfile::tempdir().unwrap();
    let storage = Storage::open(dir.path()).unwrap();
    (dir, storage)
}

/// Builds and signs an event the way a real publisher would, so it
/// passes `authentication::verify` unmodified.
struct Publisher {
    secp: Secp256k1<secp256k1::All>,
    keypair: KeyPair,
    pubkey_hex: String,
}

impl Publisher {
    fn new() -> Publisher {
        let secp = Secp256k1::new();
        let keypair = KeyPair::new(&secp, &mut OsRng);
        let (xonly, _) = XOnlyPublicKey::from_keypair(&keypair);
        Publisher { secp, keypair, pubkey_hex: hex::encode(xonly.serialize()) }
    }

    fn event(&self, kind: u16, created_at: i64, tags: Vec<Vec<String>>, content: &str) -> Event {
        let mut event = Event {
            id: String::new(),
            pubkey: self.pubkey_hex.clone(),
            created_at,
            kind,
            tags,
            content: content.to_owned(),
            sig: String::new(),
        };
        let digest = event.digest();
        event.id = hex::encode(digest);
        let msg = secp256k1::Message::from_slice(&digest).unwrap();
        let sig = self.secp.sign_schnorr(&msg, &self.keypair);
        event.sig = hex::encode(sig.as_ref());
        event
    }

    fn unrestricted_authorization(&self, admitted_kinds: Vec<u16>) -> Authorization {
        let mut map = std::collections::HashMap::new();
        map.insert(self.pubkey_hex.clone(), AllowListEntry { d_tags: vec![] });
        Authorization { pubkey_allowlist: map, admitted_kinds }
    }
}

fn historical(storage: &Storage, filters: &FilterSet, admitted: &HashSet<u16>) -> Vec<Event> {
    match query::compile(filters, admitted) {
        QueryOutcome::Admitted(plan) => storage.query(&plan).unwrap(),
        QueryOutcome::Rejected => vec![],
    }
}

struct RecordingSink {
    received: Mutex<Vec<(String, Event)>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send_event(&self, sub_id: &str, event: &Event) -> nostr_relay_core::error::Result<()> {
        self.received.lock().unwrap().push((sub_id.to_owned(), event.clone()));
        Ok(())
    }
}

/// Scenario 1: a fresh subscription over an empty store admits (kinds
/// intersect the allow-list) but returns zero historical rows.
#[test]
fn scenario_1_empty_store_yields_no_historical_rows() {
    let (_dir, storage) = open_store();
    let admitted: HashSet<u16> = HashSet::from([30063]);
    let filters = FilterSet::from_values(&[json!({"kinds": [30063]})]).unwrap();
    assert!(historical(&storage, &filters, &admitted).is_empty());
}

/// Scenario 2 & 3: submitting an event stores it and makes it
/// retrievable; resubmitting the identical event reports duplicate and
/// does not change the stored row.
#[test]
fn scenario_2_and_3_store_then_duplicate() {
    let (_dir, storage) = open_store();
    let publisher = Publisher::new();
    let authz = publisher.unrestricted_authorization(vec![30063]);
    let e = publisher.event(30063, 1000, vec![vec!["d".to_owned(), "app.one".to_owned()]], "");

    validator::validate(&e, &authz).unwrap();
    assert_eq!(writer::write(&storage, &e, 0).unwrap(), WriteOutcome::Stored);

    let admitted: HashSet<u16> = HashSet::from([30063]);
    let filters = FilterSet::from_values(&[json!({"ids": [e.id], "kinds": [30063]})]).unwrap();
    assert_eq!(historical(&storage, &filters, &admitted), vec![e.clone()]);

    // resend: same event, must report duplicate and not add a second row.
    validator::validate(&e, &authz).unwrap();
    assert_eq!(writer::write(&storage, &e, 0).unwrap(), WriteOutcome::Duplicate);
    assert_eq!(historical(&storage, &filters, &admitted).len(), 1);
}

/// Scenario 4: a second parameterized-replaceable event from the same
/// publisher and `d`-tag collapses the first; only the newer one survives
/// a historical query.
#[test]
fn scenario_4_param_replaceable_collapses_to_newest() {
    let (_dir, storage) = open_store();
    let publisher = Publisher::new();
    let authz = publisher.unrestricted_authorization(vec![30063]);
    let tags = vec![vec!["d".to_owned(), "app.one".to_owned()]];

    let first = publisher.event(30063, 1000, tags.clone(), "v1");
    validator::validate(&first, &authz).unwrap();
    writer::write(&storage, &first, 0).unwrap();

    let second = publisher.event(30063, 2000, tags, "v2");
    validator::validate(&second, &authz).unwrap();
    assert_eq!(writer::write(&storage, &second, 0).unwrap(), WriteOutcome::Stored);

    let admitted: HashSet<u16> = HashSet::from([30063]);
    let filters = FilterSet::from_values(&[json!({"kinds": [30063]})]).unwrap();
    let rows = historical(&storage, &filters, &admitted);
    assert_eq!(rows, vec![second]);
    assert!(!storage.exists(&first.id).unwrap());
}

/// Scenario 5: once a subscription is removed from the registry, a
/// subsequently fanned-out matching event must not reach it.
#[tokio::test]
async fn scenario_5_closed_subscription_receives_nothing_further() {
    let (_dir, storage) = open_store();
    let publisher = Publisher::new();
    let registry = Registry::new();
    let (_, metrics) = nostr_relay_core::metrics::create_metrics();
    let admitted: HashSet<u16> = HashSet::from([1]);

    let sink = Arc::new(RecordingSink { received: Mutex::new(vec![]) });
    let filters = FilterSet::from_values(&[json!({"kinds": [1]})]).unwrap();
    let conn_id = Uuid::new_v4();
    registry.add(conn_id, "s1".to_owned(), filters, sink.clone());
    registry.remove(conn_id, "s1");

    let authz = publisher.unrestricted_authorization(vec![1]);
    let e = publisher.event(1, 1000, vec![], "hello");
    validator::validate(&e, &authz).unwrap();
    writer::write(&storage, &e, 0).unwrap();

    dispatch::fanout(&storage, &registry, &admitted, &e, std::time::Duration::from_millis(0), &metrics).await;
    assert!(sink.received.lock().unwrap().is_empty());
}

/// Scenario 6: a filter combining `kinds`, a `#d` tag constraint, and a
/// `search` term returns exactly the event matching all three, not the
/// unrelated event also present in the store.
#[test]
fn scenario_6_tag_and_search_constrained_query_is_selective() {
    let (_dir, storage) = open_store();
    let publisher = Publisher::new();
    let authz = publisher.unrestricted_authorization(vec![30063]);

    let matching = publisher.event(
        30063,
        1000,
        vec![
            vec!["d".to_owned(), "app.one".to_owned()],
            vec!["title".to_owned(), "hello world".to_owned()],
        ],
        "hello world",
    );
    let other = publisher.event(
        30063,
        1001,
        vec![
            vec!["d".to_owned(), "app.two".to_owned()],
            vec!["title".to_owned(), "goodbye world".to_owned()],
        ],
        "goodbye world",
    );
    validator::validate(&matching, &authz).unwrap();
    validator::validate(&other, &authz).unwrap();
    writer::write(&storage, &matching, 0).unwrap();
    writer::write(&storage, &other, 0).unwrap();

    let admitted: HashSet<u16> = HashSet::from([30063]);
    let filters = FilterSet::from_values(&[
        json!({"kinds": [30063], "#d": ["app.one"], "search": "hello world"}),
    ])
    .unwrap();
    assert_eq!(historical(&storage, &filters, &admitted), vec![matching]);
}

/// Ephemerality property (§8): a historical query that matches a kind
/// 20000 event returns it exactly once - the connection layer deletes an
/// ephemeral event immediately after it is returned to a matching
/// historical query (§4.8), so a second identical query sees nothing.
#[test]
fn ephemeral_event_is_consumed_by_one_historical_read() {
    let (_dir, storage) = open_store();
    let publisher = Publisher::new();
    let authz = publisher.unrestricted_authorization(vec![20000]);
    let e = publisher.event(20000, 1000, vec![], "ping");
    validator::validate(&e, &authz).unwrap();
    writer::write(&storage, &e, 0).unwrap();

    let admitted: HashSet<u16> = HashSet::from([20000]);
    let filters = FilterSet::from_values(&[json!({"kinds": [20000]})]).unwrap();
    let rows = historical(&storage, &filters, &admitted);
    assert_eq!(rows, vec![e.clone()]);

    // the connection layer is responsible for the delete-after-return step;
    // here we perform it directly to exercise the same storage primitive.
    storage.delete_by_id(&e.id).unwrap();
    assert!(historical(&storage, &filters, &admitted).is_empty());
}
