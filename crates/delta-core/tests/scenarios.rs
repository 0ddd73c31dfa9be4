//! End-to-end scenarios for delta-core.
//!
//! Drives sessions over a shared `InMemoryStore` the way an application
//! would: writes through the delta writer, reads through projection, and
//! observes notifications through listeners and the change feed.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use delta_core::{
    DeltaConfig, DeltaEvent, DeltaListener, DeltaSession, DocumentStore, Fields, InMemoryStore,
    LogicalDocument, ManualClock, PhysicalRecord, Timestamp, WriteOutcome, project,
};
use delta_core::tracker::DeletionTracker;
use serde_json::{Value, json};

type Session = DeltaSession<Arc<InMemoryStore>>;

/// Listener that remembers every notification it gets.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DeltaEvent>>,
}

impl Recorder {
    fn events(&self) -> Vec<DeltaEvent> {
        self.events.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<(String, String)> {
        self.events()
            .iter()
            .map(|event| {
                let kind = match event {
                    DeltaEvent::Create { .. } => "create",
                    DeltaEvent::Update { .. } => "update",
                    DeltaEvent::Delete { .. } => "delete",
                };
                (kind.to_string(), event.logical_id().to_string())
            })
            .collect()
    }
}

impl DeltaListener for Recorder {
    fn on_create(&self, record: &PhysicalRecord) {
        self.events.lock().unwrap().push(DeltaEvent::Create {
            record: record.clone(),
        });
    }

    fn on_update(&self, document: &LogicalDocument) {
        self.events.lock().unwrap().push(DeltaEvent::Update {
            document: document.clone(),
        });
    }

    fn on_delete(&self, logical_id: &str) {
        self.events.lock().unwrap().push(DeltaEvent::Delete {
            id: logical_id.to_string(),
        });
    }
}

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn start() -> Timestamp {
    "2024-05-01T09:30:00.000Z".parse().unwrap()
}

fn session_over(store: &Arc<InMemoryStore>) -> Session {
    DeltaSession::new(Arc::clone(store)).with_clock(Arc::new(ManualClock::starting_at(start())))
}

async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}

/// create {title} → update {priority: medium} → update {title} → update {priority: high}
async fn save_trash(session: &Session) -> String {
    let created = session
        .create(fields(&[("title", json!("take out trash"))]))
        .await
        .unwrap();
    let id = created.logical_id;

    for change in [
        fields(&[("priority", json!("medium"))]),
        fields(&[("title", json!("take out trash and recycling"))]),
        fields(&[("priority", json!("high"))]),
    ] {
        let current = session.cached(&id).unwrap();
        let mut next = current.fields.clone();
        next.extend(change);
        assert!(session.update(&current, &next).await.unwrap().is_written());
    }
    id
}

async fn save_dishes(session: &Session) -> String {
    let created = session
        .create(fields(&[("priority", json!("low"))]))
        .await
        .unwrap();
    let id = created.logical_id;

    session.write_delta(&id, fields(&[("title", json!("clean dishes"))])).await.unwrap();
    session.write_delta(&id, fields(&[("title", json!("clean & dry dishes"))])).await.unwrap();
    session.write_delta(&id, fields(&[("priority", json!("medium"))])).await.unwrap();
    id
}

#[tokio::test]
async fn updates_are_reflected_in_all() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);

    let trash = save_trash(&session).await;
    let dishes = save_dishes(&session).await;
    let docs = session.all().await.unwrap();

    assert_eq!(store.len(), 8);
    assert_eq!(docs.len(), 2);
    assert_eq!(
        docs[&trash].fields,
        fields(&[
            ("title", json!("take out trash and recycling")),
            ("priority", json!("high")),
        ])
    );
    assert_eq!(
        docs[&dishes].fields,
        fields(&[("title", json!("clean & dry dishes")), ("priority", json!("medium"))])
    );
}

#[tokio::test]
async fn deletion_is_permanent() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe(recorder.clone());

    let a = session.create(fields(&[("title", json!("a"))])).await.unwrap().logical_id;
    let b = session.create(fields(&[("title", json!("b"))])).await.unwrap().logical_id;
    session.delete(&a).await.unwrap();

    // Writing after the delete still appends, but nothing resurrects A
    let late = session.write_delta(&a, fields(&[("title", json!("replace trash bag"))])).await.unwrap();
    assert!(late.is_written());

    let docs = session.all().await.unwrap();
    assert_eq!(docs.keys().cloned().collect::<Vec<_>>(), vec![b.clone()]);

    assert_eq!(
        recorder.kinds(),
        vec![
            ("create".to_string(), a.clone()),
            ("create".to_string(), b),
            ("delete".to_string(), a),
        ]
    );
}

#[tokio::test]
async fn deleting_by_document_reference() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);

    let trash = save_trash(&session).await;
    let document = session.cached(&trash).unwrap();
    session.delete(&document).await.unwrap();

    assert!(session.all().await.unwrap().is_empty());
    assert!(session.tracker().was_deleted(&trash));
}

#[tokio::test]
async fn unchanged_update_writes_nothing_and_notifies_nobody() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let id = session.create(fields(&[("title", json!("a"))])).await.unwrap().logical_id;

    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe(recorder.clone());
    let current = session.cached(&id).unwrap();

    let outcome = session.update(&current, &fields(&[("title", json!("a"))])).await.unwrap();

    assert_eq!(outcome, WriteOutcome::Unchanged);
    assert_eq!(store.len(), 1);
    assert!(recorder.events().is_empty());
}

#[tokio::test]
async fn local_writes_notify_listeners() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe(recorder.clone());

    let trash = save_trash(&session).await;

    let events = recorder.events();
    assert_eq!(events.len(), 4);
    assert!(matches!(&events[0], DeltaEvent::Create { record } if record.logical_id.as_deref() == Some(trash.as_str())));
    match &events[3] {
        DeltaEvent::Update { document } => {
            assert_eq!(document.get("title"), Some(&json!("take out trash and recycling")));
            assert_eq!(document.get("priority"), Some(&json!("high")));
        }
        other => panic!("expected update, got {:?}", other),
    }
}

#[tokio::test]
async fn readback_can_be_disabled() {
    let store = Arc::new(InMemoryStore::new());
    let config = DeltaConfig::from_json(r#"{"readback": false}"#).unwrap();
    let session = DeltaSession::with_config(Arc::clone(&store), config);
    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe(recorder.clone());

    session.create(fields(&[("title", json!("a"))])).await.unwrap();

    assert!(recorder.events().is_empty());
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn replica_sees_each_transition_once() {
    let store = Arc::new(InMemoryStore::new());
    let writer = session_over(&store);
    let replica = Arc::new(DeltaSession::new(Arc::clone(&store)));
    let recorder = Arc::new(Recorder::default());
    let _sub = replica.subscribe(recorder.clone());
    let feed = replica.listen(0).await.unwrap();

    let trash = save_trash(&writer).await;
    writer.delete(&trash).await.unwrap();
    writer.write_delta(&trash, fields(&[("title", json!("too late"))])).await.unwrap();

    let last = store.last_seq();
    wait_for(|| feed.cursor() == last).await;

    assert_eq!(
        recorder.kinds(),
        vec![
            ("create".to_string(), trash.clone()),
            ("update".to_string(), trash.clone()),
            ("update".to_string(), trash.clone()),
            ("update".to_string(), trash.clone()),
            ("delete".to_string(), trash),
        ]
    );
    assert_eq!(feed.stop().await, last);
}

#[tokio::test]
async fn feed_and_readback_do_not_double_notify() {
    let store = Arc::new(InMemoryStore::new());
    let session = Arc::new(session_over(&store));
    let recorder = Arc::new(Recorder::default());
    let _sub = session.subscribe(recorder.clone());
    let feed = session.listen(store.last_seq()).await.unwrap();

    let id = session.create(fields(&[("title", json!("a"))])).await.unwrap().logical_id;
    session.write_delta(&id, fields(&[("title", json!("b"))])).await.unwrap();

    let last = store.last_seq();
    wait_for(|| feed.cursor() == last).await;
    feed.stop().await;

    assert_eq!(
        recorder.kinds(),
        vec![("create".to_string(), id.clone()), ("update".to_string(), id)]
    );
}

#[tokio::test]
async fn stopped_feed_ignores_later_writes() {
    let store = Arc::new(InMemoryStore::new());
    let writer = session_over(&store);
    let replica = Arc::new(DeltaSession::new(Arc::clone(&store)));
    let recorder = Arc::new(Recorder::default());
    let _sub = replica.subscribe(recorder.clone());

    let feed = replica.listen_from_config().await.unwrap();
    writer.create(fields(&[("title", json!("a"))])).await.unwrap();
    wait_for(|| recorder.events().len() == 1).await;
    let cursor = feed.stop().await;

    writer.create(fields(&[("title", json!("b"))])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(cursor, 1);
    assert_eq!(recorder.events().len(), 1);
}

#[tokio::test]
async fn compaction_collapses_repeated_updates() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let id = session
        .create(fields(&[("title", json!("take out trash")), ("priority", json!("low"))]))
        .await
        .unwrap()
        .logical_id;
    session.write_delta(&id, fields(&[("title", json!("take out trash"))])).await.unwrap();
    session.write_delta(&id, fields(&[("priority", json!("low"))])).await.unwrap();
    session.write_delta(&id, fields(&[("title", json!("take out trash"))])).await.unwrap();
    assert_eq!(store.len(), 4);

    let before = session.all().await.unwrap();
    let report = session.compact().await.unwrap();

    assert_eq!(report.removed_redundant, 3);
    assert_eq!(store.len(), 1);
    assert_eq!(store.get(&id).await.unwrap().fields, before[&id].fields);
}

#[tokio::test]
async fn compaction_preserves_projection() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let trash = save_trash(&session).await;
    let dishes = save_dishes(&session).await;
    let gone = session.create(fields(&[("title", json!("gone"))])).await.unwrap().logical_id;
    session.write_delta(&gone, fields(&[("priority", json!("high"))])).await.unwrap();
    session.delete(&gone).await.unwrap();

    let before = project(&store.list().await.unwrap(), &DeletionTracker::new());
    let count_before = store.len();

    session.compact().await.unwrap();

    let after = project(&store.list().await.unwrap(), &DeletionTracker::new());
    assert!(store.len() < count_before);
    assert_eq!(before.len(), after.len());
    for id in [&trash, &dishes] {
        assert_eq!(before[id].fields, after[id].fields);
    }
    assert!(!after.contains_key(&gone));
    assert!(
        store
            .list()
            .await
            .unwrap()
            .iter()
            .all(|record| record.resolved_id() != gone)
    );
}

#[tokio::test]
async fn late_update_after_compaction_stays_deleted() {
    let store = Arc::new(InMemoryStore::new());
    let session = session_over(&store);
    let id = session.create(fields(&[("title", json!("a"))])).await.unwrap().logical_id;
    session.delete(&id).await.unwrap();

    session.compact().await.unwrap();
    assert!(store.is_empty());

    // A replica that missed the delete writes an update afterwards
    session.write_delta(&id, fields(&[("title", json!("b"))])).await.unwrap();

    assert!(session.all().await.unwrap().is_empty());
}
