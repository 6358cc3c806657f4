//! Two replicas editing the same group converge after one sync pass in
//! each direction.

use std::sync::Arc;

use serde_json::json;

use tidemark_core::config::EngineConfig;
use tidemark_core::keyring::{Keyring, LocalIdentity};
use tidemark_core::mock::MockConnection;
use tidemark_core::model::VersionedObject;
use tidemark_core::store::{MemoryStore, ObjectStore, Store};
use tidemark_core::transport::PeerInfo;
use tidemark_engine::{ChangeEngine, HashTree};
use tidemark_rpc::RpcChannel;
use tidemark_sync::{SyncOrchestrator, SyncPriority};

struct Node {
    keyring: Arc<Keyring>,
    engine: Arc<ChangeEngine>,
    orch: Arc<SyncOrchestrator>,
}

fn node(name: &str) -> Node {
    let keyring = Arc::new(Keyring::new(LocalIdentity::generate(name)));
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let tree = Arc::new(HashTree::new(store.clone()));
    let engine = Arc::new(ChangeEngine::new(store, keyring.clone(), tree));
    let orch = SyncOrchestrator::new(engine.clone(), EngineConfig::default());
    orch.start();
    Node {
        keyring,
        engine,
        orch,
    }
}

fn info(of: &Node) -> PeerInfo {
    PeerInfo {
        signer: of.keyring.local_signer().to_string(),
        device: format!("{}-dev", of.keyring.local_signer()),
        public_key_hex: of.keyring.local().public_key_hex(),
        same_device: false,
    }
}

async fn connect(a: &Node, b: &Node) -> (Arc<RpcChannel>, Arc<RpcChannel>) {
    let (conn_a, conn_b) = MockConnection::pair(info(b), info(a));
    let (ch_a, ch_b) = tokio::join!(
        a.orch.add_connection(conn_a),
        b.orch.add_connection(conn_b)
    );
    (ch_a.unwrap(), ch_b.unwrap())
}

async fn create(node: &Node, obj: VersionedObject) {
    let modified = obj.modified;
    node.engine
        .record_local(None, Some(&obj), modified)
        .await
        .unwrap();
}

async fn edit(node: &Node, id: &str, field: &str, value: serde_json::Value, now: u64) {
    let current = node.engine.store().get(id).await.unwrap().unwrap();
    let mut next = current.clone().with_field(field, value);
    next.modified = now;
    node.engine
        .record_local(Some(&current), Some(&next), now)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_divergent_replicas_converge() {
    let alice = node("alice");
    let bob = node("bob");

    // Alice seeds a shared group with two notes.
    create(
        &alice,
        VersionedObject::new("g1", "g1", "group", "alice", 1_000)
            .with_field("members", json!({ "bob": "write" })),
    )
    .await;
    create(
        &alice,
        VersionedObject::new("note-1", "g1", "note", "alice", 2_000)
            .with_field("title", json!("draft")),
    )
    .await;
    create(
        &alice,
        VersionedObject::new("note-2", "g1", "note", "alice", 3_000)
            .with_field("title", json!("second")),
    )
    .await;

    let (ch_a, ch_b) = connect(&alice, &bob).await;

    // Bob bootstraps the whole group.
    let report = bob
        .orch
        .request_sync(ch_b.clone(), "g1", SyncPriority::Normal)
        .await
        .unwrap();
    assert_eq!(report.merged, 3);

    // Both sides now edit independently: bob touches a different field of
    // note-1 than alice does, and adds a note of his own.
    edit(&bob, "note-1", "body", json!("bob's body"), 5_000).await;
    create(
        &bob,
        VersionedObject::new("note-3", "g1", "note", "bob", 5_500)
            .with_field("title", json!("from bob")),
    )
    .await;
    edit(&alice, "note-1", "title", json!("final"), 6_000).await;

    // One deep pass in each direction repairs both replicas.
    bob.orch
        .request_sync(ch_b, "g1", SyncPriority::Normal)
        .await
        .unwrap();
    alice
        .orch
        .request_sync(ch_a, "g1", SyncPriority::Normal)
        .await
        .unwrap();

    assert_eq!(
        alice.engine.tree().root_hash("g1").await.unwrap(),
        bob.engine.tree().root_hash("g1").await.unwrap()
    );

    // Field-level merging preserved both sides' edits to note-1.
    for n in [&alice, &bob] {
        let note = n.engine.store().get("note-1").await.unwrap().unwrap();
        assert_eq!(note.fields["title"], json!("final"));
        assert_eq!(note.fields["body"], json!("bob's body"));
        assert_eq!(note.modified, 6_000);

        let added = n.engine.store().get("note-3").await.unwrap().unwrap();
        assert_eq!(added.fields["title"], json!("from bob"));
    }
}

#[tokio::test]
async fn test_deletion_propagates() {
    let alice = node("alice");
    let bob = node("bob");

    create(
        &alice,
        VersionedObject::new("g1", "g1", "group", "alice", 1_000)
            .with_field("members", json!({ "bob": "write" })),
    )
    .await;
    create(
        &alice,
        VersionedObject::new("note-1", "g1", "note", "alice", 2_000)
            .with_field("title", json!("doomed")),
    )
    .await;

    let (_ch_a, ch_b) = connect(&alice, &bob).await;
    bob.orch
        .request_sync(ch_b.clone(), "g1", SyncPriority::Normal)
        .await
        .unwrap();

    // Alice deletes the note; bob picks up the tombstone on his next pass.
    let note = alice.engine.store().get("note-1").await.unwrap().unwrap();
    alice
        .engine
        .record_local(Some(&note), None, 4_000)
        .await
        .unwrap();

    bob.orch
        .request_sync(ch_b, "g1", SyncPriority::Normal)
        .await
        .unwrap();

    assert!(bob.engine.store().get("note-1").await.unwrap().is_none());
    assert_eq!(
        alice.engine.tree().root_hash("g1").await.unwrap(),
        bob.engine.tree().root_hash("g1").await.unwrap()
    );
}
