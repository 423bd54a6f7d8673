//! Multi-replica editing over the loopback network
//!
//! Every test follows the same rhythm: each replica submits its edits, all
//! outbound queues drain, then every replica integrates whatever arrived.
//! Replicas must end up with the same document.
//!
//! Run with:
//!   cargo test --test concurrent_editing

use std::sync::Arc;

use mindsync::convergent::{
    CreatePayload, DeletePayload, MovePayload, OperationKind, StrategyKind, UpdatePayload,
};
use mindsync::mindmap::{MindMap, MindMapNode, Position, ROOT_ID};
use mindsync::sync::{
    CollaborationSession, LoopbackNetwork, LoopbackTransport, QueueError, RemoteOutcome,
    SessionConfig,
};
use mindsync::Operation;
use serde_json::json;
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Replica {
    session: CollaborationSession,
    inbox: mpsc::UnboundedReceiver<Operation>,
    transport: Arc<LoopbackTransport>,
}

fn base_map() -> MindMap {
    MindMap::new("plan", "Launch plan").with_root(
        MindMapNode::new(ROOT_ID, "Launch")
            .with_child(
                MindMapNode::new("n", "Marketing")
                    .with_child(MindMapNode::new("c1", "Blog post"))
                    .with_child(MindMapNode::new("c2", "Newsletter")),
            )
            .with_child(MindMapNode::new("k", "Engineering").at(200.0, 0.0)),
    )
}

fn replicas(net: &Arc<LoopbackNetwork>, names: &[&str]) -> Vec<Replica> {
    let _ = env_logger::builder().is_test(true).try_init();
    names
        .iter()
        .map(|name| {
            let (transport, inbox) = net.connect(*name);
            let session = CollaborationSession::new(
                *name,
                base_map(),
                transport.clone(),
                SessionConfig::default(),
            );
            Replica {
                session,
                inbox,
                transport,
            }
        })
        .collect()
}

/// Drain every outbound queue, then integrate every inbox
async fn settle(replicas: &mut [Replica]) -> Vec<Vec<RemoteOutcome>> {
    for replica in replicas.iter() {
        replica.session.flush().await;
    }
    replicas
        .iter_mut()
        .map(|r| r.session.receive_pending(&mut r.inbox))
        .collect()
}

fn assert_converged(replicas: &[Replica]) {
    let first = replicas[0].session.digest();
    for replica in &replicas[1..] {
        assert_eq!(
            replica.session.digest(),
            first,
            "{} diverged from {}",
            replica.session.replica(),
            replicas[0].session.replica()
        );
    }
}

fn text(value: &str) -> OperationKind {
    OperationKind::Update(UpdatePayload::new().with("text", json!(value)))
}

fn delete() -> OperationKind {
    OperationKind::Delete(DeletePayload::default())
}

fn child_ids(replica: &Replica, parent: &str) -> Vec<String> {
    replica
        .session
        .snapshot()
        .find_node(parent)
        .map(|n| n.children.iter().map(|c| c.id.clone()).collect())
        .unwrap_or_default()
}

fn position(replica: &Replica, id: &str) -> Position {
    replica.session.snapshot().find_node(id).unwrap().position
}

fn node_text(replica: &Replica, id: &str) -> String {
    replica.session.snapshot().find_node(id).unwrap().text.clone()
}

/// Alice and bob race one edit each while bob is cut off. Bob integrates
/// alice's edit while his own is still queued, then reconnects and sends it.
async fn race_with_offline_bob(
    net: &Arc<LoopbackNetwork>,
    r: &mut [Replica],
    alice: (OperationKind, &str),
    bob: (OperationKind, &str),
    bob_first: bool,
) {
    net.set_reachable("bob", false);
    r[1].session.queue().set_online(false);

    if bob_first {
        r[1].session.submit(bob.0, bob.1).unwrap();
        r[0].session.submit(alice.0, alice.1).unwrap();
    } else {
        r[0].session.submit(alice.0, alice.1).unwrap();
        r[1].session.submit(bob.0, bob.1).unwrap();
    }
    r[0].session.flush().await;
    assert_eq!(r[1].session.queue().status().queued, 1);

    net.set_reachable("bob", true);
    let replica = &mut r[1];
    replica.session.receive_pending(&mut replica.inbox);
    replica.session.queue().set_online(true);
    settle(r).await;
    assert_eq!(r[1].session.queue().status().queued, 0);
    assert_converged(r);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_concurrent_updates_merge_fields() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session
        .submit(
            OperationKind::Update(
                UpdatePayload::new()
                    .with("text", json!("Platform"))
                    .with("collapsed", json!(true)),
            ),
            "k",
        )
        .unwrap();
    r[1].session.submit(text("Infrastructure"), "k").unwrap();
    settle(&mut r).await;

    assert_converged(&r);
    let snapshot = r[0].session.snapshot();
    let node = snapshot.find_node("k").unwrap();
    assert!(node.collapsed);
    assert!(node.text == "Platform" || node.text == "Infrastructure");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sibling_creates_are_spaced() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session
        .submit(
            OperationKind::Create(CreatePayload::new(ROOT_ID, "Hiring").at(100.0, 100.0)),
            "s1",
        )
        .unwrap();
    r[1].session
        .submit(
            OperationKind::Create(CreatePayload::new(ROOT_ID, "Budget").at(110.0, 100.0)),
            "s2",
        )
        .unwrap();
    settle(&mut r).await;

    for replica in &r {
        let s1 = position(replica, "s1");
        let s2 = position(replica, "s2");
        assert!(s1.distance_to(&s2) >= 50.0 - 1e-9, "{:?} {:?}", s1, s2);
    }
    assert_eq!(position(&r[0], "s1"), position(&r[1], "s1"));
    assert_eq!(position(&r[0], "s2"), position(&r[1], "s2"));
    assert_eq!(r[0].session.resolver().stats().get(&StrategyKind::PositionAdjustment), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_same_id_creates_keep_one_node() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session
        .submit(OperationKind::Create(CreatePayload::new(ROOT_ID, "From alice")), "x")
        .unwrap();
    r[1].session
        .submit(OperationKind::Create(CreatePayload::new(ROOT_ID, "From bob")), "x")
        .unwrap();
    settle(&mut r).await;

    assert_converged(&r);
    let count = child_ids(&r[0], ROOT_ID).iter().filter(|id| *id == "x").count();
    assert_eq!(count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_delete_keeps_concurrently_edited_children() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session.submit(delete(), "n").unwrap();
    r[1].session.submit(text("Long-form blog post"), "c1").unwrap();
    let outcomes = settle(&mut r).await;

    assert_eq!(outcomes[0], vec![RemoteOutcome::Applied(StrategyKind::PreserveChildren)]);
    assert_eq!(outcomes[1], vec![RemoteOutcome::Applied(StrategyKind::PreserveChildren)]);
    assert_converged(&r);

    assert_eq!(child_ids(&r[0], ROOT_ID), vec!["c1", "c2", "k"]);
    assert_eq!(
        r[1].session.snapshot().find_node("c1").unwrap().text,
        "Long-form blog post"
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete_keeps_concurrently_created_child() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session.submit(delete(), "n").unwrap();
    r[1].session
        .submit(OperationKind::Create(CreatePayload::new("n", "Podcast")), "c3")
        .unwrap();
    settle(&mut r).await;

    assert_converged(&r);
    assert_eq!(child_ids(&r[1], ROOT_ID), vec!["c1", "c2", "c3", "k"]);
}

#[tokio::test(start_paused = true)]
async fn test_double_delete_is_harmless() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session.submit(delete(), "k").unwrap();
    r[1].session.submit(delete(), "k").unwrap();
    let outcomes = settle(&mut r).await;

    for outcome in outcomes.iter().flatten() {
        assert_eq!(*outcome, RemoteOutcome::Discarded(StrategyKind::FirstDeleteWins));
    }
    assert_converged(&r);
    assert!(r[0].session.snapshot().find_node("k").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_moves_average_positions() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob", "carol"]);

    for (replica, x) in r.iter_mut().zip([0.0, 10.0, 20.0]) {
        replica
            .session
            .submit(OperationKind::Move(MovePayload::to_position(x, 0.0)), "k")
            .unwrap();
    }
    settle(&mut r).await;

    assert_converged(&r);
    for replica in &r {
        assert_eq!(position(replica, "k"), Position::new(10.0, 0.0));
    }
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_is_idempotent() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    r[0].session.submit(text("Platform"), "k").unwrap();
    r[0].session.flush().await;
    let op = r[1].inbox.recv().await.unwrap();

    assert_eq!(
        r[1].session.receive_remote(op.clone()),
        RemoteOutcome::Applied(StrategyKind::NoConflict)
    );
    assert_eq!(r[1].session.receive_remote(op), RemoteOutcome::Duplicate);
    assert_converged(&r);
}

#[tokio::test(start_paused = true)]
async fn test_offline_replica_catches_up() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    net.set_reachable("bob", false);
    r[1].session.queue().set_online(false);

    r[0].session.submit(text("Platform"), "k").unwrap();
    r[1].session.submit(text("Infrastructure"), "k").unwrap();
    r[1].session
        .submit(OperationKind::Move(MovePayload::to_parent("n")), "k")
        .unwrap();
    r[0].session.flush().await;
    assert!(r[1].inbox.try_recv().is_err());
    assert_eq!(r[1].session.queue().status().queued, 2);

    // Inbound first, while bob's edits are still queued
    net.set_reachable("bob", true);
    let bob = &mut r[1];
    bob.session.receive_pending(&mut bob.inbox);
    bob.session.queue().set_online(true);
    settle(&mut r).await;

    assert_converged(&r);
    assert_eq!(child_ids(&r[0], "n"), vec!["c1", "c2", "k"]);
}

#[tokio::test(start_paused = true)]
async fn test_queued_update_that_loses_is_overwritten() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    // Bob's edit is older, so alice's wins on both replicas
    race_with_offline_bob(&net, &mut r, (text("Platform"), "k"), (text("Infrastructure"), "k"), true)
        .await;
    assert_eq!(node_text(&r[0], "k"), "Platform");
    assert_eq!(node_text(&r[1], "k"), "Platform");
}

#[tokio::test(start_paused = true)]
async fn test_queued_move_meets_remote_move_halfway() {
    for bob_first in [true, false] {
        let net = LoopbackNetwork::new();
        let mut r = replicas(&net, &["alice", "bob"]);

        race_with_offline_bob(
            &net,
            &mut r,
            (OperationKind::Move(MovePayload::to_position(0.0, 0.0)), "k"),
            (OperationKind::Move(MovePayload::to_position(100.0, 0.0)), "k"),
            bob_first,
        )
        .await;
        for replica in &r {
            assert_eq!(position(replica, "k"), Position::new(50.0, 0.0));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_create_with_taken_id_is_replaced() {
    for bob_first in [true, false] {
        let net = LoopbackNetwork::new();
        let mut r = replicas(&net, &["alice", "bob"]);

        race_with_offline_bob(
            &net,
            &mut r,
            (OperationKind::Create(CreatePayload::new(ROOT_ID, "From alice")), "x"),
            (OperationKind::Create(CreatePayload::new(ROOT_ID, "From bob")), "x"),
            bob_first,
        )
        .await;
        let count = child_ids(&r[1], ROOT_ID).iter().filter(|id| *id == "x").count();
        assert_eq!(count, 1);
        if bob_first {
            assert_eq!(node_text(&r[1], "x"), "From alice");
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_create_survives_delete_of_its_parent() {
    for bob_first in [true, false] {
        let net = LoopbackNetwork::new();
        let mut r = replicas(&net, &["alice", "bob"]);

        race_with_offline_bob(
            &net,
            &mut r,
            (delete(), "n"),
            (OperationKind::Create(CreatePayload::new("n", "Podcast")), "c3"),
            bob_first,
        )
        .await;
        assert_eq!(child_ids(&r[1], ROOT_ID), vec!["c1", "c2", "c3", "k"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_queued_delete_keeps_remotely_created_child() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    race_with_offline_bob(
        &net,
        &mut r,
        (OperationKind::Create(CreatePayload::new("n", "Podcast")), "c3"),
        (delete(), "n"),
        true,
    )
    .await;
    assert_eq!(child_ids(&r[0], ROOT_ID), vec!["c1", "c2", "c3", "k"]);
}

#[tokio::test(start_paused = true)]
async fn test_mixed_deletes_keep_children() {
    let preserve = || {
        OperationKind::Delete(DeletePayload {
            preserve_children: true,
        })
    };
    for alice_cascades in [true, false] {
        let net = LoopbackNetwork::new();
        let mut r = replicas(&net, &["alice", "bob"]);

        let (for_alice, for_bob) = if alice_cascades {
            (delete(), preserve())
        } else {
            (preserve(), delete())
        };
        r[0].session.submit(for_alice, "n").unwrap();
        r[1].session.submit(for_bob, "n").unwrap();
        let outcomes = settle(&mut r).await;
        assert!(outcomes
            .iter()
            .flatten()
            .any(|o| *o == RemoteOutcome::Applied(StrategyKind::PreserveChildren)));

        assert_converged(&r);
        assert_eq!(child_ids(&r[0], ROOT_ID), vec!["c1", "c2", "k"]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_send_failures_are_retried() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    net.fail_next("alice", 2);
    let pending = r[0].session.submit(text("Platform"), "k").unwrap();
    let delivered = pending.wait().await.unwrap();
    assert_eq!(delivered.retry_count, 2);
    assert_eq!(r[0].transport.attempts(), 3);

    settle(&mut r).await;
    assert_converged(&r);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_park_the_operation() {
    let net = LoopbackNetwork::new();
    let mut r = replicas(&net, &["alice", "bob"]);

    net.fail_next("alice", 10);
    let pending = r[0].session.submit(text("Platform"), "k").unwrap();
    let id = pending.id();
    match pending.wait().await {
        Err(QueueError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 4),
        other => panic!("expected exhausted retries, got {:?}", other),
    }
    assert_eq!(r[0].transport.attempts(), 4);
    assert_eq!(r[0].session.queue().conflicts().len(), 1);

    // Once the link recovers the parked edit can be sent again
    net.fail_next("alice", 0);
    r[0].session.queue().requeue_conflict(&id).unwrap().wait().await.unwrap();
    settle(&mut r).await;
    assert_converged(&r);
}
