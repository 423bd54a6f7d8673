//! Pairwise operational transform for concurrent operations
//!
//! Given two concurrent operations, produce a transformed pair whose
//! application in either order yields the same tree. Every decision depends
//! only on the operation kinds and the total priority order
//! ([`Operation::priority_cmp`]), so `transform(b, a)` is always the mirror
//! image of `transform(a, b)`.

use super::operation::{Operation, OperationKind, UpdatePayload};

/// The transformed pair, in argument order
#[derive(Clone, Debug, PartialEq)]
pub struct TransformResult {
    pub op1: Operation,
    pub op2: Operation,
}

impl TransformResult {
    fn identity(op1: &Operation, op2: &Operation) -> Self {
        Self {
            op1: op1.clone(),
            op2: op2.clone(),
        }
    }

    /// Whether the transform rewrote either side
    pub fn changed(&self, op1: &Operation, op2: &Operation) -> bool {
        &self.op1 != op1 || &self.op2 != op2
    }
}

const TARGET_DELETED: &str = "target deleted by concurrent operation";
const PARENT_DELETED: &str = "parent deleted by concurrent operation";
const DUPLICATE_DELETE: &str = "node already deleted by concurrent delete";
const SUPERSEDED_MOVE: &str = "superseded by concurrent move";
const DUPLICATE_CREATE: &str = "node id created concurrently by another replica";
const CREATE_PENDING: &str = "cannot delete a node that is still being created";
const FIELDS_OVERWRITTEN: &str = "all fields overwritten by concurrent update";
const MOVE_CYCLE: &str = "concurrent move would create a cycle";

/// Wire-level transformer. Stateless.
#[derive(Clone, Debug, Default)]
pub struct OperationTransformer;

impl OperationTransformer {
    pub fn new() -> Self {
        Self
    }

    /// Same target, parent/child, or siblings under the same parent
    pub fn are_related(a: &Operation, b: &Operation) -> bool {
        if a.target_id == b.target_id {
            return true;
        }
        let pa = a.parent_id();
        let pb = b.parent_id();
        pa == Some(&b.target_id) || pb == Some(&a.target_id) || (pa.is_some() && pa == pb)
    }

    pub fn transform(&self, op1: &Operation, op2: &Operation) -> TransformResult {
        if op1.is_noop() || op2.is_noop() || !Self::are_related(op1, op2) {
            return TransformResult::identity(op1, op2);
        }
        let result = if op1.target_id == op2.target_id {
            self.transform_same_target(op1, op2)
        } else {
            self.transform_structural(op1, op2)
        };
        if result.changed(op1, op2) {
            log::debug!(
                "Transformed {} {} / {} {} on {}",
                op1.operation_type(),
                op1.id,
                op2.operation_type(),
                op2.id,
                op1.target_id
            );
        }
        result
    }

    fn transform_same_target(&self, op1: &Operation, op2: &Operation) -> TransformResult {
        use OperationKind::*;

        match (&op1.kind, &op2.kind) {
            (Update(a), Update(b)) => merge_updates(op1, a, op2, b),

            // Delete always wins over edits of the same node
            (Update(_), Delete(_)) | (Move(_), Delete(_)) => TransformResult {
                op1: op1.to_noop(TARGET_DELETED),
                op2: op2.clone(),
            },
            (Delete(_), Update(_)) | (Delete(_), Move(_)) => TransformResult {
                op1: op1.clone(),
                op2: op2.to_noop(TARGET_DELETED),
            },

            (Delete(_), Delete(_)) => keep_winner(op1, op2, DUPLICATE_DELETE),
            (Move(_), Move(_)) => keep_winner(op1, op2, SUPERSEDED_MOVE),
            (Create(_), Create(_)) => keep_winner(op1, op2, DUPLICATE_CREATE),

            (Create(_), Delete(_)) => TransformResult {
                op1: op1.clone(),
                op2: op2.to_noop(CREATE_PENDING),
            },
            (Delete(_), Create(_)) => TransformResult {
                op1: op1.to_noop(CREATE_PENDING),
                op2: op2.clone(),
            },

            // Independent aspects of the node
            _ => TransformResult::identity(op1, op2),
        }
    }

    fn transform_structural(&self, op1: &Operation, op2: &Operation) -> TransformResult {
        use OperationKind::*;

        match (&op1.kind, &op2.kind) {
            (Delete(_), _) if op2.parent_id() == Some(&op1.target_id) => TransformResult {
                op1: op1.clone(),
                op2: op2.to_noop(PARENT_DELETED),
            },
            (_, Delete(_)) if op1.parent_id() == Some(&op2.target_id) => TransformResult {
                op1: op1.to_noop(PARENT_DELETED),
                op2: op2.clone(),
            },
            // a under b while b goes under a
            (Move(a), Move(b))
                if a.parent_id.as_ref() == Some(&op2.target_id)
                    && b.parent_id.as_ref() == Some(&op1.target_id) =>
            {
                keep_winner(op1, op2, MOVE_CYCLE)
            }
            _ => TransformResult::identity(op1, op2),
        }
    }
}

fn keep_winner(op1: &Operation, op2: &Operation, reason: &str) -> TransformResult {
    if op1.has_priority_over(op2) {
        TransformResult {
            op1: op1.clone(),
            op2: op2.to_noop(reason),
        }
    } else {
        TransformResult {
            op1: op1.to_noop(reason),
            op2: op2.clone(),
        }
    }
}

/// Higher-priority update keeps every field; the other keeps only the fields
/// the winner does not touch, or becomes a noop if none are left.
fn merge_updates(
    op1: &Operation,
    a: &UpdatePayload,
    op2: &Operation,
    b: &UpdatePayload,
) -> TransformResult {
    let narrow = |loser: &Operation, mine: &UpdatePayload, theirs: &UpdatePayload| {
        let fields: std::collections::BTreeMap<_, _> = mine
            .fields
            .iter()
            .filter(|(k, _)| !theirs.contains(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if fields.is_empty() {
            loser.to_noop(FIELDS_OVERWRITTEN)
        } else {
            Operation {
                kind: OperationKind::Update(UpdatePayload { fields }),
                ..loser.clone()
            }
        }
    };

    if op1.has_priority_over(op2) {
        TransformResult {
            op1: op1.clone(),
            op2: narrow(op2, b, a),
        }
    } else {
        TransformResult {
            op1: narrow(op1, a, b),
            op2: op2.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{CreatePayload, MovePayload, OperationType};
    use crate::mindmap::{DocumentStore, InMemoryDocumentStore, MindMap, MindMapNode, ROOT_ID};
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn base() -> MindMap {
        MindMap::new("m", "Plan").with_root(
            MindMapNode::new(ROOT_ID, "Root")
                .with_child(MindMapNode::new("a", "A").with_child(MindMapNode::new("a1", "A1")))
                .with_child(MindMapNode::new("b", "B")),
        )
    }

    fn apply_in_order(ops: &[&Operation]) -> String {
        let mut store = InMemoryDocumentStore::new(base());
        for op in ops {
            store
                .apply_operation(op)
                .unwrap_or_else(|e| panic!("{} failed: {}", op.operation_type(), e));
        }
        store.snapshot().digest()
    }

    /// Both application orders of the transformed pair reach the same tree
    fn assert_converges(op1: &Operation, op2: &Operation) {
        let t = OperationTransformer::new();
        let forward = t.transform(op1, op2);
        let backward = t.transform(op2, op1);

        assert_eq!(forward.op1, backward.op2, "transform is not symmetric");
        assert_eq!(forward.op2, backward.op1, "transform is not symmetric");

        let one = apply_in_order(&[&forward.op1, &forward.op2]);
        let two = apply_in_order(&[&backward.op1, &backward.op2]);
        assert_eq!(one, two);
    }

    fn update(user: &str, secs: i64, target: &str, fields: &[(&str, serde_json::Value)]) -> Operation {
        let mut payload = UpdatePayload::new();
        for (k, v) in fields {
            payload = payload.with(*k, v.clone());
        }
        Operation::update("m", user, target, payload).with_timestamp(at(secs))
    }

    #[test]
    fn test_relatedness() {
        let same = Operation::delete("m", "u", "a");
        let child = Operation::create("m", "u", "n", CreatePayload::new("a", "x"));
        let sibling = Operation::create("m", "v", "k", CreatePayload::new("a", "y"));
        let other = Operation::delete("m", "u", "b");

        assert!(OperationTransformer::are_related(&same, &child));
        assert!(OperationTransformer::are_related(&child, &sibling));
        assert!(!OperationTransformer::are_related(&child, &other));
        // Two deletes with no parent info are only related on the same target
        assert!(!OperationTransformer::are_related(&same, &other));
    }

    #[test]
    fn test_update_update_field_merge() {
        let older = update("alice", 0, "a", &[("text", json!("Alice")), ("color", json!("red"))]);
        let newer = update("bob", 1, "a", &[("text", json!("Bob")), ("size", json!(3))]);

        let r = OperationTransformer::new().transform(&older, &newer);
        assert_eq!(r.op2, newer);
        match &r.op1.kind {
            OperationKind::Update(p) => {
                assert_eq!(p.fields.len(), 1);
                assert_eq!(p.fields.get("color"), Some(&json!("red")));
            }
            other => panic!("expected narrowed update, got {:?}", other),
        }
        assert_converges(&older, &newer);
    }

    #[test]
    fn test_update_fully_overlapped_becomes_noop() {
        let older = update("alice", 0, "a", &[("text", json!("Alice"))]);
        let newer = update("bob", 1, "a", &[("text", json!("Bob"))]);
        let r = OperationTransformer::new().transform(&older, &newer);
        assert!(r.op1.is_noop());
        assert_converges(&older, &newer);
    }

    #[test]
    fn test_update_tie_broken_by_user_id() {
        let alice = update("alice", 0, "a", &[("text", json!("Alice"))]);
        let bob = update("bob", 0, "a", &[("text", json!("Bob"))]);
        let r = OperationTransformer::new().transform(&bob, &alice);
        assert!(r.op1.is_noop());
        assert_eq!(r.op2, alice);
    }

    #[test]
    fn test_delete_beats_update() {
        let del = Operation::delete("m", "alice", "a").with_timestamp(at(0));
        let upd = update("bob", 5, "a", &[("text", json!("late edit"))]);
        let r = OperationTransformer::new().transform(&upd, &del);
        assert!(r.op1.is_noop());
        assert_eq!(r.op2, del);
        assert_converges(&del, &upd);
    }

    #[test]
    fn test_double_delete_keeps_one() {
        let d1 = Operation::delete("m", "alice", "a").with_timestamp(at(0));
        let d2 = Operation::delete("m", "bob", "a").with_timestamp(at(1));
        let r = OperationTransformer::new().transform(&d1, &d2);
        assert_eq!([r.op1.is_noop(), r.op2.is_noop()].iter().filter(|x| **x).count(), 1);
        assert_converges(&d1, &d2);
    }

    #[test]
    fn test_move_move_winner_takes_all() {
        let m1 = Operation::move_node(
            "m",
            "alice",
            "a1",
            MovePayload {
                parent_id: Some("b".into()),
                position: Some(crate::mindmap::Position::new(10.0, 10.0)),
                index: None,
            },
        )
        .with_timestamp(at(0));
        let m2 = Operation::move_node("m", "bob", "a1", MovePayload::to_position(99.0, 0.0))
            .with_timestamp(at(2));
        let r = OperationTransformer::new().transform(&m1, &m2);
        assert!(r.op1.is_noop());
        assert_eq!(r.op2, m2);
        assert_converges(&m1, &m2);
    }

    #[test]
    fn test_update_and_move_both_kept() {
        let upd = update("alice", 0, "a", &[("text", json!("Renamed"))]);
        let mv = Operation::move_node("m", "bob", "a", MovePayload::to_parent("b")).with_timestamp(at(1));
        let r = OperationTransformer::new().transform(&upd, &mv);
        assert_eq!(r.op1, upd);
        assert_eq!(r.op2, mv);
        assert_converges(&upd, &mv);
    }

    #[test]
    fn test_duplicate_create() {
        let c1 = Operation::create("m", "alice", "n", CreatePayload::new("a", "from alice"))
            .with_timestamp(at(0));
        let c2 = Operation::create("m", "bob", "n", CreatePayload::new("b", "from bob"))
            .with_timestamp(at(1));
        let r = OperationTransformer::new().transform(&c1, &c2);
        assert!(r.op1.is_noop());
        assert_eq!(r.op2, c2);
        assert_converges(&c1, &c2);
    }

    #[test]
    fn test_distinct_sibling_creates_pass_through() {
        let c1 = Operation::create("m", "alice", "n1", CreatePayload::new("a", "one"));
        let c2 = Operation::create("m", "bob", "n2", CreatePayload::new("a", "two"));
        let r = OperationTransformer::new().transform(&c1, &c2);
        assert!(!r.changed(&c1, &c2));
    }

    #[test]
    fn test_delete_of_node_being_created() {
        let create = Operation::create("m", "alice", "n", CreatePayload::new("a", "new"))
            .with_timestamp(at(5));
        let delete = Operation::delete("m", "bob", "n").with_timestamp(at(9));
        let r = OperationTransformer::new().transform(&delete, &create);
        assert!(r.op1.is_noop());
        assert_eq!(r.op2, create);
        assert_converges(&create, &delete);
    }

    #[test]
    fn test_create_under_deleted_parent_is_noop() {
        let delete = Operation::delete("m", "alice", "a").with_timestamp(at(0));
        let create = Operation::create("m", "bob", "n", CreatePayload::new("a", "child"))
            .with_timestamp(at(1));
        let r = OperationTransformer::new().transform(&create, &delete);
        assert!(r.op1.is_noop());
        match &r.op1.kind {
            OperationKind::Noop(p) => assert_eq!(p.original, OperationType::Create),
            _ => unreachable!(),
        }
        assert_converges(&delete, &create);
    }

    #[test]
    fn test_crossing_moves_do_not_cycle() {
        let m1 = Operation::move_node("m", "alice", "a", MovePayload::to_parent("b")).with_timestamp(at(0));
        let m2 = Operation::move_node("m", "bob", "b", MovePayload::to_parent("a")).with_timestamp(at(1));
        let r = OperationTransformer::new().transform(&m1, &m2);
        assert!(r.op1.is_noop());
        assert_converges(&m1, &m2);
    }

    #[test]
    fn test_unrelated_pass_through() {
        let u1 = update("alice", 0, "a", &[("text", json!("x"))]);
        let u2 = update("bob", 0, "b", &[("text", json!("y"))]);
        let r = OperationTransformer::new().transform(&u1, &u2);
        assert_eq!(r.op1, u1);
        assert_eq!(r.op2, u2);
    }
}
