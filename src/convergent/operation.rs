//! Operations: the unit of change on a mind map
//!
//! An `Operation` carries one edit to one node together with the metadata the
//! reconciliation layers need: a globally unique id for idempotent delivery,
//! the author replica, a wall-clock timestamp used only for tie-breaking, and
//! the vector clock the author held when it was generated.
//!
//! The payload is a closed enum over the five operation kinds. On the wire an
//! operation is the flat object
//! `{ id, operation_type, target_type, target_id, mindmap_id, data, userId,
//! timestamp, vector_clock, status, retryCount }`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::vector_clock::{ClockOrdering, ReplicaId, VectorClock};
use crate::mindmap::Position;

/// Unique identifier for an operation
pub type OpId = Uuid;

/// Identifier of a node within one mind map
pub type NodeId = String;

/// Identifier of a mind map document
pub type MindMapId = String;

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("Invalid {operation_type} payload: {source}")]
    InvalidPayload {
        operation_type: OperationType,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Payload-less discriminant of an operation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
    Noop,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
            OperationType::Noop => "noop",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What kind of entity an operation targets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Node,
}

/// Delivery state of an operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

// === Payloads ===

/// Full node payload for a create
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CreatePayload {
    pub parent_id: NodeId,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Index among the parent's children (appended when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, Value>,
    #[serde(default)]
    pub collapsed: bool,
}

impl CreatePayload {
    pub fn new(parent_id: impl Into<NodeId>, text: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Some(Position::new(x, y));
        self
    }
}

/// Field -> value mapping for an update.
///
/// `text`, `collapsed`, `position`, `x` and `y` address node properties;
/// everything else is a style attribute.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdatePayload {
    pub fields: BTreeMap<String, Value>,
}

impl UpdatePayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    /// Re-parent children to the deleted node's parent instead of cascading
    #[serde(default, rename = "preserveChildren")]
    pub preserve_children: bool,
}

/// New parent and/or coordinates for a move
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MovePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl MovePayload {
    pub fn to_parent(parent_id: impl Into<NodeId>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Default::default()
        }
    }

    pub fn to_position(x: f64, y: f64) -> Self {
        Self {
            position: Some(Position::new(x, y)),
            ..Default::default()
        }
    }
}

/// An operation rewritten to have no effect, kept for audit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoopPayload {
    pub original: OperationType,
    pub reason: String,
}

/// The closed set of operation kinds
#[derive(Clone, Debug, PartialEq)]
pub enum OperationKind {
    Create(CreatePayload),
    Update(UpdatePayload),
    Delete(DeletePayload),
    Move(MovePayload),
    Noop(NoopPayload),
}

impl OperationKind {
    pub fn operation_type(&self) -> OperationType {
        match self {
            OperationKind::Create(_) => OperationType::Create,
            OperationKind::Update(_) => OperationType::Update,
            OperationKind::Delete(_) => OperationType::Delete,
            OperationKind::Move(_) => OperationType::Move,
            OperationKind::Noop(_) => OperationType::Noop,
        }
    }

    /// The parent referenced by the payload (create parent or move destination)
    pub fn parent_id(&self) -> Option<&NodeId> {
        match self {
            OperationKind::Create(p) => Some(&p.parent_id),
            OperationKind::Move(p) => p.parent_id.as_ref(),
            _ => None,
        }
    }

    /// Serialize the payload to the wire `data` value
    pub fn data(&self) -> Result<Value, OperationError> {
        // serde_json turns NaN into null, which no receiver can decode
        let position = match self {
            OperationKind::Create(p) => p.position,
            OperationKind::Move(p) => p.position,
            _ => None,
        };
        if let Some(p) = position {
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(OperationError::SerializationError(format!(
                    "non-finite position ({}, {})",
                    p.x, p.y
                )));
            }
        }

        let result = match self {
            OperationKind::Create(p) => serde_json::to_value(p),
            OperationKind::Update(p) => serde_json::to_value(p),
            OperationKind::Delete(p) => serde_json::to_value(p),
            OperationKind::Move(p) => serde_json::to_value(p),
            OperationKind::Noop(p) => serde_json::to_value(p),
        };
        result.map_err(|e| OperationError::SerializationError(e.to_string()))
    }

    /// Decode a payload from its wire `data` value
    pub fn from_data(operation_type: OperationType, data: Value) -> Result<Self, OperationError> {
        // An absent payload is an empty object for every kind that allows it
        let data = if data.is_null() {
            Value::Object(Default::default())
        } else {
            data
        };
        let invalid = |source: serde_json::Error| OperationError::InvalidPayload {
            operation_type,
            source,
        };
        Ok(match operation_type {
            OperationType::Create => OperationKind::Create(serde_json::from_value(data).map_err(invalid)?),
            OperationType::Update => OperationKind::Update(serde_json::from_value(data).map_err(invalid)?),
            OperationType::Delete => OperationKind::Delete(serde_json::from_value(data).map_err(invalid)?),
            OperationType::Move => OperationKind::Move(serde_json::from_value(data).map_err(invalid)?),
            OperationType::Noop => OperationKind::Noop(serde_json::from_value(data).map_err(invalid)?),
        })
    }
}

/// A single edit with its delivery and causality metadata
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "WireOperation")]
pub struct Operation {
    /// Globally unique, assigned once; the idempotence key
    pub id: OpId,
    pub kind: OperationKind,
    pub target_type: TargetType,
    pub target_id: NodeId,
    pub mindmap_id: MindMapId,
    /// Author replica
    pub user_id: ReplicaId,
    /// Wall-clock time, for tie-breaking only
    pub timestamp: DateTime<Utc>,
    /// Causal stamp at creation
    pub vector_clock: VectorClock,
    pub status: OperationStatus,
    pub retry_count: u32,
}

impl Operation {
    /// Create a fresh, unstamped operation
    pub fn new(
        mindmap_id: impl Into<MindMapId>,
        user_id: impl Into<ReplicaId>,
        target_id: impl Into<NodeId>,
        kind: OperationKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            target_type: TargetType::Node,
            target_id: target_id.into(),
            mindmap_id: mindmap_id.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            vector_clock: VectorClock::new(),
            status: OperationStatus::Pending,
            retry_count: 0,
        }
    }

    pub fn create(
        mindmap_id: impl Into<MindMapId>,
        user_id: impl Into<ReplicaId>,
        target_id: impl Into<NodeId>,
        payload: CreatePayload,
    ) -> Self {
        Self::new(mindmap_id, user_id, target_id, OperationKind::Create(payload))
    }

    pub fn update(
        mindmap_id: impl Into<MindMapId>,
        user_id: impl Into<ReplicaId>,
        target_id: impl Into<NodeId>,
        payload: UpdatePayload,
    ) -> Self {
        Self::new(mindmap_id, user_id, target_id, OperationKind::Update(payload))
    }

    pub fn delete(
        mindmap_id: impl Into<MindMapId>,
        user_id: impl Into<ReplicaId>,
        target_id: impl Into<NodeId>,
    ) -> Self {
        Self::new(
            mindmap_id,
            user_id,
            target_id,
            OperationKind::Delete(DeletePayload::default()),
        )
    }

    pub fn move_node(
        mindmap_id: impl Into<MindMapId>,
        user_id: impl Into<ReplicaId>,
        target_id: impl Into<NodeId>,
        payload: MovePayload,
    ) -> Self {
        Self::new(mindmap_id, user_id, target_id, OperationKind::Move(payload))
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_clock(mut self, vector_clock: VectorClock) -> Self {
        self.vector_clock = vector_clock;
        self
    }

    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    pub fn parent_id(&self) -> Option<&NodeId> {
        self.kind.parent_id()
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.kind, OperationKind::Noop(_))
    }

    /// The same operation (same id and metadata) rewritten to have no effect.
    pub fn to_noop(&self, reason: impl Into<String>) -> Operation {
        let original = match &self.kind {
            OperationKind::Noop(p) => p.original,
            other => other.operation_type(),
        };
        Operation {
            kind: OperationKind::Noop(NoopPayload {
                original,
                reason: reason.into(),
            }),
            ..self.clone()
        }
    }

    /// Total priority order used for every deterministic tie-break.
    ///
    /// `Greater` means `self` wins: later timestamp first, then the
    /// lexicographically smaller user id, then the smaller operation id.
    pub fn priority_cmp(&self, other: &Operation) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| other.user_id.cmp(&self.user_id))
            .then_with(|| other.id.cmp(&self.id))
    }

    pub fn has_priority_over(&self, other: &Operation) -> bool {
        self.priority_cmp(other) == Ordering::Greater
    }

    /// Causal relation between the stamps of two operations
    pub fn causal_order(&self, other: &Operation) -> ClockOrdering {
        self.vector_clock.compare(&other.vector_clock)
    }

    pub fn is_concurrent_with(&self, other: &Operation) -> bool {
        self.causal_order(other) == ClockOrdering::Concurrent
    }
}

/// Flat wire representation of an operation
#[derive(Serialize, Deserialize)]
struct WireOperation {
    id: OpId,
    operation_type: OperationType,
    #[serde(default)]
    target_type: TargetType,
    target_id: NodeId,
    mindmap_id: MindMapId,
    #[serde(default)]
    data: Value,
    #[serde(rename = "userId")]
    user_id: ReplicaId,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    vector_clock: VectorClock,
    #[serde(default)]
    status: OperationStatus,
    #[serde(default, rename = "retryCount")]
    retry_count: u32,
}

impl TryFrom<WireOperation> for Operation {
    type Error = OperationError;

    fn try_from(wire: WireOperation) -> Result<Self, Self::Error> {
        Ok(Operation {
            id: wire.id,
            kind: OperationKind::from_data(wire.operation_type, wire.data)?,
            target_type: wire.target_type,
            target_id: wire.target_id,
            mindmap_id: wire.mindmap_id,
            user_id: wire.user_id,
            timestamp: wire.timestamp,
            vector_clock: wire.vector_clock,
            status: wire.status,
            retry_count: wire.retry_count,
        })
    }
}

impl Serialize for Operation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let data = self
            .kind
            .data()
            .map_err(<S::Error as serde::ser::Error>::custom)?;
        WireOperation {
            id: self.id,
            operation_type: self.operation_type(),
            target_type: self.target_type,
            target_id: self.target_id.clone(),
            mindmap_id: self.mindmap_id.clone(),
            data,
            user_id: self.user_id.clone(),
            timestamp: self.timestamp,
            vector_clock: self.vector_clock.clone(),
            status: self.status,
            retry_count: self.retry_count,
        }
        .serialize(serializer)
    }
}
