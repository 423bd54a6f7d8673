//! Convergent editing core
//!
//! Causality tracking, the operation model, and the two reconciliation
//! layers: pairwise transformation of concurrent operations and tree-aware
//! conflict resolution.

mod vector_clock;
mod operation;
mod transform;
mod resolver;

pub use vector_clock::{VectorClock, ClockOrdering, ReplicaId};
pub use operation::{
    Operation, OperationKind, OperationType, OperationStatus, OperationError, TargetType, OpId,
    NodeId, MindMapId, CreatePayload, UpdatePayload, DeletePayload, MovePayload, NoopPayload,
};
pub use transform::{OperationTransformer, TransformResult};
pub use resolver::{
    ConflictResolver, ResolverConfig, ResolutionStrategy, Resolution, ResolutionRecord,
    ResolveError, StrategyKind, PositionAdjustment, DeletedSubtree, Restoration,
    FieldMergeStrategy, CreateStrategy, DeleteStrategy, MoveAverageStrategy,
};
