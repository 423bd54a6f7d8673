// Mindsync - concurrent-edit reconciliation for collaborative mind maps

pub mod convergent;
pub mod mindmap;
pub mod sync;

pub use convergent::{
    ConflictResolver, Operation, OperationKind, OperationTransformer, VectorClock,
};
pub use mindmap::{MindMap, MindMapNode};
pub use sync::{CollaborationSession, OperationQueue, SessionConfig};
