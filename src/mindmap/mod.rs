//! Mind map documents
//!
//! The tree model the reconciliation core operates on, its relational
//! projection, and the store that applies resolved operations to it.

pub mod convert;
mod node;
mod store;

pub use convert::{
    hierarchical_to_relational, relational_to_hierarchical, validate_relational, ConvertError,
    RelationalMindMap,
};
pub use node::{
    is_child_of_node, is_descendant_of, node_exists, Attachment, Connection, MapLink, MindMap,
    MindMapNode, Position, ROOT_ID,
};
pub use store::{DocumentStore, InMemoryDocumentStore, StoreError};
