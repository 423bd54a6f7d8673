//! Document store: applies resolved operations to a mind map snapshot
//!
//! Snapshots are handed out as `Arc<MindMap>` and never mutated in place once
//! shared; applying an operation clones the map only if a reader still holds
//! the previous snapshot (`Arc::make_mut`). Application is idempotent keyed on
//! the operation id.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;

use super::node::{MindMap, MindMapNode, Position};
use crate::convergent::{
    CreatePayload, DeletePayload, MovePayload, NodeId, OpId, Operation, OperationKind,
    UpdatePayload,
};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Parent node not found: {0}")]
    ParentNotFound(NodeId),

    #[error("Node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("The root node cannot be deleted or moved")]
    RootImmutable,

    #[error("Moving {node} under {parent} would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },

    #[error("Operation targets map {found}, store holds {expected}")]
    WrongMindMap { expected: String, found: String },
}

/// The store a session applies resolved operations to
pub trait DocumentStore: Send + Sync {
    /// Current read-only snapshot
    fn snapshot(&self) -> Arc<MindMap>;

    /// Apply an already-resolved operation and return the new snapshot.
    ///
    /// Applying the same operation id twice is a no-op.
    fn apply_operation(&mut self, op: &Operation) -> Result<Arc<MindMap>, StoreError>;

    /// Whether an operation id has already been applied
    fn has_applied(&self, id: &OpId) -> bool;
}

/// In-memory copy-on-write store
pub struct InMemoryDocumentStore {
    current: Arc<MindMap>,
    applied: HashSet<OpId>,
}

impl InMemoryDocumentStore {
    pub fn new(map: MindMap) -> Self {
        Self {
            current: Arc::new(map),
            applied: HashSet::new(),
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn snapshot(&self) -> Arc<MindMap> {
        Arc::clone(&self.current)
    }

    fn apply_operation(&mut self, op: &Operation) -> Result<Arc<MindMap>, StoreError> {
        if self.applied.contains(&op.id) {
            log::debug!("Operation {} already applied, skipping", op.id);
            return Ok(self.snapshot());
        }
        if op.mindmap_id != self.current.id {
            return Err(StoreError::WrongMindMap {
                expected: self.current.id.clone(),
                found: op.mindmap_id.clone(),
            });
        }

        // Validate against the shared snapshot first so a rejected operation
        // never forces a copy.
        validate(&self.current, op)?;

        if !op.is_noop() {
            let map = Arc::make_mut(&mut self.current);
            apply_to_map(map, op)?;
            map.updated_at = Utc::now();
        }
        self.applied.insert(op.id);
        Ok(self.snapshot())
    }

    fn has_applied(&self, id: &OpId) -> bool {
        self.applied.contains(id)
    }
}

fn validate(map: &MindMap, op: &Operation) -> Result<(), StoreError> {
    let target = op.target_id.as_str();
    match &op.kind {
        OperationKind::Create(p) => {
            if map.find_node(target).is_some() {
                return Err(StoreError::DuplicateNode(op.target_id.clone()));
            }
            if map.find_node(&p.parent_id).is_none() {
                return Err(StoreError::ParentNotFound(p.parent_id.clone()));
            }
        }
        OperationKind::Update(_) => {
            if map.find_node(target).is_none() {
                return Err(StoreError::NodeNotFound(op.target_id.clone()));
            }
        }
        OperationKind::Delete(_) => {
            if target == map.root.id {
                return Err(StoreError::RootImmutable);
            }
            if map.find_node(target).is_none() {
                return Err(StoreError::NodeNotFound(op.target_id.clone()));
            }
        }
        OperationKind::Move(p) => {
            let node = map
                .find_node(target)
                .ok_or_else(|| StoreError::NodeNotFound(op.target_id.clone()))?;
            if let Some(parent_id) = &p.parent_id {
                if target == map.root.id {
                    return Err(StoreError::RootImmutable);
                }
                if map.find_node(parent_id).is_none() {
                    return Err(StoreError::ParentNotFound(parent_id.clone()));
                }
                if parent_id == target || node.find(parent_id).is_some() {
                    return Err(StoreError::Cycle {
                        node: op.target_id.clone(),
                        parent: parent_id.clone(),
                    });
                }
            }
        }
        OperationKind::Noop(_) => {}
    }
    Ok(())
}

fn apply_to_map(map: &mut MindMap, op: &Operation) -> Result<(), StoreError> {
    match &op.kind {
        OperationKind::Create(p) => apply_create(map, &op.target_id, p),
        OperationKind::Update(p) => apply_update(map, &op.target_id, p),
        OperationKind::Delete(p) => apply_delete(map, &op.target_id, p),
        OperationKind::Move(p) => apply_move(map, &op.target_id, p),
        OperationKind::Noop(_) => Ok(()),
    }
}

fn apply_create(map: &mut MindMap, id: &NodeId, p: &CreatePayload) -> Result<(), StoreError> {
    let parent = map
        .root
        .find_mut(&p.parent_id)
        .ok_or_else(|| StoreError::ParentNotFound(p.parent_id.clone()))?;

    let mut node = MindMapNode::new(id.clone(), p.text.clone());
    node.position = p.position.unwrap_or_default();
    node.style = p.style.clone();
    node.collapsed = p.collapsed;

    let index = p.index.unwrap_or(parent.children.len()).min(parent.children.len());
    parent.children.insert(index, node);
    Ok(())
}

fn apply_update(map: &mut MindMap, id: &NodeId, p: &UpdatePayload) -> Result<(), StoreError> {
    let node = map
        .root
        .find_mut(id)
        .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;

    for (field, value) in &p.fields {
        match field.as_str() {
            "text" => {
                node.text = match value {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                }
            }
            "collapsed" => node.collapsed = value.as_bool().unwrap_or(false),
            "position" => {
                if let Ok(position) = serde_json::from_value::<Position>(value.clone()) {
                    node.position = position;
                }
            }
            "x" => node.position.x = value.as_f64().unwrap_or(node.position.x),
            "y" => node.position.y = value.as_f64().unwrap_or(node.position.y),
            _ => {
                if value.is_null() {
                    node.style.remove(field);
                } else {
                    node.style.insert(field.clone(), value.clone());
                }
            }
        }
    }
    Ok(())
}

fn apply_delete(map: &mut MindMap, id: &NodeId, p: &DeletePayload) -> Result<(), StoreError> {
    let (parent_id, index, removed) = map
        .root
        .remove_descendant(id)
        .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;

    let mut gone = removed.descendant_ids();
    if p.preserve_children {
        // Children take the deleted node's slot under its parent
        let parent = map
            .root
            .find_mut(&parent_id)
            .ok_or_else(|| StoreError::ParentNotFound(parent_id.clone()))?;
        for (offset, child) in removed.children.into_iter().enumerate() {
            parent.children.insert(index + offset, child);
        }
        gone.clear();
    }
    gone.insert(id.clone());

    map.connections
        .retain(|c| !gone.contains(&c.from) && !gone.contains(&c.to));
    Ok(())
}

fn apply_move(map: &mut MindMap, id: &NodeId, p: &MovePayload) -> Result<(), StoreError> {
    if let Some(parent_id) = &p.parent_id {
        let already_there = map
            .root
            .find_parent(id)
            .map(|parent| &parent.id == parent_id)
            .unwrap_or(false);
        if !already_there || p.index.is_some() {
            let (_, _, node) = map
                .root
                .remove_descendant(id)
                .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
            let parent = map
                .root
                .find_mut(parent_id)
                .ok_or_else(|| StoreError::ParentNotFound(parent_id.clone()))?;
            let index = p.index.unwrap_or(parent.children.len()).min(parent.children.len());
            parent.children.insert(index, node);
        }
    }

    if let Some(position) = p.position {
        let node = map
            .root
            .find_mut(id)
            .ok_or_else(|| StoreError::NodeNotFound(id.clone()))?;
        node.position = position;
    }
    Ok(())
}
