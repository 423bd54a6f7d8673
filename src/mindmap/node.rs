//! The hierarchical mind map model
//!
//! A mind map is a single rooted tree of nodes plus a list of cross-links
//! between nodes. Sibling order in `children` is meaningful for layout.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::convergent::{MindMapId, NodeId};

/// Id reserved for the root node of every map
pub const ROOT_ID: &str = "root";

/// Canvas coordinates of a node
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_to(&self, other: &Position) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// A file attached to a node
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
}

/// A reference from a node to another mind map document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapLink {
    pub id: String,
    pub target_map_id: MindMapId,
    #[serde(default)]
    pub title: String,
}

/// A cross-link between two nodes of the same map (outside the tree edges)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub from: NodeId,
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindMapNode {
    pub id: NodeId,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub style: BTreeMap<String, Value>,
    #[serde(default)]
    pub children: Vec<MindMapNode>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub map_links: Vec<MapLink>,
    #[serde(default)]
    pub collapsed: bool,
}

impl MindMapNode {
    pub fn new(id: impl Into<NodeId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            position: Position::default(),
            style: BTreeMap::new(),
            children: Vec::new(),
            attachments: Vec::new(),
            map_links: Vec::new(),
            collapsed: false,
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position::new(x, y);
        self
    }

    pub fn with_child(mut self, child: MindMapNode) -> Self {
        self.children.push(child);
        self
    }

    /// Depth-first search for a node by id
    pub fn find(&self, id: &str) -> Option<&MindMapNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(id))
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut MindMapNode> {
        if self.id == id {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(id))
    }

    /// Depth-first search for the node whose children contain `id`
    pub fn find_parent(&self, id: &str) -> Option<&MindMapNode> {
        if self.children.iter().any(|c| c.id == id) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_parent(id))
    }

    pub fn find_parent_mut(&mut self, id: &str) -> Option<&mut MindMapNode> {
        if self.children.iter().any(|c| c.id == id) {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_parent_mut(id))
    }

    /// Detach a descendant (never `self`) and return it with its old index
    pub fn remove_descendant(&mut self, id: &str) -> Option<(NodeId, usize, MindMapNode)> {
        let parent = self.find_parent_mut(id)?;
        let index = parent.children.iter().position(|c| c.id == id)?;
        let node = parent.children.remove(index);
        Some((parent.id.clone(), index, node))
    }

    /// Visit this node and every descendant in depth-first pre-order
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a MindMapNode, Option<&'a MindMapNode>)) {
        fn inner<'a>(
            node: &'a MindMapNode,
            parent: Option<&'a MindMapNode>,
            visit: &mut impl FnMut(&'a MindMapNode, Option<&'a MindMapNode>),
        ) {
            visit(node, parent);
            for child in &node.children {
                inner(child, Some(node), visit);
            }
        }
        inner(self, None, visit);
    }

    /// Ids of every strict descendant
    pub fn descendant_ids(&self) -> HashSet<NodeId> {
        let mut ids = HashSet::new();
        for child in &self.children {
            child.walk(&mut |n, _| {
                ids.insert(n.id.clone());
            });
        }
        ids
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}

/// A mind map document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MindMap {
    pub id: MindMapId,
    #[serde(default)]
    pub title: String,
    pub root: MindMapNode,
    #[serde(default)]
    pub connections: Vec<Connection>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MindMap {
    /// A new map holding only a root node
    pub fn new(id: impl Into<MindMapId>, title: impl Into<String>) -> Self {
        let title = title.into();
        let now = Utc::now();
        Self {
            id: id.into(),
            root: MindMapNode::new(ROOT_ID, title.clone()),
            title,
            connections: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_root(mut self, root: MindMapNode) -> Self {
        self.root = root;
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&MindMapNode> {
        self.root.find(id)
    }

    pub fn node_count(&self) -> usize {
        self.root.node_count()
    }

    /// SHA-256 over the content of the map, independent of bookkeeping
    /// timestamps. Two replicas holding the same tree produce the same digest.
    pub fn digest(&self) -> String {
        fn feed(hasher: &mut Sha256, node: &MindMapNode) {
            hasher.update(node.id.as_bytes());
            hasher.update([0]);
            hasher.update(node.text.as_bytes());
            hasher.update([0]);
            hasher.update(node.position.x.to_le_bytes());
            hasher.update(node.position.y.to_le_bytes());
            hasher.update([node.collapsed as u8]);
            // BTreeMap keeps style keys ordered
            if let Ok(style) = serde_json::to_vec(&node.style) {
                hasher.update(&style);
            }
            for attachment in &node.attachments {
                hasher.update(attachment.id.as_bytes());
                hasher.update(attachment.url.as_bytes());
            }
            for link in &node.map_links {
                hasher.update(link.id.as_bytes());
                hasher.update(link.target_map_id.as_bytes());
            }
            hasher.update((node.children.len() as u64).to_le_bytes());
            for child in &node.children {
                feed(hasher, child);
            }
        }

        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        feed(&mut hasher, &self.root);
        for connection in &self.connections {
            hasher.update(connection.id.as_bytes());
            hasher.update(connection.from.as_bytes());
            hasher.update(connection.to.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

// === Tree helpers ===

/// Depth-first existence search
pub fn node_exists(id: &str, tree: &MindMapNode) -> bool {
    tree.find(id).is_some()
}

/// True iff `candidate_id`'s actual parent is `alleged_parent_id`
pub fn is_child_of_node(candidate_id: &str, alleged_parent_id: &str, tree: &MindMapNode) -> bool {
    tree.find_parent(candidate_id)
        .map(|p| p.id == alleged_parent_id)
        .unwrap_or(false)
}

/// True iff `candidate_id` lies strictly below `ancestor_id`
pub fn is_descendant_of(candidate_id: &str, ancestor_id: &str, tree: &MindMapNode) -> bool {
    match tree.find(ancestor_id) {
        Some(ancestor) => ancestor.children.iter().any(|c| c.find(candidate_id).is_some()),
        None => false,
    }
}
