//! Conversion between the hierarchical tree and its relational projection
//!
//! The relational form flattens a map into rows (`nodes` carrying
//! `parent_id`, `attachments`, `links`, `connections`) for persistence and
//! analytics. Rehydrating a projection reproduces an identical tree: sibling
//! order travels in `sort_order`.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::node::{Attachment, Connection, MapLink, MindMap, MindMapNode, Position};
use crate::convergent::{MindMapId, NodeId};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConvertError {
    #[error("No root node (a node without parent_id) in projection")]
    MissingRoot,

    #[error("Multiple root nodes: {0:?}")]
    MultipleRoots(Vec<NodeId>),

    #[error("Duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("Node {node} references missing parent {parent}")]
    OrphanNode { node: NodeId, parent: NodeId },

    #[error("Nodes not reachable from the root: {0:?}")]
    Unreachable(Vec<NodeId>),

    #[error("{kind} {id} references missing node {node}")]
    DanglingReference {
        kind: &'static str,
        id: String,
        node: NodeId,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MindMapRecord {
    pub id: MindMapId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub mindmap_id: MindMapId,
    pub parent_id: Option<NodeId>,
    pub text: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub style: BTreeMap<String, Value>,
    #[serde(default)]
    pub collapsed: bool,
    pub sort_order: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub id: String,
    pub node_id: NodeId,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: u64,
    pub sort_order: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: String,
    pub node_id: NodeId,
    pub target_map_id: MindMapId,
    #[serde(default)]
    pub title: String,
    pub sort_order: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub id: String,
    pub mindmap_id: MindMapId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    #[serde(default)]
    pub label: Option<String>,
}

/// The flat `{ mindmap, nodes, attachments, links, connections }` bundle
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RelationalMindMap {
    pub mindmap: MindMapRecord,
    pub nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
    #[serde(default)]
    pub links: Vec<LinkRecord>,
    #[serde(default)]
    pub connections: Vec<ConnectionRecord>,
}

/// Flatten a mind map into rows (pre-order, parents before children)
pub fn hierarchical_to_relational(map: &MindMap) -> RelationalMindMap {
    let mut nodes = Vec::with_capacity(map.node_count());
    let mut attachments = Vec::new();
    let mut links = Vec::new();

    map.root.walk(&mut |node, parent| {
        let sort_order = match parent {
            Some(p) => p.children.iter().position(|c| c.id == node.id).unwrap_or(0),
            None => 0,
        };

        nodes.push(NodeRecord {
            id: node.id.clone(),
            mindmap_id: map.id.clone(),
            parent_id: parent.map(|p| p.id.clone()),
            text: node.text.clone(),
            x: node.position.x,
            y: node.position.y,
            style: node.style.clone(),
            collapsed: node.collapsed,
            sort_order,
        });

        for (i, a) in node.attachments.iter().enumerate() {
            attachments.push(AttachmentRecord {
                id: a.id.clone(),
                node_id: node.id.clone(),
                name: a.name.clone(),
                url: a.url.clone(),
                mime_type: a.mime_type.clone(),
                size: a.size,
                sort_order: i,
            });
        }

        for (i, l) in node.map_links.iter().enumerate() {
            links.push(LinkRecord {
                id: l.id.clone(),
                node_id: node.id.clone(),
                target_map_id: l.target_map_id.clone(),
                title: l.title.clone(),
                sort_order: i,
            });
        }
    });

    let connections = map
        .connections
        .iter()
        .map(|c| ConnectionRecord {
            id: c.id.clone(),
            mindmap_id: map.id.clone(),
            from_node_id: c.from.clone(),
            to_node_id: c.to.clone(),
            label: c.label.clone(),
        })
        .collect();

    RelationalMindMap {
        mindmap: MindMapRecord {
            id: map.id.clone(),
            title: map.title.clone(),
            created_at: map.created_at,
            updated_at: map.updated_at,
        },
        nodes,
        attachments,
        links,
        connections,
    }
}

/// Parent -> ordered children index over a validated projection
struct ProjectionIndex<'a> {
    root: &'a NodeRecord,
    children: HashMap<&'a str, Vec<&'a NodeRecord>>,
}

fn index_projection(bundle: &RelationalMindMap) -> Result<ProjectionIndex<'_>, ConvertError> {
    let mut ids: HashSet<&str> = HashSet::with_capacity(bundle.nodes.len());
    for node in &bundle.nodes {
        if !ids.insert(node.id.as_str()) {
            return Err(ConvertError::DuplicateNode(node.id.clone()));
        }
    }

    let mut roots = Vec::new();
    let mut children: HashMap<&str, Vec<&NodeRecord>> = HashMap::new();
    for node in &bundle.nodes {
        match &node.parent_id {
            None => roots.push(node),
            Some(parent) if ids.contains(parent.as_str()) => {
                children.entry(parent.as_str()).or_default().push(node);
            }
            Some(parent) => {
                return Err(ConvertError::OrphanNode {
                    node: node.id.clone(),
                    parent: parent.clone(),
                })
            }
        }
    }

    let root = match roots.as_slice() {
        [] => return Err(ConvertError::MissingRoot),
        [root] => *root,
        many => {
            return Err(ConvertError::MultipleRoots(
                many.iter().map(|n| n.id.clone()).collect(),
            ))
        }
    };

    for siblings in children.values_mut() {
        siblings.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.id.cmp(&b.id)));
    }

    // Every node must hang off the root; anything else sits on a parent cycle
    let mut reached: HashSet<&str> = HashSet::new();
    let mut stack = vec![root.id.as_str()];
    while let Some(id) = stack.pop() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(kids) = children.get(id) {
            stack.extend(kids.iter().map(|k| k.id.as_str()));
        }
    }
    if reached.len() != bundle.nodes.len() {
        let mut missing: Vec<NodeId> = bundle
            .nodes
            .iter()
            .filter(|n| !reached.contains(n.id.as_str()))
            .map(|n| n.id.clone())
            .collect();
        missing.sort();
        return Err(ConvertError::Unreachable(missing));
    }

    for a in &bundle.attachments {
        if !ids.contains(a.node_id.as_str()) {
            return Err(ConvertError::DanglingReference {
                kind: "attachment",
                id: a.id.clone(),
                node: a.node_id.clone(),
            });
        }
    }
    for l in &bundle.links {
        if !ids.contains(l.node_id.as_str()) {
            return Err(ConvertError::DanglingReference {
                kind: "link",
                id: l.id.clone(),
                node: l.node_id.clone(),
            });
        }
    }
    for c in &bundle.connections {
        for end in [&c.from_node_id, &c.to_node_id] {
            if !ids.contains(end.as_str()) {
                return Err(ConvertError::DanglingReference {
                    kind: "connection",
                    id: c.id.clone(),
                    node: end.clone(),
                });
            }
        }
    }

    Ok(ProjectionIndex { root, children })
}

/// Check a projection for the problems rehydration would hit
pub fn validate_relational(bundle: &RelationalMindMap) -> Result<(), ConvertError> {
    index_projection(bundle).map(|_| ())
}

/// Rebuild the tree from a projection
pub fn relational_to_hierarchical(bundle: &RelationalMindMap) -> Result<MindMap, ConvertError> {
    let index = index_projection(bundle)?;

    let mut attachments: HashMap<&str, Vec<&AttachmentRecord>> = HashMap::new();
    for a in &bundle.attachments {
        attachments.entry(a.node_id.as_str()).or_default().push(a);
    }
    let mut links: HashMap<&str, Vec<&LinkRecord>> = HashMap::new();
    for l in &bundle.links {
        links.entry(l.node_id.as_str()).or_default().push(l);
    }

    fn build(
        record: &NodeRecord,
        index: &ProjectionIndex<'_>,
        attachments: &mut HashMap<&str, Vec<&AttachmentRecord>>,
        links: &mut HashMap<&str, Vec<&LinkRecord>>,
    ) -> MindMapNode {
        let mut node = MindMapNode::new(record.id.clone(), record.text.clone());
        node.position = Position::new(record.x, record.y);
        node.style = record.style.clone();
        node.collapsed = record.collapsed;

        if let Some(mut rows) = attachments.remove(record.id.as_str()) {
            rows.sort_by_key(|a| a.sort_order);
            node.attachments = rows
                .into_iter()
                .map(|a| Attachment {
                    id: a.id.clone(),
                    name: a.name.clone(),
                    url: a.url.clone(),
                    mime_type: a.mime_type.clone(),
                    size: a.size,
                })
                .collect();
        }
        if let Some(mut rows) = links.remove(record.id.as_str()) {
            rows.sort_by_key(|l| l.sort_order);
            node.map_links = rows
                .into_iter()
                .map(|l| MapLink {
                    id: l.id.clone(),
                    target_map_id: l.target_map_id.clone(),
                    title: l.title.clone(),
                })
                .collect();
        }

        if let Some(kids) = index.children.get(record.id.as_str()) {
            node.children = kids
                .iter()
                .map(|k| build(k, index, attachments, links))
                .collect();
        }
        node
    }

    let root = build(index.root, &index, &mut attachments, &mut links);

    Ok(MindMap {
        id: bundle.mindmap.id.clone(),
        title: bundle.mindmap.title.clone(),
        root,
        connections: bundle
            .connections
            .iter()
            .map(|c| Connection {
                id: c.id.clone(),
                from: c.from_node_id.clone(),
                to: c.to_node_id.clone(),
                label: c.label.clone(),
            })
            .collect(),
        created_at: bundle.mindmap.created_at,
        updated_at: bundle.mindmap.updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mindmap::node::ROOT_ID;
    use serde_json::json;

    fn sample_map() -> MindMap {
        let mut idea = MindMapNode::new("idea", "Idea").at(120.0, -40.0);
        idea.attachments.push(Attachment {
            id: "att-1".into(),
            name: "sketch.png".into(),
            url: "https://files.example/sketch.png".into(),
            mime_type: Some("image/png".into()),
            size: 2048,
        });
        idea.map_links.push(MapLink {
            id: "link-1".into(),
            target_map_id: "other-map".into(),
            title: "Details".into(),
        });
        idea.style.insert("color".into(), json!("#00aa00"));

        let root = MindMapNode::new(ROOT_ID, "Project")
            .with_child(idea.with_child(MindMapNode::new("leaf", "Leaf")))
            .with_child(MindMapNode::new("zeta", "Zeta"))
            .with_child(MindMapNode::new("alpha", "Alpha"));

        let mut map = MindMap::new("map-1", "Project").with_root(root);
        map.connections.push(Connection {
            id: "conn-1".into(),
            from: "leaf".into(),
            to: "alpha".into(),
            label: Some("depends".into()),
        });
        map
    }

    #[test]
    fn test_projection_rows() {
        let bundle = hierarchical_to_relational(&sample_map());
        assert_eq!(bundle.nodes.len(), 5);
        assert_eq!(bundle.attachments.len(), 1);
        assert_eq!(bundle.links.len(), 1);
        assert_eq!(bundle.connections.len(), 1);

        let root = bundle.nodes.iter().find(|n| n.id == ROOT_ID).unwrap();
        assert!(root.parent_id.is_none());
        let alpha = bundle.nodes.iter().find(|n| n.id == "alpha").unwrap();
        assert_eq!(alpha.parent_id.as_deref(), Some(ROOT_ID));
        assert_eq!(alpha.sort_order, 2);
    }

    #[test]
    fn test_round_trip_is_identical() {
        let map = sample_map();
        let back = relational_to_hierarchical(&hierarchical_to_relational(&map)).unwrap();
        assert_eq!(back, map);
        assert_eq!(back.digest(), map.digest());
    }

    #[test]
    fn test_round_trip_survives_row_shuffle() {
        let map = sample_map();
        let mut bundle = hierarchical_to_relational(&map);
        bundle.nodes.reverse();
        let back = relational_to_hierarchical(&bundle).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_missing_root() {
        let mut bundle = hierarchical_to_relational(&sample_map());
        bundle.nodes.retain(|n| n.id != ROOT_ID);
        // Children of the removed root are now orphans
        assert!(matches!(
            validate_relational(&bundle),
            Err(ConvertError::OrphanNode { .. })
        ));

        bundle.nodes.clear();
        bundle.attachments.clear();
        bundle.links.clear();
        bundle.connections.clear();
        assert_eq!(validate_relational(&bundle), Err(ConvertError::MissingRoot));
    }

    #[test]
    fn test_multiple_roots() {
        let mut bundle = hierarchical_to_relational(&sample_map());
        bundle.nodes.iter_mut().find(|n| n.id == "zeta").unwrap().parent_id = None;
        assert!(matches!(
            relational_to_hierarchical(&bundle),
            Err(ConvertError::MultipleRoots(_))
        ));
    }

    #[test]
    fn test_cycle_is_unreachable() {
        let mut bundle = hierarchical_to_relational(&sample_map());
        // idea -> leaf -> idea
        bundle.nodes.iter_mut().find(|n| n.id == "idea").unwrap().parent_id = Some("leaf".into());
        assert_eq!(
            validate_relational(&bundle),
            Err(ConvertError::Unreachable(vec!["idea".into(), "leaf".into()]))
        );
    }

    #[test]
    fn test_duplicate_and_dangling() {
        let mut bundle = hierarchical_to_relational(&sample_map());
        let dup = bundle.nodes[1].clone();
        bundle.nodes.push(dup);
        assert!(matches!(
            validate_relational(&bundle),
            Err(ConvertError::DuplicateNode(_))
        ));

        let mut bundle = hierarchical_to_relational(&sample_map());
        bundle.connections[0].to_node_id = "ghost".into();
        assert!(matches!(
            validate_relational(&bundle),
            Err(ConvertError::DanglingReference { kind: "connection", .. })
        ));
    }

    #[test]
    fn test_bundle_json_shape() {
        let bundle = hierarchical_to_relational(&sample_map());
        let json = serde_json::to_value(&bundle).unwrap();
        for key in ["mindmap", "nodes", "attachments", "links", "connections"] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
    }
}
