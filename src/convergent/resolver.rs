//! Tree-aware conflict resolution
//!
//! Where the transformer reconciles two operations at a time without looking
//! at the document, the resolver sees a candidate operation, every applied
//! operation it is concurrent with, and the current tree snapshot. It picks a
//! per-type policy and answers with the operations to apply instead of the
//! candidate. The snapshot is never mutated here.
//!
//! Policies are pluggable through [`ResolutionStrategy`]. A strategy that
//! errors, or an operation type without one, falls back to whole-operation
//! last-writer-wins, which cannot fail.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::operation::{
    CreatePayload, DeletePayload, MovePayload, NodeId, OpId, Operation, OperationKind,
    OperationType, UpdatePayload,
};
use super::transform::OperationTransformer;
use crate::mindmap::{is_descendant_of, node_exists, MindMap, MindMapNode, Position};

/// Strategy failures. Never escape [`ConflictResolver::resolve`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("{strategy} cannot resolve a {operation_type} operation")]
    UnsupportedOperation {
        strategy: &'static str,
        operation_type: OperationType,
    },

    #[error("Strategy {strategy} failed: {reason}")]
    StrategyFailed {
        strategy: &'static str,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum distance kept between concurrently created siblings
    pub min_node_distance: f64,
    /// Number of resolution records kept for inspection
    pub history_limit: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            min_node_distance: 50.0,
            history_limit: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution results
// ---------------------------------------------------------------------------

/// Which policy produced a resolution
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    NoConflict,
    FieldMerge,
    LatestWins,
    PositionAdjustment,
    FirstDeleteWins,
    PreserveChildren,
    MoveAverage,
    LastWriterWins,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::NoConflict => "no_conflict",
            StrategyKind::FieldMerge => "field_merge",
            StrategyKind::LatestWins => "latest_wins",
            StrategyKind::PositionAdjustment => "position_adjustment",
            StrategyKind::FirstDeleteWins => "first_delete_wins",
            StrategyKind::PreserveChildren => "preserve_children",
            StrategyKind::MoveAverage => "move_average",
            StrategyKind::LastWriterWins => "last_writer_wins",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node pushed away from a concurrently created sibling
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionAdjustment {
    pub node_id: NodeId,
    pub from: Position,
    pub to: Position,
    /// How far the node was moved
    pub shortfall: f64,
}

/// What to apply in place of a candidate operation
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    /// Operations to apply in order. Empty when the candidate is discarded.
    /// May include local-only compensating operations alongside the candidate.
    pub operations: Vec<Operation>,
    pub strategy: StrategyKind,
    /// Operations that lost
    pub discarded: Vec<OpId>,
    pub adjustment: Option<PositionAdjustment>,
}

impl Resolution {
    pub fn accept(op: Operation, strategy: StrategyKind) -> Self {
        Self {
            operations: vec![op],
            strategy,
            discarded: Vec::new(),
            adjustment: None,
        }
    }

    pub fn discard(candidate: &Operation, strategy: StrategyKind) -> Self {
        Self {
            operations: Vec::new(),
            strategy,
            discarded: vec![candidate.id],
            adjustment: None,
        }
    }

    pub fn is_discarded(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Telemetry entry for one resolution
#[derive(Clone, Debug, Serialize)]
pub struct ResolutionRecord {
    pub candidate: OpId,
    pub operation_type: OperationType,
    pub target_id: NodeId,
    pub strategy: StrategyKind,
    pub conflicts: usize,
    pub discarded: Vec<OpId>,
    pub adjustment: Option<PositionAdjustment>,
    pub resolved_at: DateTime<Utc>,
}

/// A per-operation-type resolution policy
pub trait ResolutionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn resolve(
        &self,
        candidate: &Operation,
        conflicts: &[Operation],
        tree: &MindMap,
        config: &ResolverConfig,
    ) -> Result<Resolution, ResolveError>;
}

// ---------------------------------------------------------------------------
// Deleted subtrees
// ---------------------------------------------------------------------------

/// A subtree removed by a cascading delete, kept so that a concurrent edit
/// landing inside it can bring the removed children back.
#[derive(Clone, Debug)]
pub struct DeletedSubtree {
    pub delete: Operation,
    pub parent_id: NodeId,
    pub index: usize,
    pub node: MindMapNode,
    /// Nodes already put back into the deleted node's slot
    placed: usize,
}

impl DeletedSubtree {
    /// Capture what `op` is about to remove from `tree`.
    ///
    /// `None` unless `op` is a cascading delete of an existing non-root node.
    pub fn capture(op: &Operation, tree: &MindMap) -> Option<Self> {
        match &op.kind {
            OperationKind::Delete(p) if !p.preserve_children => {}
            _ => return None,
        }
        let parent = tree.root.find_parent(&op.target_id)?;
        let index = parent.children.iter().position(|c| c.id == op.target_id)?;
        Some(Self {
            delete: op.clone(),
            parent_id: parent.id.clone(),
            index,
            node: parent.children[index].clone(),
            placed: 0,
        })
    }

    /// Strict descendant of the deleted node
    pub fn contains(&self, id: &str) -> bool {
        self.node.children.iter().any(|c| c.find(id).is_some())
    }

    fn holds_parent(&self, parent_id: Option<&NodeId>) -> bool {
        parent_id
            .map(|p| *p == self.node.id || self.contains(p))
            .unwrap_or(false)
    }

    /// Every removed child has been restored
    pub fn is_empty(&self) -> bool {
        self.node.children.is_empty()
    }

    /// Index under the surviving parent for something aimed at `index` under
    /// the deleted node
    fn slot(&mut self, index: Option<usize>) -> usize {
        let count = self.placed + self.node.children.len();
        self.placed += 1;
        self.index + index.unwrap_or(count).min(count)
    }
}

/// Outcome of reconciling a candidate with a deleted subtree
#[derive(Clone, Debug)]
pub struct Restoration {
    /// Local-only creates that bring removed nodes back
    pub restore: Vec<Operation>,
    /// The candidate rewritten for the restored tree, `None` if it has nothing
    /// left to do
    pub candidate: Option<Operation>,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct ConflictResolver {
    config: ResolverConfig,
    strategies: HashMap<OperationType, Box<dyn ResolutionStrategy>>,
    history: VecDeque<ResolutionRecord>,
    stats: BTreeMap<StrategyKind, u64>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ResolverConfig::default())
    }
}

impl ConflictResolver {
    /// A resolver with the built-in update, create, delete and move policies
    pub fn new(config: ResolverConfig) -> Self {
        let mut resolver = Self {
            config,
            strategies: HashMap::new(),
            history: VecDeque::new(),
            stats: BTreeMap::new(),
        };
        resolver.register_strategy(OperationType::Update, Box::new(FieldMergeStrategy));
        resolver.register_strategy(OperationType::Create, Box::new(CreateStrategy));
        resolver.register_strategy(OperationType::Delete, Box::new(DeleteStrategy));
        resolver.register_strategy(OperationType::Move, Box::new(MoveAverageStrategy));
        resolver
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Install a policy for an operation type, returning the one it replaces
    pub fn register_strategy(
        &mut self,
        operation_type: OperationType,
        strategy: Box<dyn ResolutionStrategy>,
    ) -> Option<Box<dyn ResolutionStrategy>> {
        self.strategies.insert(operation_type, strategy)
    }

    /// Drop the policy for an operation type so it resolves by last-writer-wins
    pub fn remove_strategy(&mut self, operation_type: OperationType) -> Option<Box<dyn ResolutionStrategy>> {
        self.strategies.remove(&operation_type)
    }

    /// Structural precondition check against a snapshot.
    ///
    /// `false` means the operation is stale and should be dropped rather than
    /// resolved.
    pub fn can_apply_operation(op: &Operation, tree: &MindMap) -> bool {
        if op.mindmap_id != tree.id {
            return false;
        }
        let root = &tree.root;
        match &op.kind {
            OperationKind::Noop(_) => true,
            OperationKind::Create(p) => {
                node_exists(&p.parent_id, root) && !node_exists(&op.target_id, root)
            }
            OperationKind::Move(p) => {
                node_exists(&op.target_id, root)
                    && p.parent_id.as_ref().map(|id| node_exists(id, root)).unwrap_or(true)
            }
            OperationKind::Update(_) | OperationKind::Delete(_) => node_exists(&op.target_id, root),
        }
    }

    /// Applied operations that are causally concurrent with `candidate` and
    /// touch the same part of the tree.
    pub fn find_conflicts<'a, I>(&self, candidate: &Operation, applied: I, tree: &MindMap) -> Vec<Operation>
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let deleting = matches!(candidate.kind, OperationKind::Delete(_));
        applied
            .into_iter()
            .filter(|op| op.id != candidate.id && !op.is_noop())
            .filter(|op| op.is_concurrent_with(candidate))
            .filter(|op| {
                OperationTransformer::are_related(candidate, op)
                    || (deleting && lands_in_subtree(op, &candidate.target_id, tree))
            })
            .cloned()
            .collect()
    }

    /// Resolve a candidate against its conflicts. Never fails.
    pub fn resolve(&mut self, candidate: &Operation, conflicts: &[Operation], tree: &MindMap) -> Resolution {
        let relevant: Vec<Operation> = conflicts
            .iter()
            .filter(|c| c.id != candidate.id && !c.is_noop())
            .cloned()
            .collect();

        if candidate.is_noop() || relevant.is_empty() {
            return Resolution::accept(candidate.clone(), StrategyKind::NoConflict);
        }

        let resolution = match self.strategies.get(&candidate.operation_type()) {
            Some(strategy) => match strategy.resolve(candidate, &relevant, tree, &self.config) {
                Ok(resolution) => resolution,
                Err(e) => {
                    log::warn!(
                        "Strategy {} failed for {} {}: {}; falling back to last-writer-wins",
                        strategy.name(),
                        candidate.operation_type(),
                        candidate.id,
                        e
                    );
                    last_writer_wins(candidate, &relevant)
                }
            },
            None => last_writer_wins(candidate, &relevant),
        };

        log::debug!(
            "Resolved {} {} against {} conflict(s) with {}",
            candidate.operation_type(),
            candidate.id,
            relevant.len(),
            resolution.strategy
        );
        self.record(candidate, relevant.len(), &resolution);
        resolution
    }

    /// Reconcile a candidate with a subtree removed by a concurrent cascading
    /// delete.
    ///
    /// A replica that sees the edit first keeps the children when the delete
    /// arrives (see the delete policy), so this side restores them too: the
    /// deleted node's children come back at its old slot and the candidate is
    /// re-pointed at the surviving parent when it referenced the deleted node.
    /// A move of a removed node out of the subtree restores only that node.
    /// Returns `None` when the candidate does not land inside the subtree.
    pub fn restore_deleted(
        &mut self,
        candidate: &Operation,
        deleted: &mut DeletedSubtree,
    ) -> Option<Restoration> {
        if !deleted.delete.is_concurrent_with(candidate) {
            return None;
        }
        let target = candidate.target_id.as_str();

        let restoration = match &candidate.kind {
            // Children survive when either of two concurrent deletes keeps them
            OperationKind::Delete(p) if p.preserve_children && target == deleted.node.id => Restoration {
                restore: restore_children(candidate, deleted),
                candidate: None,
            },
            // Already gone with its ancestor
            OperationKind::Delete(_) if deleted.contains(target) => Restoration {
                restore: Vec::new(),
                candidate: None,
            },
            OperationKind::Update(_) if deleted.contains(target) => Restoration {
                restore: restore_children(candidate, deleted),
                candidate: Some(candidate.clone()),
            },
            OperationKind::Create(p) if deleted.holds_parent(Some(&p.parent_id)) => {
                let restore = restore_children(candidate, deleted);
                let mut rewritten = candidate.clone();
                if p.parent_id == deleted.node.id {
                    rewritten.kind = OperationKind::Create(CreatePayload {
                        parent_id: deleted.parent_id.clone(),
                        index: Some(deleted.slot(p.index)),
                        ..p.clone()
                    });
                }
                Restoration {
                    restore,
                    candidate: Some(rewritten),
                }
            }
            OperationKind::Move(p)
                if deleted.contains(target)
                    && p.parent_id.is_some()
                    && !deleted.holds_parent(p.parent_id.as_ref()) =>
            {
                // Moved out before the delete reached the mover
                let (_, _, node) = deleted.node.remove_descendant(target)?;
                let parent = p.parent_id.clone()?;
                Restoration {
                    restore: resurrect(candidate, &node, &parent, p.index),
                    candidate: Some(candidate.clone()),
                }
            }
            OperationKind::Move(p)
                if deleted.contains(target) || deleted.holds_parent(p.parent_id.as_ref()) =>
            {
                let restore = restore_children(candidate, deleted);
                let mut rewritten = candidate.clone();
                if p.parent_id.as_ref() == Some(&deleted.node.id) {
                    rewritten.kind = OperationKind::Move(MovePayload {
                        parent_id: Some(deleted.parent_id.clone()),
                        index: Some(deleted.slot(p.index)),
                        position: p.position,
                    });
                }
                Restoration {
                    restore,
                    candidate: Some(rewritten),
                }
            }
            _ => return None,
        };

        log::info!(
            "{} {} landed inside subtree deleted by {}; restoring {} node(s)",
            candidate.operation_type(),
            candidate.id,
            deleted.delete.id,
            restoration.restore.len()
        );
        let resolution = Resolution {
            operations: restoration.restore.iter().cloned().chain(restoration.candidate.clone()).collect(),
            strategy: StrategyKind::PreserveChildren,
            discarded: if restoration.candidate.is_none() {
                vec![candidate.id]
            } else {
                Vec::new()
            },
            adjustment: None,
        };
        self.record(candidate, 1, &resolution);
        Some(restoration)
    }

    pub fn history(&self) -> impl Iterator<Item = &ResolutionRecord> {
        self.history.iter()
    }

    /// Number of resolutions per strategy
    pub fn stats(&self) -> &BTreeMap<StrategyKind, u64> {
        &self.stats
    }

    fn record(&mut self, candidate: &Operation, conflicts: usize, resolution: &Resolution) {
        *self.stats.entry(resolution.strategy).or_insert(0) += 1;
        self.history.push_back(ResolutionRecord {
            candidate: candidate.id,
            operation_type: candidate.operation_type(),
            target_id: candidate.target_id.clone(),
            strategy: resolution.strategy,
            conflicts,
            discarded: resolution.discarded.clone(),
            adjustment: resolution.adjustment.clone(),
            resolved_at: Utc::now(),
        });
        while self.history.len() > self.config.history_limit {
            self.history.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in strategies
// ---------------------------------------------------------------------------

/// Field-level last-writer-wins across every concurrent update of the node
pub struct FieldMergeStrategy;

impl ResolutionStrategy for FieldMergeStrategy {
    fn name(&self) -> &'static str {
        "field_merge"
    }

    fn resolve(
        &self,
        candidate: &Operation,
        conflicts: &[Operation],
        _tree: &MindMap,
        _config: &ResolverConfig,
    ) -> Result<Resolution, ResolveError> {
        let OperationKind::Update(payload) = &candidate.kind else {
            return Err(unsupported(self, candidate));
        };

        let newer: Vec<&UpdatePayload> = conflicts
            .iter()
            .filter(|c| c.target_id == candidate.target_id && c.has_priority_over(candidate))
            .filter_map(|c| match &c.kind {
                OperationKind::Update(p) => Some(p),
                _ => None,
            })
            .collect();

        let fields: BTreeMap<_, _> = payload
            .fields
            .iter()
            .filter(|(field, _)| !newer.iter().any(|p| p.contains(field)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if fields.is_empty() {
            return Ok(Resolution::discard(candidate, StrategyKind::FieldMerge));
        }
        let merged = Operation {
            kind: OperationKind::Update(UpdatePayload { fields }),
            ..candidate.clone()
        };
        Ok(Resolution::accept(merged, StrategyKind::FieldMerge))
    }
}

/// Same-id creates: latest wins. Distinct close siblings: pushed apart.
pub struct CreateStrategy;

impl ResolutionStrategy for CreateStrategy {
    fn name(&self) -> &'static str {
        "create"
    }

    fn resolve(
        &self,
        candidate: &Operation,
        conflicts: &[Operation],
        tree: &MindMap,
        config: &ResolverConfig,
    ) -> Result<Resolution, ResolveError> {
        let OperationKind::Create(payload) = &candidate.kind else {
            return Err(unsupported(self, candidate));
        };

        let same_id: Vec<&Operation> = conflicts
            .iter()
            .filter(|c| c.target_id == candidate.target_id)
            .filter(|c| matches!(c.kind, OperationKind::Create(_)))
            .collect();

        if !same_id.is_empty() {
            if !same_id.iter().all(|c| candidate.has_priority_over(c)) {
                return Ok(Resolution::discard(candidate, StrategyKind::LatestWins));
            }
            // Replace the losing node, keeping anything created under it
            let mut operations = Vec::new();
            if tree.find_node(&candidate.target_id).is_some() {
                operations.push(derived_op(
                    candidate,
                    &candidate.target_id,
                    OperationKind::Delete(DeletePayload {
                        preserve_children: true,
                    }),
                ));
            }
            operations.push(candidate.clone());
            return Ok(Resolution {
                operations,
                strategy: StrategyKind::LatestWins,
                discarded: same_id.iter().map(|c| c.id).collect(),
                adjustment: None,
            });
        }

        let Some(proposed) = payload.position else {
            return Ok(Resolution::accept(candidate.clone(), StrategyKind::NoConflict));
        };

        let mut siblings: Vec<(&Operation, Position)> = conflicts
            .iter()
            .filter_map(|c| match &c.kind {
                OperationKind::Create(p) if p.parent_id == payload.parent_id => p.position.map(|pos| (c, pos)),
                _ => None,
            })
            .collect();
        siblings.sort_by(|a, b| b.0.priority_cmp(a.0));

        let min = config.min_node_distance;
        let mut position = proposed;
        let mut adjustment = None;
        let mut compensations = Vec::new();

        for (sibling, sibling_position) in siblings {
            if sibling.has_priority_over(candidate) {
                let distance = position.distance_to(&sibling_position);
                if distance >= min {
                    continue;
                }
                let moved = push_apart(position, sibling_position, min);
                adjustment = Some(PositionAdjustment {
                    node_id: candidate.target_id.clone(),
                    from: position,
                    to: moved,
                    shortfall: min - distance,
                });
                position = moved;
            } else {
                // The other replica nudges its own copy of this sibling the
                // same way when our candidate reaches it.
                let distance = sibling_position.distance_to(&proposed);
                if distance >= min || tree.find_node(&sibling.target_id).is_none() {
                    continue;
                }
                let moved = push_apart(sibling_position, proposed, min);
                compensations.push(derived_op(
                    candidate,
                    &sibling.target_id,
                    OperationKind::Move(MovePayload {
                        parent_id: None,
                        position: Some(moved),
                        index: None,
                    }),
                ));
                adjustment.get_or_insert(PositionAdjustment {
                    node_id: sibling.target_id.clone(),
                    from: sibling_position,
                    to: moved,
                    shortfall: min - distance,
                });
            }
        }

        if adjustment.is_none() {
            return Ok(Resolution::accept(candidate.clone(), StrategyKind::NoConflict));
        }

        let mut adjusted = candidate.clone();
        adjusted.kind = OperationKind::Create(CreatePayload {
            position: Some(position),
            ..payload.clone()
        });
        let mut operations = vec![adjusted];
        operations.extend(compensations);
        Ok(Resolution {
            operations,
            strategy: StrategyKind::PositionAdjustment,
            discarded: Vec::new(),
            adjustment,
        })
    }
}

/// Duplicate deletes are dropped. Concurrent edits below the node keep its
/// children alive.
pub struct DeleteStrategy;

impl ResolutionStrategy for DeleteStrategy {
    fn name(&self) -> &'static str {
        "delete"
    }

    fn resolve(
        &self,
        candidate: &Operation,
        conflicts: &[Operation],
        tree: &MindMap,
        _config: &ResolverConfig,
    ) -> Result<Resolution, ResolveError> {
        let OperationKind::Delete(payload) = &candidate.kind else {
            return Err(unsupported(self, candidate));
        };

        let duplicate = conflicts
            .iter()
            .any(|c| c.target_id == candidate.target_id && matches!(c.kind, OperationKind::Delete(_)));
        if duplicate {
            // The node is gone either way. A cascade arriving after a
            // preserving delete keeps the children; a preserving delete
            // arriving after a cascade brings them back through the deleted
            // subtree before it gets here.
            return Ok(Resolution::discard(candidate, StrategyKind::FirstDeleteWins));
        }

        let touches_subtree = conflicts.iter().any(|c| {
            !matches!(c.kind, OperationKind::Delete(_)) && lands_in_subtree(c, &candidate.target_id, tree)
        });
        if touches_subtree && !payload.preserve_children {
            let preserved = Operation {
                kind: OperationKind::Delete(DeletePayload {
                    preserve_children: true,
                }),
                ..candidate.clone()
            };
            return Ok(Resolution::accept(preserved, StrategyKind::PreserveChildren));
        }

        Ok(Resolution::accept(candidate.clone(), StrategyKind::NoConflict))
    }
}

/// Latest move picks the parent; proposed positions are averaged
pub struct MoveAverageStrategy;

impl ResolutionStrategy for MoveAverageStrategy {
    fn name(&self) -> &'static str {
        "move_average"
    }

    fn resolve(
        &self,
        candidate: &Operation,
        conflicts: &[Operation],
        _tree: &MindMap,
        _config: &ResolverConfig,
    ) -> Result<Resolution, ResolveError> {
        if !matches!(candidate.kind, OperationKind::Move(_)) {
            return Err(unsupported(self, candidate));
        }

        let mut moves: Vec<(&Operation, &MovePayload)> = std::iter::once(candidate)
            .chain(conflicts.iter().filter(|c| c.target_id == candidate.target_id))
            .filter_map(|op| match &op.kind {
                OperationKind::Move(p) => Some((op, p)),
                _ => None,
            })
            .collect();
        if moves.len() < 2 {
            return Ok(Resolution::accept(candidate.clone(), StrategyKind::NoConflict));
        }
        moves.sort_by(|a, b| b.0.priority_cmp(a.0));

        // Most recent move that names a destination
        let destination = moves.iter().find(|(_, p)| p.parent_id.is_some());
        let parent_id = destination.and_then(|(_, p)| p.parent_id.clone());
        let index = destination.and_then(|(_, p)| p.index);

        let positions: Vec<Position> = moves.iter().filter_map(|(_, p)| p.position).collect();
        let position = if positions.is_empty() {
            None
        } else {
            let n = positions.len() as f64;
            let x = positions.iter().map(|p| p.x).sum::<f64>() / n;
            let y = positions.iter().map(|p| p.y).sum::<f64>() / n;
            Some(Position::new(x.round(), y.round()))
        };

        let averaged = Operation {
            kind: OperationKind::Move(MovePayload {
                parent_id,
                position,
                index,
            }),
            ..candidate.clone()
        };
        Ok(Resolution::accept(averaged, StrategyKind::MoveAverage))
    }
}

/// Whole-operation last-writer-wins
fn last_writer_wins(candidate: &Operation, conflicts: &[Operation]) -> Resolution {
    if conflicts.iter().all(|c| candidate.has_priority_over(c)) {
        Resolution {
            operations: vec![candidate.clone()],
            strategy: StrategyKind::LastWriterWins,
            discarded: conflicts.iter().map(|c| c.id).collect(),
            adjustment: None,
        }
    } else {
        Resolution::discard(candidate, StrategyKind::LastWriterWins)
    }
}

fn unsupported(strategy: &dyn ResolutionStrategy, candidate: &Operation) -> ResolveError {
    ResolveError::UnsupportedOperation {
        strategy: strategy.name(),
        operation_type: candidate.operation_type(),
    }
}

/// A local-only operation derived from `candidate`
fn derived_op(candidate: &Operation, target_id: &str, kind: OperationKind) -> Operation {
    Operation::new(
        candidate.mindmap_id.clone(),
        candidate.user_id.clone(),
        target_id,
        kind,
    )
    .with_timestamp(candidate.timestamp)
    .with_clock(candidate.vector_clock.clone())
}

/// Whether `op` edits something strictly below `ancestor` in `tree`
fn lands_in_subtree(op: &Operation, ancestor: &str, tree: &MindMap) -> bool {
    let below = |id: &str| is_descendant_of(id, ancestor, &tree.root);
    below(&op.target_id) || op.parent_id().map(|p| p == ancestor || below(p)).unwrap_or(false)
}

/// Move `position` directly away from `from` until it is `min` apart
fn push_apart(position: Position, from: Position, min: f64) -> Position {
    let distance = position.distance_to(&from);
    let (dx, dy) = if distance == 0.0 {
        (1.0, 0.0)
    } else {
        ((position.x - from.x) / distance, (position.y - from.y) / distance)
    };
    let shortfall = min - distance;
    Position::new(position.x + dx * shortfall, position.y + dy * shortfall)
}

/// Creates that rebuild every child subtree of a deleted node in its old slot
fn restore_children(candidate: &Operation, deleted: &mut DeletedSubtree) -> Vec<Operation> {
    let children = std::mem::take(&mut deleted.node.children);
    let first = deleted.index + deleted.placed;
    deleted.placed += children.len();
    children
        .iter()
        .enumerate()
        .flat_map(|(offset, child)| {
            resurrect(candidate, child, &deleted.parent_id, Some(first + offset))
        })
        .collect()
}

/// Creates for `node` and its descendants in pre-order
fn resurrect(candidate: &Operation, node: &MindMapNode, parent_id: &str, index: Option<usize>) -> Vec<Operation> {
    let mut ops = vec![derived_op(
        candidate,
        &node.id,
        OperationKind::Create(CreatePayload {
            parent_id: parent_id.to_string(),
            text: node.text.clone(),
            position: Some(node.position),
            index,
            style: node.style.clone(),
            collapsed: node.collapsed,
        }),
    )];
    for child in &node.children {
        ops.extend(resurrect(candidate, child, &node.id, None));
    }
    ops
}
