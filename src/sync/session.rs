//! Per-document collaboration session
//!
//! A session owns everything one replica needs to edit one mind map: the
//! document store, the outbound queue, the resolver, and a bounded log of
//! applied operations used to find concurrent conflicts.
//! Nothing here is process-global, so any number of sessions can run side by
//! side.
//!
//! Local edits are validated, stamped, applied optimistically and queued.
//! Remote operations go through: dedup by id, clock merge, restoration of
//! concurrently deleted subtrees, conflict resolution against the applied
//! log, and finally a precondition check of every resulting operation before
//! it is applied.
//!
//! Local edits that are still queued are already in the store and in the
//! applied log, so a remote edit is resolved against them exactly as the
//! other replica will resolve them once they arrive there. Queued edits are
//! sent unchanged.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::config::SessionConfig;
use super::error::SessionError;
use super::queue::{OperationQueue, PendingOperation};
use super::transport::Transport;
use crate::convergent::{
    ConflictResolver, DeletedSubtree, MindMapId, NodeId, OpId, Operation, OperationKind,
    ReplicaId, StrategyKind,
};
use crate::mindmap::{DocumentStore, InMemoryDocumentStore, MindMap};

/// What happened to a remote operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Applied, possibly rewritten by the named strategy
    Applied(StrategyKind),
    /// Already seen
    Duplicate,
    /// Arrived as a noop
    Noop,
    /// Lost its conflict
    Discarded(StrategyKind),
    /// No longer fits the tree; needs a re-sync to recover
    Stale,
}

pub struct CollaborationSession {
    replica: ReplicaId,
    mindmap_id: MindMapId,
    config: SessionConfig,
    store: Box<dyn DocumentStore>,
    queue: Arc<OperationQueue>,
    resolver: ConflictResolver,
    applied: VecDeque<Operation>,
    deleted: VecDeque<DeletedSubtree>,
    seen: HashSet<OpId>,
}

impl CollaborationSession {
    /// A session over an in-memory store holding `map`
    pub fn new(
        replica: impl Into<ReplicaId>,
        map: MindMap,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        Self::with_store(
            replica,
            Box::new(InMemoryDocumentStore::new(map)),
            transport,
            config,
        )
    }

    pub fn with_store(
        replica: impl Into<ReplicaId>,
        store: Box<dyn DocumentStore>,
        transport: Arc<dyn Transport>,
        config: SessionConfig,
    ) -> Self {
        let replica = replica.into();
        let mindmap_id = store.snapshot().id.clone();
        let queue = OperationQueue::new(replica.clone(), config.queue.clone(), transport);
        let resolver = ConflictResolver::new(config.resolver.clone());
        Self {
            replica,
            mindmap_id,
            config,
            store,
            queue,
            resolver,
            applied: VecDeque::new(),
            deleted: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn mindmap_id(&self) -> &str {
        &self.mindmap_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn snapshot(&self) -> Arc<MindMap> {
        self.store.snapshot()
    }

    pub fn digest(&self) -> String {
        self.store.snapshot().digest()
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub fn resolver_mut(&mut self) -> &mut ConflictResolver {
        &mut self.resolver
    }

    /// Operations remembered for conflict detection, oldest first
    pub fn applied_log(&self) -> impl Iterator<Item = &Operation> {
        self.applied.iter()
    }

    // ---------------------------------------------------------------------
    // Local edits
    // ---------------------------------------------------------------------

    /// Validate, stamp, apply and queue a local edit
    pub fn submit(
        &mut self,
        kind: OperationKind,
        target_id: impl Into<NodeId>,
    ) -> Result<PendingOperation, SessionError> {
        self.submit_with_priority(kind, target_id, 0)
    }

    pub fn submit_with_priority(
        &mut self,
        kind: OperationKind,
        target_id: impl Into<NodeId>,
        priority: i32,
    ) -> Result<PendingOperation, SessionError> {
        let draft = Operation::new(self.mindmap_id.clone(), self.replica.clone(), target_id, kind);
        draft.kind.data()?;
        let snapshot = self.store.snapshot();
        if !ConflictResolver::can_apply_operation(&draft, &snapshot) {
            return Err(SessionError::Precondition(format!(
                "{} of {} does not fit the current tree",
                draft.operation_type(),
                draft.target_id
            )));
        }

        let op = self.queue.stamp(draft);
        let captured = DeletedSubtree::capture(&op, &snapshot);
        self.store.apply_operation(&op)?;
        if let Some(deleted) = captured {
            self.remember_deleted(deleted);
        }
        self.remember(op.clone());
        Ok(self.queue.enqueue(op, priority))
    }

    /// Wait for the outbound queue to go idle
    pub async fn flush(&self) {
        self.queue.wait_idle().await;
    }

    // ---------------------------------------------------------------------
    // Remote operations
    // ---------------------------------------------------------------------

    /// Integrate an operation from another replica
    pub fn receive_remote(&mut self, op: Operation) -> RemoteOutcome {
        if op.mindmap_id != self.mindmap_id {
            log::warn!(
                "Replica {} ignoring operation {} for map {}",
                self.replica,
                op.id,
                op.mindmap_id
            );
            return RemoteOutcome::Stale;
        }
        if !self.seen.insert(op.id) || self.store.has_applied(&op.id) {
            log::debug!("Duplicate delivery of {} to {}", op.id, self.replica);
            return RemoteOutcome::Duplicate;
        }
        self.queue.observe_clock(&op.vector_clock);

        // Edits that land inside a subtree removed by a concurrent delete
        let mut restore = Vec::new();
        let mut candidate = Some(op.clone());
        for deleted in self.deleted.iter_mut() {
            let Some(current) = candidate.as_ref() else {
                break;
            };
            if let Some(restoration) = self.resolver.restore_deleted(current, deleted) {
                restore.extend(restoration.restore);
                candidate = restoration.candidate;
            }
        }

        let restored = !restore.is_empty();
        for extra in &restore {
            self.apply_checked(extra);
        }
        let Some(remote) = candidate else {
            self.remember(op);
            if restored {
                return RemoteOutcome::Applied(StrategyKind::PreserveChildren);
            }
            log::debug!("Operation already removed with its ancestor at {}", self.replica);
            return RemoteOutcome::Stale;
        };

        if remote.is_noop() {
            if let Err(e) = self.store.apply_operation(&remote) {
                log::warn!("Could not record noop {}: {}", remote.id, e);
            }
            self.remember(remote);
            return RemoteOutcome::Noop;
        }

        let snapshot = self.store.snapshot();
        let conflicts = self.resolver.find_conflicts(&remote, &self.applied, &snapshot);
        let resolution = self.resolver.resolve(&remote, &conflicts, &snapshot);

        let mut applied_candidate = false;
        for resolved in &resolution.operations {
            if self.apply_checked(resolved) && resolved.id == remote.id {
                applied_candidate = true;
            }
        }
        self.remember(remote);

        let strategy = match resolution.strategy {
            StrategyKind::NoConflict if restored => StrategyKind::PreserveChildren,
            other => other,
        };
        if resolution.is_discarded() {
            RemoteOutcome::Discarded(strategy)
        } else if applied_candidate {
            RemoteOutcome::Applied(strategy)
        } else {
            RemoteOutcome::Stale
        }
    }

    /// Drain whatever has arrived in an inbox without waiting
    pub fn receive_pending(&mut self, inbox: &mut mpsc::UnboundedReceiver<Operation>) -> Vec<RemoteOutcome> {
        let mut outcomes = Vec::new();
        while let Ok(op) = inbox.try_recv() {
            outcomes.push(self.receive_remote(op));
        }
        outcomes
    }

    /// Apply one resolved operation if it still fits the tree
    fn apply_checked(&mut self, op: &Operation) -> bool {
        let snapshot = self.store.snapshot();
        if !ConflictResolver::can_apply_operation(op, &snapshot) {
            log::debug!(
                "Dropping stale {} {} on {} at {}",
                op.operation_type(),
                op.id,
                op.target_id,
                self.replica
            );
            return false;
        }
        let captured = DeletedSubtree::capture(op, &snapshot);
        match self.store.apply_operation(op) {
            Ok(_) => {
                if let Some(deleted) = captured {
                    self.remember_deleted(deleted);
                }
                true
            }
            Err(e) => {
                log::warn!("Store rejected {} {}: {}", op.operation_type(), op.id, e);
                false
            }
        }
    }

    fn remember(&mut self, op: Operation) {
        self.seen.insert(op.id);
        self.applied.push_back(op);
        while self.applied.len() > self.config.applied_log_limit {
            self.applied.pop_front();
        }
    }

    fn remember_deleted(&mut self, deleted: DeletedSubtree) {
        self.deleted.push_back(deleted);
        while self.deleted.len() > self.config.applied_log_limit {
            self.deleted.pop_front();
        }
    }
}
