//! Outbound operation queue
//!
//! Buffers locally generated operations, stamps them with the replica's
//! vector clock, and delivers them through a [`Transport`] in batches. A batch
//! is sent concurrently and settles as a whole; one failed send never holds up
//! its siblings. Failed sends are retried with exponential backoff and go back
//! to the very front of the queue. Once retries are exhausted the operation
//! lands in the conflict queue and its waiter is told.
//!
//! Draining is single-flight and stops (without error) while offline;
//! reconnecting resumes it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::join_all;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use super::config::QueueConfig;
use super::error::{QueueError, TransportError};
use super::transport::Transport;
use crate::convergent::{OpId, Operation, OperationStatus, ReplicaId, VectorClock};

type Completion = Result<Operation, QueueError>;

/// Priority of retried operations; nothing overtakes them
const RETRY_PRIORITY: i32 = i32::MAX;

/// Handle on a queued operation
#[derive(Debug)]
pub struct PendingOperation {
    /// The operation as stamped by the queue
    pub operation: Operation,
    completion: oneshot::Receiver<Completion>,
}

impl PendingOperation {
    pub fn id(&self) -> OpId {
        self.operation.id
    }

    /// Wait until the operation is delivered, cancelled or permanently failed
    pub async fn wait(self) -> Completion {
        self.completion.await.unwrap_or(Err(QueueError::Closed))
    }
}

/// Point-in-time view of the queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub in_flight: usize,
    pub backing_off: usize,
    pub processing: bool,
    pub online: bool,
    pub completed: u64,
    pub failed: u64,
    pub conflicts: usize,
}

struct QueueEntry {
    operation: Operation,
    priority: i32,
}

#[derive(Default)]
struct QueueState {
    clock: VectorClock,
    entries: VecDeque<QueueEntry>,
    waiters: HashMap<OpId, oneshot::Sender<Completion>>,
    in_flight: usize,
    backing_off: usize,
    history: VecDeque<Operation>,
    conflicts: Vec<Operation>,
    completed: u64,
    failed: u64,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) {
        let index = self
            .entries
            .iter()
            .position(|e| e.priority < entry.priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, entry);
    }

    fn is_idle(&self) -> bool {
        self.entries.is_empty() && self.in_flight == 0 && self.backing_off == 0
    }
}

pub struct OperationQueue {
    replica: ReplicaId,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<QueueState>,
    online: AtomicBool,
    processing: AtomicBool,
    idle: Notify,
}

impl OperationQueue {
    /// Returns `Arc<Self>` because draining and retries run on spawned tasks
    /// that hold a reference.
    pub fn new(replica: impl Into<ReplicaId>, config: QueueConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            replica: replica.into(),
            config,
            transport,
            state: Mutex::new(QueueState::default()),
            online: AtomicBool::new(true),
            processing: AtomicBool::new(false),
            idle: Notify::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn replica(&self) -> &str {
        &self.replica
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The replica's current clock
    pub fn clock(&self) -> VectorClock {
        self.state().clock.clone()
    }

    /// Merge a clock observed on a remote operation
    pub fn observe_clock(&self, clock: &VectorClock) {
        self.state().clock.update(clock);
    }

    /// Give an operation a fresh id and the next tick of this replica's clock
    pub fn stamp(&self, mut op: Operation) -> Operation {
        let mut state = self.state();
        state.clock.increment(&self.replica);
        op.id = Uuid::new_v4();
        op.vector_clock = state.clock.clone();
        op.status = OperationStatus::Pending;
        op.retry_count = 0;
        op
    }

    /// Stamp and enqueue at default priority
    pub fn add_operation(self: &Arc<Self>, op: Operation) -> PendingOperation {
        self.add_operation_with_priority(op, 0)
    }

    /// Stamp and enqueue ahead of every queued entry with a lower priority
    pub fn add_operation_with_priority(self: &Arc<Self>, op: Operation, priority: i32) -> PendingOperation {
        let op = self.stamp(op);
        self.enqueue(op, priority)
    }

    /// Enqueue an operation that is already stamped
    pub fn enqueue(self: &Arc<Self>, op: Operation, priority: i32) -> PendingOperation {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state();
            state.waiters.insert(op.id, tx);
            state.insert(QueueEntry {
                operation: op.clone(),
                priority,
            });
        }
        log::debug!(
            "Queued {} {} on {} (clock {:?})",
            op.operation_type(),
            op.id,
            op.target_id,
            op.vector_clock
        );
        if self.is_online() && !self.processing.load(Ordering::SeqCst) {
            self.kick();
        }
        PendingOperation {
            operation: op,
            completion: rx,
        }
    }

    /// Remove a still-queued operation. In-flight sends are not affected.
    pub fn cancel_operation(&self, id: &OpId) -> bool {
        let waiter = {
            let mut state = self.state();
            let Some(index) = state.entries.iter().position(|e| &e.operation.id == id) else {
                return false;
            };
            state.entries.remove(index);
            state.waiters.remove(id)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Err(QueueError::Cancelled(*id)));
        }
        log::debug!("Cancelled queued operation {}", id);
        self.notify_if_idle();
        true
    }

    /// Drop every queued operation, rejecting their waiters. Returns how many.
    pub fn clear(&self) -> usize {
        let dropped: Vec<(OpId, Option<oneshot::Sender<Completion>>)> = {
            let mut state = self.state();
            let ids: Vec<OpId> = state.entries.drain(..).map(|e| e.operation.id).collect();
            let mut dropped = Vec::with_capacity(ids.len());
            for id in ids {
                let waiter = state.waiters.remove(&id);
                dropped.push((id, waiter));
            }
            dropped
        };
        let count = dropped.len();
        for (id, waiter) in dropped {
            if let Some(tx) = waiter {
                let _ = tx.send(Err(QueueError::Cancelled(id)));
            }
        }
        if count > 0 {
            log::info!("Cleared {} queued operation(s) on {}", count, self.replica);
        }
        self.notify_if_idle();
        count
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Flip connectivity. Going online resumes draining.
    pub fn set_online(self: &Arc<Self>, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if online && !was {
            let queued = self.state().entries.len();
            log::info!("Replica {} back online; {} operation(s) queued", self.replica, queued);
            if queued > 0 {
                self.kick();
            }
        } else if !online && was {
            log::info!("Replica {} offline; buffering operations", self.replica);
        }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.state();
        QueueStatus {
            queued: state.entries.len(),
            in_flight: state.in_flight,
            backing_off: state.backing_off,
            processing: self.processing.load(Ordering::SeqCst),
            online: self.is_online(),
            completed: state.completed,
            failed: state.failed,
            conflicts: state.conflicts.len(),
        }
    }

    /// Operations still waiting to be sent, in send order
    pub fn queued(&self) -> Vec<Operation> {
        self.state().entries.iter().map(|e| e.operation.clone()).collect()
    }

    /// The most recent `limit` delivered operations, oldest first
    pub fn history(&self, limit: usize) -> Vec<Operation> {
        let state = self.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Permanently failed operations
    pub fn conflicts(&self) -> Vec<Operation> {
        self.state().conflicts.clone()
    }

    pub fn take_conflicts(&self) -> Vec<Operation> {
        std::mem::take(&mut self.state().conflicts)
    }

    /// Give a permanently failed operation a fresh set of retries
    pub fn requeue_conflict(self: &Arc<Self>, id: &OpId) -> Result<PendingOperation, QueueError> {
        let mut op = {
            let mut state = self.state();
            let index = state
                .conflicts
                .iter()
                .position(|op| &op.id == id)
                .ok_or(QueueError::NotInConflicts(*id))?;
            state.conflicts.remove(index)
        };
        op.retry_count = 0;
        op.status = OperationStatus::Pending;
        log::info!("Requeueing failed operation {}", op.id);
        Ok(self.enqueue(op, 0))
    }

    /// Wait until nothing is queued, in flight or waiting to retry
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.state().is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Spawn a drain on the current runtime
    fn kick(self: &Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = Arc::clone(self);
                handle.spawn(async move {
                    queue.process_queue().await;
                });
            }
            Err(_) => log::warn!("No async runtime; operations stay queued until process_queue is called"),
        }
    }

    fn notify_if_idle(&self) {
        if self.state().is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Drain the queue batch by batch while online. A no-op when offline or
    /// when another drain is already running.
    pub async fn process_queue(self: &Arc<Self>) {
        loop {
            if !self.is_online() {
                log::debug!("Replica {} offline, not draining", self.replica);
                return;
            }
            if self.processing.swap(true, Ordering::SeqCst) {
                return;
            }

            loop {
                if !self.is_online() {
                    break;
                }
                let batch = self.next_batch();
                if batch.is_empty() {
                    break;
                }
                self.process_batch(batch).await;
                if !self.state().entries.is_empty() {
                    tokio::time::sleep(self.config.batch_interval()).await;
                }
            }
            self.processing.store(false, Ordering::SeqCst);

            // Something may have been queued after the last empty check
            let more = self.is_online() && !self.state().entries.is_empty();
            if !more {
                return;
            }
        }
    }

    fn next_batch(&self) -> Vec<Operation> {
        let mut state = self.state();
        let take = self.config.batch_size.max(1).min(state.entries.len());
        let batch: Vec<Operation> = state
            .entries
            .drain(..take)
            .map(|mut e| {
                e.operation.status = OperationStatus::Processing;
                e.operation
            })
            .collect();
        state.in_flight += batch.len();
        batch
    }

    /// Send a batch concurrently and wait for every send to settle
    pub async fn process_batch(self: &Arc<Self>, batch: Vec<Operation>) {
        log::debug!("Sending batch of {} from {}", batch.len(), self.replica);
        join_all(batch.into_iter().map(|op| self.send_one(op))).await;
    }

    async fn send_one(self: &Arc<Self>, op: Operation) {
        match self.transport.send(&op).await {
            Ok(ack) => self.complete(op, &ack.vector_clock),
            Err(e) => self.fail(op, e),
        }
        self.notify_if_idle();
    }

    fn complete(&self, mut op: Operation, server_clock: &VectorClock) {
        op.status = OperationStatus::Completed;
        let waiter = {
            let mut state = self.state();
            state.clock.update(server_clock);
            state.in_flight = state.in_flight.saturating_sub(1);
            state.completed += 1;
            state.history.push_back(op.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
            state.waiters.remove(&op.id)
        };
        log::debug!("Delivered {} {}", op.operation_type(), op.id);
        if let Some(tx) = waiter {
            let _ = tx.send(Ok(op));
        }
    }

    fn fail(self: &Arc<Self>, mut op: Operation, error: TransportError) {
        if op.retry_count < self.config.max_retries {
            op.retry_count += 1;
            op.status = OperationStatus::Pending;
            let delay = self.config.backoff(op.retry_count);
            log::warn!(
                "Send of {} failed: {}; retry {}/{} in {:?}",
                op.id,
                error,
                op.retry_count,
                self.config.max_retries,
                delay
            );
            {
                let mut state = self.state();
                state.in_flight = state.in_flight.saturating_sub(1);
                state.backing_off += 1;
            }
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                queue.retry_front(op);
            });
            return;
        }

        op.status = OperationStatus::Failed;
        let attempts = op.retry_count + 1;
        log::error!(
            "Operation {} failed permanently after {} attempts: {}",
            op.id,
            attempts,
            error
        );
        let waiter = {
            let mut state = self.state();
            state.in_flight = state.in_flight.saturating_sub(1);
            state.failed += 1;
            state.conflicts.push(op.clone());
            state.waiters.remove(&op.id)
        };
        if let Some(tx) = waiter {
            let _ = tx.send(Err(QueueError::RetriesExhausted {
                id: op.id,
                attempts,
                source: error,
            }));
        }
    }

    /// Put a retried operation back at the head of the queue
    fn retry_front(self: &Arc<Self>, op: Operation) {
        {
            let mut state = self.state();
            state.backing_off = state.backing_off.saturating_sub(1);
            state.entries.push_front(QueueEntry {
                operation: op,
                priority: RETRY_PRIORITY,
            });
        }
        if self.is_online() {
            self.kick();
        }
    }
}
