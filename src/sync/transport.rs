//! Transport boundary and an in-memory network
//!
//! The core only needs `send` with at-least-once semantics and a stream of
//! incoming operations per replica. `LoopbackNetwork` provides both without
//! sockets: every replica registered with it gets a `LoopbackTransport` for
//! sending and an `mpsc` receiver for everything the other replicas send.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::error::TransportError;
use super::wire;
use crate::convergent::{Operation, ReplicaId, VectorClock};

/// Server acknowledgement of a delivered operation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SendAck {
    pub vector_clock: VectorClock,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one operation. An error triggers the queue's retry policy.
    async fn send(&self, op: &Operation) -> Result<SendAck, TransportError>;
}

struct Peer {
    inbox: mpsc::UnboundedSender<Operation>,
    /// Operations held back while the replica is partitioned
    backlog: Vec<Operation>,
    reachable: bool,
    fail_next: u32,
}

#[derive(Default)]
struct Hub {
    peers: BTreeMap<ReplicaId, Peer>,
    server_clock: VectorClock,
    delivered: u64,
}

/// In-memory fan-out hub standing in for a sync server
#[derive(Default)]
pub struct LoopbackNetwork {
    hub: Mutex<Hub>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a replica and hand back its send side and inbox
    pub fn connect(
        self: &Arc<Self>,
        replica: impl Into<ReplicaId>,
    ) -> (Arc<LoopbackTransport>, mpsc::UnboundedReceiver<Operation>) {
        let replica = replica.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub().peers.insert(
            replica.clone(),
            Peer {
                inbox: tx,
                backlog: Vec::new(),
                reachable: true,
                fail_next: 0,
            },
        );
        log::debug!("Replica {} joined loopback network", replica);
        let transport = Arc::new(LoopbackTransport {
            replica,
            network: Arc::clone(self),
            attempts: AtomicU64::new(0),
        });
        (transport, rx)
    }

    /// Make the next `n` sends from `replica` fail
    pub fn fail_next(&self, replica: &str, n: u32) {
        if let Some(peer) = self.hub().peers.get_mut(replica) {
            peer.fail_next = n;
        }
    }

    /// Partition or heal a replica. While unreachable its sends fail with
    /// `Disconnected` and operations addressed to it are held back.
    pub fn set_reachable(&self, replica: &str, reachable: bool) {
        let mut hub = self.hub();
        let Some(peer) = hub.peers.get_mut(replica) else {
            return;
        };
        peer.reachable = reachable;
        if reachable {
            for op in peer.backlog.drain(..) {
                let _ = peer.inbox.send(op);
            }
        }
    }

    /// Component-wise max of every clock the hub has accepted
    pub fn server_clock(&self) -> VectorClock {
        self.hub().server_clock.clone()
    }

    /// Number of operations accepted by the hub
    pub fn delivered(&self) -> u64 {
        self.hub().delivered
    }

    fn accept(&self, from: &str, encoded: &[u8]) -> Result<SendAck, TransportError> {
        let op: Operation = wire::from_cbor(encoded)?;
        let mut hub = self.hub();

        let peer = hub
            .peers
            .get_mut(from)
            .ok_or_else(|| TransportError::UnknownReplica(from.to_string()))?;
        if !peer.reachable {
            return Err(TransportError::Disconnected);
        }
        if peer.fail_next > 0 {
            peer.fail_next -= 1;
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        hub.server_clock.update(&op.vector_clock);
        hub.delivered += 1;
        for (id, peer) in hub.peers.iter_mut() {
            if id == from {
                continue;
            }
            if peer.reachable {
                if peer.inbox.send(op.clone()).is_err() {
                    log::debug!("Replica {} inbox closed", id);
                }
            } else {
                peer.backlog.push(op.clone());
            }
        }

        // The hub records the operation as stamped; it does not vouch for
        // anything the sender has not seen.
        Ok(SendAck {
            vector_clock: op.vector_clock,
        })
    }
}

/// One replica's handle on a `LoopbackNetwork`
pub struct LoopbackTransport {
    replica: ReplicaId,
    network: Arc<LoopbackNetwork>,
    attempts: AtomicU64,
}

impl LoopbackTransport {
    pub fn replica(&self) -> &str {
        &self.replica
    }

    /// Sends attempted through this handle, failed ones included
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, op: &Operation) -> Result<SendAck, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let encoded = wire::to_cbor(op)?;
        // Hand control back to the scheduler as a real network would
        tokio::task::yield_now().await;
        self.network.accept(&self.replica, &encoded)
    }
}
