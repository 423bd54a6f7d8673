//! Replica-side synchronisation
//!
//! The outbound operation queue, the transport boundary it sends through,
//! and the per-document session that ties the queue to the convergent core.

pub mod config;
pub mod error;
pub mod queue;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::{QueueConfig, SessionConfig};
pub use error::{ConfigError, QueueError, SessionError, TransportError};
pub use queue::{OperationQueue, PendingOperation, QueueStatus};
pub use session::{CollaborationSession, RemoteOutcome};
pub use transport::{LoopbackNetwork, LoopbackTransport, SendAck, Transport};
