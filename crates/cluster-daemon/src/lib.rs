//! cluster-daemon library: native networking for cluster membership and
//! replication.
//!
//! Exposes the components so the binary and integration tests share them.

pub mod codec;
pub mod dispatch;
pub mod heartbeat;
pub mod receiver;
pub mod sender;
pub mod transmitter;

// Re-export key types for convenience
pub use dispatch::MessageDispatcher;
pub use heartbeat::{Channels, HeartbeatService};
pub use receiver::{MessageListener, ReplicationReceiver};
pub use sender::PeerSender;
pub use transmitter::Transmitter;
