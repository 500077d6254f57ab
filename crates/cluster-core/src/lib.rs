//! cluster-core: platform-free building blocks for cluster membership and
//! replication transport.
//!
//! This crate provides:
//! - Member identity and the membership registry fed by heartbeats
//! - Per-peer sender health (Ready / Suspect / Failing)
//! - Heartbeat and data-frame wire codecs plus the connection handshake
//! - Membership events with subscription-based fan-out
//! - The bounded handoff queue between producers and the dispatch worker
//! - Configuration and error types
//!
//! Sockets live in `cluster-daemon`.

pub mod config;
pub mod error;
pub mod events;
pub mod member;
pub mod membership;
pub mod message;
pub mod protocol;
pub mod queue;
pub mod sender_state;

pub use config::{
    ClusterConfig, FanOut, MembershipConfig, QueueConfig, ReceiverConfig, SenderConfig,
    TransmitterConfig,
};
pub use error::{ChannelError, ConfigError, FaultyMember, ProtocolError, TransportError};
pub use events::{EventBus, MembershipEvent, Subscription};
pub use member::{Member, MemberId, MemberIdError, now_ms};
pub use membership::{MembershipRegistry, UpsertOutcome};
pub use message::{OutboundMessage, PendingMessage};
pub use queue::HandoffQueue;
pub use sender_state::{HealthState, SenderState, SenderStateRegistry};
