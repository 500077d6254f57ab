//! Wire protocols.
//!
//! - Heartbeat datagrams announcing liveness over multicast
//! - Length-prefixed data frames over point-to-point connections
//! - The handshake that opens every data connection

pub mod frame;
pub mod handshake;
pub mod heartbeat;

pub use frame::{
    FLAG_ACK_REQUESTED, FRAME_HEADER_LEN, Frame, FrameKind, LENGTH_PREFIX_LEN, MAX_FRAME_SIZE,
};
pub use handshake::{Handshake, PROTOCOL_VERSION};
pub use heartbeat::{Command, HEARTBEAT_MAGIC, HEARTBEAT_VERSION, HeartbeatPacket};
