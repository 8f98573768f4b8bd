//! Wire formats
//!
//! [`frame`] and [`header`] implement the length-prefixed RPC framing,
//! [`registry`] and [`correlation`] resolve typed payloads, and [`bgs`] ties
//! them into one codec. [`game`] is the uncorrelated framing of the game
//! network.

pub mod bgs;
pub mod correlation;
pub mod frame;
pub mod game;
pub mod header;
pub mod messages;
pub mod registry;
pub mod wire;

pub use bgs::{BgsCodec, BgsPacket, Payload};
pub use correlation::PendingResponses;
pub use frame::{Frame, FrameCodec, PayloadMode};
pub use header::{FrameHeader, Header};
pub use registry::{MethodDescriptor, ServiceRegistry};
