//! Inter-AI Communication Protocol wire model.
//!
//! - Message envelopes with globally unique ids
//! - Closed message type enumeration (query, response, observation, proposal)
//! - Oversight and safety records attached by the gateway's gates

pub mod envelope;
pub mod types;

pub use envelope::{Envelope, EnvelopeBuilder, PROTOCOL_VERSION};
pub use types::{
    AgentIdentity, Content, MessageType, Metadata, OversightRecord, Recipient, SafetyRecord,
    Target, BROADCAST_MARKER,
};
