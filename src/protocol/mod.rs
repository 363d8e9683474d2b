//! Agent communication protocol.
//!
//! This module defines the wire format for inter-agent communication:
//! - Message envelopes with correlation IDs and reply addresses
//! - Response bodies and parsed replies
//! - Queue naming and well-known message types

pub mod envelope;
pub mod types;

pub use envelope::Envelope;
pub use types::{
    agent_queue, kinds, response_type, Payload, Reply, ResponseBody, ResponseStatus,
    BROADCAST_TOPIC,
};
