//! Message envelopes with correlation IDs for tracking agent communication.

use serde::{Deserialize, Serialize};

use super::types::{response_type, Payload, ResponseBody};

/// Message envelope exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Unique message ID (ULID)
    pub id: String,
    /// Logical message kind (e.g. `mine_data`, `mine_data_response`)
    #[serde(rename = "type")]
    pub message_type: String,
    /// Type-specific arguments or results
    #[serde(default)]
    pub payload: Payload,
    /// Originating agent's identifier
    pub sender_id: String,
    /// Queue a response should be published to; absent for fire-and-forget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Token matching a reply to its request
    pub correlation_id: String,
    /// Creation timestamp (unix ms)
    pub created_at: i64,
}

impl Envelope {
    /// Create a fire-and-forget envelope with a fresh correlation ID.
    pub fn new(sender_id: impl Into<String>, message_type: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: generate_id(),
            message_type: message_type.into(),
            payload,
            sender_id: sender_id.into(),
            reply_to: None,
            correlation_id: generate_id(),
            created_at: current_timestamp(),
        }
    }

    /// Set correlation ID for request/response tracking.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    /// Set the reply address.
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Whether the sender is waiting for a response.
    pub fn expects_reply(&self) -> bool {
        self.reply_to.as_deref().is_some_and(|q| !q.is_empty())
    }

    /// Create the response envelope for this request.
    ///
    /// The response copies the correlation ID unchanged and never carries a
    /// reply address of its own.
    pub fn create_response(&self, from_agent: &str, body: ResponseBody) -> Self {
        Self {
            id: generate_id(),
            message_type: response_type(&self.message_type),
            payload: body.into_payload(from_agent),
            sender_id: from_agent.to_string(),
            reply_to: None,
            correlation_id: self.correlation_id.clone(),
            created_at: current_timestamp(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

pub(crate) fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
