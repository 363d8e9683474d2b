//! Message kinds, addressing conventions, and reply parsing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::Envelope;
use crate::error::{Error, Result};

/// Message payload: type-specific arguments or results.
pub type Payload = Map<String, Value>;

/// Shared topic every broadcast-enabled agent queue is bound to.
pub const BROADCAST_TOPIC: &str = "broadcast";

/// Prefix of every agent inbound queue.
pub const AGENT_QUEUE_PREFIX: &str = "agent_";

/// Suffix appended to a request type to form its response type.
pub const RESPONSE_SUFFIX: &str = "_response";

/// Well-known message types.
pub mod kinds {
    pub const PING: &str = "ping";
    pub const STOP: &str = "stop";
    pub const MINE_DATA: &str = "mine_data";
    pub const CREATE_KNOWLEDGE_GRAPH: &str = "create_knowledge_graph";
    pub const ANSWER_QUERY: &str = "answer_query";
    pub const VALIDATE_ANSWER: &str = "validate_answer";
    pub const GENERATE_REPORT: &str = "generate_report";
}

/// Inbound queue name for an agent id.
pub fn agent_queue(agent_id: &str) -> String {
    format!("{}{}", AGENT_QUEUE_PREFIX, agent_id)
}

/// Response type for a request type (`mine_data` -> `mine_data_response`).
pub fn response_type(message_type: &str) -> String {
    format!("{}{}", message_type, RESPONSE_SUFFIX)
}

/// Outcome carried by a response envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Body of a response envelope before it is put on the wire.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Success(Value),
    Error(String),
}

impl ResponseBody {
    /// Render as the wire payload `{status, data | error, agent_id}`.
    pub fn into_payload(self, agent_id: &str) -> Payload {
        let mut payload = Payload::new();
        match self {
            ResponseBody::Success(data) => {
                payload.insert("status".into(), Value::from("success"));
                payload.insert("data".into(), data);
            }
            ResponseBody::Error(error) => {
                payload.insert("status".into(), Value::from("error"));
                payload.insert("error".into(), Value::from(error));
            }
        }
        payload.insert("agent_id".into(), Value::from(agent_id));
        payload
    }
}

/// A parsed response, as seen by an RPC caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub message_type: String,
    pub status: ResponseStatus,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub agent_id: Option<String>,
    pub correlation_id: String,
}

impl Reply {
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        let status = envelope
            .payload
            .get("status")
            .cloned()
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "reply {} has no status field",
                    envelope.correlation_id
                ))
            })
            .and_then(|v| {
                serde_json::from_value::<ResponseStatus>(v).map_err(|e| {
                    Error::Protocol(format!(
                        "reply {} has invalid status: {}",
                        envelope.correlation_id, e
                    ))
                })
            })?;

        Ok(Self {
            message_type: envelope.message_type.clone(),
            status,
            data: envelope.payload.get("data").cloned(),
            error: envelope
                .payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
            agent_id: envelope
                .payload
                .get("agent_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            correlation_id: envelope.correlation_id.clone(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Look up a field of an object-shaped `data`.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }

    /// The reply rendered back into its wire shape, for error details.
    pub fn to_value(&self) -> Value {
        let body = match (&self.status, &self.error) {
            (ResponseStatus::Success, _) => {
                ResponseBody::Success(self.data.clone().unwrap_or(Value::Null))
            }
            (ResponseStatus::Error, error) => {
                ResponseBody::Error(error.clone().unwrap_or_default())
            }
        };
        Value::Object(body.into_payload(self.agent_id.as_deref().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_addressing() {
        assert_eq!(agent_queue("writer"), "agent_writer");
        assert_eq!(response_type("mine_data"), "mine_data_response");
    }

    #[test]
    fn test_success_reply_round_trip() {
        let request = Envelope::new("orchestrator", kinds::PING, Payload::new());
        let body = ResponseBody::Success(json!({"status": "alive"}));
        let response = request.create_response("writer", body);

        let reply = Reply::from_envelope(&response).unwrap();
        assert!(reply.is_success());
        assert_eq!(reply.message_type, "ping_response");
        assert_eq!(reply.agent_id.as_deref(), Some("writer"));
        assert_eq!(reply.field("status"), Some(&json!("alive")));
        assert_eq!(reply.correlation_id, request.correlation_id);
    }

    #[test]
    fn test_error_reply() {
        let request = Envelope::new("orchestrator", kinds::MINE_DATA, Payload::new());
        let response = request.create_response("data_miner", ResponseBody::Error("boom".into()));

        let reply = Reply::from_envelope(&response).unwrap();
        assert!(!reply.is_success());
        assert_eq!(reply.error.as_deref(), Some("boom"));
        assert!(reply.data.is_none());
        assert_eq!(reply.to_value()["status"], json!("error"));
    }

    #[test]
    fn test_reply_without_status_is_protocol_error() {
        let envelope = Envelope::new("someone", "ping_response", Payload::new());
        let err = Reply::from_envelope(&envelope).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
