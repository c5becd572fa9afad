//! Message bus envelope
//!
//! JSON wrapper carried on every bus topic. `requestID` is the RPC
//! correlation key; `correlationID` is for tracing only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BleSrvError, Result};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const API_VERSION: &str = "v3";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(default)]
    pub api_version: String,

    #[serde(rename = "requestID", default)]
    pub request_id: String,

    #[serde(rename = "correlationID", default)]
    pub correlation_id: String,

    #[serde(default)]
    pub error_code: i32,

    #[serde(default)]
    pub payload: Value,

    #[serde(default)]
    pub content_type: String,

    /// Topic the envelope arrived on; never serialized
    #[serde(skip)]
    pub received_topic: String,
}

impl Envelope {
    /// Fresh envelope with new request and correlation ids
    pub fn new(payload: Value) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            request_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            error_code: 0,
            payload,
            content_type: CONTENT_TYPE_JSON.to_string(),
            received_topic: String::new(),
        }
    }

    /// Response envelope answering `request_id`
    pub fn response_to(request_id: impl Into<String>, payload: Value) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::new(payload)
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode an envelope received on `topic`
    pub fn from_bytes(topic: &str, bytes: &[u8]) -> Result<Self> {
        let mut envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| BleSrvError::serialization(format!("invalid envelope on {topic}: {e}")))?;
        envelope.received_topic = topic.to_string();
        Ok(envelope)
    }

    /// Payload as a JSON value; a string payload holding JSON is parsed
    pub fn payload_json(&self) -> Result<Value> {
        match &self.payload {
            Value::String(text) => serde_json::from_str(text).map_err(|e| {
                BleSrvError::serialization(format!("payload string is not JSON: {e}"))
            }),
            other => Ok(other.clone()),
        }
    }
}
