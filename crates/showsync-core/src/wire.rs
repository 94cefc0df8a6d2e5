//! JSON envelope exchanged with the change-notification backend over a
//! WebSocket. Every text frame carries exactly one [`WireEnvelope`].

use crate::{ChannelStatus, OwnerId, Record, ResourceKind, Topic};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const PROTOCOL_VERSION: u16 = 1;

fn protocol_version() -> u16 {
    PROTOCOL_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireEnvelope {
    /// Peers that omit the field are assumed to speak the current version.
    #[serde(default = "protocol_version")]
    pub version: u16,
    pub client_id: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    /// Stamps `msg` with the current version and time.
    pub fn new(client_id: impl Into<String>, request_id: Option<String>, msg: WireMsg) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            client_id: client_id.into(),
            timestamp: Utc::now().to_rfc3339(),
            request_id,
            msg,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    Subscribe(SubscribePayload),
    Unsubscribe(UnsubscribePayload),
    ChannelStatus(ChannelStatusPayload),
    Changed(ChangedPayload),
    Query(QueryPayload),
    QueryResult(QueryResultPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubscribePayload {
    pub subscription_id: String,
    pub owner_id: OwnerId,
    #[serde(default)]
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnsubscribePayload {
    pub subscription_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStatusPayload {
    pub subscription_id: String,
    pub status: ChannelStatus,
    #[serde(default)]
    pub detail: Option<String>,
}

/// "Something changed" for a topic. Deliberately carries no row data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangedPayload {
    pub subscription_id: String,
    pub topic: Topic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryPayload {
    pub owner_id: OwnerId,
    pub kind: ResourceKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryResultPayload {
    pub kind: ResourceKind,
    #[serde(default)]
    pub records: Vec<Record>,
    #[serde(default)]
    pub error: Option<QueryError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
}

pub fn encode_text<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_text<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes one envelope, refusing frames from a newer protocol.
pub fn decode_envelope(text: &str, max_frame_bytes: usize) -> Result<WireEnvelope, FrameError> {
    let envelope: WireEnvelope = decode_text(text, max_frame_bytes)?;
    if envelope.version > PROTOCOL_VERSION {
        return Err(FrameError::UnsupportedVersion(envelope.version));
    }
    Ok(envelope)
}
