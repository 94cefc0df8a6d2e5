use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod wire;

/// Identifier scoping which records a subscription or query is limited to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Returns `None` for blank input; a blank owner can never own a subscription.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    TourRequests,
    Messages,
    UnreadMessages,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::TourRequests => "tour-requests",
            ResourceKind::Messages => "messages",
            ResourceKind::UnreadMessages => "unread-messages",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "tour-requests" | "tours" => Ok(ResourceKind::TourRequests),
            "messages" => Ok(ResourceKind::Messages),
            "unread-messages" | "unread" => Ok(ResourceKind::UnreadMessages),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// How a topic's rows relate to the owner id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicScope {
    OwnedBy,
    AddressedTo,
}

/// One resource kind multiplexed on a channel, e.g. "tour requests owned by X".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic {
    pub kind: ResourceKind,
    pub scope: TopicScope,
}

impl Topic {
    pub fn tour_requests_owned() -> Self {
        Self {
            kind: ResourceKind::TourRequests,
            scope: TopicScope::OwnedBy,
        }
    }

    pub fn messages_addressed() -> Self {
        Self {
            kind: ResourceKind::Messages,
            scope: TopicScope::AddressedTo,
        }
    }

    pub fn unread_messages_addressed() -> Self {
        Self {
            kind: ResourceKind::UnreadMessages,
            scope: TopicScope::AddressedTo,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scope = match self.scope {
            TopicScope::OwnedBy => "owned_by",
            TopicScope::AddressedTo => "addressed_to",
        };
        write!(f, "{}:{scope}", self.kind)
    }
}

/// An opaque row returned by the backend. Only `id` is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, flatten)]
    pub fields: HashMap<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            updated_at: None,
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disabled,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disabled => "disabled",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by the transport after a subscribe request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    Error,
    Closed,
}

impl ChannelStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, ChannelStatus::Subscribed)
    }
}

/// Per-subscription status as displayed to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        }
    }
}

impl From<ConnectionState> for ConnectionStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Disabled => ConnectionStatus::Disconnected,
            ConnectionState::Connecting => ConnectionStatus::Connecting,
            ConnectionState::Connected => ConnectionStatus::Connected,
            ConnectionState::Error => ConnectionStatus::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Partial,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Healthy => "healthy",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionHealthRecord {
    pub is_ready: bool,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub circuit_breaker_open: bool,
    #[serde(default)]
    pub last_successful_connection: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateReadiness {
    pub total: usize,
    pub ready: usize,
    pub failed: usize,
    pub required_ready: bool,
    pub overall_status: OverallStatus,
    pub can_submit_forms: bool,
}

impl Default for AggregateReadiness {
    fn default() -> Self {
        Self {
            total: 0,
            ready: 0,
            failed: 0,
            required_ready: true,
            overall_status: OverallStatus::Failed,
            can_submit_forms: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("query for {kind} failed: {message}")]
    Query { kind: ResourceKind, message: String },
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("request timed out after {0}ms")]
    Timeout(u64),
    #[error("transport closed")]
    TransportClosed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_id_rejects_blank_values() {
        assert!(OwnerId::new("").is_none());
        assert!(OwnerId::new("   ").is_none());
        assert_eq!(OwnerId::new(" u1 ").expect("owner").as_str(), "u1");
    }

    #[test]
    fn resource_kind_parses_aliases() {
        assert_eq!(
            "tour_requests".parse::<ResourceKind>(),
            Ok(ResourceKind::TourRequests)
        );
        assert_eq!("unread".parse::<ResourceKind>(), Ok(ResourceKind::UnreadMessages));
        assert!("listings".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn disabled_state_displays_as_disconnected() {
        assert_eq!(
            ConnectionStatus::from(ConnectionState::Disabled),
            ConnectionStatus::Disconnected
        );
        assert_eq!(
            ConnectionStatus::from(ConnectionState::Error).as_str(),
            "error"
        );
    }

    #[test]
    fn record_keeps_unknown_fields() {
        let record: Record = serde_json::from_str(
            r#"{"id":"tr-1","status":"pending","listing_id":42}"#,
        )
        .expect("parse record");
        assert_eq!(record.id, "tr-1");
        assert_eq!(record.fields.get("status"), Some(&Value::from("pending")));
        assert_eq!(record.fields.get("listing_id"), Some(&Value::from(42)));
        assert!(record.updated_at.is_none());
    }
}
