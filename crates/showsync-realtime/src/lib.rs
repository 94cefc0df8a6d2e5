//! Real-time synchronization and connection resilience for a session's
//! tour requests and direct messages.
//!
//! A [`SyncCoordinator`] owns at most one [`SyncSession`] at a time, bound to
//! the current owner id. Each session drives one multiplexed push channel,
//! one polling loop per resource, and an isolated unread-count channel from
//! a single task, and publishes a [`SyncSnapshot`] the UI renders through
//! [`view::ConnectionStatusView`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

pub mod backend;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod polling;
pub mod readiness;
pub mod session;
pub mod sim;
pub mod unread;
pub mod view;
pub mod ws;

pub use backend::{ChannelSink, DataService, SubscriptionHandle};
pub use config::SyncConfig;
pub use coordinator::SyncCoordinator;
pub use error::{ConfigError, SyncError};
pub use session::{SyncEvent, SyncHandle, SyncSession, SyncSnapshot};

/// What a deadline saturates to when `now + delay` does not fit in an
/// [`Instant`]. Roughly thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

pub(crate) fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Names of the subscriptions a session tracks health for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionId {
    /// Multiplexed channel for tour requests and messages.
    RealtimeChannel,
    TourRequestsPoll,
    MessagesPoll,
    UnreadCount,
}

impl SubscriptionId {
    pub const ALL: [SubscriptionId; 4] = [
        SubscriptionId::RealtimeChannel,
        SubscriptionId::TourRequestsPoll,
        SubscriptionId::MessagesPoll,
        SubscriptionId::UnreadCount,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionId::RealtimeChannel => "realtime-channel",
            SubscriptionId::TourRequestsPoll => "tour-requests-poll",
            SubscriptionId::MessagesPoll => "messages-poll",
            SubscriptionId::UnreadCount => "unread-count",
        }
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubscriptionId {
    type Err = SyncError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SubscriptionId::ALL
            .into_iter()
            .find(|id| id.as_str() == value.trim())
            .ok_or_else(|| SyncError::UnknownSubscription(value.to_string()))
    }
}
