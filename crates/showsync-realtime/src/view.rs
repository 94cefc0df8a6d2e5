//! Presentation of a [`SyncSnapshot`]. Pure: no state, no side effects.

use crate::session::SyncSnapshot;
use crate::SubscriptionId;
use chrono::{DateTime, Utc};
use showsync_core::{OverallStatus, ResourceKind};
use std::fmt;

pub const OFFLINE_LABEL: &str = "offline";
pub const ISSUES_BADGE: &str = "connection issues";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Headline {
    Disabled,
    Offline,
    Live,
    Issues,
}

impl Headline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Headline::Disabled => "Realtime off",
            Headline::Offline => "Offline",
            Headline::Live => "Live",
            Headline::Issues => "Connection issues",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub subscription: SubscriptionId,
    pub label: &'static str,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// The circuit is open; only a manual retry brings it back.
    pub retry_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLine {
    pub kind: ResourceKind,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatusView {
    pub headline: Headline,
    pub badge: Option<&'static str>,
    pub rows: Vec<StatusRow>,
    pub resources: Vec<ResourceLine>,
    pub unread: Option<String>,
    pub can_submit_forms: bool,
}

impl ConnectionStatusView {
    pub fn from_snapshot(snapshot: &SyncSnapshot) -> Self {
        if snapshot.is_disabled() {
            return Self {
                headline: if snapshot.online {
                    Headline::Disabled
                } else {
                    Headline::Offline
                },
                badge: None,
                rows: Vec::new(),
                resources: Vec::new(),
                unread: None,
                can_submit_forms: snapshot.can_submit_forms(),
            };
        }

        let healthy = snapshot.overall_status() == OverallStatus::Healthy;
        let headline = match (snapshot.online, healthy) {
            (false, _) => Headline::Offline,
            (true, true) => Headline::Live,
            (true, false) => Headline::Issues,
        };
        let badge = (snapshot.online && !healthy).then_some(ISSUES_BADGE);

        let rows = snapshot
            .subscriptions
            .iter()
            .map(|(id, status)| StatusRow {
                subscription: *id,
                label: if snapshot.online {
                    status.connection_status().as_str()
                } else {
                    OFFLINE_LABEL
                },
                retry_count: status.health.retry_count,
                last_error: status.health.last_error.clone(),
                retry_available: status.health.circuit_breaker_open,
            })
            .collect();

        let resources = snapshot
            .resources
            .iter()
            .map(|(kind, status)| {
                let label = if status.is_loading {
                    "loading".to_string()
                } else {
                    let mut label = match status.record_count {
                        Some(count) => format!("{count} records"),
                        None => "no data".to_string(),
                    };
                    if let Some(at) = status.last_fetch_at {
                        label.push_str(&format!(" (fetched {})", clock(at)));
                    }
                    if status.is_refreshing {
                        label.push_str(", refreshing");
                    }
                    label
                };
                ResourceLine { kind: *kind, label }
            })
            .collect();

        let unread = snapshot.unread.count.map(|count| {
            if snapshot.unread.stale {
                format!("{count} (stale)")
            } else {
                count.to_string()
            }
        });

        Self {
            headline,
            badge,
            rows,
            resources,
            unread,
            can_submit_forms: snapshot.can_submit_forms(),
        }
    }
}

fn clock(at: DateTime<Utc>) -> String {
    at.format("%H:%M:%S").to_string()
}

impl fmt::Display for ConnectionStatusView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.headline.as_str())?;
        if let Some(badge) = self.badge {
            write!(f, " ({badge})")?;
        }
        writeln!(
            f,
            " forms={}",
            if self.can_submit_forms { "open" } else { "blocked" }
        )?;
        for row in &self.rows {
            write!(f, "  {:<20} {:<12}", row.subscription.as_str(), row.label)?;
            if row.retry_count > 0 {
                write!(f, " retries={}", row.retry_count)?;
            }
            if row.retry_available {
                write!(f, " [retry]")?;
            }
            if let Some(error) = &row.last_error {
                write!(f, " last_error={error:?}")?;
            }
            writeln!(f)?;
        }
        for line in &self.resources {
            writeln!(f, "  {:<20} {}", line.kind.as_str(), line.label)?;
        }
        if let Some(unread) = &self.unread {
            writeln!(f, "  {:<20} {unread}", "unread")?;
        }
        Ok(())
    }
}
