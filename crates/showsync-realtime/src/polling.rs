//! Timer-driven re-fetch of one resource list with adaptive interval.

use crate::backend::RecordsFuture;
use crate::{deadline_after, SubscriptionId};
use chrono::{DateTime, Utc};
use showsync_core::{BackendError, ConnectionState, Record, ResourceKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub type FetchFn = Arc<dyn Fn() -> RecordsFuture + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl PollPolicy {
    /// `min(base * 2^(errors-1), max)`; `base` when there are no errors.
    pub fn interval_after(&self, consecutive_errors: u32) -> Duration {
        if consecutive_errors == 0 {
            return self.base_interval;
        }
        let factor = 2u32.saturating_pow(consecutive_errors - 1);
        self.base_interval
            .saturating_mul(factor)
            .min(self.max_interval)
            .max(self.base_interval)
    }
}

#[derive(Debug, Clone)]
pub struct PollingMachine {
    policy: PollPolicy,
    interval: Duration,
    consecutive_errors: u32,
    last_fetch_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    has_succeeded: bool,
    manual_in_flight: u32,
}

impl PollingMachine {
    pub fn new(policy: PollPolicy) -> Self {
        Self {
            policy,
            interval: policy.base_interval,
            consecutive_errors: 0,
            last_fetch_at: None,
            last_error: None,
            has_succeeded: false,
            manual_in_flight: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_fetch_at(&self) -> Option<DateTime<Utc>> {
        self.last_fetch_at
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_succeeded(&self) -> bool {
        self.has_succeeded
    }

    pub fn is_refreshing(&self) -> bool {
        self.manual_in_flight > 0
    }

    pub fn state(&self) -> ConnectionState {
        if self.consecutive_errors > 0 {
            ConnectionState::Error
        } else if self.has_succeeded {
            ConnectionState::Connected
        } else {
            ConnectionState::Connecting
        }
    }

    pub fn record_success(&mut self, at: DateTime<Utc>) {
        self.consecutive_errors = 0;
        self.interval = self.policy.base_interval;
        self.last_fetch_at = Some(at);
        self.last_error = None;
        self.has_succeeded = true;
    }

    /// Returns true only for the first failure of a streak.
    pub fn record_failure(&mut self, error: &str, at: DateTime<Utc>) -> bool {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.interval = self.policy.interval_after(self.consecutive_errors);
        self.last_fetch_at = Some(at);
        self.last_error = Some(error.to_string());
        self.consecutive_errors == 1
    }

    pub fn begin_manual(&mut self) {
        self.manual_in_flight = self.manual_in_flight.saturating_add(1);
    }

    /// Manual attempts never touch the interval or the error streak.
    pub fn finish_manual(&mut self, succeeded: bool, at: DateTime<Utc>) {
        self.manual_in_flight = self.manual_in_flight.saturating_sub(1);
        self.last_fetch_at = Some(at);
        if succeeded {
            self.has_succeeded = true;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PollReport {
    /// First failure of a streak; surface once to the user.
    pub announce_failure: bool,
    pub recovered: bool,
}

pub struct PollingSession {
    id: SubscriptionId,
    kind: ResourceKind,
    fetch: FetchFn,
    machine: PollingMachine,
    next_due: Option<Instant>,
    in_flight: bool,
    running: bool,
}

impl PollingSession {
    pub fn new(id: SubscriptionId, kind: ResourceKind, fetch: FetchFn, policy: PollPolicy) -> Self {
        Self {
            id,
            kind,
            fetch,
            machine: PollingMachine::new(policy),
            next_due: None,
            in_flight: false,
            running: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn machine(&self) -> &PollingMachine {
        &self.machine
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn next_fire(&self) -> Option<Instant> {
        self.next_due
    }

    /// The first attempt runs immediately.
    pub fn start(&mut self, now: Instant) {
        if self.running {
            return;
        }
        self.running = true;
        self.next_due = Some(now);
        debug!(event = "poll_start", subscription = self.id.as_str(), kind = %self.kind);
    }

    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;
        self.next_due = None;
        debug!(event = "poll_stop", subscription = self.id.as_str());
    }

    /// Hands out the background fetch when it is due.
    pub fn take_due(&mut self, now: Instant) -> Option<RecordsFuture> {
        if !self.running || self.in_flight {
            return None;
        }
        match self.next_due {
            Some(due) if due <= now => {
                self.next_due = None;
                self.in_flight = true;
                Some((self.fetch)())
            }
            _ => None,
        }
    }

    pub fn complete(
        &mut self,
        result: &Result<Vec<Record>, BackendError>,
        at: DateTime<Utc>,
        now: Instant,
    ) -> PollReport {
        self.in_flight = false;
        let mut report = PollReport::default();
        match result {
            Ok(records) => {
                report.recovered = self.machine.consecutive_errors() > 0;
                self.machine.record_success(at);
                if report.recovered {
                    info!(event = "poll_recovered", subscription = self.id.as_str());
                }
                debug!(
                    event = "poll_ok",
                    subscription = self.id.as_str(),
                    records = records.len()
                );
            }
            Err(err) => {
                report.announce_failure = self.machine.record_failure(&err.to_string(), at);
                let interval_ms = self.machine.interval().as_millis() as u64;
                if report.announce_failure {
                    warn!(
                        event = "poll_failed",
                        subscription = self.id.as_str(),
                        error = %err,
                        interval_ms
                    );
                } else {
                    debug!(
                        event = "poll_failed",
                        subscription = self.id.as_str(),
                        error = %err,
                        consecutive_errors = self.machine.consecutive_errors(),
                        interval_ms
                    );
                }
            }
        }
        if self.running {
            self.next_due = Some(deadline_after(now, self.machine.interval()));
        }
        report
    }

    /// Out-of-band attempt; the background schedule is left untouched.
    pub fn refresh_now(&mut self) -> Option<RecordsFuture> {
        if !self.running {
            return None;
        }
        self.machine.begin_manual();
        Some((self.fetch)())
    }

    pub fn complete_manual(&mut self, result: &Result<Vec<Record>, BackendError>, at: DateTime<Utc>) {
        self.machine.finish_manual(result.is_ok(), at);
        if let Err(err) = result {
            warn!(
                event = "manual_refresh_failed",
                subscription = self.id.as_str(),
                error = %err
            );
        }
    }
}
