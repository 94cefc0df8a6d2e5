use chrono::{DateTime, Utc};
use showsync_core::SubscriptionHealthRecord;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;

/// Isolated circuit breaker for one named subscription.
///
/// The tracker only observes; it never drives the wrapped subscription. Once
/// the circuit is open it stays open: recovering means building a new tracker
/// next to a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHealthTracker {
    name: String,
    connected: bool,
    retry_count: u32,
    last_error: Option<String>,
    circuit_open: bool,
    last_successful_connection: Option<DateTime<Utc>>,
}

impl SubscriptionHealthTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connected: false,
            retry_count: 0,
            last_error: None,
            circuit_open: false,
            last_successful_connection: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.connected && !self.circuit_open
    }

    pub fn circuit_open(&self) -> bool {
        self.circuit_open
    }

    pub fn record_connected(&mut self, at: DateTime<Utc>) {
        self.connected = true;
        self.retry_count = 0;
        self.last_successful_connection = Some(at);
    }

    /// Channel semantics: readiness follows the live connection.
    pub fn record_connection_lost(&mut self, error: Option<&str>, retry_count: u32) {
        self.connected = false;
        self.retry_count = retry_count;
        if let Some(error) = error {
            self.last_error = Some(error.to_string());
        }
    }

    /// Polling semantics: one success is enough to count as ready, failures
    /// afterwards only update the bookkeeping.
    pub fn record_fetch(&mut self, outcome: Result<(), &str>, consecutive_errors: u32, at: DateTime<Utc>) {
        match outcome {
            Ok(()) => {
                self.connected = true;
                self.last_successful_connection = Some(at);
            }
            Err(error) => {
                self.last_error = Some(error.to_string());
            }
        }
        self.retry_count = consecutive_errors;
    }

    pub fn note_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn open_circuit(&mut self, reason: impl Into<String>) {
        if self.circuit_open {
            return;
        }
        self.circuit_open = true;
        self.connected = false;
        let reason = reason.into();
        warn!(event = "circuit_open", subscription = %self.name, reason = %reason);
        self.last_error = Some(reason);
    }

    /// Runs a callback on behalf of this subscription. Errors and panics are
    /// recorded here and never escape to the caller.
    pub fn isolate<T, F>(&mut self, f: F) -> Option<T>
    where
        F: FnOnce() -> Result<T, String>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(error)) => {
                warn!(event = "callback_error", subscription = %self.name, error = %error);
                self.last_error = Some(error);
                None
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(event = "callback_panic", subscription = %self.name, error = %message);
                self.last_error = Some(format!("callback panicked: {message}"));
                None
            }
        }
    }

    pub fn record(&self) -> SubscriptionHealthRecord {
        SubscriptionHealthRecord {
            is_ready: self.is_ready(),
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            circuit_breaker_open: self.circuit_open,
            last_successful_connection: self.last_successful_connection,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_requires_connection_and_closed_circuit() {
        let mut tracker = SubscriptionHealthTracker::new("realtime-channel");
        assert!(!tracker.is_ready());

        let now = Utc::now();
        tracker.record_connected(now);
        assert!(tracker.is_ready());
        assert_eq!(tracker.record().last_successful_connection, Some(now));

        tracker.record_connection_lost(Some("closed"), 1);
        assert!(!tracker.is_ready());
        assert_eq!(tracker.record().retry_count, 1);
        assert_eq!(tracker.record().last_error.as_deref(), Some("closed"));
    }

    #[test]
    fn open_circuit_is_sticky() {
        let mut tracker = SubscriptionHealthTracker::new("unread-count");
        tracker.record_connected(Utc::now());
        tracker.open_circuit("retries exhausted");
        tracker.record_connected(Utc::now());

        let record = tracker.record();
        assert!(record.circuit_breaker_open);
        assert!(!record.is_ready);
    }

    #[test]
    fn polling_stays_ready_after_later_failures() {
        let mut tracker = SubscriptionHealthTracker::new("tour-requests-poll");
        let now = Utc::now();
        tracker.record_fetch(Err("timeout"), 1, now);
        assert!(!tracker.is_ready());
        tracker.record_fetch(Ok(()), 0, now);
        tracker.record_fetch(Err("timeout"), 1, now);

        let record = tracker.record();
        assert!(record.is_ready);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn isolate_records_errors_and_panics() {
        let mut tracker = SubscriptionHealthTracker::new("messages-poll");
        assert_eq!(tracker.isolate(|| Ok::<_, String>(7)), Some(7));

        assert_eq!(tracker.isolate(|| Err::<(), _>("render failed".to_string())), None);
        assert_eq!(tracker.record().last_error.as_deref(), Some("render failed"));

        let result: Option<()> = tracker.isolate(|| panic!("listener exploded"));
        assert!(result.is_none());
        let error = tracker.record().last_error.expect("panic recorded");
        assert!(error.contains("listener exploded"));
    }
}
