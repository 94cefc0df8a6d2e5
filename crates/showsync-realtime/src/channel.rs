//! One multiplexed push channel per owner id, with bounded reopen.
//!
//! [`ChannelMachine`] holds the pure state transitions; [`ChannelSubscription`]
//! executes the steps it returns against a [`DataService`] and owns the live
//! transport handle plus the pending reopen deadline.

use crate::backend::{ChannelEvent, ChannelSink, DataService, SubscriptionHandle};
use crate::{deadline_after, SubscriptionId};
use showsync_core::{ChannelStatus, ConnectionState, OwnerId, Topic};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2_000),
        }
    }
}

impl RetryPolicy {
    /// `base_delay * 2^retry_count`, saturating.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStep {
    /// Nothing to execute (stale or redundant input).
    Idle,
    /// Open a fresh transport subscription.
    Subscribe,
    /// Transport confirmed; the retry budget was reset.
    Connected,
    /// Drop the dead transport and reopen after `delay`.
    Reopen { delay: Duration, attempt: u32 },
    /// Retry budget exhausted. Terminal until the machine is recreated.
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    policy: RetryPolicy,
    state: ConnectionState,
    retry_count: u32,
    gave_up: bool,
    epoch: u64,
}

impl ChannelMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: ConnectionState::Disabled,
            retry_count: 0,
            gave_up: false,
            epoch: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Continues numbering after a previous machine so its late events
    /// never match this one.
    pub fn resume_epochs(&mut self, after: u64) {
        self.epoch = self.epoch.max(after);
    }

    pub fn open(&mut self) -> ChannelStep {
        if self.gave_up || self.state.is_live() {
            return ChannelStep::Idle;
        }
        self.epoch += 1;
        self.state = ConnectionState::Connecting;
        ChannelStep::Subscribe
    }

    pub fn on_status(&mut self, epoch: u64, status: ChannelStatus) -> ChannelStep {
        if epoch != self.epoch || !self.state.is_live() {
            return ChannelStep::Idle;
        }
        match status {
            ChannelStatus::Subscribed => {
                if self.state == ConnectionState::Connected {
                    return ChannelStep::Idle;
                }
                self.state = ConnectionState::Connected;
                self.retry_count = 0;
                ChannelStep::Connected
            }
            ChannelStatus::Error | ChannelStatus::Closed => {
                self.state = ConnectionState::Error;
                let failures = self.retry_count.saturating_add(1);
                if failures >= self.policy.max_retries {
                    self.retry_count = failures;
                    self.gave_up = true;
                    return ChannelStep::GaveUp;
                }
                let delay = self.policy.delay_for(self.retry_count);
                self.retry_count = failures;
                ChannelStep::Reopen {
                    delay,
                    attempt: failures,
                }
            }
        }
    }

    /// Invoked when a scheduled reopen fires.
    pub fn reopen_due(&mut self) -> ChannelStep {
        if self.state != ConnectionState::Error {
            return ChannelStep::Idle;
        }
        self.open()
    }

    /// Returns true when the machine was doing anything.
    pub fn close(&mut self) -> bool {
        let was_active = self.state != ConnectionState::Disabled;
        self.state = ConnectionState::Disabled;
        // Bump so late transport events from the closed attempt are ignored.
        self.epoch += 1;
        was_active
    }
}

pub struct ChannelSubscription {
    id: SubscriptionId,
    owner_id: OwnerId,
    topics: Vec<Topic>,
    machine: ChannelMachine,
    handle: Option<Box<dyn SubscriptionHandle>>,
    reopen_at: Option<Instant>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    closed: bool,
}

impl ChannelSubscription {
    pub fn new(
        id: SubscriptionId,
        owner_id: OwnerId,
        topics: Vec<Topic>,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            id,
            owner_id,
            topics,
            machine: ChannelMachine::new(policy),
            handle: None,
            reopen_at: None,
            events,
            closed: false,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.machine.retry_count()
    }

    pub fn gave_up(&self) -> bool {
        self.machine.gave_up()
    }

    pub fn reopen_deadline(&self) -> Option<Instant> {
        self.reopen_at
    }

    pub fn epoch(&self) -> u64 {
        self.machine.epoch()
    }

    /// Used when recreating a subscription in place of `previous`.
    pub fn replacing(mut self, previous: &ChannelSubscription) -> Self {
        self.machine.resume_epochs(previous.epoch());
        self
    }

    pub fn has_live_handle(&self) -> bool {
        self.handle.is_some()
    }

    /// Whether an event belongs to the attempt currently in flight.
    pub fn is_current(&self, event: &ChannelEvent) -> bool {
        event.source == self.id && event.epoch == self.machine.epoch()
    }

    pub fn open(&mut self, service: &dyn DataService) {
        if self.closed {
            return;
        }
        if let ChannelStep::Subscribe = self.machine.open() {
            self.subscribe(service);
        }
    }

    pub fn handle_status(
        &mut self,
        epoch: u64,
        status: ChannelStatus,
        detail: Option<&str>,
        now: Instant,
    ) -> ChannelStep {
        let step = self.machine.on_status(epoch, status);
        match step {
            ChannelStep::Connected => {
                info!(
                    event = "channel_subscribed",
                    subscription = self.id.as_str(),
                    owner_id = %self.owner_id
                );
            }
            ChannelStep::Reopen { delay, attempt } => {
                self.release_handle();
                self.reopen_at = Some(deadline_after(now, delay));
                warn!(
                    event = "channel_retry_scheduled",
                    subscription = self.id.as_str(),
                    owner_id = %self.owner_id,
                    status = ?status,
                    detail = detail.unwrap_or(""),
                    attempt,
                    delay_ms = delay.as_millis() as u64
                );
            }
            ChannelStep::GaveUp => {
                self.release_handle();
                self.reopen_at = None;
                warn!(
                    event = "channel_gave_up",
                    subscription = self.id.as_str(),
                    owner_id = %self.owner_id,
                    retry_count = self.machine.retry_count(),
                    detail = detail.unwrap_or("")
                );
            }
            ChannelStep::Idle | ChannelStep::Subscribe => {
                debug!(
                    event = "channel_status_ignored",
                    subscription = self.id.as_str(),
                    epoch,
                    status = ?status
                );
            }
        }
        step
    }

    /// Reopens if the scheduled deadline has passed.
    pub fn poll_reopen(&mut self, service: &dyn DataService, now: Instant) -> bool {
        match self.reopen_at {
            Some(deadline) if deadline <= now => {
                self.reopen_at = None;
                if let ChannelStep::Subscribe = self.machine.reopen_due() {
                    debug!(
                        event = "channel_reopen",
                        subscription = self.id.as_str(),
                        attempt = self.machine.retry_count()
                    );
                    self.subscribe(service);
                    return true;
                }
                false
            }
            _ => false,
        }
    }

    /// Cancels any scheduled reopen and unsubscribes the live channel.
    /// Repeated calls are no-ops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.reopen_at = None;
        self.release_handle();
        if self.machine.close() {
            debug!(
                event = "channel_closed",
                subscription = self.id.as_str(),
                owner_id = %self.owner_id
            );
        }
    }

    fn subscribe(&mut self, service: &dyn DataService) {
        self.release_handle();
        let sink = ChannelSink::new(self.id, self.machine.epoch(), self.events.clone());
        self.handle = Some(service.subscribe_to_changes(&self.owner_id, &self.topics, sink));
    }

    fn release_handle(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.unsubscribe();
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelEventKind;
    use crate::sim::{ChannelOutcome, SimDataService};
    use showsync_core::ResourceKind;

    fn owner() -> OwnerId {
        OwnerId::new("u1").expect("owner")
    }

    #[test]
    fn delay_doubles_per_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(8_000));
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    #[test]
    fn machine_gives_up_on_third_consecutive_failure() {
        let mut machine = ChannelMachine::new(RetryPolicy::default());
        assert_eq!(machine.open(), ChannelStep::Subscribe);
        assert_eq!(machine.state(), ConnectionState::Connecting);

        let epoch = machine.epoch();
        assert_eq!(
            machine.on_status(epoch, ChannelStatus::Error),
            ChannelStep::Reopen {
                delay: Duration::from_millis(2_000),
                attempt: 1
            }
        );
        assert_eq!(machine.reopen_due(), ChannelStep::Subscribe);

        let epoch = machine.epoch();
        assert_eq!(
            machine.on_status(epoch, ChannelStatus::Closed),
            ChannelStep::Reopen {
                delay: Duration::from_millis(4_000),
                attempt: 2
            }
        );
        assert_eq!(machine.reopen_due(), ChannelStep::Subscribe);

        let epoch = machine.epoch();
        assert_eq!(machine.on_status(epoch, ChannelStatus::Error), ChannelStep::GaveUp);
        assert_eq!(machine.state(), ConnectionState::Error);
        assert_eq!(machine.retry_count(), 3);
        assert_eq!(machine.reopen_due(), ChannelStep::Idle);
        assert_eq!(machine.open(), ChannelStep::Idle);
    }

    #[test]
    fn success_resets_retry_budget() {
        let mut machine = ChannelMachine::new(RetryPolicy::default());
        machine.open();
        let epoch = machine.epoch();
        machine.on_status(epoch, ChannelStatus::Error);
        machine.reopen_due();
        let epoch = machine.epoch();
        machine.on_status(epoch, ChannelStatus::Error);
        machine.reopen_due();

        let epoch = machine.epoch();
        assert_eq!(machine.on_status(epoch, ChannelStatus::Subscribed), ChannelStep::Connected);
        assert_eq!(machine.retry_count(), 0);

        assert_eq!(
            machine.on_status(epoch, ChannelStatus::Closed),
            ChannelStep::Reopen {
                delay: Duration::from_millis(2_000),
                attempt: 1
            }
        );
    }

    #[test]
    fn stale_epoch_is_ignored() {
        let mut machine = ChannelMachine::new(RetryPolicy::default());
        machine.open();
        let stale = machine.epoch();
        machine.on_status(stale, ChannelStatus::Error);
        machine.reopen_due();

        assert_eq!(machine.on_status(stale, ChannelStatus::Subscribed), ChannelStep::Idle);
        assert_eq!(machine.state(), ConnectionState::Connecting);
    }

    #[test]
    fn closed_machine_ignores_late_status() {
        let mut machine = ChannelMachine::new(RetryPolicy::default());
        machine.open();
        let epoch = machine.epoch();
        assert!(machine.close());
        assert_eq!(machine.on_status(epoch, ChannelStatus::Subscribed), ChannelStep::Idle);
        assert_eq!(machine.state(), ConnectionState::Disabled);
        assert!(!machine.close());
    }

    #[tokio::test]
    async fn replacement_ignores_events_of_the_previous_channel() {
        let service = SimDataService::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let build = |tx| {
            ChannelSubscription::new(
                SubscriptionId::RealtimeChannel,
                owner(),
                vec![Topic::tour_requests_owned()],
                RetryPolicy::default(),
                tx,
            )
        };
        let mut old = build(tx.clone());
        old.open(&service);
        let late = rx.recv().await.expect("status");
        old.close();

        let mut fresh = build(tx).replacing(&old);
        fresh.open(&service);
        assert!(!fresh.is_current(&late));
        let current = rx.recv().await.expect("status");
        assert!(fresh.is_current(&current));
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_leaves_no_timer_after_third_failure() {
        let service = SimDataService::new();
        service.script_channel(
            ResourceKind::TourRequests,
            [
                ChannelOutcome::Status(ChannelStatus::Error),
                ChannelOutcome::Status(ChannelStatus::Error),
                ChannelOutcome::Status(ChannelStatus::Error),
            ],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = ChannelSubscription::new(
            SubscriptionId::RealtimeChannel,
            owner(),
            vec![Topic::tour_requests_owned(), Topic::messages_addressed()],
            RetryPolicy::default(),
            tx,
        );

        channel.open(&service);
        let mut steps = Vec::new();
        while steps.len() < 3 {
            let event = rx.recv().await.expect("event");
            let ChannelEventKind::Status { status, detail } = event.kind else {
                continue;
            };
            let step = channel.handle_status(event.epoch, status, detail.as_deref(), Instant::now());
            steps.push(step);
            if let Some(deadline) = channel.reopen_deadline() {
                tokio::time::sleep_until(deadline).await;
                assert!(channel.poll_reopen(&service, Instant::now()));
            }
        }

        assert_eq!(steps[2], ChannelStep::GaveUp);
        assert_eq!(channel.state(), ConnectionState::Error);
        assert!(channel.reopen_deadline().is_none());
        assert!(!channel.has_live_handle());
        assert_eq!(service.counters().subscribe_calls, 3);
        assert_eq!(service.live_handle_count(), 0);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancels_reopen() {
        let service = SimDataService::new();
        service.script_channel(
            ResourceKind::TourRequests,
            [ChannelOutcome::Status(ChannelStatus::Error)],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut channel = ChannelSubscription::new(
            SubscriptionId::RealtimeChannel,
            owner(),
            vec![Topic::tour_requests_owned()],
            RetryPolicy::default(),
            tx,
        );
        channel.open(&service);
        let event = rx.recv().await.expect("status");
        if let ChannelEventKind::Status { status, .. } = event.kind {
            channel.handle_status(event.epoch, status, None, Instant::now());
        }
        assert!(channel.reopen_deadline().is_some());

        channel.close();
        channel.close();
        assert!(channel.reopen_deadline().is_none());
        assert_eq!(channel.state(), ConnectionState::Disabled);
        assert_eq!(service.counters().subscribe_calls, 1);
        assert_eq!(service.counters().unsubscribe_calls, 1);
    }

    #[tokio::test]
    async fn close_unsubscribes_live_channel_once() {
        let service = SimDataService::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut channel = ChannelSubscription::new(
            SubscriptionId::RealtimeChannel,
            owner(),
            vec![Topic::tour_requests_owned()],
            RetryPolicy::default(),
            tx,
        );
        channel.open(&service);
        assert_eq!(service.live_handle_count(), 1);

        channel.close();
        drop(channel);
        assert_eq!(service.live_handle_count(), 0);
        assert_eq!(service.counters().unsubscribe_calls, 1);
    }
}
