//! Unread-message count on its own channel, kept apart from the main
//! channel so a failure here never stalls tour-request updates.

use crate::backend::{ChannelEvent, DataService, RecordsFuture};
use crate::channel::{ChannelStep, ChannelSubscription, RetryPolicy};
use crate::SubscriptionId;
use showsync_core::{BackendError, ChannelStatus, OwnerId, Record, ResourceKind, Topic};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadCount {
    /// Last known count; `None` until the first successful fetch.
    pub count: Option<u64>,
    /// Set once the channel gave up; the count is no longer kept current.
    pub stale: bool,
}

pub struct UnreadCountSubscription {
    channel: ChannelSubscription,
    count: Option<u64>,
    fetch_in_flight: bool,
    refetch_pending: bool,
}

impl UnreadCountSubscription {
    pub fn new(
        owner_id: OwnerId,
        policy: RetryPolicy,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            channel: ChannelSubscription::new(
                SubscriptionId::UnreadCount,
                owner_id,
                vec![Topic::unread_messages_addressed()],
                policy,
                events,
            ),
            count: None,
            fetch_in_flight: false,
            refetch_pending: false,
        }
    }

    /// Continues `previous`: its epochs and its last known count carry over.
    pub fn replacing(mut self, previous: &UnreadCountSubscription) -> Self {
        self.channel = self.channel.replacing(&previous.channel);
        self.count = previous.count;
        self
    }

    pub fn channel(&self) -> &ChannelSubscription {
        &self.channel
    }

    pub fn snapshot(&self) -> UnreadCount {
        UnreadCount {
            count: self.count,
            stale: self.channel.gave_up(),
        }
    }

    /// Opens the channel and returns the initial count fetch.
    pub fn open(&mut self, service: &dyn DataService) -> Option<RecordsFuture> {
        self.channel.open(service);
        self.fetch(service)
    }

    pub fn handle_status(
        &mut self,
        service: &dyn DataService,
        epoch: u64,
        status: ChannelStatus,
        detail: Option<&str>,
        now: Instant,
    ) -> (ChannelStep, Option<RecordsFuture>) {
        let step = self.channel.handle_status(epoch, status, detail, now);
        let fetch = match step {
            ChannelStep::Connected => self.fetch(service),
            ChannelStep::GaveUp => {
                debug!(
                    event = "unread_count_stale",
                    owner_id = %self.channel.owner_id(),
                    count = self.count.unwrap_or(0)
                );
                None
            }
            _ => None,
        };
        (step, fetch)
    }

    pub fn on_changed(&mut self, service: &dyn DataService) -> Option<RecordsFuture> {
        self.fetch(service)
    }

    pub fn poll_reopen(&mut self, service: &dyn DataService, now: Instant) -> bool {
        self.channel.poll_reopen(service, now)
    }

    /// Applies a finished count fetch; failures keep the last known value.
    /// Returns a follow-up fetch when a change arrived mid-flight.
    pub fn apply(
        &mut self,
        service: &dyn DataService,
        result: &Result<Vec<Record>, BackendError>,
    ) -> Option<RecordsFuture> {
        self.fetch_in_flight = false;
        match result {
            Ok(records) => self.count = Some(records.len() as u64),
            Err(err) => {
                debug!(event = "unread_count_fetch_failed", error = %err);
            }
        }
        if self.refetch_pending {
            self.refetch_pending = false;
            return self.fetch(service);
        }
        None
    }

    pub fn close(&mut self) {
        self.channel.close();
        self.refetch_pending = false;
    }

    fn fetch(&mut self, service: &dyn DataService) -> Option<RecordsFuture> {
        if self.fetch_in_flight {
            self.refetch_pending = true;
            return None;
        }
        self.fetch_in_flight = true;
        Some(service.query_resources(self.channel.owner_id(), ResourceKind::UnreadMessages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelEventKind;
    use crate::sim::{ChannelOutcome, SimDataService};

    fn owner() -> OwnerId {
        OwnerId::new("u1").expect("owner")
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_silently_and_keeps_last_count() {
        let service = SimDataService::new();
        service.set_records(
            &owner(),
            ResourceKind::UnreadMessages,
            vec![Record::new("m-1"), Record::new("m-2")],
        );
        service.script_channel(
            ResourceKind::UnreadMessages,
            [
                ChannelOutcome::Status(ChannelStatus::Error),
                ChannelOutcome::Status(ChannelStatus::Error),
                ChannelOutcome::Status(ChannelStatus::Error),
            ],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut unread = UnreadCountSubscription::new(owner(), RetryPolicy::default(), tx);

        let initial = unread.open(&service).expect("initial fetch");
        let result = initial.await;
        assert!(unread.apply(&service, &result).is_none());
        assert_eq!(unread.snapshot().count, Some(2));

        let mut last_step = ChannelStep::Idle;
        while last_step != ChannelStep::GaveUp {
            let event = rx.recv().await.expect("event");
            if let ChannelEventKind::Status { status, detail } = event.kind {
                let (step, fetch) =
                    unread.handle_status(&service, event.epoch, status, detail.as_deref(), Instant::now());
                assert!(fetch.is_none());
                last_step = step;
            }
            if let Some(deadline) = unread.channel().reopen_deadline() {
                tokio::time::sleep_until(deadline).await;
                unread.poll_reopen(&service, Instant::now());
            }
        }

        let snapshot = unread.snapshot();
        assert!(snapshot.stale);
        assert_eq!(snapshot.count, Some(2));
        assert!(unread.channel().reopen_deadline().is_none());
    }

    #[tokio::test]
    async fn change_during_fetch_schedules_one_follow_up() {
        let service = SimDataService::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut unread = UnreadCountSubscription::new(owner(), RetryPolicy::default(), tx);

        let first = unread.open(&service).expect("initial fetch");
        assert!(unread.on_changed(&service).is_none());
        assert!(unread.on_changed(&service).is_none());

        let result = first.await;
        let follow_up = unread.apply(&service, &result).expect("coalesced refetch");
        let result = follow_up.await;
        assert!(unread.apply(&service, &result).is_none());
        assert_eq!(unread.snapshot().count, Some(0));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_count() {
        let service = SimDataService::new();
        service.set_records(&owner(), ResourceKind::UnreadMessages, vec![Record::new("m-1")]);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut unread = UnreadCountSubscription::new(owner(), RetryPolicy::default(), tx);

        let result = unread.open(&service).expect("fetch").await;
        unread.apply(&service, &result);
        service.fail_queries(ResourceKind::UnreadMessages, 1);
        let result = unread.on_changed(&service).expect("fetch").await;
        assert!(result.is_err());
        unread.apply(&service, &result);

        assert_eq!(unread.snapshot(), UnreadCount { count: Some(1), stale: false });
    }

    #[tokio::test]
    async fn replacement_keeps_count_when_its_first_fetch_fails() {
        let service = SimDataService::new();
        service.set_records(
            &owner(),
            ResourceKind::UnreadMessages,
            vec![Record::new("m-1"), Record::new("m-2")],
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut unread = UnreadCountSubscription::new(owner(), RetryPolicy::default(), tx.clone());
        let result = unread.open(&service).expect("fetch").await;
        unread.apply(&service, &result);

        service.set_outage(ResourceKind::UnreadMessages, true);
        unread.close();
        let mut replacement =
            UnreadCountSubscription::new(owner(), RetryPolicy::default(), tx).replacing(&unread);
        let result = replacement.open(&service).expect("fetch").await;
        assert!(result.is_err());
        replacement.apply(&service, &result);
        assert_eq!(replacement.snapshot().count, Some(2));

        service.set_outage(ResourceKind::UnreadMessages, false);
        service.set_records(&owner(), ResourceKind::UnreadMessages, vec![Record::new("m-3")]);
        let result = replacement.on_changed(&service).expect("fetch").await;
        replacement.apply(&service, &result);
        assert_eq!(replacement.snapshot().count, Some(1));
    }
}
