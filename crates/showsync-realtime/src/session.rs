//! One owner id's subscriptions, driven from a single task.
//!
//! The task owns every piece of mutable state (channels, polling sessions,
//! health trackers, in-flight fetches) and reacts to channel events, fetch
//! completions, timers and commands one at a time, so no locking is needed.
//! Consumers talk to it through [`SyncHandle`] and read the published
//! [`SyncSnapshot`].

use crate::backend::{ChannelEvent, ChannelEventKind, DataService, RecordsFuture};
use crate::channel::{ChannelStep, ChannelSubscription};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::health::SubscriptionHealthTracker;
use crate::polling::{FetchFn, PollingSession};
use crate::readiness::aggregate;
use crate::unread::{UnreadCount, UnreadCountSubscription};
use crate::SubscriptionId;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use showsync_core::{
    AggregateReadiness, BackendError, ChannelStatus, ConnectionState, ConnectionStatus,
    OverallStatus, OwnerId, Record, ResourceKind, SubscriptionHealthRecord, Topic,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Callback run with every freshly fetched list. Errors and panics are
/// recorded against the resource's polling subscription.
pub type RecordsListener =
    Arc<dyn Fn(ResourceKind, &[Record]) -> Result<(), String> + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Full replacement list for `kind`.
    Records {
        owner_id: OwnerId,
        kind: ResourceKind,
        records: Vec<Record>,
    },
    /// First failure of a polling streak. Not repeated while the streak lasts.
    Warning {
        owner_id: OwnerId,
        subscription: SubscriptionId,
        message: String,
    },
    UnreadCount {
        owner_id: OwnerId,
        count: UnreadCount,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStatus {
    pub state: ConnectionState,
    pub retry_scheduled: bool,
    pub health: SubscriptionHealthRecord,
}

impl SubscriptionStatus {
    pub fn connection_status(&self) -> ConnectionStatus {
        self.state.into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceStatus {
    /// No attempt has completed yet.
    pub is_loading: bool,
    /// A user-initiated refresh is in flight.
    pub is_refreshing: bool,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub record_count: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncSnapshot {
    pub owner_id: Option<OwnerId>,
    pub online: bool,
    pub subscriptions: BTreeMap<SubscriptionId, SubscriptionStatus>,
    pub resources: BTreeMap<ResourceKind, ResourceStatus>,
    pub unread: UnreadCount,
    pub readiness: AggregateReadiness,
}

impl SyncSnapshot {
    /// Snapshot for a coordinator with no active session.
    pub fn disabled(online: bool) -> Self {
        Self {
            owner_id: None,
            online,
            subscriptions: BTreeMap::new(),
            resources: BTreeMap::new(),
            unread: UnreadCount::default(),
            readiness: AggregateReadiness::default(),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.owner_id.is_none()
    }

    pub fn connection_status(&self, id: SubscriptionId) -> ConnectionStatus {
        self.subscriptions
            .get(&id)
            .map(SubscriptionStatus::connection_status)
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn state(&self, id: SubscriptionId) -> ConnectionState {
        self.subscriptions
            .get(&id)
            .map(|status| status.state)
            .unwrap_or(ConnectionState::Disabled)
    }

    pub fn overall_status(&self) -> OverallStatus {
        self.readiness.overall_status
    }

    pub fn can_submit_forms(&self) -> bool {
        self.readiness.can_submit_forms
    }
}

enum SessionCommand {
    ManualRefresh {
        kind: ResourceKind,
        reply: oneshot::Sender<Option<Vec<Record>>>,
    },
    Retry {
        id: SubscriptionId,
        reply: oneshot::Sender<()>,
    },
    SetOnline(bool),
    Shutdown,
}

#[derive(Clone)]
pub struct SyncHandle {
    owner_id: OwnerId,
    commands: mpsc::Sender<SessionCommand>,
    snapshot: watch::Receiver<SyncSnapshot>,
}

impl SyncHandle {
    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot.clone()
    }

    /// Fetches `kind` immediately, outside the polling schedule. `None` when
    /// the fetch failed or the session is gone.
    pub async fn manual_refresh(&self, kind: ResourceKind) -> Option<Vec<Record>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::ManualRefresh { kind, reply })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Recreates one subscription with a fresh retry budget and tracker.
    pub async fn retry(&self, id: SubscriptionId) -> Result<(), SyncError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Retry { id, reply })
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        self.commands
            .send(SessionCommand::SetOnline(online))
            .await
            .map_err(|_| SyncError::SessionClosed)
    }
}

/// Owns the session task. Dropping it aborts the task, which releases every
/// channel handle through their `Drop` impls.
pub struct SyncSession {
    handle: SyncHandle,
    task: Option<JoinHandle<()>>,
}

impl SyncSession {
    pub fn spawn(
        owner_id: OwnerId,
        config: &SyncConfig,
        service: Arc<dyn DataService>,
        events: mpsc::UnboundedSender<SyncEvent>,
        listeners: Vec<RecordsListener>,
        online: bool,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let runtime = SessionRuntime::new(
            owner_id.clone(),
            config.clone(),
            service,
            events,
            listeners,
            online,
            channel_tx,
        );
        let (snapshot_tx, snapshot_rx) = watch::channel(runtime.build_snapshot());
        let task = tokio::spawn(runtime.run(snapshot_tx, command_rx, channel_rx));
        Self {
            handle: SyncHandle {
                owner_id,
                commands: command_tx,
                snapshot: snapshot_rx,
            },
            task: Some(task),
        }
    }

    pub fn handle(&self) -> &SyncHandle {
        &self.handle
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.handle.owner_id
    }

    /// Tears the session down and waits until every timer is cancelled and
    /// every channel unsubscribed.
    pub async fn shutdown(mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        if self.handle.commands.send(SessionCommand::Shutdown).await.is_err() {
            task.abort();
        }
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                warn!(event = "session_task_failed", owner_id = %self.handle.owner_id, error = %err);
            }
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

enum FetchOrigin {
    Poll,
    Manual(oneshot::Sender<Option<Vec<Record>>>),
    Change,
    UnreadCount,
}

struct FetchDone {
    kind: ResourceKind,
    origin: FetchOrigin,
    generation: u64,
    result: Result<Vec<Record>, BackendError>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ChangeFetch {
    in_flight: bool,
    dirty: bool,
}

struct SessionRuntime {
    owner_id: OwnerId,
    config: SyncConfig,
    service: Arc<dyn DataService>,
    required: BTreeSet<String>,
    channel: ChannelSubscription,
    unread: UnreadCountSubscription,
    polls: BTreeMap<ResourceKind, PollingSession>,
    trackers: BTreeMap<SubscriptionId, SubscriptionHealthTracker>,
    generations: BTreeMap<SubscriptionId, u64>,
    record_counts: BTreeMap<ResourceKind, usize>,
    change_fetches: BTreeMap<ResourceKind, ChangeFetch>,
    fetches: FuturesUnordered<BoxFuture<'static, FetchDone>>,
    listeners: Vec<RecordsListener>,
    events: mpsc::UnboundedSender<SyncEvent>,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    last_unread: UnreadCount,
    /// The main channel dropped since it last confirmed a subscription.
    channel_lost: bool,
    online: bool,
}

impl SessionRuntime {
    fn new(
        owner_id: OwnerId,
        config: SyncConfig,
        service: Arc<dyn DataService>,
        events: mpsc::UnboundedSender<SyncEvent>,
        listeners: Vec<RecordsListener>,
        online: bool,
        channel_tx: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let channel = build_channel(&owner_id, &config, channel_tx.clone());
        let unread =
            UnreadCountSubscription::new(owner_id.clone(), config.unread.policy(), channel_tx.clone());
        let mut polls = BTreeMap::new();
        for kind in [ResourceKind::TourRequests, ResourceKind::Messages] {
            polls.insert(kind, build_poll(&owner_id, &config, &service, kind));
        }
        let trackers = SubscriptionId::ALL
            .into_iter()
            .map(|id| (id, SubscriptionHealthTracker::new(id.as_str())))
            .collect();
        let required = config.required.iter().cloned().collect();

        Self {
            owner_id,
            config,
            service,
            required,
            channel,
            unread,
            polls,
            trackers,
            generations: BTreeMap::new(),
            record_counts: BTreeMap::new(),
            change_fetches: BTreeMap::new(),
            fetches: FuturesUnordered::new(),
            listeners,
            events,
            channel_tx,
            last_unread: UnreadCount::default(),
            channel_lost: false,
            online,
        }
    }

    async fn run(
        mut self,
        snapshot: watch::Sender<SyncSnapshot>,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) {
        self.start(Instant::now());
        self.publish(&snapshot);

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = channel_events.recv() => {
                    self.handle_channel_event(event);
                }
                Some(done) = self.fetches.next(), if !self.fetches.is_empty() => {
                    self.handle_fetch(done);
                }
                _ = sleep_until_opt(deadline) => {
                    self.run_due_timers(Instant::now());
                }
            }
            self.publish(&snapshot);
        }

        self.teardown();
        self.publish(&snapshot);
    }

    fn start(&mut self, now: Instant) {
        info!(event = "session_start", owner_id = %self.owner_id);
        self.channel.open(self.service.as_ref());
        if let Some(fetch) = self.unread.open(self.service.as_ref()) {
            let generation = self.generation(SubscriptionId::UnreadCount);
            self.push_fetch(ResourceKind::UnreadMessages, FetchOrigin::UnreadCount, generation, fetch);
        }
        for poll in self.polls.values_mut() {
            poll.start(now);
        }
        self.run_due_timers(now);
    }

    fn teardown(&mut self) {
        self.channel.close();
        self.unread.close();
        for poll in self.polls.values_mut() {
            poll.stop();
        }
        let dropped = self.fetches.len();
        self.fetches = FuturesUnordered::new();
        info!(
            event = "session_teardown",
            owner_id = %self.owner_id,
            dropped_fetches = dropped
        );
    }

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadlines = vec![
            self.channel.reopen_deadline(),
            self.unread.channel().reopen_deadline(),
        ];
        deadlines.extend(self.polls.values().map(PollingSession::next_fire));
        deadlines.into_iter().flatten().min()
    }

    fn run_due_timers(&mut self, now: Instant) {
        self.channel.poll_reopen(self.service.as_ref(), now);
        self.unread.poll_reopen(self.service.as_ref(), now);

        let mut due = Vec::new();
        for (kind, poll) in self.polls.iter_mut() {
            if let Some(fetch) = poll.take_due(now) {
                due.push((*kind, poll.id(), fetch));
            }
        }
        for (kind, id, fetch) in due {
            let generation = self.generation(id);
            self.push_fetch(kind, FetchOrigin::Poll, generation, fetch);
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ManualRefresh { kind, reply } => {
                let Some(poll) = self.polls.get_mut(&kind) else {
                    let _ = reply.send(None);
                    return;
                };
                let id = poll.id();
                match poll.refresh_now() {
                    Some(fetch) => {
                        debug!(event = "manual_refresh", owner_id = %self.owner_id, kind = %kind);
                        let generation = self.generation(id);
                        self.push_fetch(kind, FetchOrigin::Manual(reply), generation, fetch);
                    }
                    None => {
                        let _ = reply.send(None);
                    }
                }
            }
            SessionCommand::Retry { id, reply } => {
                self.retry(id, Instant::now());
                let _ = reply.send(());
            }
            SessionCommand::SetOnline(online) => {
                if self.online != online {
                    info!(event = "online_changed", owner_id = %self.owner_id, online);
                }
                self.online = online;
            }
            SessionCommand::Shutdown => {}
        }
    }

    fn retry(&mut self, id: SubscriptionId, now: Instant) {
        info!(event = "subscription_retry", owner_id = %self.owner_id, subscription = id.as_str());
        self.bump_generation(id);
        self.trackers.insert(id, SubscriptionHealthTracker::new(id.as_str()));
        match id {
            SubscriptionId::RealtimeChannel => {
                self.channel.close();
                self.channel = build_channel(&self.owner_id, &self.config, self.channel_tx.clone())
                    .replacing(&self.channel);
                self.channel.open(self.service.as_ref());
            }
            SubscriptionId::UnreadCount => {
                self.unread.close();
                self.unread = UnreadCountSubscription::new(
                    self.owner_id.clone(),
                    self.config.unread.policy(),
                    self.channel_tx.clone(),
                )
                .replacing(&self.unread);
                if let Some(fetch) = self.unread.open(self.service.as_ref()) {
                    let generation = self.generation(id);
                    self.push_fetch(ResourceKind::UnreadMessages, FetchOrigin::UnreadCount, generation, fetch);
                }
            }
            SubscriptionId::TourRequestsPoll | SubscriptionId::MessagesPoll => {
                let kind = poll_kind(id);
                let mut poll = build_poll(&self.owner_id, &self.config, &self.service, kind);
                poll.start(now);
                if let Some(mut old) = self.polls.insert(kind, poll) {
                    old.stop();
                }
                self.run_due_timers(now);
            }
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event.source {
            SubscriptionId::RealtimeChannel => {
                if !self.channel.is_current(&event) {
                    debug!(event = "channel_event_stale", epoch = event.epoch);
                    return;
                }
                match event.kind {
                    ChannelEventKind::Status { status, detail } => {
                        let step = self.channel.handle_status(
                            event.epoch,
                            status,
                            detail.as_deref(),
                            Instant::now(),
                        );
                        let retry_count = self.channel.retry_count();
                        self.track_channel_step(
                            SubscriptionId::RealtimeChannel,
                            step,
                            status,
                            detail.as_deref(),
                            retry_count,
                        );
                        self.resync_after(step);
                    }
                    ChannelEventKind::Changed(topic) => self.request_change_fetch(topic),
                }
            }
            SubscriptionId::UnreadCount => {
                if !self.unread.channel().is_current(&event) {
                    debug!(event = "channel_event_stale", epoch = event.epoch);
                    return;
                }
                let fetch = match event.kind {
                    ChannelEventKind::Status { status, detail } => {
                        let (step, fetch) = self.unread.handle_status(
                            self.service.as_ref(),
                            event.epoch,
                            status,
                            detail.as_deref(),
                            Instant::now(),
                        );
                        let retry_count = self.unread.channel().retry_count();
                        self.track_channel_step(
                            SubscriptionId::UnreadCount,
                            step,
                            status,
                            detail.as_deref(),
                            retry_count,
                        );
                        fetch
                    }
                    ChannelEventKind::Changed(_) => self.unread.on_changed(self.service.as_ref()),
                };
                if let Some(fetch) = fetch {
                    let generation = self.generation(SubscriptionId::UnreadCount);
                    self.push_fetch(ResourceKind::UnreadMessages, FetchOrigin::UnreadCount, generation, fetch);
                }
            }
            SubscriptionId::TourRequestsPoll | SubscriptionId::MessagesPoll => {}
        }
    }

    fn track_channel_step(
        &mut self,
        id: SubscriptionId,
        step: ChannelStep,
        status: ChannelStatus,
        detail: Option<&str>,
        retry_count: u32,
    ) {
        let Some(tracker) = self.trackers.get_mut(&id) else {
            return;
        };
        let error = detail
            .map(str::to_string)
            .unwrap_or_else(|| format!("channel reported {status:?}").to_lowercase());
        match step {
            ChannelStep::Connected => tracker.record_connected(Utc::now()),
            ChannelStep::Reopen { .. } => tracker.record_connection_lost(Some(&error), retry_count),
            ChannelStep::GaveUp => {
                tracker.record_connection_lost(Some(&error), retry_count);
                tracker.open_circuit(format!("retries exhausted after {retry_count} failures: {error}"));
            }
            ChannelStep::Idle | ChannelStep::Subscribe => {}
        }
    }

    /// Nothing is pushed while the main channel is down, so reconnecting
    /// re-fetches every topic it carries.
    fn resync_after(&mut self, step: ChannelStep) {
        match step {
            ChannelStep::Reopen { .. } | ChannelStep::GaveUp => self.channel_lost = true,
            ChannelStep::Connected if std::mem::take(&mut self.channel_lost) => {
                let topics = self.channel.topics().to_vec();
                info!(event = "channel_resync", owner_id = %self.owner_id, topics = topics.len());
                for topic in topics {
                    self.request_change_fetch(topic);
                }
            }
            _ => {}
        }
    }

    /// Change notifications for a kind collapse into at most one fetch in
    /// flight plus one follow-up.
    fn request_change_fetch(&mut self, topic: Topic) {
        let kind = topic.kind;
        if !self.polls.contains_key(&kind) {
            debug!(event = "change_ignored", topic = %topic);
            return;
        }
        let entry = self.change_fetches.entry(kind).or_default();
        if entry.in_flight {
            entry.dirty = true;
            return;
        }
        entry.in_flight = true;
        debug!(event = "change_refetch", owner_id = %self.owner_id, topic = %topic);
        let fetch = self.service.query_resources(&self.owner_id, kind);
        self.push_fetch(kind, FetchOrigin::Change, 0, fetch);
    }

    fn push_fetch(&mut self, kind: ResourceKind, origin: FetchOrigin, generation: u64, fetch: RecordsFuture) {
        let timeout = self.config.query_timeout();
        self.fetches.push(
            async move {
                let result = match tokio::time::timeout(timeout, fetch).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(duration_ms(timeout))),
                };
                FetchDone {
                    kind,
                    origin,
                    generation,
                    result,
                }
            }
            .boxed(),
        );
    }

    fn handle_fetch(&mut self, done: FetchDone) {
        let FetchDone {
            kind,
            origin,
            generation,
            result,
        } = done;
        let at = Utc::now();
        match origin {
            FetchOrigin::Poll => {
                let id = poll_id(kind);
                if generation != self.generation(id) {
                    return;
                }
                let Some(poll) = self.polls.get_mut(&kind) else {
                    return;
                };
                let report = poll.complete(&result, at, Instant::now());
                let consecutive_errors = poll.machine().consecutive_errors();
                let message = result.as_ref().err().map(ToString::to_string);
                if let Some(tracker) = self.trackers.get_mut(&id) {
                    tracker.record_fetch(
                        message.as_deref().map_or(Ok(()), Err),
                        consecutive_errors,
                        at,
                    );
                }
                match result {
                    Ok(records) => self.deliver(kind, records),
                    Err(_) if report.announce_failure => {
                        let _ = self.events.send(SyncEvent::Warning {
                            owner_id: self.owner_id.clone(),
                            subscription: id,
                            message: format!(
                                "Could not refresh {kind}: {}",
                                message.unwrap_or_default()
                            ),
                        });
                    }
                    Err(_) => {}
                }
            }
            FetchOrigin::Manual(reply) => {
                let id = poll_id(kind);
                if generation == self.generation(id) {
                    if let Some(poll) = self.polls.get_mut(&kind) {
                        poll.complete_manual(&result, at);
                        let consecutive_errors = poll.machine().consecutive_errors();
                        if result.is_ok() {
                            if let Some(tracker) = self.trackers.get_mut(&id) {
                                tracker.record_fetch(Ok(()), consecutive_errors, at);
                            }
                        }
                    }
                }
                match result {
                    Ok(records) => {
                        self.deliver(kind, records.clone());
                        let _ = reply.send(Some(records));
                    }
                    Err(_) => {
                        let _ = reply.send(None);
                    }
                }
            }
            FetchOrigin::Change => {
                let entry = self.change_fetches.entry(kind).or_default();
                entry.in_flight = false;
                let follow_up = std::mem::take(&mut entry.dirty);
                match result {
                    Ok(records) => self.deliver(kind, records),
                    Err(err) => {
                        warn!(
                            event = "change_refetch_failed",
                            owner_id = %self.owner_id,
                            kind = %kind,
                            error = %err
                        );
                        if let Some(tracker) = self.trackers.get_mut(&SubscriptionId::RealtimeChannel) {
                            tracker.note_error(err.to_string());
                        }
                    }
                }
                if follow_up {
                    let topic = match kind {
                        ResourceKind::Messages => Topic::messages_addressed(),
                        _ => Topic::tour_requests_owned(),
                    };
                    self.request_change_fetch(topic);
                }
            }
            FetchOrigin::UnreadCount => {
                if generation != self.generation(SubscriptionId::UnreadCount) {
                    return;
                }
                if let Some(fetch) = self.unread.apply(self.service.as_ref(), &result) {
                    self.push_fetch(ResourceKind::UnreadMessages, FetchOrigin::UnreadCount, generation, fetch);
                }
            }
        }
    }

    fn deliver(&mut self, kind: ResourceKind, records: Vec<Record>) {
        self.record_counts.insert(kind, records.len());
        if let Some(tracker) = self.trackers.get_mut(&poll_id(kind)) {
            for listener in &self.listeners {
                tracker.isolate(|| listener(kind, &records));
            }
        }
        let _ = self.events.send(SyncEvent::Records {
            owner_id: self.owner_id.clone(),
            kind,
            records,
        });
    }

    fn generation(&self, id: SubscriptionId) -> u64 {
        self.generations.get(&id).copied().unwrap_or(0)
    }

    fn bump_generation(&mut self, id: SubscriptionId) {
        *self.generations.entry(id).or_default() += 1;
    }

    fn build_snapshot(&self) -> SyncSnapshot {
        let mut subscriptions = BTreeMap::new();
        let mut insert = |id: SubscriptionId, state: ConnectionState, retry_scheduled: bool| {
            let health = self
                .trackers
                .get(&id)
                .map(SubscriptionHealthTracker::record)
                .unwrap_or_default();
            subscriptions.insert(
                id,
                SubscriptionStatus {
                    state,
                    retry_scheduled,
                    health,
                },
            );
        };

        insert(
            SubscriptionId::RealtimeChannel,
            self.channel.state(),
            self.channel.reopen_deadline().is_some(),
        );
        insert(
            SubscriptionId::UnreadCount,
            self.unread.channel().state(),
            self.unread.channel().reopen_deadline().is_some(),
        );
        let mut resources = BTreeMap::new();
        for (kind, poll) in &self.polls {
            let machine = poll.machine();
            let state = if poll.is_running() {
                machine.state()
            } else {
                ConnectionState::Disabled
            };
            insert(
                poll.id(),
                state,
                machine.consecutive_errors() > 0 && poll.next_fire().is_some(),
            );
            resources.insert(
                *kind,
                ResourceStatus {
                    is_loading: machine.last_fetch_at().is_none(),
                    is_refreshing: machine.is_refreshing(),
                    last_fetch_at: machine.last_fetch_at(),
                    record_count: self.record_counts.get(kind).copied(),
                },
            );
        }

        let records: BTreeMap<String, SubscriptionHealthRecord> = subscriptions
            .iter()
            .map(|(id, status)| (id.as_str().to_string(), status.health.clone()))
            .collect();
        let readiness = aggregate(&records, &self.required);

        SyncSnapshot {
            owner_id: Some(self.owner_id.clone()),
            online: self.online,
            subscriptions,
            resources,
            unread: self.unread.snapshot(),
            readiness,
        }
    }

    fn publish(&mut self, snapshot: &watch::Sender<SyncSnapshot>) {
        let unread = self.unread.snapshot();
        if unread != self.last_unread {
            self.last_unread = unread;
            let _ = self.events.send(SyncEvent::UnreadCount {
                owner_id: self.owner_id.clone(),
                count: unread,
            });
        }

        let next = self.build_snapshot();
        snapshot.send_if_modified(move |current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

fn build_channel(
    owner_id: &OwnerId,
    config: &SyncConfig,
    channel_tx: mpsc::UnboundedSender<ChannelEvent>,
) -> ChannelSubscription {
    ChannelSubscription::new(
        SubscriptionId::RealtimeChannel,
        owner_id.clone(),
        vec![Topic::tour_requests_owned(), Topic::messages_addressed()],
        config.channel.policy(),
        channel_tx,
    )
}

fn build_poll(
    owner_id: &OwnerId,
    config: &SyncConfig,
    service: &Arc<dyn DataService>,
    kind: ResourceKind,
) -> PollingSession {
    let service = Arc::clone(service);
    let owner = owner_id.clone();
    let fetch: FetchFn = Arc::new(move || service.query_resources(&owner, kind));
    PollingSession::new(poll_id(kind), kind, fetch, config.polling.policy())
}

fn poll_id(kind: ResourceKind) -> SubscriptionId {
    match kind {
        ResourceKind::TourRequests => SubscriptionId::TourRequestsPoll,
        ResourceKind::Messages => SubscriptionId::MessagesPoll,
        ResourceKind::UnreadMessages => SubscriptionId::UnreadCount,
    }
}

fn poll_kind(id: SubscriptionId) -> ResourceKind {
    match id {
        SubscriptionId::MessagesPoll => ResourceKind::Messages,
        SubscriptionId::UnreadCount => ResourceKind::UnreadMessages,
        SubscriptionId::RealtimeChannel | SubscriptionId::TourRequestsPoll => {
            ResourceKind::TourRequests
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
