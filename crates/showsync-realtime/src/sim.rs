//! Scriptable in-memory backend. Drives tests and the monitor's simulate mode.

use crate::backend::{ChannelSink, DataService, RecordsFuture, SubscriptionHandle};
use futures_util::FutureExt;
use showsync_core::{BackendError, ChannelStatus, OwnerId, Record, ResourceKind, Topic};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the simulated transport reports right after a subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOutcome {
    Status(ChannelStatus),
    /// Report nothing; the channel stays `Connecting`.
    Silent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimCounters {
    pub subscribe_calls: usize,
    pub unsubscribe_calls: usize,
    pub queries: usize,
}

struct LiveChannel {
    owner_id: OwnerId,
    topics: Vec<Topic>,
    sink: ChannelSink,
}

#[derive(Default)]
struct SimState {
    records: BTreeMap<(OwnerId, ResourceKind), Vec<Record>>,
    scripts: BTreeMap<ResourceKind, VecDeque<ChannelOutcome>>,
    pending_failures: BTreeMap<ResourceKind, usize>,
    outages: BTreeSet<ResourceKind>,
    latency: Duration,
    live: BTreeMap<u64, LiveChannel>,
    next_id: u64,
    counters: SimCounters,
}

impl SimState {
    fn query(&mut self, owner_id: &OwnerId, kind: ResourceKind) -> Result<Vec<Record>, BackendError> {
        if self.outages.contains(&kind) {
            return Err(BackendError::Query {
                kind,
                message: "simulated outage".to_string(),
            });
        }
        if let Some(remaining) = self.pending_failures.get_mut(&kind) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(BackendError::Query {
                    kind,
                    message: "simulated failure".to_string(),
                });
            }
        }
        Ok(self
            .records
            .get(&(owner_id.clone(), kind))
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Clone, Default)]
pub struct SimDataService {
    state: Arc<Mutex<SimState>>,
}

impl SimDataService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_records(&self, owner_id: &OwnerId, kind: ResourceKind, records: Vec<Record>) {
        lock(&self.state)
            .records
            .insert((owner_id.clone(), kind), records);
    }

    /// Queues outcomes for subscribe calls whose first topic has `kind`.
    /// Once the queue drains, channels subscribe successfully.
    pub fn script_channel(&self, kind: ResourceKind, outcomes: impl IntoIterator<Item = ChannelOutcome>) {
        lock(&self.state)
            .scripts
            .entry(kind)
            .or_default()
            .extend(outcomes);
    }

    /// Fails the next `count` queries for `kind`.
    pub fn fail_queries(&self, kind: ResourceKind, count: usize) {
        *lock(&self.state).pending_failures.entry(kind).or_default() += count;
    }

    pub fn set_outage(&self, kind: ResourceKind, down: bool) {
        let mut state = lock(&self.state);
        if down {
            state.outages.insert(kind);
        } else {
            state.outages.remove(&kind);
        }
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// Sends a change notification to every live channel of `owner_id`
    /// carrying `kind`. Returns how many channels were notified.
    pub fn notify_change(&self, owner_id: &OwnerId, kind: ResourceKind) -> usize {
        let state = lock(&self.state);
        let mut notified = 0;
        for live in state.live.values() {
            if &live.owner_id != owner_id {
                continue;
            }
            if let Some(topic) = live.topics.iter().find(|topic| topic.kind == kind) {
                live.sink.changed(*topic);
                notified += 1;
            }
        }
        notified
    }

    /// Reports `status` on every live channel, as if the server dropped them.
    pub fn drop_channels(&self, status: ChannelStatus) -> usize {
        let state = lock(&self.state);
        for live in state.live.values() {
            live.sink.status(status, Some("simulated drop".to_string()));
        }
        state.live.len()
    }

    pub fn counters(&self) -> SimCounters {
        lock(&self.state).counters
    }

    pub fn live_handle_count(&self) -> usize {
        lock(&self.state).live.len()
    }

    pub fn live_owners(&self) -> BTreeSet<OwnerId> {
        lock(&self.state)
            .live
            .values()
            .map(|live| live.owner_id.clone())
            .collect()
    }
}

impl DataService for SimDataService {
    fn query_resources(&self, owner_id: &OwnerId, kind: ResourceKind) -> RecordsFuture {
        let latency = {
            let mut state = lock(&self.state);
            state.counters.queries += 1;
            state.latency
        };
        let state = self.state.clone();
        let owner_id = owner_id.clone();
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            lock(&state).query(&owner_id, kind)
        }
        .boxed()
    }

    fn subscribe_to_changes(
        &self,
        owner_id: &OwnerId,
        topics: &[Topic],
        sink: ChannelSink,
    ) -> Box<dyn SubscriptionHandle> {
        let (id, outcome) = {
            let mut state = lock(&self.state);
            state.counters.subscribe_calls += 1;
            state.next_id += 1;
            let id = state.next_id;
            let outcome = topics
                .first()
                .and_then(|topic| state.scripts.get_mut(&topic.kind))
                .and_then(|queue| queue.pop_front())
                .unwrap_or(ChannelOutcome::Status(ChannelStatus::Subscribed));
            state.live.insert(
                id,
                LiveChannel {
                    owner_id: owner_id.clone(),
                    topics: topics.to_vec(),
                    sink: sink.clone(),
                },
            );
            (id, outcome)
        };

        if let ChannelOutcome::Status(status) = outcome {
            let detail = status
                .is_failure()
                .then(|| format!("simulated {status:?}"));
            sink.status(status, detail);
        }

        Box::new(SimHandle {
            id,
            state: self.state.clone(),
            released: false,
        })
    }
}

struct SimHandle {
    id: u64,
    state: Arc<Mutex<SimState>>,
    released: bool,
}

impl SubscriptionHandle for SimHandle {
    fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut state = lock(&self.state);
        state.live.remove(&self.id);
        state.counters.unsubscribe_calls += 1;
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
