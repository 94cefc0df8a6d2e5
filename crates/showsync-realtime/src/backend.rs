//! Seam to the backend data service: row queries plus push change channels.

use crate::SubscriptionId;
use futures_util::future::BoxFuture;
use showsync_core::{BackendError, ChannelStatus, OwnerId, Record, ResourceKind, Topic};
use tokio::sync::mpsc;

pub type RecordsFuture = BoxFuture<'static, Result<Vec<Record>, BackendError>>;

pub trait DataService: Send + Sync + 'static {
    fn query_resources(&self, owner_id: &OwnerId, kind: ResourceKind) -> RecordsFuture;

    /// Registers a push channel. Status and change notifications arrive
    /// asynchronously through `sink`.
    fn subscribe_to_changes(
        &self,
        owner_id: &OwnerId,
        topics: &[Topic],
        sink: ChannelSink,
    ) -> Box<dyn SubscriptionHandle>;
}

/// Live registration returned by [`DataService::subscribe_to_changes`].
/// `unsubscribe` must tolerate repeated calls.
pub trait SubscriptionHandle: Send {
    fn unsubscribe(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEventKind {
    Status {
        status: ChannelStatus,
        detail: Option<String>,
    },
    Changed(Topic),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub source: SubscriptionId,
    /// Identifies which open attempt produced the event.
    pub epoch: u64,
    pub kind: ChannelEventKind,
}

/// Delivery end handed to the transport for one open attempt.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    source: SubscriptionId,
    epoch: u64,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelSink {
    pub fn new(source: SubscriptionId, epoch: u64, tx: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self { source, epoch, tx }
    }

    pub fn status(&self, status: ChannelStatus, detail: Option<String>) {
        self.send(ChannelEventKind::Status { status, detail });
    }

    pub fn changed(&self, topic: Topic) {
        self.send(ChannelEventKind::Changed(topic));
    }

    fn send(&self, kind: ChannelEventKind) {
        let _ = self.tx.send(ChannelEvent {
            source: self.source,
            epoch: self.epoch,
            kind,
        });
    }
}
