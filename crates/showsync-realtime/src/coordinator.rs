use crate::backend::DataService;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::session::{RecordsListener, SyncEvent, SyncHandle, SyncSession, SyncSnapshot};
use crate::SubscriptionId;
use showsync_core::{OwnerId, Record, ResourceKind};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// Holds at most one [`SyncSession`], bound to the current owner id.
///
/// Changing the owner, disabling the feature or shutting down always tears
/// the previous session down completely before anything new is created.
pub struct SyncCoordinator {
    config: SyncConfig,
    service: Arc<dyn DataService>,
    events: mpsc::UnboundedSender<SyncEvent>,
    listeners: Vec<RecordsListener>,
    owner_id: Option<OwnerId>,
    enabled: bool,
    online: bool,
    session: Option<SyncSession>,
}

impl SyncCoordinator {
    pub fn new(
        config: SyncConfig,
        service: Arc<dyn DataService>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let enabled = config.enabled;
        (
            Self {
                config,
                service,
                events,
                listeners: Vec::new(),
                owner_id: None,
                enabled,
                online: true,
                session: None,
            },
            rx,
        )
    }

    /// Registers a callback for fetched lists. Applies to sessions started
    /// after the call.
    pub fn on_records<F>(&mut self, listener: F)
    where
        F: Fn(ResourceKind, &[Record]) -> Result<(), String> + Send + Sync + 'static,
    {
        self.listeners.push(Arc::new(listener));
    }

    pub fn owner_id(&self) -> Option<&OwnerId> {
        self.owner_id.as_ref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn set_owner(&mut self, owner_id: Option<OwnerId>) {
        if self.owner_id == owner_id {
            return;
        }
        self.owner_id = owner_id;
        self.reconcile().await;
    }

    pub async fn set_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled {
            return;
        }
        self.enabled = enabled;
        self.reconcile().await;
    }

    pub async fn set_online(&mut self, online: bool) {
        self.online = online;
        if let Some(session) = &self.session {
            // A closed session is replaced on the next reconcile and picks
            // up `self.online` then.
            let _ = session.handle().set_online(online).await;
        }
    }

    pub fn handle(&self) -> Option<&SyncHandle> {
        self.session.as_ref().map(SyncSession::handle)
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        match &self.session {
            Some(session) => session.handle().snapshot(),
            None => SyncSnapshot::disabled(self.online),
        }
    }

    /// Snapshot stream of the current session. Replaced on owner change.
    pub fn watch(&self) -> Option<watch::Receiver<SyncSnapshot>> {
        self.handle().map(SyncHandle::watch)
    }

    pub fn can_submit_forms(&self) -> bool {
        self.snapshot().can_submit_forms()
    }

    pub async fn manual_refresh(&self, kind: ResourceKind) -> Option<Vec<Record>> {
        self.handle()?.manual_refresh(kind).await
    }

    pub async fn retry(&self, id: SubscriptionId) -> Result<(), SyncError> {
        match self.handle() {
            Some(handle) => handle.retry(id).await,
            None => Err(SyncError::SessionClosed),
        }
    }

    pub async fn shutdown(mut self) {
        if let Some(session) = self.session.take() {
            session.shutdown().await;
        }
    }

    async fn reconcile(&mut self) {
        let desired = self.owner_id.clone().filter(|_| self.enabled);
        let current = self.session.as_ref().map(|session| session.owner_id().clone());
        if desired == current {
            return;
        }

        if let Some(session) = self.session.take() {
            info!(
                event = "session_replace",
                previous = %session.owner_id(),
                next = desired.as_ref().map(OwnerId::as_str).unwrap_or("-")
            );
            session.shutdown().await;
        }

        if let Some(owner_id) = desired {
            self.session = Some(SyncSession::spawn(
                owner_id,
                &self.config,
                Arc::clone(&self.service),
                self.events.clone(),
                self.listeners.clone(),
                self.online,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDataService;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).expect("owner")
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn no_session_without_owner() {
        let service = SimDataService::new();
        let (mut coordinator, _events) =
            SyncCoordinator::new(SyncConfig::default(), Arc::new(service.clone()));
        coordinator.set_owner(None).await;

        assert!(coordinator.handle().is_none());
        assert!(coordinator.snapshot().is_disabled());
        assert_eq!(service.counters().subscribe_calls, 0);
        assert!(coordinator.retry(SubscriptionId::RealtimeChannel).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn disabling_tears_the_session_down() {
        let service = SimDataService::new();
        let (mut coordinator, _events) =
            SyncCoordinator::new(SyncConfig::default(), Arc::new(service.clone()));
        coordinator.set_owner(Some(owner("u1"))).await;
        settle().await;
        assert_eq!(service.live_handle_count(), 2);

        coordinator.set_enabled(false).await;
        assert!(coordinator.handle().is_none());
        assert_eq!(service.live_handle_count(), 0);

        coordinator.set_enabled(true).await;
        assert_eq!(coordinator.handle().map(|h| h.owner_id().clone()), Some(owner("u1")));
        coordinator.shutdown().await;
        assert_eq!(service.live_handle_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_owner_keeps_the_session() {
        let service = SimDataService::new();
        let (mut coordinator, _events) =
            SyncCoordinator::new(SyncConfig::default(), Arc::new(service.clone()));
        coordinator.set_owner(Some(owner("u1"))).await;
        settle().await;
        coordinator.set_owner(Some(owner("u1"))).await;
        settle().await;

        assert_eq!(service.counters().subscribe_calls, 2);
        assert_eq!(service.counters().unsubscribe_calls, 0);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn disabled_config_never_subscribes() {
        let service = SimDataService::new();
        let config = SyncConfig {
            enabled: false,
            ..SyncConfig::default()
        };
        let (mut coordinator, _events) = SyncCoordinator::new(config, Arc::new(service.clone()));
        coordinator.set_owner(Some(owner("u1"))).await;

        assert!(coordinator.handle().is_none());
        assert_eq!(service.counters().subscribe_calls, 0);
        assert!(coordinator.can_submit_forms());
    }
}
