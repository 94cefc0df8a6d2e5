//! [`DataService`] over a single multiplexed WebSocket connection.
//!
//! Queries are matched to replies by `request_id`, channel traffic by
//! subscription id. The connection is dialled on first use; when it breaks,
//! pending queries fail with [`BackendError::TransportClosed`] and every live
//! channel is told `Closed`, which hands recovery to the channel retry policy.
//! The next request dials again.

use crate::backend::{ChannelSink, DataService, RecordsFuture, SubscriptionHandle};
use futures_util::{FutureExt, SinkExt, StreamExt};
use showsync_core::wire::{
    decode_envelope, encode_text, QueryPayload, SubscribePayload, UnsubscribePayload,
    WireEnvelope, WireMsg, DEFAULT_MAX_FRAME_BYTES,
};
use showsync_core::{BackendError, ChannelStatus, OwnerId, Record, ResourceKind, Topic};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

type QueryReply = oneshot::Sender<Result<Vec<Record>, BackendError>>;

#[derive(Clone)]
pub struct WsDataService {
    shared: Arc<WsShared>,
}

struct WsShared {
    url: Url,
    client_id: String,
    max_frame_bytes: usize,
    state: Mutex<ConnState>,
}

#[derive(Default)]
struct ConnState {
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    pending: HashMap<String, QueryReply>,
    channels: HashMap<String, ChannelSink>,
}

impl WsDataService {
    pub fn new(url: Url) -> Self {
        Self {
            shared: Arc::new(WsShared {
                url,
                client_id: format!("showsync-{}", Uuid::new_v4()),
                max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
                state: Mutex::new(ConnState::default()),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    pub fn is_connected(&self) -> bool {
        self.shared
            .lock()
            .outbound
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl WsShared {
    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn frame(&self, request_id: Option<String>, msg: WireMsg) -> Result<String, BackendError> {
        let envelope = WireEnvelope::new(self.client_id.clone(), request_id, msg);
        encode_text(&envelope, self.max_frame_bytes).map_err(|err| BackendError::Protocol(err.to_string()))
    }

    /// Returns the live outbound queue, dialling a new connection if needed.
    fn ensure_connected(self: &Arc<Self>, state: &mut ConnState) -> mpsc::UnboundedSender<String> {
        if let Some(tx) = state.outbound.as_ref().filter(|tx| !tx.is_closed()) {
            return tx.clone();
        }
        state.generation += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        state.outbound = Some(tx.clone());
        tokio::spawn(run_connection(Arc::clone(self), state.generation, rx));
        tx
    }

    fn dispatch(&self, text: &str) {
        let envelope = match decode_envelope(text, self.max_frame_bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "ws_frame_rejected", error = %err);
                return;
            }
        };

        match envelope.msg {
            WireMsg::QueryResult(result) => {
                let Some(request_id) = envelope.request_id else {
                    warn!(event = "ws_query_result_unmatched", kind = %result.kind);
                    return;
                };
                let Some(reply) = self.lock().pending.remove(&request_id) else {
                    debug!(event = "ws_query_result_late", request_id = %request_id);
                    return;
                };
                let outcome = match result.error {
                    Some(error) => Err(BackendError::Query {
                        kind: result.kind,
                        message: format!("{}: {}", error.code, error.message),
                    }),
                    None => Ok(result.records),
                };
                let _ = reply.send(outcome);
            }
            WireMsg::ChannelStatus(payload) => {
                let sink = {
                    let mut state = self.lock();
                    if payload.status.is_failure() {
                        state.channels.remove(&payload.subscription_id)
                    } else {
                        state.channels.get(&payload.subscription_id).cloned()
                    }
                };
                match sink {
                    Some(sink) => sink.status(payload.status, payload.detail),
                    None => debug!(event = "ws_status_unmatched", subscription_id = %payload.subscription_id),
                }
            }
            WireMsg::Changed(payload) => {
                let sink = self.lock().channels.get(&payload.subscription_id).cloned();
                match sink {
                    Some(sink) => sink.changed(payload.topic),
                    None => debug!(event = "ws_change_unmatched", subscription_id = %payload.subscription_id),
                }
            }
            WireMsg::Subscribe(_) | WireMsg::Unsubscribe(_) | WireMsg::Query(_) => {
                debug!(event = "ws_unexpected_message");
            }
        }
    }

    fn fail_all(&self, generation: u64, reason: &str) {
        let (pending, channels) = {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.outbound = None;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.channels),
            )
        };
        warn!(
            event = "ws_disconnected",
            url = %self.url,
            reason,
            pending = pending.len(),
            channels = channels.len()
        );
        for (_, reply) in pending {
            let _ = reply.send(Err(BackendError::TransportClosed));
        }
        for (_, sink) in channels {
            sink.status(ChannelStatus::Closed, Some(reason.to_string()));
        }
    }
}

async fn run_connection(
    shared: Arc<WsShared>,
    generation: u64,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let ws = match connect_async(shared.url.clone()).await {
        Ok((ws, _)) => ws,
        Err(err) => {
            shared.fail_all(generation, &format!("connect failed: {err}"));
            return;
        }
    };
    info!(event = "ws_connected", url = %shared.url, generation);

    let (mut sink, mut stream) = ws.split();
    let reason = loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(_))) | None => break "server closed the connection".to_string(),
                Some(Ok(_)) => {}
                Some(Err(err)) => break format!("read failed: {err}"),
            },
            out = outbound.recv() => match out {
                Some(text) => {
                    if let Err(err) = sink.send(Message::Text(text)).await {
                        break format!("write failed: {err}");
                    }
                }
                None => break "client dropped".to_string(),
            },
        }
    };
    let _ = sink.close().await;
    shared.fail_all(generation, &reason);
}

/// Removes the pending entry when the query future is dropped early, e.g.
/// by a timeout.
struct PendingGuard {
    shared: Arc<WsShared>,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.shared.lock().pending.remove(&self.request_id);
    }
}

impl DataService for WsDataService {
    fn query_resources(&self, owner_id: &OwnerId, kind: ResourceKind) -> RecordsFuture {
        let shared = Arc::clone(&self.shared);
        let owner_id = owner_id.clone();
        async move {
            let request_id = Uuid::new_v4().to_string();
            let frame = shared.frame(
                Some(request_id.clone()),
                WireMsg::Query(QueryPayload { owner_id, kind }),
            )?;
            let (reply, rx) = oneshot::channel();
            let outbound = {
                let mut state = shared.lock();
                state.pending.insert(request_id.clone(), reply);
                shared.ensure_connected(&mut state)
            };
            let _guard = PendingGuard {
                shared: Arc::clone(&shared),
                request_id,
            };
            outbound.send(frame).map_err(|_| BackendError::TransportClosed)?;
            rx.await.map_err(|_| BackendError::TransportClosed)?
        }
        .boxed()
    }

    fn subscribe_to_changes(
        &self,
        owner_id: &OwnerId,
        topics: &[Topic],
        sink: ChannelSink,
    ) -> Box<dyn SubscriptionHandle> {
        let subscription_id = Uuid::new_v4().to_string();
        let mut handle = WsHandle {
            shared: Arc::clone(&self.shared),
            subscription_id: subscription_id.clone(),
            released: false,
        };

        let frame = match self.shared.frame(
            None,
            WireMsg::Subscribe(SubscribePayload {
                subscription_id: subscription_id.clone(),
                owner_id: owner_id.clone(),
                topics: topics.to_vec(),
            }),
        ) {
            Ok(frame) => frame,
            Err(err) => {
                handle.released = true;
                sink.status(ChannelStatus::Error, Some(err.to_string()));
                return Box::new(handle);
            }
        };

        let outbound = {
            let mut state = self.shared.lock();
            state.channels.insert(subscription_id.clone(), sink.clone());
            self.shared.ensure_connected(&mut state)
        };
        if outbound.send(frame).is_err() {
            self.shared.lock().channels.remove(&subscription_id);
            handle.released = true;
            sink.status(ChannelStatus::Closed, Some("transport closed".to_string()));
        } else {
            debug!(event = "ws_subscribe_sent", subscription_id = %subscription_id, topics = topics.len());
        }
        Box::new(handle)
    }
}

struct WsHandle {
    shared: Arc<WsShared>,
    subscription_id: String,
    released: bool,
}

impl SubscriptionHandle for WsHandle {
    fn unsubscribe(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let outbound = {
            let mut state = self.shared.lock();
            state.channels.remove(&self.subscription_id);
            state.outbound.clone()
        };
        // Only tell a live connection; never dial just to unsubscribe.
        let Some(outbound) = outbound else {
            return;
        };
        match self.shared.frame(
            None,
            WireMsg::Unsubscribe(UnsubscribePayload {
                subscription_id: self.subscription_id.clone(),
            }),
        ) {
            Ok(frame) => {
                let _ = outbound.send(frame);
            }
            Err(err) => warn!(event = "ws_unsubscribe_encode_failed", error = %err),
        }
    }
}

impl Drop for WsHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ChannelEventKind;
    use crate::SubscriptionId;
    use showsync_core::wire::{ChangedPayload, ChannelStatusPayload, QueryResultPayload, QueryError};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn reply(request: &WireEnvelope, msg: WireMsg) -> Message {
        let envelope = WireEnvelope::new("server", request.request_id.clone(), msg);
        Message::Text(encode_text(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode"))
    }

    /// Answers queries, acknowledges subscriptions with a change notification
    /// and hangs up after `frames` inbound frames.
    async fn spawn_server(frames: usize) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = accept_async(stream).await.expect("handshake");
            let mut seen = 0;
            while let Some(Ok(message)) = ws.next().await {
                let Message::Text(text) = message else { continue };
                let request = decode_envelope(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
                match &request.msg {
                    WireMsg::Query(query) if query.kind == ResourceKind::Messages => {
                        let msg = WireMsg::QueryResult(QueryResultPayload {
                            kind: query.kind,
                            records: Vec::new(),
                            error: Some(QueryError {
                                code: "forbidden".to_string(),
                                message: "not yours".to_string(),
                            }),
                        });
                        ws.send(reply(&request, msg)).await.expect("send");
                    }
                    WireMsg::Query(query) => {
                        let msg = WireMsg::QueryResult(QueryResultPayload {
                            kind: query.kind,
                            records: vec![Record::new(format!("{}-1", query.owner_id))],
                            error: None,
                        });
                        ws.send(reply(&request, msg)).await.expect("send");
                    }
                    WireMsg::Subscribe(subscribe) => {
                        let status = WireMsg::ChannelStatus(ChannelStatusPayload {
                            subscription_id: subscribe.subscription_id.clone(),
                            status: ChannelStatus::Subscribed,
                            detail: None,
                        });
                        ws.send(reply(&request, status)).await.expect("send");
                        let changed = WireMsg::Changed(ChangedPayload {
                            subscription_id: subscribe.subscription_id.clone(),
                            topic: subscribe.topics[0],
                        });
                        ws.send(reply(&request, changed)).await.expect("send");
                    }
                    _ => {}
                }
                seen += 1;
                if seen >= frames {
                    break;
                }
            }
        });
        Url::parse(&format!("ws://{addr}")).expect("url")
    }

    #[tokio::test]
    async fn query_results_match_their_requests() {
        let url = spawn_server(2).await;
        let service = WsDataService::new(url);
        let owner = OwnerId::new("u1").expect("owner");

        let records = service
            .query_resources(&owner, ResourceKind::TourRequests)
            .await
            .expect("records");
        assert_eq!(records, vec![Record::new("u1-1")]);

        let err = service
            .query_resources(&owner, ResourceKind::Messages)
            .await
            .expect_err("server error");
        assert_eq!(
            err,
            BackendError::Query {
                kind: ResourceKind::Messages,
                message: "forbidden: not yours".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn channel_receives_status_changes_and_close() {
        let url = spawn_server(1).await;
        let service = WsDataService::new(url);
        let owner = OwnerId::new("u1").expect("owner");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = ChannelSink::new(SubscriptionId::RealtimeChannel, 7, tx);

        let _handle = service.subscribe_to_changes(&owner, &[Topic::tour_requests_owned()], sink);

        let first = rx.recv().await.expect("status");
        assert_eq!(first.epoch, 7);
        assert_eq!(
            first.kind,
            ChannelEventKind::Status {
                status: ChannelStatus::Subscribed,
                detail: None
            }
        );
        let second = rx.recv().await.expect("change");
        assert_eq!(second.kind, ChannelEventKind::Changed(Topic::tour_requests_owned()));

        let third = rx.recv().await.expect("close");
        assert!(matches!(
            third.kind,
            ChannelEventKind::Status {
                status: ChannelStatus::Closed,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_server_fails_queries_and_redials_lazily() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let service = WsDataService::new(Url::parse(&format!("ws://{addr}")).expect("url"));
        let owner = OwnerId::new("u1").expect("owner");

        for _ in 0..2 {
            let err = service
                .query_resources(&owner, ResourceKind::TourRequests)
                .await
                .expect_err("no server");
            assert_eq!(err, BackendError::TransportClosed);
        }
        assert!(!service.is_connected());
    }
}
