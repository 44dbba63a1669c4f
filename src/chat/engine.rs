use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{durable_id, normalize, Conversation, DeliveryState, LiveOutcome, Message};
use crate::session::Session;
use crate::transport::{MessageApi, OutgoingMessage, PushConnection, PushConnector};

/// Fallback delivery event on the realtime channel.
pub const SEND_EVENT: &str = "send_message";

const DEFAULT_PEER_NAME: &str = "User";

/// Notifications for whatever surface renders the conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TranscriptChanged { peer: String },
    ScrollToLatest,
    PeerResolved { peer: String, name: String },
    /// Live message for a conversation that is not the open one.
    ForeignMessage(Message),
    DeliveryFailed { peer: String, temp_id: String },
    LiveConnected { peer: String },
    LiveDisconnected { peer: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Blank text, no open conversation, or a send already in flight.
    Ignored,
    Confirmed { id: String },
    /// Primary channel did not confirm; the push channel was tried instead.
    FellBack { temp_id: String },
}

/// An optimistic entry that still has to be delivered. Holding it occupies
/// the conversation's single in-flight slot; dropping it frees the slot.
#[derive(Debug)]
pub struct PendingSend {
    conversation: Arc<Conversation>,
    temp_id: String,
    body: String,
}

impl PendingSend {
    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }
}

impl Drop for PendingSend {
    fn drop(&mut self) {
        self.conversation.finish_send();
    }
}

struct LiveSubscription {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl LiveSubscription {
    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Live subscriber ended abnormally: {}", e);
            }
        }
    }
}

/// Keeps the transcript of the open conversation in sync: history over
/// REST, live messages over the push channel, optimistic sends with
/// REST-then-push delivery.
#[derive(Clone)]
pub struct MessageSyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    session: Session,
    api: Arc<dyn MessageApi>,
    push: Arc<dyn PushConnector>,
    pending_timeout: Duration,
    events: mpsc::UnboundedSender<EngineEvent>,
    current: Mutex<Option<Arc<Conversation>>>,
    live: tokio::sync::Mutex<Option<LiveSubscription>>,
}

impl MessageSyncEngine {
    pub fn new(
        session: Session,
        api: Arc<dyn MessageApi>,
        push: Arc<dyn PushConnector>,
        pending_timeout: Duration,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                session,
                api,
                push,
                pending_timeout,
                events,
                current: Mutex::new(None),
                live: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn current_peer(&self) -> Option<String> {
        self.current().map(|c| c.peer.clone())
    }

    /// Snapshot of the open conversation, empty when nothing is open.
    pub fn transcript(&self) -> Vec<Message> {
        self.current().map(|c| c.snapshot()).unwrap_or_default()
    }

    pub fn is_sending(&self) -> bool {
        self.current().is_some_and(|c| c.is_sending())
    }

    fn current(&self) -> Option<Arc<Conversation>> {
        self.inner.current.lock().clone()
    }

    fn is_current(&self, conversation: &Arc<Conversation>) -> bool {
        self.current()
            .is_some_and(|current| Arc::ptr_eq(&current, conversation))
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Switch to the conversation with `peer`: tears down the previous one,
    /// subscribes to live messages, then loads history and the peer's name.
    pub async fn open(&self, peer: &str) {
        let peer = peer.trim();
        if peer.is_empty() {
            return;
        }

        let conversation = Arc::new(Conversation::new(peer));
        {
            let mut live = self.inner.live.lock().await;
            if let Some(previous) = live.take() {
                previous.stop().await;
            }
            *self.inner.current.lock() = Some(conversation.clone());
            *live = Some(self.subscribe(conversation.clone()));
        }
        info!("Opened conversation with {}", peer);

        let (history, name) = tokio::join!(
            load_history(self.inner.api.as_ref(), peer),
            self.inner.api.peer_name(peer)
        );

        if !self.is_current(&conversation) {
            debug!("Conversation with {} closed while loading", peer);
            return;
        }

        conversation.merge_history(history);
        self.emit(EngineEvent::TranscriptChanged {
            peer: peer.to_string(),
        });
        self.emit(EngineEvent::ScrollToLatest);

        let name = match name {
            Ok(Some(name)) => name,
            Ok(None) => DEFAULT_PEER_NAME.to_string(),
            Err(e) => {
                debug!("Profile for {} unavailable: {}", peer, e);
                DEFAULT_PEER_NAME.to_string()
            }
        };
        self.emit(EngineEvent::PeerResolved {
            peer: peer.to_string(),
            name,
        });
    }

    /// Drop the open conversation and its live connection. In-flight sends
    /// are not cancelled.
    pub async fn close(&self) {
        let mut live = self.inner.live.lock().await;
        let conversation = self.inner.current.lock().take();
        if let Some(subscription) = live.take() {
            subscription.stop().await;
        }
        drop(live);

        if let Some(conversation) = conversation {
            info!("Closed conversation with {}", conversation.peer);
            self.emit(EngineEvent::TranscriptChanged {
                peer: conversation.peer.clone(),
            });
        }
    }

    fn subscribe(&self, conversation: Arc<Conversation>) -> LiveSubscription {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_live_subscriber(
            self.inner.push.clone(),
            self.inner.session.user_id.clone(),
            conversation,
            self.inner.events.clone(),
            shutdown_rx,
        ));
        LiveSubscription { shutdown, task }
    }

    pub async fn send(&self, text: &str) -> SendOutcome {
        match self.stage(text) {
            Some(pending) => self.deliver(pending).await,
            None => SendOutcome::Ignored,
        }
    }

    /// Append the optimistic entry for `text` and claim the in-flight slot.
    /// `None` means nothing was staged and the input should be kept.
    pub fn stage(&self, text: &str) -> Option<PendingSend> {
        self.stage_in(self.current()?, text)
    }

    /// Like [`stage`](Self::stage), but only if the open conversation is
    /// still the one with `peer`.
    pub fn stage_for(&self, peer: &str, text: &str) -> Option<PendingSend> {
        let conversation = self.current().filter(|c| c.peer == peer)?;
        self.stage_in(conversation, text)
    }

    fn stage_in(&self, conversation: Arc<Conversation>, text: &str) -> Option<PendingSend> {
        let body = text.trim();
        if body.is_empty() {
            return None;
        }

        let temp_id = new_temp_id();
        let draft = Message::pending(
            &temp_id,
            &self.inner.session.user_id,
            &conversation.peer,
            body,
        );
        if !conversation.begin_send(draft) {
            debug!("Send to {} already in flight", conversation.peer);
            return None;
        }

        self.emit(EngineEvent::TranscriptChanged {
            peer: conversation.peer.clone(),
        });
        self.emit(EngineEvent::ScrollToLatest);

        Some(PendingSend {
            conversation,
            temp_id,
            body: body.to_string(),
        })
    }

    /// Deliver a staged message: primary channel first, push channel if the
    /// primary one fails or does not return a durable id.
    pub async fn deliver(&self, pending: PendingSend) -> SendOutcome {
        let peer = pending.conversation.peer.clone();
        let request = OutgoingMessage {
            to: peer.clone(),
            body: pending.body.clone(),
            temp_id: pending.temp_id.clone(),
        };

        let response = match self.inner.api.post_message(&request).await {
            Ok(Some(response)) if durable_id(&response).is_some() => Some(response),
            Ok(_) => {
                info!("Send {} accepted without a durable id", pending.temp_id);
                None
            }
            Err(e) => {
                warn!("Primary delivery of {} failed: {}", pending.temp_id, e);
                None
            }
        };

        if let Some(response) = response {
            let id = pending
                .conversation
                .confirm(&pending.temp_id, &response)
                .or_else(|| durable_id(&response))
                .unwrap_or_default();
            debug!("Send {} confirmed as {}", pending.temp_id, id);
            self.emit(EngineEvent::TranscriptChanged { peer });
            return SendOutcome::Confirmed { id };
        }

        self.emit_fallback(&pending).await;
        self.watch_pending(pending.conversation.clone(), pending.temp_id.clone());
        SendOutcome::FellBack {
            temp_id: pending.temp_id.clone(),
        }
    }

    async fn emit_fallback(&self, pending: &PendingSend) {
        let payload = json!({
            "senderId": self.inner.session.user_id,
            "receiverId": pending.conversation.peer,
            "content": pending.body,
            "tempId": pending.temp_id,
        });

        let mut connection = match self.inner.push.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Fallback channel unavailable for {}: {}", pending.temp_id, e);
                return;
            }
        };

        match connection.emit(SEND_EVENT, payload).await {
            Ok(()) => info!("Send {} handed to the realtime channel", pending.temp_id),
            Err(e) => warn!("Fallback emit of {} failed: {}", pending.temp_id, e),
        }
        connection.close().await;
    }

    /// Entries left pending by the fallback path turn `failed` once
    /// `pending_timeout` passes without a confirmation.
    fn watch_pending(&self, conversation: Arc<Conversation>, temp_id: String) {
        let events = self.inner.events.clone();
        let timeout = self.inner.pending_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if conversation.mark_failed(&temp_id) {
                warn!("Send {} unconfirmed after {:?}, marking failed", temp_id, timeout);
                let peer = conversation.peer.clone();
                let _ = events.send(EngineEvent::DeliveryFailed {
                    peer: peer.clone(),
                    temp_id,
                });
                let _ = events.send(EngineEvent::TranscriptChanged { peer });
            }
        });
    }
}

/// History for `peer`, best effort: any failure yields an empty list.
pub async fn load_history(api: &dyn MessageApi, peer: &str) -> Vec<Message> {
    match api.history(peer).await {
        Ok(records) => records
            .iter()
            .map(normalize)
            .map(|mut message| {
                message.delivery_state = DeliveryState::Confirmed;
                message
            })
            .collect(),
        Err(e) => {
            warn!("History for {} unavailable: {}", peer, e);
            Vec::new()
        }
    }
}

async fn run_live_subscriber(
    push: Arc<dyn PushConnector>,
    local_user: String,
    conversation: Arc<Conversation>,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let peer = conversation.peer.clone();

    let connected = tokio::select! {
        biased;
        _ = &mut shutdown => return,
        result = push.connect() => result,
    };
    let mut connection: Box<dyn PushConnection> = match connected {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Live updates for {} unavailable: {}", peer, e);
            let _ = events.send(EngineEvent::LiveDisconnected { peer });
            return;
        }
    };
    let _ = events.send(EngineEvent::LiveConnected { peer: peer.clone() });

    // The channel is keyed by the local user, so it carries every peer.
    let inbound = format!("message_{}", local_user);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            received = connection.recv() => match received {
                Ok(Some(event)) if event.name == inbound => {
                    accept_live(&conversation, &local_user, &event.payload, &events);
                }
                Ok(Some(event)) => debug!("Ignoring realtime event {}", event.name),
                Ok(None) => {
                    info!("Realtime channel closed by the server");
                    let _ = events.send(EngineEvent::LiveDisconnected { peer: peer.clone() });
                    break;
                }
                Err(e) => {
                    warn!("Realtime channel failed: {}", e);
                    let _ = events.send(EngineEvent::LiveDisconnected { peer: peer.clone() });
                    break;
                }
            }
        }
    }

    connection.close().await;
    debug!("Live subscriber for {} stopped", peer);
}

fn accept_live(
    conversation: &Conversation,
    local_user: &str,
    payload: &Value,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    // Anything on the live channel is already stored server side.
    let mut message = normalize(payload);
    message.delivery_state = DeliveryState::Confirmed;

    if message.counterpart(local_user) != conversation.peer {
        debug!("Live message {} belongs to another conversation", message.id);
        let _ = events.send(EngineEvent::ForeignMessage(message));
        return;
    }

    let id = message.id.clone();
    match conversation.apply_live(message) {
        LiveOutcome::Appended => {
            let _ = events.send(EngineEvent::TranscriptChanged {
                peer: conversation.peer.clone(),
            });
            let _ = events.send(EngineEvent::ScrollToLatest);
        }
        LiveOutcome::Confirmed => {
            let _ = events.send(EngineEvent::TranscriptChanged {
                peer: conversation.peer.clone(),
            });
        }
        LiveOutcome::Duplicate => debug!("Dropping duplicate live message {}", id),
    }
}

fn new_temp_id() -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("tmp_{}_{}", chrono::Utc::now().timestamp_millis(), &nonce[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ChatError, Result};
    use crate::transport::PushEvent;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeApi {
        history: Option<Vec<Value>>,
        reply: Option<Value>,
        name: Option<String>,
        posts: Mutex<Vec<OutgoingMessage>>,
        /// Holds history back until notified.
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl FakeApi {
        fn new() -> Self {
            Self {
                history: Some(Vec::new()),
                reply: None,
                name: None,
                posts: Mutex::new(Vec::new()),
                gate: None,
            }
        }

        fn replying(reply: Value) -> Self {
            Self {
                reply: Some(reply),
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl MessageApi for FakeApi {
        async fn history(&self, _peer: &str) -> Result<Vec<Value>> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.history
                .clone()
                .ok_or_else(|| ChatError::Protocol("history down".to_string()))
        }

        async fn post_message(&self, message: &OutgoingMessage) -> Result<Option<Value>> {
            self.posts.lock().push(message.clone());
            match &self.reply {
                Some(reply) => Ok(Some(reply.clone())),
                None => Err(ChatError::Protocol("api down".to_string())),
            }
        }

        async fn peer_name(&self, _peer: &str) -> Result<Option<String>> {
            Ok(self.name.clone())
        }
    }

    struct FakePush {
        active: Arc<AtomicUsize>,
        connects: AtomicUsize,
        emits: Arc<Mutex<Vec<PushEvent>>>,
        inbound_tx: mpsc::UnboundedSender<PushEvent>,
        inbound_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<PushEvent>>>>,
    }

    impl FakePush {
        fn new() -> Self {
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            Self {
                active: Arc::new(AtomicUsize::new(0)),
                connects: AtomicUsize::new(0),
                emits: Arc::new(Mutex::new(Vec::new())),
                inbound_tx,
                inbound_rx: Arc::new(Mutex::new(Some(inbound_rx))),
            }
        }

        fn deliver(&self, name: &str, payload: Value) {
            self.inbound_tx
                .send(PushEvent {
                    name: name.to_string(),
                    payload,
                })
                .unwrap();
        }

        fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PushConnector for FakePush {
        async fn connect(&self) -> Result<Box<dyn PushConnection>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            self.active.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConnection {
                active: self.active.clone(),
                emits: self.emits.clone(),
                source: self.inbound_rx.clone(),
                inbound: None,
                closed: false,
            }))
        }
    }

    struct FakeConnection {
        active: Arc<AtomicUsize>,
        emits: Arc<Mutex<Vec<PushEvent>>>,
        source: Arc<Mutex<Option<mpsc::UnboundedReceiver<PushEvent>>>>,
        inbound: Option<mpsc::UnboundedReceiver<PushEvent>>,
        closed: bool,
    }

    #[async_trait]
    impl PushConnection for FakeConnection {
        async fn recv(&mut self) -> Result<Option<PushEvent>> {
            // Only a connection that listens takes the inbound stream.
            if self.inbound.is_none() {
                self.inbound = self.source.lock().take();
            }
            match self.inbound.as_mut() {
                Some(rx) => Ok(rx.recv().await),
                None => std::future::pending().await,
            }
        }

        async fn emit(&mut self, event: &str, payload: Value) -> Result<()> {
            self.emits.lock().push(PushEvent {
                name: event.to_string(),
                payload,
            });
            Ok(())
        }

        async fn close(&mut self) {
            if !self.closed {
                self.closed = true;
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn engine(
        api: Arc<FakeApi>,
        push: Arc<FakePush>,
    ) -> (MessageSyncEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = MessageSyncEngine::new(
            Session::new("u1", None),
            api,
            push,
            Duration::from_secs(15),
            tx,
        );
        (engine, rx)
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("condition not reached");
    }

    async fn next_matching(
        rx: &mut mpsc::UnboundedReceiver<EngineEvent>,
        matches: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("engine dropped");
                if matches(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not emitted")
    }

    #[tokio::test]
    async fn open_then_close_releases_live_connection() {
        let push = Arc::new(FakePush::new());
        let (engine, mut rx) = engine(Arc::new(FakeApi::new()), push.clone());

        engine.open("u42").await;
        next_matching(&mut rx, |e| matches!(e, EngineEvent::LiveConnected { .. })).await;
        assert_eq!(push.active(), 1);
        assert_eq!(engine.current_peer().as_deref(), Some("u42"));

        engine.close().await;
        assert_eq!(push.active(), 0);
        assert_eq!(engine.current_peer(), None);
        assert!(engine.transcript().is_empty());
    }

    #[tokio::test]
    async fn close_right_after_open_leaves_nothing_running() {
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), push.clone());

        engine.open("u42").await;
        engine.close().await;
        assert_eq!(push.active(), 0);
    }

    #[tokio::test]
    async fn switching_peers_uses_a_fresh_connection() {
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), push.clone());

        engine.open("u42").await;
        wait_until(|| push.active() == 1).await;
        engine.open("u43").await;
        wait_until(|| push.connects.load(Ordering::SeqCst) == 2).await;

        assert_eq!(push.active(), 1);
        assert_eq!(engine.current_peer().as_deref(), Some("u43"));
        engine.close().await;
        assert_eq!(push.active(), 0);
    }

    #[tokio::test]
    async fn history_is_normalized_into_transcript() {
        let api = Arc::new(FakeApi {
            history: Some(vec![serde_json::json!({
                "senderId": "u42", "receiverId": "u1", "content": "hi", "timestamp": 1000
            })]),
            name: Some("Dana".to_string()),
            ..FakeApi::new()
        });
        let (engine, mut rx) = engine(api, Arc::new(FakePush::new()));

        engine.open("u42").await;

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].from, "u42");
        assert_eq!(transcript[0].to, "u1");
        assert_eq!(transcript[0].body, "hi");
        assert_eq!(transcript[0].created_at, Utc.timestamp_millis_opt(1000).unwrap());
        assert_eq!(transcript[0].delivery_state, DeliveryState::Confirmed);

        let event = next_matching(&mut rx, |e| matches!(e, EngineEvent::PeerResolved { .. })).await;
        assert_eq!(
            event,
            EngineEvent::PeerResolved {
                peer: "u42".to_string(),
                name: "Dana".to_string()
            }
        );
        engine.close().await;
    }

    #[tokio::test]
    async fn history_failure_yields_empty_transcript() {
        let api = Arc::new(FakeApi {
            history: None,
            ..FakeApi::new()
        });
        let push = Arc::new(FakePush::new());
        let (engine, mut rx) = engine(api, push.clone());

        engine.open("u42").await;
        assert!(engine.transcript().is_empty());

        let event = next_matching(&mut rx, |e| matches!(e, EngineEvent::PeerResolved { .. })).await;
        assert_eq!(
            event,
            EngineEvent::PeerResolved {
                peer: "u42".to_string(),
                name: "User".to_string()
            }
        );

        push.deliver("message_u1", serde_json::json!({"_id": "m1", "from": "u42", "to": "u1", "body": "still live"}));
        wait_until(|| engine.transcript().len() == 1).await;
        engine.close().await;
    }

    #[tokio::test]
    async fn blank_send_is_a_noop() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"_id": "m9"})));
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api.clone(), push.clone());
        engine.open("u42").await;

        for text in ["", "   ", "\n\t "] {
            assert_eq!(engine.send(text).await, SendOutcome::Ignored);
        }

        assert!(engine.transcript().is_empty());
        assert!(api.posts.lock().is_empty());
        assert!(push.emits.lock().is_empty());
        engine.close().await;
    }

    #[tokio::test]
    async fn send_without_open_conversation_is_ignored() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"_id": "m9"})));
        let (engine, _rx) = engine(api.clone(), Arc::new(FakePush::new()));

        assert_eq!(engine.send("hello").await, SendOutcome::Ignored);
        assert!(api.posts.lock().is_empty());
    }

    #[tokio::test]
    async fn confirmed_send_replaces_optimistic_entry() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"_id": "m9"})));
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api.clone(), push.clone());
        engine.open("u42").await;

        let pending = engine.stage("  hello ").unwrap();
        let temp_id = pending.temp_id().to_string();
        let staged = engine.transcript();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].id, temp_id);
        assert_eq!(staged[0].delivery_state, DeliveryState::Pending);

        let outcome = engine.deliver(pending).await;
        assert_eq!(outcome, SendOutcome::Confirmed { id: "m9".to_string() });

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].id, "m9");
        assert_eq!(transcript[0].body, "hello");
        assert_eq!(transcript[0].from, "u1");
        assert_eq!(transcript[0].delivery_state, DeliveryState::Confirmed);
        assert!(!transcript.iter().any(|m| m.id == temp_id));

        let posts = api.posts.lock();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].to, "u42");
        assert_eq!(posts[0].body, "hello");
        assert_eq!(posts[0].temp_id, temp_id);
        assert!(push.emits.lock().is_empty());
        assert!(!engine.is_sending());
    }

    #[tokio::test]
    async fn primary_failure_falls_back_to_push_channel() {
        let api = Arc::new(FakeApi::new());
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api, push.clone());
        engine.open("u42").await;

        let temp_id = match engine.send("hello").await {
            SendOutcome::FellBack { temp_id } => temp_id,
            other => panic!("expected fallback, got {:?}", other),
        };

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].delivery_state, DeliveryState::Pending);
        assert_eq!(transcript[0].temp_id.as_deref(), Some(temp_id.as_str()));

        let emits = push.emits.lock().clone();
        assert_eq!(emits.len(), 1);
        assert_eq!(emits[0].name, SEND_EVENT);
        assert_eq!(
            emits[0].payload,
            serde_json::json!({"senderId": "u1", "receiverId": "u42", "content": "hello", "tempId": temp_id})
        );
        assert!(!engine.is_sending());

        engine.close().await;
        assert_eq!(push.active(), 0);
    }

    #[tokio::test]
    async fn response_without_durable_id_falls_back() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"ok": true})));
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api, push.clone());
        engine.open("u42").await;

        assert!(matches!(engine.send("hello").await, SendOutcome::FellBack { .. }));
        assert_eq!(push.emits.lock().len(), 1);
        assert_eq!(engine.transcript()[0].delivery_state, DeliveryState::Pending);
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_fallback_send_turns_failed() {
        let push = Arc::new(FakePush::new());
        let (engine, mut rx) = engine(Arc::new(FakeApi::new()), push);
        engine.open("u42").await;

        let SendOutcome::FellBack { temp_id } = engine.send("hello").await else {
            panic!("expected fallback");
        };
        assert_eq!(engine.transcript()[0].delivery_state, DeliveryState::Pending);

        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(engine.transcript()[0].delivery_state, DeliveryState::Failed);
        let event = next_matching(&mut rx, |e| matches!(e, EngineEvent::DeliveryFailed { .. })).await;
        assert_eq!(
            event,
            EngineEvent::DeliveryFailed {
                peer: "u42".to_string(),
                temp_id
            }
        );
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn live_echo_before_timeout_prevents_failure() {
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), push.clone());
        engine.open("u42").await;

        let SendOutcome::FellBack { temp_id } = engine.send("hello").await else {
            panic!("expected fallback");
        };
        push.deliver(
            "message_u1",
            serde_json::json!({"_id": "m5", "tempId": temp_id, "senderId": "u1", "receiverId": "u42", "content": "hello"}),
        );
        wait_until(|| !engine.transcript()[0].is_pending()).await;

        tokio::time::sleep(Duration::from_secs(16)).await;

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].id, "m5");
        assert_eq!(transcript[0].delivery_state, DeliveryState::Confirmed);
        engine.close().await;
    }

    #[tokio::test]
    async fn only_one_send_in_flight() {
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), Arc::new(FakePush::new()));
        engine.open("u42").await;

        let first = engine.stage("one").unwrap();
        assert!(engine.is_sending());
        assert!(engine.stage("two").is_none());
        assert_eq!(engine.transcript().len(), 1);

        drop(first);
        assert!(!engine.is_sending());
        assert!(engine.stage("two").is_some());
        engine.close().await;
    }

    #[tokio::test]
    async fn live_message_from_other_peer_is_filtered() {
        let push = Arc::new(FakePush::new());
        let (engine, mut rx) = engine(Arc::new(FakeApi::new()), push.clone());
        engine.open("u42").await;

        push.deliver("message_u1", serde_json::json!({"_id": "m1", "from": "u7", "to": "u1", "body": "psst"}));

        let event = next_matching(&mut rx, |e| matches!(e, EngineEvent::ForeignMessage(_))).await;
        let EngineEvent::ForeignMessage(message) = event else {
            unreachable!()
        };
        assert_eq!(message.from, "u7");
        assert!(engine.transcript().is_empty());
        engine.close().await;
    }

    #[tokio::test]
    async fn live_messages_for_open_peer_are_appended() {
        let push = Arc::new(FakePush::new());
        let (engine, mut rx) = engine(Arc::new(FakeApi::new()), push.clone());
        engine.open("u42").await;

        push.deliver("message_u2", serde_json::json!({"_id": "m0", "from": "u42", "to": "u2", "body": "not ours"}));
        push.deliver("message_u1", serde_json::json!({"_id": "m1", "senderId": "u42", "receiverId": "u1", "content": "hey"}));
        push.deliver("message_u1", serde_json::json!({"_id": "m2", "from": "u1", "to": "u42", "body": "from my phone"}));

        wait_until(|| engine.transcript().len() == 2).await;
        let transcript = engine.transcript();
        assert_eq!(transcript[0].body, "hey");
        assert_eq!(transcript[1].body, "from my phone");

        next_matching(&mut rx, |e| *e == EngineEvent::ScrollToLatest).await;
        engine.close().await;
    }

    #[tokio::test]
    async fn live_echo_of_confirmed_send_is_not_duplicated() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"_id": "m9"})));
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api, push.clone());
        engine.open("u42").await;

        let pending = engine.stage("hello").unwrap();
        let temp_id = pending.temp_id().to_string();
        engine.deliver(pending).await;

        push.deliver(
            "message_u1",
            serde_json::json!({"_id": "m9", "tempId": temp_id, "from": "u1", "to": "u42", "body": "hello"}),
        );
        push.deliver("message_u1", serde_json::json!({"_id": "m10", "from": "u42", "to": "u1", "body": "got it"}));

        wait_until(|| engine.transcript().len() >= 2).await;
        let ids: Vec<String> = engine.transcript().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m9".to_string(), "m10".to_string()]);
        engine.close().await;
    }

    #[tokio::test]
    async fn primary_confirm_after_untagged_echo_is_not_duplicated() {
        let api = Arc::new(FakeApi::replying(serde_json::json!({"_id": "m9"})));
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(api, push.clone());
        engine.open("u42").await;

        let pending = engine.stage("hello").unwrap();
        push.deliver(
            "message_u1",
            serde_json::json!({"_id": "m9", "from": "u1", "to": "u42", "body": "hello"}),
        );
        wait_until(|| engine.transcript().len() == 2).await;

        let outcome = engine.deliver(pending).await;
        assert_eq!(outcome, SendOutcome::Confirmed { id: "m9".to_string() });

        let transcript = engine.transcript();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript[0].id, "m9");
        assert_eq!(transcript[0].delivery_state, DeliveryState::Confirmed);
        engine.close().await;
    }

    #[tokio::test]
    async fn live_messages_are_always_confirmed() {
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), push.clone());
        engine.open("u42").await;

        push.deliver(
            "message_u1",
            serde_json::json!({"_id": "m1", "from": "u42", "to": "u1", "body": "x", "deliveryState": "pending"}),
        );
        wait_until(|| engine.transcript().len() == 1).await;

        assert_eq!(engine.transcript()[0].delivery_state, DeliveryState::Confirmed);
        engine.close().await;
    }

    #[tokio::test]
    async fn close_queued_behind_open_closes_the_new_conversation() {
        let push = Arc::new(FakePush::new());
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), push.clone());
        engine.open("u42").await;
        wait_until(|| push.active() == 1).await;

        tokio::join!(engine.open("u43"), engine.close());

        assert_eq!(engine.current_peer(), None);
        assert!(engine.transcript().is_empty());
        wait_until(|| push.active() == 0).await;

        engine.open("u44").await;
        wait_until(|| push.active() == 1).await;
        assert_eq!(engine.current_peer().as_deref(), Some("u44"));
        engine.close().await;
        assert_eq!(push.active(), 0);
    }

    #[tokio::test]
    async fn open_closed_while_loading_stays_quiet() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let api = Arc::new(FakeApi {
            gate: Some(gate.clone()),
            name: Some("Dana".to_string()),
            ..FakeApi::new()
        });
        let (engine, mut rx) = engine(api, Arc::new(FakePush::new()));

        let opening = tokio::spawn({
            let engine = engine.clone();
            async move { engine.open("u42").await }
        });
        wait_until(|| engine.current_peer().is_some()).await;
        engine.close().await;
        gate.notify_one();
        opening.await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(!events.iter().any(|e| matches!(
            e,
            EngineEvent::ScrollToLatest | EngineEvent::PeerResolved { .. }
        )));
        assert_eq!(engine.current_peer(), None);
    }

    #[tokio::test]
    async fn stage_for_checks_the_open_peer() {
        let (engine, _rx) = engine(Arc::new(FakeApi::new()), Arc::new(FakePush::new()));
        engine.open("u42").await;

        assert!(engine.stage_for("u43", "hello").is_none());
        assert!(engine.transcript().is_empty());

        let pending = engine.stage_for("u42", "hello").unwrap();
        assert_eq!(engine.transcript()[0].to, "u42");
        drop(pending);
        engine.close().await;
    }
}
