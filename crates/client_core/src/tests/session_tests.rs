use super::*;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering},
        Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::domain::ThreadKind;
use tokio::sync::Notify;

use crate::transport::{InboundStream, SubscriptionHandle};

macro_rules! eventually {
    ($cond:expr) => {{
        let mut satisfied = false;
        for _ in 0..200 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(satisfied, "condition not reached: {}", stringify!($cond));
    }};
}

const ME: UserId = UserId(7);
const PEER: UserId = UserId(9);

fn message(id: i64, thread_id: i64, sender: UserId) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        thread_id: ThreadId(thread_id),
        sender_id: sender,
        sender_name: None,
        content: Some(format!("message {id}")),
        attachment: None,
        sent_at: "2024-05-01T10:00:00Z".parse().expect("timestamp"),
        delivered_at: None,
        read_at: None,
    }
}

fn thread(id: i64, kind: ThreadKind, unread_count: u32) -> ThreadSummary {
    ThreadSummary {
        id: ThreadId(id),
        kind,
        subject: None,
        participants: Vec::new(),
        last_message: None,
        unread_count,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Frame {
    Subscribe(String),
    Unsubscribe(String),
    Publish(String, Value),
    Disconnect,
}

#[derive(Default)]
struct MockConnection {
    next_id: AtomicU64,
    routes: StdMutex<HashMap<u64, (String, mpsc::UnboundedSender<Value>)>>,
    frames: StdMutex<Vec<Frame>>,
    fail_publish: AtomicBool,
}

impl MockConnection {
    fn push(&self, destination: &str, body: Value) {
        for (route, sink) in self.routes.lock().unwrap().values() {
            if route == destination {
                let _ = sink.send(body.clone());
            }
        }
    }

    fn active(&self) -> Vec<String> {
        let mut active: Vec<String> = self
            .routes
            .lock()
            .unwrap()
            .values()
            .map(|(destination, _)| destination.clone())
            .collect();
        active.sort();
        active
    }

    fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    fn published(&self, destination: &str) -> Vec<Value> {
        self.frames()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Publish(to, body) if to == destination => Some(body),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn subscribe(
        &self,
        destination: &str,
    ) -> Result<(SubscriptionHandle, InboundStream), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sink, stream) = mpsc::unbounded_channel();
        self.routes
            .lock()
            .unwrap()
            .insert(id, (destination.to_string(), sink));
        self.frames
            .lock()
            .unwrap()
            .push(Frame::Subscribe(destination.to_string()));
        Ok((SubscriptionHandle::new(id), stream))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), TransportError> {
        let removed = self.routes.lock().unwrap().remove(&handle.id());
        if let Some((destination, _)) = removed {
            self.frames
                .lock()
                .unwrap()
                .push(Frame::Unsubscribe(destination));
        }
        Ok(())
    }

    async fn publish(&self, destination: &str, payload: Value) -> Result<(), TransportError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.frames
            .lock()
            .unwrap()
            .push(Frame::Publish(destination.to_string(), payload));
        Ok(())
    }

    async fn disconnect(&self) {
        self.frames.lock().unwrap().push(Frame::Disconnect);
        self.routes.lock().unwrap().clear();
    }
}

#[derive(Default)]
struct MockTransport {
    attempts: AtomicUsize,
    refuse: AtomicBool,
    connections: StdMutex<Vec<Arc<MockConnection>>>,
    on_failure: StdMutex<Option<FailureCallback>>,
}

impl MockTransport {
    fn latest(&self) -> Arc<MockConnection> {
        self.connections
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened")
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn drop_connection(&self) {
        let callback = self.on_failure.lock().unwrap().take();
        self.latest().routes.lock().unwrap().clear();
        callback.expect("no live connection")(TransportError::Dropped("reset by peer".into()));
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _user_id: UserId,
        on_failure: FailureCallback,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            let err = TransportError::Connect("connection refused".into());
            on_failure(err.clone());
            return Err(err);
        }
        let connection = Arc::new(MockConnection::default());
        self.connections
            .lock()
            .unwrap()
            .push(Arc::clone(&connection));
        *self.on_failure.lock().unwrap() = Some(on_failure);
        Ok(connection as Arc<dyn Connection>)
    }
}

#[derive(Default)]
struct MockApi {
    threads: StdMutex<Vec<ThreadSummary>>,
    pages: StdMutex<HashMap<ThreadId, Vec<MessagePayload>>>,
    gates: StdMutex<HashMap<ThreadId, Arc<Notify>>>,
    calls: StdMutex<Vec<String>>,
    read_requests: StdMutex<Vec<(ThreadId, MarkReadRequest)>>,
    sends: StdMutex<Vec<(SendMessageRequest, Option<usize>)>>,
    fail_lists: AtomicBool,
    fail_send: AtomicBool,
    next_message_id: AtomicI64,
}

impl MockApi {
    fn with_threads(threads: Vec<ThreadSummary>) -> Self {
        let api = Self {
            next_message_id: AtomicI64::new(500),
            ..Self::default()
        };
        *api.threads.lock().unwrap() = threads;
        api
    }

    /// Server-side page for `thread_id`, newest first.
    fn set_page(&self, thread_id: i64, newest_first: Vec<MessagePayload>) {
        self.pages
            .lock()
            .unwrap()
            .insert(ThreadId(thread_id), newest_first);
    }

    fn gate(&self, thread_id: i64) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(ThreadId(thread_id), Arc::clone(&gate));
        gate
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn read_requests(&self) -> Vec<(ThreadId, MarkReadRequest)> {
        self.read_requests.lock().unwrap().clone()
    }

    fn sends(&self) -> Vec<(SendMessageRequest, Option<usize>)> {
        self.sends.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl MessagingApi for MockApi {
    async fn list_threads(&self, _user_id: UserId) -> anyhow::Result<Vec<ThreadSummary>> {
        self.record("list_threads".into());
        if self.fail_lists.load(Ordering::SeqCst) {
            anyhow::bail!("threads unavailable");
        }
        Ok(self.threads.lock().unwrap().clone())
    }

    async fn list_messages(
        &self,
        _user_id: UserId,
        thread_id: ThreadId,
        _page: u32,
        _size: u32,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        self.record(format!("list_messages:{thread_id}"));
        let gate = self.gates.lock().unwrap().get(&thread_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.fail_lists.load(Ordering::SeqCst) {
            anyhow::bail!("messages unavailable");
        }
        Ok(self
            .pages
            .lock()
            .unwrap()
            .get(&thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_read(
        &self,
        thread_id: ThreadId,
        request: MarkReadRequest,
    ) -> anyhow::Result<Vec<MessagePayload>> {
        self.record(format!("mark_read:{thread_id}"));
        self.read_requests
            .lock()
            .unwrap()
            .push((thread_id, request));
        let read_at = "2024-05-01T10:05:00Z".parse().expect("timestamp");
        let mut pages = self.pages.lock().unwrap();
        let page = pages.entry(thread_id).or_default();
        let mut updated = Vec::new();
        for message in page.iter_mut() {
            if message.id <= request.last_message_id && message.sender_id != request.user_id {
                message.read_at = Some(read_at);
                updated.push(message.clone());
            }
        }
        for summary in self.threads.lock().unwrap().iter_mut() {
            if summary.id == thread_id {
                summary.unread_count = 0;
            }
        }
        Ok(updated)
    }

    async fn send_message(
        &self,
        request: SendMessageRequest,
        attachment: Option<AttachmentUpload>,
    ) -> anyhow::Result<MessagePayload> {
        self.record("send_message".into());
        if self.fail_send.load(Ordering::SeqCst) {
            anyhow::bail!(shared::error::ApiError::new(
                shared::error::ErrorCode::Internal,
                "storage offline"
            ));
        }
        self.sends
            .lock()
            .unwrap()
            .push((request.clone(), attachment.as_ref().map(AttachmentUpload::size)));

        let thread_id = request.thread_id.map(|t| t.0).unwrap_or(900);
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let mut created = message(id, thread_id, request.sender_id);
        created.content = request.content;

        self.pages
            .lock()
            .unwrap()
            .entry(ThreadId(thread_id))
            .or_default()
            .insert(0, created.clone());
        let mut threads = self.threads.lock().unwrap();
        if !threads.iter().any(|summary| summary.id.0 == thread_id) {
            threads.push(thread(thread_id, ThreadKind::Private, 0));
        }
        Ok(created)
    }

    async fn list_users(&self) -> anyhow::Result<Vec<DirectoryUser>> {
        self.record("list_users".into());
        Ok(vec![DirectoryUser {
            id: PEER,
            display_name: "Dana".into(),
            email: None,
        }])
    }

    async fn create_private_thread(
        &self,
        request: CreatePrivateThreadRequest,
    ) -> anyhow::Result<ThreadSummary> {
        self.record("create_private_thread".into());
        let created = thread(40 + request.recipient_id.0, ThreadKind::Private, 0);
        self.threads.lock().unwrap().push(created.clone());
        Ok(created)
    }
}

fn new_session(
    transport: &Arc<MockTransport>,
    api: &Arc<MockApi>,
) -> Arc<MessagingSession> {
    MessagingSession::new(
        ME,
        ClientSettings::default(),
        Arc::clone(transport) as Arc<dyn Transport>,
        Arc::clone(api) as Arc<dyn MessagingApi>,
    )
}

fn drain(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn ids(messages: &[MessagePayload]) -> Vec<i64> {
    messages.iter().map(|message| message.id.0).collect()
}

fn to_json(message: &MessagePayload) -> Value {
    serde_json::to_value(message).expect("encode message")
}

#[tokio::test]
async fn connect_subscribes_fixed_channels_and_announces_presence() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    let mut events = session.subscribe_events();

    assert!(session.connect().await);

    let connection = transport.latest();
    assert_eq!(
        connection.active(),
        vec![
            "/topic/general".to_string(),
            "/topic/presence".to_string(),
            "/user/7/queue/notifications".to_string(),
        ]
    );
    assert_eq!(
        connection.published("/app/presence"),
        vec![json!({ "userId": 7, "online": true })]
    );
    assert_eq!(session.connection_state().await, ConnectionState::Connected);
    assert!(!session.connect().await);
    assert_eq!(transport.attempts(), 1);
    assert_eq!(
        drain(&mut events),
        vec![
            SessionEvent::ConnectionStateChanged(ConnectionState::Connecting),
            SessionEvent::ConnectionStateChanged(ConnectionState::Connected),
        ]
    );
}

#[tokio::test]
async fn live_send_then_echo_stores_exactly_one_message() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(7, ThreadKind::General, 0)]));
    let session = new_session(&transport, &api);
    session.start().await;
    session.open_thread(ThreadId(7)).await;

    let route = session
        .try_send_message(OutgoingMessage::text(ThreadId(7), "hello"))
        .await
        .expect("send");
    assert_eq!(route, DeliveryRoute::Live);

    let connection = transport.latest();
    assert_eq!(
        connection.published("/app/chat.send"),
        vec![json!({ "threadId": 7, "senderId": 7, "content": "hello" })]
    );
    assert!(api.sends().is_empty());

    // The broker echoes on both the general and the thread channel.
    let echo = to_json(&message(101, 7, ME));
    connection.push("/topic/threads/7", echo.clone());
    connection.push("/topic/general", echo);

    eventually!(session.messages(ThreadId(7)).await.len() == 1);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(ids(&session.active_messages().await), vec![101]);
    assert!(api.read_requests().is_empty());
}

#[tokio::test]
async fn duplicate_foreign_delivery_sends_one_read_receipt() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(7, ThreadKind::General, 0)]));
    let session = new_session(&transport, &api);
    session.start().await;
    session.open_thread(ThreadId(7)).await;

    let incoming = message(102, 7, PEER);
    api.set_page(7, vec![incoming.clone()]);
    let connection = transport.latest();
    connection.push("/topic/general", to_json(&incoming));
    connection.push("/topic/threads/7", to_json(&incoming));

    eventually!(api.read_requests().len() == 1);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let requests = api.read_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0, ThreadId(7));
    assert_eq!(requests[0].1.last_message_id, MessageId(102));
    assert_eq!(ids(&session.messages(ThreadId(7)).await), vec![102]);
    eventually!(session.messages(ThreadId(7)).await[0].read_at.is_some());
}

#[tokio::test]
async fn message_for_background_thread_bumps_unread() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![
        thread(1, ThreadKind::General, 0),
        thread(2, ThreadKind::Private, 1),
    ]));
    let session = new_session(&transport, &api);
    session.start().await;
    session.set_active_thread(Some(ThreadId(1))).await;
    let mut events = session.subscribe_events();

    assert!(session.apply_incoming(message(30, 2, PEER)).await);
    assert!(!session.apply_incoming(message(30, 2, PEER)).await);
    assert!(session.apply_incoming(message(31, 2, ME)).await);

    let totals = session.unread_totals().await;
    assert_eq!(totals.private, 2);
    assert_eq!(totals.total, 2);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::UnreadChanged(t) if t.private == 2)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(api.read_requests().is_empty());
}

#[tokio::test]
async fn load_messages_stores_ascending_without_receipt() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    api.set_page(3, vec![message(3, 3, PEER), message(2, 3, ME), message(1, 3, PEER)]);
    let session = new_session(&transport, &api);
    session.load_threads().await;

    let loaded = session.load_messages(ThreadId(3), false).await;

    assert_eq!(ids(&loaded), vec![1, 2, 3]);
    assert!(api.read_requests().is_empty());
    let threads = session.threads().await;
    assert_eq!(
        threads[0].last_message.as_ref().map(|m| m.id),
        Some(MessageId(3))
    );
}

#[tokio::test]
async fn opening_thread_marks_newest_message_read() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![
        thread(1, ThreadKind::General, 4),
        thread(3, ThreadKind::Private, 2),
    ]));
    api.set_page(3, vec![message(12, 3, PEER), message(11, 3, PEER)]);
    let session = new_session(&transport, &api);
    session.load_threads().await;
    assert_eq!(session.unread_totals().await.total, 6);

    let messages = session.open_thread(ThreadId(3)).await;

    let requests = api.read_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1.last_message_id, MessageId(12));
    assert!(messages.iter().all(|message| message.read_at.is_some()));
    let totals = session.unread_totals().await;
    assert_eq!((totals.general, totals.private, totals.total), (4, 0, 4));
}

#[tokio::test]
async fn late_page_for_previous_thread_does_not_replace_active_view() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![
        thread(1, ThreadKind::Private, 0),
        thread(2, ThreadKind::Private, 0),
    ]));
    api.set_page(1, vec![message(11, 1, PEER), message(10, 1, PEER)]);
    api.set_page(2, vec![message(21, 2, PEER), message(20, 2, PEER)]);
    let gate = api.gate(1);
    let session = new_session(&transport, &api);
    session.load_threads().await;

    let first = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.open_thread(ThreadId(1)).await })
    };
    eventually!(api.calls().contains(&"list_messages:1".to_string()));

    session.open_thread(ThreadId(2)).await;
    assert_eq!(ids(&session.active_messages().await), vec![20, 21]);

    gate.notify_one();
    let late = first.await.expect("join");

    assert_eq!(ids(&late), vec![10, 11]);
    assert_eq!(session.active_thread().await, Some(ThreadId(2)));
    assert_eq!(ids(&session.active_messages().await), vec![20, 21]);
    assert_eq!(ids(&session.messages(ThreadId(1)).await), vec![10, 11]);
}

#[tokio::test(start_paused = true)]
async fn repeated_drop_signals_arm_a_single_retry() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    assert!(session.connect().await);

    transport.drop_connection();
    eventually!(!session.is_connected().await);
    assert_eq!(session.connection_state().await, ConnectionState::Disconnected);

    // A second failure while the retry is armed is absorbed.
    transport.refuse.store(true, Ordering::SeqCst);
    assert!(!session.connect().await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.attempts(), 2);
    transport.refuse.store(false, Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(5)).await;
    eventually!(session.is_connected().await);
    assert_eq!(transport.attempts(), 3);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 3);
    assert_eq!(session.connection_state().await, ConnectionState::Connected);

    let connection = transport.latest();
    assert_eq!(connection.active().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn reconnect_restores_active_thread_subscription() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(5, ThreadKind::Private, 0)]));
    let session = new_session(&transport, &api);
    session.start().await;
    session.set_active_thread(Some(ThreadId(5))).await;

    transport.drop_connection();
    tokio::time::sleep(Duration::from_secs(6)).await;
    eventually!(session.is_connected().await);

    assert!(transport
        .latest()
        .active()
        .contains(&"/topic/threads/5".to_string()));
}

#[tokio::test]
async fn thread_switch_moves_the_thread_subscription() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    session.connect().await;
    let connection = transport.latest();
    let baseline = connection.frames().len();

    session.set_active_thread(Some(ThreadId(1))).await;
    session.set_active_thread(Some(ThreadId(2))).await;
    session.set_active_thread(Some(ThreadId(2))).await;
    session.set_active_thread(None).await;

    assert_eq!(
        connection.frames()[baseline..].to_vec(),
        vec![
            Frame::Subscribe("/topic/threads/1".into()),
            Frame::Unsubscribe("/topic/threads/1".into()),
            Frame::Subscribe("/topic/threads/2".into()),
            Frame::Unsubscribe("/topic/threads/2".into()),
        ]
    );
}

#[tokio::test]
async fn oversized_attachment_fails_without_network_call() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    let session = new_session(&transport, &api);
    session.connect().await;
    let mut events = session.subscribe_events();

    let outgoing = OutgoingMessage::text(ThreadId(3), "report")
        .with_attachment(AttachmentUpload::new("report.bin", vec![0; 6 * 1024 * 1024]));
    assert!(!session.send_message(outgoing).await);

    assert!(api.calls().is_empty());
    assert!(transport.latest().published("/app/chat.send").is_empty());
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::SendFailed(reason) if reason.contains("report.bin"))));
}

#[tokio::test]
async fn attachment_without_connection_uses_rest_and_reconciles() {
    let transport = Arc::new(MockTransport::default());
    transport.refuse.store(true, Ordering::SeqCst);
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    let session = new_session(&transport, &api);
    session.start().await;
    assert!(!session.is_connected().await);

    let outgoing = OutgoingMessage::text(ThreadId(3), "q3 numbers")
        .with_attachment(AttachmentUpload::new("q3.xlsx", vec![1; 4 * 1024 * 1024]));
    assert!(session.send_message(outgoing).await);

    let sends = api.sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].1, Some(4 * 1024 * 1024));
    assert_eq!(
        api.calls().iter().filter(|call| *call == "list_threads").count(),
        2
    );
    assert_eq!(session.active_thread().await, Some(ThreadId(3)));
    assert_eq!(ids(&session.active_messages().await), vec![500]);
}

#[tokio::test]
async fn rest_send_to_new_recipient_refreshes_threads() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    session.connect().await;

    let outgoing = OutgoingMessage::to_recipient(PEER, "hi")
        .with_attachment(AttachmentUpload::new("hi.txt", b"hi".to_vec()));
    assert_eq!(
        session.try_send_message(outgoing).await.expect("send"),
        DeliveryRoute::Fallback
    );

    assert_eq!(
        session.threads().await.iter().map(|t| t.id).collect::<Vec<_>>(),
        vec![ThreadId(900)]
    );
    assert_eq!(session.active_thread().await, Some(ThreadId(900)));
    assert!(transport
        .latest()
        .active()
        .contains(&"/topic/threads/900".to_string()));
}

#[tokio::test]
async fn publish_failure_falls_back_to_rest() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    let session = new_session(&transport, &api);
    session.start().await;
    transport.latest().fail_publish.store(true, Ordering::SeqCst);

    let route = session
        .try_send_message(OutgoingMessage::text(ThreadId(3), "still here"))
        .await
        .expect("send");

    assert_eq!(route, DeliveryRoute::Fallback);
    assert_eq!(api.sends().len(), 1);
    assert_eq!(ids(&session.messages(ThreadId(3)).await), vec![500]);
}

#[tokio::test]
async fn blank_message_is_rejected_locally() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    session.connect().await;

    let result = session
        .try_send_message(OutgoingMessage::text(ThreadId(3), "   "))
        .await;

    assert!(matches!(result, Err(SendError::Empty)));
    assert!(api.calls().is_empty());
    assert!(transport.latest().published("/app/chat.send").is_empty());
}

#[tokio::test]
async fn failed_rest_send_leaves_state_untouched() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    api.set_page(3, vec![message(1, 3, PEER)]);
    let session = new_session(&transport, &api);
    session.load_threads().await;
    session.open_thread(ThreadId(3)).await;
    api.fail_send.store(true, Ordering::SeqCst);
    let calls_before = api.calls().len();
    let mut events = session.subscribe_events();

    assert!(!session.send_message(OutgoingMessage::text(ThreadId(3), "lost")).await);

    assert_eq!(api.calls().len(), calls_before + 1);
    assert_eq!(ids(&session.messages(ThreadId(3)).await), vec![1]);
    assert_eq!(session.threads().await.len(), 1);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, SessionEvent::SendFailed(reason) if reason.contains("storage offline"))));
}

#[tokio::test]
async fn failed_loads_keep_prior_state() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    api.set_page(3, vec![message(2, 3, PEER), message(1, 3, PEER)]);
    let session = new_session(&transport, &api);
    session.load_threads().await;
    session.load_messages(ThreadId(3), false).await;

    api.fail_lists.store(true, Ordering::SeqCst);
    let threads = session.load_threads().await;
    let messages = session.load_messages(ThreadId(3), false).await;

    assert_eq!(threads.len(), 1);
    assert_eq!(ids(&messages), vec![1, 2]);
}

#[tokio::test]
async fn thread_list_without_active_thread_clears_it() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![
        thread(1, ThreadKind::General, 0),
        thread(2, ThreadKind::Private, 0),
    ]));
    let session = new_session(&transport, &api);
    session.connect().await;
    session.load_threads().await;
    session.set_active_thread(Some(ThreadId(2))).await;

    api.threads.lock().unwrap().retain(|summary| summary.id != ThreadId(2));
    session.load_threads().await;

    assert_eq!(session.active_thread().await, None);
    assert!(!transport
        .latest()
        .active()
        .contains(&"/topic/threads/2".to_string()));
}

#[tokio::test]
async fn presence_broadcast_updates_tracker() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    session.connect().await;
    let mut events = session.subscribe_events();

    let connection = transport.latest();
    connection.push("/topic/presence", json!({ "userId": 9, "online": true }));
    connection.push("/topic/presence", json!({ "bogus": true }));

    eventually!(session
        .presence_of(PEER)
        .await
        .is_some_and(|record| record.online));
    assert_eq!(session.online_users().await, vec![PEER]);
    assert!(drain(&mut events).contains(&SessionEvent::PresenceChanged {
        user_id: PEER,
        online: true,
    }));

    connection.push("/topic/presence", json!({ "userId": 9, "online": false }));
    eventually!(session
        .presence_of(PEER)
        .await
        .is_some_and(|record| !record.online));
}

#[tokio::test]
async fn notification_refreshes_threads_and_reloads_active_thread() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(vec![thread(3, ThreadKind::Private, 0)]));
    api.set_page(3, vec![message(1, 3, PEER)]);
    let session = new_session(&transport, &api);
    session.start().await;
    session.open_thread(ThreadId(3)).await;

    api.set_page(3, vec![message(2, 3, PEER), message(1, 3, PEER)]);
    transport.latest().push(
        "/user/7/queue/notifications",
        json!({ "threadId": 3, "messageId": 2 }),
    );

    eventually!(session.messages(ThreadId(3)).await.len() == 2);
    eventually!(api
        .read_requests()
        .iter()
        .any(|(_, request)| request.last_message_id == MessageId(2)));
    assert!(
        api.calls()
            .iter()
            .filter(|call| *call == "list_threads")
            .count()
            >= 2
    );
}

#[tokio::test]
async fn private_thread_is_created_and_activated() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);

    let users = session.list_users().await;
    assert_eq!(users[0].id, PEER);

    let opened = session.open_private_thread(PEER).await.expect("thread");
    assert_eq!(opened.id, ThreadId(49));
    assert_eq!(session.active_thread().await, Some(ThreadId(49)));
    assert_eq!(session.threads().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_announces_offline_and_stops_reconnecting() {
    let transport = Arc::new(MockTransport::default());
    let api = Arc::new(MockApi::with_threads(Vec::new()));
    let session = new_session(&transport, &api);
    session.connect().await;
    let connection = transport.latest();

    session.shutdown().await;

    assert_eq!(
        connection.published("/app/presence"),
        vec![
            json!({ "userId": 7, "online": true }),
            json!({ "userId": 7, "online": false }),
        ]
    );
    assert_eq!(connection.frames().last(), Some(&Frame::Disconnect));
    assert!(connection.active().is_empty());
    assert!(!session.connect().await);
    assert!(matches!(
        session
            .try_send_message(OutgoingMessage::text(ThreadId(1), "bye"))
            .await,
        Err(SendError::ShutDown)
    ));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(transport.attempts(), 1);
}
