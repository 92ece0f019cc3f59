use std::sync::{Arc, Weak};

use chrono::Utc;
use futures::{future::BoxFuture, FutureExt};
use shared::{
    destinations,
    domain::{ConnectionState, MessageId, ThreadId, UserId},
    protocol::{
        CreatePrivateThreadRequest, DirectoryUser, MarkReadRequest, MessagePayload,
        NotificationPayload, SendMessageRequest, ThreadSummary,
    },
};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    api::{AttachmentUpload, MessagingApi},
    config::ClientSettings,
    error::{SendError, TransportError},
    presence::{announcement, PresenceRecord, PresenceTracker},
    reconnect::ReconnectSupervisor,
    store::{ApplyOutcome, ThreadStore, UnreadTotals},
    subscriptions::{InboundEvent, SubscriptionSet},
    transport::{Connection, FailureCallback, Transport},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ConnectionStateChanged(ConnectionState),
    ThreadsUpdated,
    MessagesUpdated { thread_id: ThreadId },
    PresenceChanged { user_id: UserId, online: bool },
    UnreadChanged(UnreadTotals),
    /// A send was rejected or failed; shown to the user.
    SendFailed(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryRoute {
    Live,
    Fallback,
}

#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub thread_id: Option<ThreadId>,
    pub recipient_id: Option<UserId>,
    pub content: Option<String>,
    pub attachment: Option<AttachmentUpload>,
}

impl OutgoingMessage {
    pub fn text(thread_id: ThreadId, content: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn to_recipient(recipient_id: UserId, content: impl Into<String>) -> Self {
        Self {
            recipient_id: Some(recipient_id),
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn with_attachment(mut self, attachment: AttachmentUpload) -> Self {
        self.attachment = Some(attachment);
        self
    }

    fn has_content(&self) -> bool {
        self.content
            .as_deref()
            .is_some_and(|content| !content.trim().is_empty())
    }
}

struct LiveLink {
    connection: Option<Arc<dyn Connection>>,
    epoch: u64,
    subscriptions: SubscriptionSet,
}

/// One authenticated user's messaging session.
///
/// Owns the live connection and the reconnect timer, and funnels every
/// subscription into a single consumer task that applies frames in arrival
/// order. Lock order is `link`, then `supervisor`, then `store`.
pub struct MessagingSession {
    user_id: UserId,
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    api: Arc<dyn MessagingApi>,
    link: Mutex<LiveLink>,
    supervisor: Mutex<ReconnectSupervisor>,
    store: RwLock<ThreadStore>,
    presence: RwLock<PresenceTracker>,
    events: broadcast::Sender<SessionEvent>,
}

impl MessagingSession {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        user_id: UserId,
        settings: ClientSettings,
        transport: Arc<dyn Transport>,
        api: Arc<dyn MessagingApi>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(settings.event_buffer.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            user_id,
            supervisor: Mutex::new(ReconnectSupervisor::new(settings.reconnect_delay())),
            settings,
            transport,
            api,
            link: Mutex::new(LiveLink {
                connection: None,
                epoch: 0,
                subscriptions: SubscriptionSet::new(user_id, inbound_tx),
            }),
            store: RwLock::new(ThreadStore::new(user_id)),
            presence: RwLock::new(PresenceTracker::default()),
            events,
        });
        tokio::spawn(run_inbound(Arc::downgrade(&session), inbound_rx));
        session
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    async fn emit_unread(&self) {
        let totals = self.store.read().await.unread_totals();
        self.emit(SessionEvent::UnreadChanged(totals));
    }

    /// Connects (or arms a retry) and loads the thread list.
    pub async fn start(self: &Arc<Self>) {
        self.connect().await;
        self.load_threads().await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.supervisor.lock().await.state()
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.connection.is_some()
    }

    async fn live_connection(&self) -> Option<Arc<dyn Connection>> {
        self.link.lock().await.connection.clone()
    }

    /// Opens the live connection. Returns false when an attempt is already
    /// under way, the session is connected or shut down, or the attempt
    /// failed; failures arm a retry through the transport's failure callback.
    pub async fn connect(self: &Arc<Self>) -> bool {
        if !self.supervisor.lock().await.begin_connect() {
            return false;
        }
        self.emit(SessionEvent::ConnectionStateChanged(
            ConnectionState::Connecting,
        ));

        let epoch = {
            let mut link = self.link.lock().await;
            link.epoch += 1;
            link.epoch
        };

        let weak = Arc::downgrade(self);
        let on_failure: FailureCallback = Box::new(move |err| {
            if let Some(session) = weak.upgrade() {
                tokio::spawn(session.handle_transport_failure(epoch, err));
            }
        });

        match self.transport.connect(self.user_id, on_failure).await {
            Ok(connection) => self.on_connected(epoch, connection).await,
            Err(err) => {
                warn!(user_id = self.user_id.0, "live connect failed: {err}");
                false
            }
        }
    }

    async fn on_connected(&self, epoch: u64, connection: Arc<dyn Connection>) -> bool {
        {
            let mut link = self.link.lock().await;
            if link.epoch != epoch || self.supervisor.lock().await.is_shut_down() {
                drop(link);
                connection.disconnect().await;
                return false;
            }
            link.connection = Some(Arc::clone(&connection));

            if let Err(err) = link.subscriptions.subscribe_fixed(connection.as_ref()).await {
                warn!("failed to subscribe broadcast channels: {err}");
            }
            let active = self.store.read().await.active_thread();
            if let Err(err) = link
                .subscriptions
                .retarget_thread(Some(connection.as_ref()), active)
                .await
            {
                warn!("failed to subscribe active thread: {err}");
            }
            self.supervisor.lock().await.on_connected();
        }

        self.announce_presence(connection.as_ref(), true).await;
        info!(user_id = self.user_id.0, "messaging session connected");
        self.emit(SessionEvent::ConnectionStateChanged(
            ConnectionState::Connected,
        ));
        true
    }

    fn handle_transport_failure(
        self: Arc<Self>,
        epoch: u64,
        err: TransportError,
    ) -> BoxFuture<'static, ()> {
        async move {
            {
                let mut link = self.link.lock().await;
                if link.epoch != epoch {
                    debug!(epoch, "ignoring failure from a stale connection");
                    return;
                }
                link.epoch += 1;
                link.connection = None;
                link.subscriptions.clear();
            }

            let weak = Arc::downgrade(&self);
            let scheduled = self.supervisor.lock().await.on_failure(move |generation| {
                run_scheduled_retry(weak, generation)
            });
            info!(scheduled, "live connection unavailable: {err}");
            self.emit(SessionEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ));
        }
        .boxed()
    }

    /// Logout: cancels the reconnect timer, announces offline and closes the
    /// connection without arming a retry.
    pub async fn shutdown(&self) {
        self.supervisor.lock().await.shutdown();

        let connection = {
            let mut link = self.link.lock().await;
            link.epoch += 1;
            let connection = link.connection.take();
            match &connection {
                Some(connection) => {
                    link.subscriptions
                        .unsubscribe_all(connection.as_ref())
                        .await
                }
                None => link.subscriptions.clear(),
            }
            connection
        };

        if let Some(connection) = connection {
            self.announce_presence(connection.as_ref(), false).await;
            connection.disconnect().await;
        }
        self.presence.write().await.clear();
        info!(user_id = self.user_id.0, "messaging session shut down");
        self.emit(SessionEvent::ConnectionStateChanged(
            ConnectionState::Disconnected,
        ));
    }

    async fn announce_presence(&self, connection: &dyn Connection, online: bool) {
        let payload = match serde_json::to_value(announcement(self.user_id, online)) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("failed to encode presence: {err}");
                return;
            }
        };
        if let Err(err) = connection
            .publish(destinations::SEND_PRESENCE, payload)
            .await
        {
            debug!(online, "presence announcement not sent: {err}");
        }
    }

    async fn sync_thread_subscription(&self) {
        let mut link = self.link.lock().await;
        let target = self.store.read().await.active_thread();
        let connection = link.connection.clone();
        if let Err(err) = link
            .subscriptions
            .retarget_thread(connection.as_deref(), target)
            .await
        {
            warn!(thread_id = ?target.map(|t| t.0), "failed to switch thread subscription: {err}");
        }
    }

    pub async fn threads(&self) -> Vec<ThreadSummary> {
        self.store.read().await.threads().to_vec()
    }

    pub async fn active_thread(&self) -> Option<ThreadId> {
        self.store.read().await.active_thread()
    }

    pub async fn messages(&self, thread_id: ThreadId) -> Vec<MessagePayload> {
        self.store.read().await.messages(thread_id).to_vec()
    }

    /// Messages of the active thread; what the UI renders.
    pub async fn active_messages(&self) -> Vec<MessagePayload> {
        self.store.read().await.active_messages().to_vec()
    }

    pub async fn unread_totals(&self) -> UnreadTotals {
        self.store.read().await.unread_totals()
    }

    pub async fn presence_of(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.presence.read().await.get(user_id)
    }

    pub async fn online_users(&self) -> Vec<UserId> {
        self.presence.read().await.online_users()
    }

    pub async fn set_active_thread(&self, thread_id: Option<ThreadId>) {
        let changed = self.store.write().await.set_active_thread(thread_id);
        if changed {
            debug!(thread_id = ?thread_id.map(|t| t.0), "active thread changed");
        }
        self.sync_thread_subscription().await;
    }

    /// Activates `thread_id` and loads its messages, marking them read.
    pub async fn open_thread(&self, thread_id: ThreadId) -> Vec<MessagePayload> {
        self.set_active_thread(Some(thread_id)).await;
        self.load_messages(thread_id, true).await
    }

    pub async fn load_threads(&self) -> Vec<ThreadSummary> {
        match self.api.list_threads(self.user_id).await {
            Ok(threads) => {
                let cleared = self.store.write().await.replace_threads(threads.clone());
                if cleared {
                    info!("active thread no longer listed; cleared");
                    self.sync_thread_subscription().await;
                }
                self.emit(SessionEvent::ThreadsUpdated);
                self.emit_unread().await;
                threads
            }
            Err(err) => {
                warn!(user_id = self.user_id.0, "failed to load threads: {err:#}");
                self.threads().await
            }
        }
    }

    pub async fn load_messages(&self, thread_id: ThreadId, mark_read: bool) -> Vec<MessagePayload> {
        let page = match self
            .api
            .list_messages(self.user_id, thread_id, 0, self.settings.message_page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(thread_id = thread_id.0, "failed to load messages: {err:#}");
                return self.messages(thread_id).await;
            }
        };

        let newest = self.store.write().await.replace_messages(thread_id, page);
        self.emit(SessionEvent::MessagesUpdated { thread_id });

        if mark_read {
            if let Some(last_message_id) = newest {
                self.mark_read(thread_id, last_message_id).await;
            }
        }
        self.messages(thread_id).await
    }

    /// Read receipt for everything up to `last_message_id`. Failures are
    /// logged and leave local state untouched.
    pub async fn mark_read(
        &self,
        thread_id: ThreadId,
        last_message_id: MessageId,
    ) -> Vec<MessagePayload> {
        let request = MarkReadRequest {
            user_id: self.user_id,
            last_message_id,
        };
        match self.api.mark_read(thread_id, request).await {
            Ok(updated) => {
                let merged = self
                    .store
                    .write()
                    .await
                    .merge_read(thread_id, updated.clone());
                debug!(thread_id = thread_id.0, merged, "applied read receipts");
                self.emit(SessionEvent::MessagesUpdated { thread_id });
                self.emit_unread().await;
                updated
            }
            Err(err) => {
                warn!(
                    thread_id = thread_id.0,
                    last_message_id = last_message_id.0,
                    "failed to mark thread read: {err:#}"
                );
                Vec::new()
            }
        }
    }

    /// Stores a pushed message unless its id is already held. Returns
    /// whether it was new.
    pub async fn apply_incoming(self: &Arc<Self>, message: MessagePayload) -> bool {
        let thread_id = message.thread_id;
        let message_id = message.id;
        let outcome = self.store.write().await.apply_incoming(message);

        match outcome {
            ApplyOutcome::Duplicate => {
                debug!(
                    thread_id = thread_id.0,
                    message_id = message_id.0,
                    "duplicate delivery ignored"
                );
                false
            }
            ApplyOutcome::Appended { needs_read_receipt } => {
                self.emit(SessionEvent::MessagesUpdated { thread_id });
                self.emit_unread().await;
                if needs_read_receipt {
                    let session = Arc::clone(self);
                    tokio::spawn(async move {
                        session.mark_read(thread_id, message_id).await;
                    });
                }
                true
            }
        }
    }

    async fn handle_inbound(self: &Arc<Self>, event: InboundEvent) {
        match event {
            InboundEvent::General(message) | InboundEvent::Thread(message) => {
                self.apply_incoming(message).await;
            }
            InboundEvent::Presence(update) => {
                let changed = self.presence.write().await.apply(update, Utc::now());
                if changed {
                    self.emit(SessionEvent::PresenceChanged {
                        user_id: update.user_id,
                        online: update.online,
                    });
                }
            }
            InboundEvent::Notification(notification) => {
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    session.handle_notification(notification).await;
                });
            }
        }
    }

    async fn handle_notification(&self, notification: NotificationPayload) {
        debug!(
            thread_id = notification.thread_id.0,
            message_id = notification.message_id.0,
            "notification received"
        );
        self.load_threads().await;
        if self.active_thread().await == Some(notification.thread_id) {
            self.load_messages(notification.thread_id, true).await;
        }
    }

    /// Sends `outgoing`, reporting failures as [`SessionEvent::SendFailed`].
    pub async fn send_message(&self, outgoing: OutgoingMessage) -> bool {
        match self.try_send_message(outgoing).await {
            Ok(route) => {
                debug!(?route, "message handed off");
                true
            }
            Err(err) => {
                warn!(user_id = self.user_id.0, "send failed: {err}");
                self.emit(SessionEvent::SendFailed(err.to_string()));
                false
            }
        }
    }

    /// Publishes over the live connection when possible. Attachments and
    /// sends without a connection go through the REST endpoint, after which
    /// local state is reconciled from the response.
    pub async fn try_send_message(
        &self,
        outgoing: OutgoingMessage,
    ) -> Result<DeliveryRoute, SendError> {
        if self.supervisor.lock().await.is_shut_down() {
            return Err(SendError::ShutDown);
        }
        if let Some(attachment) = &outgoing.attachment {
            if attachment.size() > self.settings.max_attachment_bytes {
                return Err(SendError::AttachmentTooLarge {
                    file_name: attachment.file_name.clone(),
                    size: attachment.size(),
                    limit: self.settings.max_attachment_bytes,
                });
            }
        } else if !outgoing.has_content() {
            return Err(SendError::Empty);
        }

        let request = SendMessageRequest {
            thread_id: outgoing.thread_id,
            sender_id: self.user_id,
            recipient_id: outgoing.recipient_id,
            content: outgoing.content.clone(),
        };

        if outgoing.attachment.is_none() {
            if let Some(connection) = self.live_connection().await {
                let body = serde_json::to_value(&request).map_err(|err| SendError::Request {
                    source: err.into(),
                })?;
                match connection.publish(destinations::SEND_MESSAGE, body).await {
                    Ok(()) => return Ok(DeliveryRoute::Live),
                    Err(err) => warn!("live publish failed, sending over REST: {err}"),
                }
            }
        }

        self.send_via_rest(request, outgoing.attachment).await?;
        Ok(DeliveryRoute::Fallback)
    }

    async fn send_via_rest(
        &self,
        request: SendMessageRequest,
        attachment: Option<AttachmentUpload>,
    ) -> Result<MessagePayload, SendError> {
        let connected = self.is_connected().await;
        let created = self
            .api
            .send_message(request.clone(), attachment)
            .await
            .map_err(|source| SendError::Request { source })?;
        let thread_id = created.thread_id;

        let created_thread = request.thread_id.is_none()
            || self.store.read().await.thread(thread_id).is_none();
        if created_thread || !connected {
            self.load_threads().await;
        }

        let (activated, active) = {
            let mut store = self.store.write().await;
            let activated = store.active_thread().is_none() && store.set_active_thread(Some(thread_id));
            (activated, store.active_thread())
        };
        if activated {
            self.sync_thread_subscription().await;
        }

        self.load_messages(thread_id, active == Some(thread_id)).await;
        Ok(created)
    }

    pub async fn list_users(&self) -> Vec<DirectoryUser> {
        match self.api.list_users().await {
            Ok(users) => users,
            Err(err) => {
                warn!("failed to load user directory: {err:#}");
                Vec::new()
            }
        }
    }

    /// Creates (or fetches) the private thread with `recipient_id` and makes
    /// it the active thread.
    pub async fn open_private_thread(&self, recipient_id: UserId) -> Option<ThreadSummary> {
        let request = CreatePrivateThreadRequest {
            sender_id: self.user_id,
            recipient_id,
        };
        let thread = match self.api.create_private_thread(request).await {
            Ok(thread) => thread,
            Err(err) => {
                warn!(recipient_id = recipient_id.0, "failed to open private thread: {err:#}");
                self.emit(SessionEvent::Error(format!(
                    "could not open a conversation with user {recipient_id}: {err}"
                )));
                return None;
            }
        };

        self.load_threads().await;
        self.open_thread(thread.id).await;
        Some(thread)
    }
}

async fn run_inbound(session: Weak<MessagingSession>, mut inbound: mpsc::UnboundedReceiver<InboundEvent>) {
    while let Some(event) = inbound.recv().await {
        let Some(session) = session.upgrade() else {
            break;
        };
        session.handle_inbound(event).await;
    }
}

async fn run_scheduled_retry(session: Weak<MessagingSession>, generation: u64) {
    let Some(session) = session.upgrade() else {
        return;
    };
    if !session.supervisor.lock().await.claim_retry(generation) {
        return;
    }
    info!(generation, "reconnecting");
    session.connect().await;
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
