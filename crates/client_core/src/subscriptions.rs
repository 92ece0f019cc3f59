use serde_json::Value;
use shared::{
    destinations,
    domain::{ThreadId, UserId},
    protocol::{MessagePayload, NotificationPayload, PresencePayload},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::TransportError,
    transport::{Connection, InboundStream, SubscriptionHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    General,
    Presence,
    Notifications,
    Thread(ThreadId),
}

impl ChannelKind {
    pub fn destination(&self, user_id: UserId) -> String {
        match self {
            ChannelKind::General => destinations::GENERAL_TOPIC.to_string(),
            ChannelKind::Presence => destinations::PRESENCE_TOPIC.to_string(),
            ChannelKind::Notifications => destinations::user_notifications(user_id),
            ChannelKind::Thread(thread_id) => destinations::thread_topic(*thread_id),
        }
    }

    fn decode(&self, body: Value) -> serde_json::Result<InboundEvent> {
        Ok(match self {
            ChannelKind::General => InboundEvent::General(serde_json::from_value(body)?),
            ChannelKind::Presence => InboundEvent::Presence(serde_json::from_value(body)?),
            ChannelKind::Notifications => {
                InboundEvent::Notification(serde_json::from_value(body)?)
            }
            ChannelKind::Thread(_) => InboundEvent::Thread(serde_json::from_value(body)?),
        })
    }
}

/// Decoded frame from one of the session's channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    General(MessagePayload),
    Thread(MessagePayload),
    Presence(PresencePayload),
    Notification(NotificationPayload),
}

const FIXED_CHANNELS: [ChannelKind; 3] = [
    ChannelKind::General,
    ChannelKind::Presence,
    ChannelKind::Notifications,
];

/// Subscription handles for one live connection. Each subscription gets a
/// forwarding task that decodes its frames and pushes them into the shared
/// `sink`, which has a single consumer.
pub struct SubscriptionSet {
    user_id: UserId,
    sink: mpsc::UnboundedSender<InboundEvent>,
    fixed: Vec<(ChannelKind, SubscriptionHandle)>,
    thread: Option<(ThreadId, SubscriptionHandle)>,
}

impl SubscriptionSet {
    pub fn new(user_id: UserId, sink: mpsc::UnboundedSender<InboundEvent>) -> Self {
        Self {
            user_id,
            sink,
            fixed: Vec::new(),
            thread: None,
        }
    }

    pub fn thread_target(&self) -> Option<ThreadId> {
        self.thread.map(|(thread_id, _)| thread_id)
    }

    pub fn is_subscribed(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Thread(thread_id) => self.thread_target() == Some(thread_id),
            other => self.fixed.iter().any(|(k, _)| *k == other),
        }
    }

    /// General, presence and per-user notification channels.
    pub async fn subscribe_fixed(&mut self, connection: &dyn Connection) -> Result<(), TransportError> {
        for kind in FIXED_CHANNELS {
            if self.is_subscribed(kind) {
                continue;
            }
            let handle = self.open(connection, kind).await?;
            self.fixed.push((kind, handle));
        }
        Ok(())
    }

    /// Points the per-thread subscription at `target`. The previous thread
    /// subscription is released first. Returns false when nothing changed.
    pub async fn retarget_thread(
        &mut self,
        connection: Option<&dyn Connection>,
        target: Option<ThreadId>,
    ) -> Result<bool, TransportError> {
        if self.thread_target() == target {
            return Ok(false);
        }

        if let Some((previous, handle)) = self.thread.take() {
            if let Some(connection) = connection {
                if let Err(err) = connection.unsubscribe(handle).await {
                    debug!(thread_id = previous.0, "thread unsubscribe failed: {err}");
                }
            }
        }

        if let (Some(thread_id), Some(connection)) = (target, connection) {
            let handle = self.open(connection, ChannelKind::Thread(thread_id)).await?;
            self.thread = Some((thread_id, handle));
        }
        Ok(true)
    }

    pub async fn unsubscribe_all(&mut self, connection: &dyn Connection) {
        let handles = self
            .fixed
            .drain(..)
            .map(|(_, handle)| handle)
            .chain(self.thread.take().map(|(_, handle)| handle));
        for handle in handles.collect::<Vec<_>>() {
            let _ = connection.unsubscribe(handle).await;
        }
    }

    /// Forgets every handle without talking to the broker; used once the
    /// connection they belonged to is gone.
    pub fn clear(&mut self) {
        self.fixed.clear();
        self.thread = None;
    }

    async fn open(
        &self,
        connection: &dyn Connection,
        kind: ChannelKind,
    ) -> Result<SubscriptionHandle, TransportError> {
        let (handle, stream) = connection.subscribe(&kind.destination(self.user_id)).await?;
        tokio::spawn(forward_channel(kind, stream, self.sink.clone()));
        Ok(handle)
    }
}

async fn forward_channel(
    kind: ChannelKind,
    mut stream: InboundStream,
    sink: mpsc::UnboundedSender<InboundEvent>,
) {
    while let Some(body) = stream.recv().await {
        match kind.decode(body) {
            Ok(event) => {
                if sink.send(event).is_err() {
                    break;
                }
            }
            Err(err) => debug!(?kind, "dropping malformed frame: {err}"),
        }
    }
}
