//! Channel names used on the live connection.

use crate::domain::{ThreadId, UserId};

pub const GENERAL_TOPIC: &str = "/topic/general";
pub const PRESENCE_TOPIC: &str = "/topic/presence";
pub const SEND_MESSAGE: &str = "/app/chat.send";
pub const SEND_PRESENCE: &str = "/app/presence";

pub fn user_notifications(user_id: UserId) -> String {
    format!("/user/{}/queue/notifications", user_id.0)
}

pub fn thread_topic(thread_id: ThreadId) -> String {
    format!("/topic/threads/{}", thread_id.0)
}
