use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{domain::UserId, protocol::PresencePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Default, Clone)]
pub struct PresenceTracker {
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    /// Overwrites the record for the broadcasting user. Returns true when the
    /// online flag changed or the user was unknown.
    pub fn apply(&mut self, update: PresencePayload, now: DateTime<Utc>) -> bool {
        let previous = self.records.insert(
            update.user_id,
            PresenceRecord {
                online: update.online,
                last_seen: now,
            },
        );
        previous.map(|record| record.online) != Some(update.online)
    }

    pub fn get(&self, user_id: UserId) -> Option<PresenceRecord> {
        self.records.get(&user_id).copied()
    }

    pub fn is_online(&self, user_id: UserId) -> bool {
        self.get(user_id).is_some_and(|record| record.online)
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .records
            .iter()
            .filter(|(_, record)| record.online)
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort();
        users
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

pub fn announcement(user_id: UserId, online: bool) -> PresencePayload {
    PresencePayload { user_id, online }
}
