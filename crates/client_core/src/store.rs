use std::collections::{HashMap, HashSet};

use shared::{
    domain::{MessageId, ThreadId, ThreadKind, UserId},
    protocol::{MessagePayload, ThreadSummary},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnreadTotals {
    pub general: u32,
    pub private: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Duplicate,
    Appended { needs_read_receipt: bool },
}

/// Local view of threads and their messages.
///
/// Every write is keyed by thread id, never by the active pointer, so a late
/// response for a thread the user already left lands in that thread only.
#[derive(Debug, Clone)]
pub struct ThreadStore {
    local_user: UserId,
    threads: Vec<ThreadSummary>,
    messages: HashMap<ThreadId, Vec<MessagePayload>>,
    active_thread: Option<ThreadId>,
}

impl ThreadStore {
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            threads: Vec::new(),
            messages: HashMap::new(),
            active_thread: None,
        }
    }

    pub fn local_user(&self) -> UserId {
        self.local_user
    }

    pub fn threads(&self) -> &[ThreadSummary] {
        &self.threads
    }

    pub fn thread(&self, thread_id: ThreadId) -> Option<&ThreadSummary> {
        self.threads.iter().find(|thread| thread.id == thread_id)
    }

    pub fn messages(&self, thread_id: ThreadId) -> &[MessagePayload] {
        self.messages
            .get(&thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.active_thread
    }

    pub fn active_messages(&self) -> &[MessagePayload] {
        match self.active_thread {
            Some(thread_id) => self.messages(thread_id),
            None => &[],
        }
    }

    /// Returns whether the active thread changed.
    pub fn set_active_thread(&mut self, thread_id: Option<ThreadId>) -> bool {
        if self.active_thread == thread_id {
            return false;
        }
        self.active_thread = thread_id;
        true
    }

    /// Replaces the thread list. Returns true if the active thread vanished
    /// from the new list and was cleared.
    pub fn replace_threads(&mut self, threads: Vec<ThreadSummary>) -> bool {
        self.threads = threads;
        match self.active_thread {
            Some(active) if self.thread(active).is_none() => {
                self.active_thread = None;
                true
            }
            _ => false,
        }
    }

    /// Stores a newest-first page in ascending order, replacing what was held
    /// for the thread. Returns the id of the newest message.
    pub fn replace_messages(
        &mut self,
        thread_id: ThreadId,
        newest_first: Vec<MessagePayload>,
    ) -> Option<MessageId> {
        let mut seen = HashSet::new();
        let ascending: Vec<MessagePayload> = newest_first
            .into_iter()
            .rev()
            .filter(|message| seen.insert(message.id))
            .collect();

        let newest = ascending.last().cloned();
        self.messages.insert(thread_id, ascending);

        if let Some(newest) = &newest {
            if let Some(thread) = self.thread_mut(thread_id) {
                thread.last_message = Some(newest.clone());
            }
        }
        newest.map(|message| message.id)
    }

    /// Appends `message` unless its id is already held for its thread.
    pub fn apply_incoming(&mut self, message: MessagePayload) -> ApplyOutcome {
        let thread_id = message.thread_id;
        let list = self.messages.entry(thread_id).or_default();
        if list.iter().any(|existing| existing.id == message.id) {
            return ApplyOutcome::Duplicate;
        }

        let own = message.sender_id == self.local_user;
        let active = self.active_thread == Some(thread_id);
        list.push(message.clone());

        if let Some(thread) = self.thread_mut(thread_id) {
            thread.last_message = Some(message);
            if !active && !own {
                thread.unread_count = thread.unread_count.saturating_add(1);
            }
        }

        ApplyOutcome::Appended {
            needs_read_receipt: active && !own,
        }
    }

    /// Merges server copies carrying read timestamps and zeroes the thread's
    /// unread counter. Returns how many held messages were replaced.
    pub fn merge_read(&mut self, thread_id: ThreadId, updated: Vec<MessagePayload>) -> usize {
        let mut merged = 0;
        for message in updated {
            let Some(list) = self.messages.get_mut(&message.thread_id) else {
                continue;
            };
            if let Some(slot) = list.iter_mut().find(|existing| existing.id == message.id) {
                *slot = message;
                merged += 1;
            }
        }

        if let Some(thread) = self.thread_mut(thread_id) {
            thread.unread_count = 0;
        }
        merged
    }

    pub fn unread_totals(&self) -> UnreadTotals {
        let (general, private) =
            self.threads
                .iter()
                .fold((0u32, 0u32), |(general, private), thread| match thread.kind {
                    ThreadKind::General => (general.saturating_add(thread.unread_count), private),
                    ThreadKind::Private => (general, private.saturating_add(thread.unread_count)),
                });
        UnreadTotals {
            general,
            private,
            total: general.saturating_add(private),
        }
    }

    fn thread_mut(&mut self, thread_id: ThreadId) -> Option<&mut ThreadSummary> {
        self.threads.iter_mut().find(|thread| thread.id == thread_id)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
