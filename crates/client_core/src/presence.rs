//! Typing presence with TTL expiry. A single min-heap of deadlines
//! backs every (conversation, user) entry, so there is one scheduled
//! expiry primitive instead of a timer per signal. Expiry is purely
//! local; no server round-trip refreshes or clears an entry.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Duration,
};

use shared::domain::{ConversationId, UserId};
use tokio::time::Instant;

/// A typing signal that is not refreshed within this window expires.
pub const TYPING_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct PresenceTracker {
    /// Authoritative expiry per (conversation, user).
    active: HashMap<ConversationId, HashMap<UserId, Instant>>,
    /// Min-heap of scheduled deadlines. Entries go stale when a signal
    /// is refreshed or withdrawn; stale entries are skipped against
    /// the authoritative map when popped.
    deadlines: BinaryHeap<Reverse<(Instant, ConversationId, UserId)>>,
}

impl PresenceTracker {
    /// Returns true when the conversation's typing set changed.
    pub fn handle_typing(
        &mut self,
        conversation_id: ConversationId,
        user_id: UserId,
        is_typing: bool,
        now: Instant,
    ) -> bool {
        if is_typing {
            let expires_at = now + TYPING_TTL;
            let users = self.active.entry(conversation_id.clone()).or_default();
            let was_absent = users.insert(user_id.clone(), expires_at).is_none();
            self.deadlines
                .push(Reverse((expires_at, conversation_id, user_id)));
            was_absent
        } else {
            self.remove(&conversation_id, &user_id)
        }
    }

    /// Drops every entry whose deadline has passed. Returns the
    /// conversations whose typing set changed. Removal of one user
    /// never affects others typing in the same conversation.
    pub fn expire_due(&mut self, now: Instant) -> Vec<ConversationId> {
        let mut changed = Vec::new();
        while let Some(Reverse((deadline, _, _))) = self.deadlines.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, conversation_id, user_id))) = self.deadlines.pop() else {
                break;
            };
            // Skip if the signal was refreshed after this deadline was
            // scheduled, or already withdrawn.
            let is_current = self
                .active
                .get(&conversation_id)
                .and_then(|users| users.get(&user_id))
                == Some(&deadline);
            if is_current
                && self.remove(&conversation_id, &user_id)
                && !changed.contains(&conversation_id)
            {
                changed.push(conversation_id);
            }
        }
        changed
    }

    /// Earliest live deadline, for the engine's expiry task. Prunes
    /// stale heap entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, conversation_id, user_id))) = self.deadlines.peek() {
            let current = self
                .active
                .get(conversation_id)
                .and_then(|users| users.get(user_id));
            if current == Some(deadline) {
                return Some(*deadline);
            }
            self.deadlines.pop();
        }
        None
    }

    pub fn typing_users(&self, conversation_id: &ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .active
            .get(conversation_id)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    pub fn is_anyone_typing(&self, conversation_id: &ConversationId) -> bool {
        self.active
            .get(conversation_id)
            .is_some_and(|users| !users.is_empty())
    }

    fn remove(&mut self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        let Some(users) = self.active.get_mut(conversation_id) else {
            return false;
        };
        let removed = users.remove(user_id).is_some();
        if users.is_empty() {
            self.active.remove(conversation_id);
        }
        removed
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
