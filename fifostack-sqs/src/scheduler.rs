//! Group scheduler: decides which message, if any, each group may deliver
//! next and which groups a batch receive serves.

use uuid::Uuid;

use crate::queue::QueueState;

/// Head of `group_id` if it is visible. Only a group's head is ever leased,
/// so an in-flight head means the whole group is blocked until it is
/// deleted or its lease expires.
pub fn next_eligible(state: &QueueState, group_id: &str) -> Option<Uuid> {
    let head = *state.groups.get(group_id)?.front()?;
    state
        .messages
        .get(&head)
        .filter(|message| message.is_visible())
        .map(|_| head)
}

/// Up to `max_messages` eligible heads, at most one per group, oldest head
/// first regardless of group id.
pub fn select_batch(state: &QueueState, max_messages: usize) -> Vec<Uuid> {
    let mut heads: Vec<(u64, Uuid)> = state
        .groups
        .keys()
        .filter_map(|group_id| next_eligible(state, group_id))
        .filter_map(|id| state.messages.get(&id).map(|m| (m.sequence_number, id)))
        .collect();

    heads.sort_unstable_by_key(|(sequence, _)| *sequence);
    heads.truncate(max_messages);
    heads.into_iter().map(|(_, id)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageState, SendRequest};
    use crate::queue::QueueConfig;
    use std::time::Duration;
    use tokio::time::Instant;

    fn send(state: &mut QueueState, group: &str, body: &'static str) -> Uuid {
        state
            .enqueue(SendRequest::new(group, body), Instant::now(), 0)
            .unwrap()
            .message_id
    }

    fn lease(state: &mut QueueState, id: Uuid) {
        state.messages.get_mut(&id).unwrap().state = MessageState::InFlight {
            lease_expiry: Instant::now() + Duration::from_secs(30),
        };
    }

    #[test]
    fn test_next_eligible_is_group_head() {
        let mut state = QueueState::new(QueueConfig::default());
        let m1 = send(&mut state, "g", "m1");
        send(&mut state, "g", "m2");

        assert_eq!(next_eligible(&state, "g"), Some(m1));
        assert_eq!(next_eligible(&state, "missing"), None);
    }

    #[test]
    fn test_in_flight_head_blocks_group() {
        let mut state = QueueState::new(QueueConfig::default());
        let m1 = send(&mut state, "g", "m1");
        send(&mut state, "g", "m2");
        lease(&mut state, m1);

        assert_eq!(next_eligible(&state, "g"), None);
        assert!(select_batch(&state, 10).is_empty());
    }

    #[test]
    fn test_batch_serves_oldest_heads_first() {
        let mut state = QueueState::new(QueueConfig::default());
        let b1 = send(&mut state, "b", "b1");
        let a1 = send(&mut state, "a", "a1");
        send(&mut state, "b", "b2");
        let c1 = send(&mut state, "c", "c1");

        assert_eq!(select_batch(&state, 10), vec![b1, a1, c1]);
        assert_eq!(select_batch(&state, 2), vec![b1, a1]);
    }

    #[test]
    fn test_batch_skips_blocked_groups() {
        let mut state = QueueState::new(QueueConfig::default());
        let a1 = send(&mut state, "a", "a1");
        send(&mut state, "a", "a2");
        let b1 = send(&mut state, "b", "b1");
        lease(&mut state, a1);

        assert_eq!(select_batch(&state, 10), vec![b1]);
    }
}
