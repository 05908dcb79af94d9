//! Delivery and visibility: issuing leases, reverting expired ones and the
//! timer-driven sweeper that keeps every queue settled.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::message::{MessageState, ReceiptToken, ReceivedMessage};
use crate::queue::QueueState;
use crate::scheduler::select_batch;
use crate::storage::SqsStorage;

/// What one settling pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub leases_expired: usize,
    pub messages_expired: usize,
    pub dedup_pruned: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.leases_expired += other.leases_expired;
        self.messages_expired += other.messages_expired;
        self.dedup_pruned += other.dedup_pruned;
    }

    /// Whether receivers may now find something they could not before
    pub fn unblocked_receivers(&self) -> bool {
        self.leases_expired > 0 || self.messages_expired > 0
    }
}

/// Make every in-flight message whose lease has run out visible again. The
/// message keeps its place at the head of its group and its lease version,
/// so a delete carrying that lease is still honoured until it is re-leased.
pub fn expire_leases(state: &mut QueueState, now: Instant) -> usize {
    let QueueState {
        messages, groups, ..
    } = state;

    let mut expired = 0;
    for group in groups.values() {
        let Some(message) = group.front().and_then(|head| messages.get_mut(head)) else {
            continue;
        };
        if let MessageState::InFlight { lease_expiry } = message.state {
            if lease_expiry <= now {
                debug!(message_id = %message.id, group = %message.group_id, lease = message.lease, "Lease expired");
                message.state = MessageState::Visible;
                expired += 1;
            }
        }
    }
    expired
}

/// Revert expired leases, drop aged messages and closed dedup windows
pub fn settle(state: &mut QueueState, now: Instant) -> SweepReport {
    SweepReport {
        leases_expired: expire_leases(state, now),
        messages_expired: state.sweep_retention(now),
        dedup_pruned: state.prune_dedup(now),
    }
}

/// Lease up to `max_messages` eligible heads. Each gets a fresh lease
/// version, so receipt tokens from earlier leases go stale.
pub fn lease_batch(
    state: &mut QueueState,
    max_messages: usize,
    now: Instant,
    receive_timestamp: i64,
) -> Vec<ReceivedMessage> {
    let lease_expiry = now + state.config.visibility_timeout();
    let ids = select_batch(state, max_messages);
    let mut leased = Vec::with_capacity(ids.len());

    for id in ids {
        state.next_lease += 1;
        let lease = state.next_lease;
        let Some(message) = state.messages.get_mut(&id) else {
            continue;
        };

        message.state = MessageState::InFlight { lease_expiry };
        message.lease = lease;
        message.receive_count += 1;
        message.first_receive_timestamp.get_or_insert(receive_timestamp);

        leased.push(ReceivedMessage::from_leased(
            message,
            ReceiptToken {
                message_id: id,
                lease,
            },
        ));
    }
    leased
}

/// Earliest moment an in-flight lease runs out
pub fn next_lease_expiry(state: &QueueState) -> Option<Instant> {
    state
        .groups
        .values()
        .filter_map(|group| group.front())
        .filter_map(|head| match state.messages.get(head)?.state {
            MessageState::InFlight { lease_expiry } => Some(lease_expiry),
            MessageState::Visible => None,
        })
        .min()
}

/// Settle every queue on a fixed interval until the returned task is
/// aborted.
pub fn spawn_sweeper(storage: Arc<SqsStorage>, every: Duration) -> JoinHandle<()> {
    info!(interval_ms = every.as_millis(), "Starting queue sweeper");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let report = storage.sweep_all();
            if report != SweepReport::default() {
                debug!(
                    leases_expired = report.leases_expired,
                    messages_expired = report.messages_expired,
                    dedup_pruned = report.dedup_pruned,
                    "Sweep"
                );
            }
        }
    })
}
