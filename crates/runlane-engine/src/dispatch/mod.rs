// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concurrency-limited dispatch queue.
//!
//! Messages are keyed by run id and grouped by environment and queue. A dequeue
//! leases messages to one consumer inside a single transaction and only admits a
//! message when
//!
//! - the environment has fewer leased messages than its limit,
//! - the queue has fewer leased messages than its limit,
//! - no other message with the same concurrency key (within the queue) is leased,
//! - the batch has room left.
//!
//! Slots are counted from leased rows, so a lease that is never acknowledged
//! keeps its slot until it is reclaimed.
//!
//! ```text
//!   enqueue ──► queued ──dequeue──► leased ──acknowledge──► (deleted)
//!                  ▲                  │
//!                  └──release/reclaim─┘
//! ```

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresDispatchQueue;
pub use self::sqlite::SqliteDispatchQueue;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Order in which admissible messages are considered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DequeueStrategy {
    /// Longest-waiting message first, regardless of queue.
    #[default]
    OldestFirst,
    /// Interleave queues, ordering queues by their longest-waiting message.
    QueueRoundRobin,
}

impl fmt::Display for DequeueStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OldestFirst => f.write_str("oldest_first"),
            Self::QueueRoundRobin => f.write_str("queue_round_robin"),
        }
    }
}

impl FromStr for DequeueStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "oldest_first" => Ok(Self::OldestFirst),
            "queue_round_robin" => Ok(Self::QueueRoundRobin),
            other => Err(format!("unknown dequeue strategy '{other}'")),
        }
    }
}

/// Dispatch message record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DispatchMessage {
    pub run_id: String,
    pub environment_id: String,
    pub queue_name: String,
    pub worker_queue: String,
    pub concurrency_key: Option<String>,
    pub payload: Vec<u8>,
    /// `queued` or `leased`.
    pub status: String,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub delivery_count: i32,
}

impl DispatchMessage {
    pub fn is_leased(&self) -> bool {
        self.status == "leased"
    }
}

/// Message to enqueue. Enqueueing an existing run id replaces its message.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub run_id: String,
    pub environment_id: String,
    pub queue_name: String,
    pub worker_queue: String,
    pub concurrency_key: Option<String>,
    pub payload: Vec<u8>,
    pub available_at: DateTime<Utc>,
}

/// Parameters of one dequeue call.
#[derive(Debug, Clone)]
pub struct DequeueRequest {
    pub consumer_id: String,
    pub worker_queue: String,
    pub max_messages: usize,
    pub lease_ttl: Duration,
    pub strategy: DequeueStrategy,
    pub now: DateTime<Utc>,
}

/// Upper bound on messages leased by a single dequeue call.
pub const MAX_DEQUEUE_BATCH: usize = 1000;

impl DequeueRequest {
    /// Candidate rows read per page. Candidates are prefiltered against saturated
    /// queues, saturated environments and busy concurrency keys, and pages are read
    /// until the batch fills or candidates run out.
    pub(crate) fn page_size(&self) -> i64 {
        let batch = self.max_messages.min(MAX_DEQUEUE_BATCH);
        i64::try_from(batch.saturating_mul(4).max(200)).unwrap_or(i64::MAX)
    }

    pub(crate) fn lease_expires_at(&self) -> DateTime<Utc> {
        self.now
            + chrono::Duration::from_std(self.lease_ttl)
                .unwrap_or_else(|_| chrono::Duration::seconds(0))
    }
}

/// Durable store behind the dispatch queue.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Insert or replace the message for a run; it becomes `queued`.
    async fn enqueue(&self, request: &EnqueueRequest) -> Result<()>;

    /// Lease admissible messages of a worker queue. Never blocks; may return empty.
    async fn dequeue(&self, request: &DequeueRequest) -> Result<Vec<DispatchMessage>>;

    async fn get_message(&self, run_id: &str) -> Result<Option<DispatchMessage>>;

    /// Push out the expiry of a leased message.
    async fn extend_lease(&self, run_id: &str, lease_expires_at: DateTime<Utc>) -> Result<bool>;

    /// Delete a leased message, freeing its slot.
    async fn acknowledge(&self, run_id: &str) -> Result<bool>;

    /// Return a message to `queued`, clearing its lease.
    async fn release(&self, run_id: &str, available_at: DateTime<Utc>) -> Result<bool>;

    /// Leased messages whose lease expired at or before `now`.
    async fn list_expired_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<DispatchMessage>>;

    /// Delete the message in whatever state it is.
    async fn remove(&self, run_id: &str) -> Result<bool>;

    async fn set_queue_limit(&self, environment_id: &str, queue_name: &str, limit: i64)
    -> Result<()>;

    async fn remove_queue_limit(&self, environment_id: &str, queue_name: &str) -> Result<bool>;

    /// Set (or with `None`, remove) the environment-wide limit.
    async fn set_env_limit(&self, environment_id: &str, limit: Option<i64>) -> Result<()>;

    /// Leased messages of an environment, optionally restricted to one queue.
    async fn count_leased(&self, environment_id: &str, queue_name: Option<&str>) -> Result<i64>;
}

/// Limits and in-flight counts observed inside a dequeue transaction.
#[derive(Debug, Default, Clone)]
pub struct SlotState {
    pub env_limits: HashMap<String, i64>,
    pub queue_limits: HashMap<(String, String), i64>,
    pub env_in_flight: HashMap<String, i64>,
    pub queue_in_flight: HashMap<(String, String), i64>,
    /// (environment, queue, concurrency key) triples with a leased message.
    pub busy_keys: HashSet<(String, String, String)>,
}

impl SlotState {
    fn admit(&mut self, message: &DispatchMessage) -> bool {
        let env = &message.environment_id;
        let queue_key = (env.clone(), message.queue_name.clone());

        let env_used = self.env_in_flight.get(env).copied().unwrap_or(0);
        if let Some(limit) = self.env_limits.get(env)
            && env_used >= *limit
        {
            return false;
        }

        let queue_used = self.queue_in_flight.get(&queue_key).copied().unwrap_or(0);
        if let Some(limit) = self.queue_limits.get(&queue_key)
            && queue_used >= *limit
        {
            return false;
        }

        if let Some(key) = &message.concurrency_key {
            let busy = (env.clone(), message.queue_name.clone(), key.clone());
            if !self.busy_keys.insert(busy) {
                return false;
            }
        }

        *self.env_in_flight.entry(env.clone()).or_insert(0) += 1;
        *self.queue_in_flight.entry(queue_key).or_insert(0) += 1;
        true
    }
}

fn order_candidates(candidates: &[DispatchMessage], strategy: DequeueStrategy) -> Vec<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|a, b| {
        let (a, b) = (&candidates[*a], &candidates[*b]);
        a.enqueued_at
            .cmp(&b.enqueued_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });

    match strategy {
        DequeueStrategy::OldestFirst => order,
        DequeueStrategy::QueueRoundRobin => {
            // Groups appear in order of their oldest message.
            let mut groups: Vec<((&str, &str), Vec<usize>)> = Vec::new();
            for idx in order {
                let message = &candidates[idx];
                let key = (message.environment_id.as_str(), message.queue_name.as_str());
                match groups.iter_mut().find(|(k, _)| *k == key) {
                    Some((_, members)) => members.push(idx),
                    None => groups.push((key, vec![idx])),
                }
            }

            let mut interleaved = Vec::with_capacity(candidates.len());
            let mut round = 0;
            loop {
                let before = interleaved.len();
                for (_, members) in &groups {
                    if let Some(idx) = members.get(round) {
                        interleaved.push(*idx);
                    }
                }
                if interleaved.len() == before {
                    break;
                }
                round += 1;
            }
            interleaved
        }
    }
}

/// Pick which candidates to lease, in lease order.
///
/// Returns indices into `candidates`. `slots` is updated with the admitted
/// messages so that it reflects the state after the lease.
pub fn select_admissible(
    candidates: &[DispatchMessage],
    slots: &mut SlotState,
    max_messages: usize,
    strategy: DequeueStrategy,
) -> Vec<usize> {
    let mut admitted = Vec::new();
    for idx in order_candidates(candidates, strategy) {
        if admitted.len() >= max_messages {
            break;
        }
        if slots.admit(&candidates[idx]) {
            admitted.push(idx);
        }
    }
    admitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn message(run_id: &str, queue: &str, age_secs: i64, key: Option<&str>) -> DispatchMessage {
        let at = Utc::now() - ChronoDuration::seconds(age_secs);
        DispatchMessage {
            run_id: run_id.to_string(),
            environment_id: "env-1".to_string(),
            queue_name: queue.to_string(),
            worker_queue: "env-1".to_string(),
            concurrency_key: key.map(str::to_string),
            payload: Vec::new(),
            status: "queued".to_string(),
            enqueued_at: at,
            available_at: at,
            lease_owner: None,
            lease_expires_at: None,
            delivery_count: 0,
        }
    }

    fn ids(candidates: &[DispatchMessage], picked: &[usize]) -> Vec<String> {
        picked.iter().map(|i| candidates[*i].run_id.clone()).collect()
    }

    #[test]
    fn test_oldest_first_without_limits() {
        let candidates = vec![
            message("b", "q1", 10, None),
            message("a", "q1", 30, None),
            message("c", "q2", 20, None),
        ];
        let mut slots = SlotState::default();
        let picked = select_admissible(&candidates, &mut slots, 10, DequeueStrategy::OldestFirst);
        assert_eq!(ids(&candidates, &picked), vec!["a", "c", "b"]);
    }

    #[test]
    fn test_batch_size_caps_result() {
        let candidates: Vec<_> = (0..5)
            .map(|i| message(&format!("r{i}"), "q1", 100 - i, None))
            .collect();
        let mut slots = SlotState::default();
        let picked = select_admissible(&candidates, &mut slots, 2, DequeueStrategy::OldestFirst);
        assert_eq!(ids(&candidates, &picked), vec!["r0", "r1"]);
    }

    #[test]
    fn test_queue_limit_counts_in_flight() {
        let candidates = vec![
            message("a", "q1", 30, None),
            message("b", "q1", 20, None),
            message("c", "q2", 10, None),
        ];
        let mut slots = SlotState::default();
        slots
            .queue_limits
            .insert(("env-1".to_string(), "q1".to_string()), 2);
        slots
            .queue_in_flight
            .insert(("env-1".to_string(), "q1".to_string()), 1);

        let picked = select_admissible(&candidates, &mut slots, 10, DequeueStrategy::OldestFirst);
        assert_eq!(ids(&candidates, &picked), vec!["a", "c"]);
        assert_eq!(
            slots.queue_in_flight[&("env-1".to_string(), "q1".to_string())],
            2
        );
    }

    #[test]
    fn test_env_limit_applies_across_queues() {
        let candidates = vec![
            message("a", "q1", 30, None),
            message("b", "q2", 20, None),
            message("c", "q3", 10, None),
        ];
        let mut slots = SlotState::default();
        slots.env_limits.insert("env-1".to_string(), 2);

        let picked = select_admissible(&candidates, &mut slots, 10, DequeueStrategy::OldestFirst);
        assert_eq!(ids(&candidates, &picked), vec!["a", "b"]);
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let candidates = vec![message("a", "q1", 30, None)];
        let mut slots = SlotState::default();
        slots
            .queue_limits
            .insert(("env-1".to_string(), "q1".to_string()), 0);

        assert!(select_admissible(&candidates, &mut slots, 10, DequeueStrategy::OldestFirst).is_empty());
    }

    #[test]
    fn test_concurrency_key_is_exclusive() {
        let candidates = vec![
            message("a", "q1", 30, Some("user-1")),
            message("b", "q1", 20, Some("user-1")),
            message("c", "q1", 10, Some("user-2")),
            message("d", "q2", 5, Some("user-1")),
        ];
        let mut slots = SlotState::default();
        slots.busy_keys.insert((
            "env-1".to_string(),
            "q1".to_string(),
            "user-2".to_string(),
        ));

        let picked = select_admissible(&candidates, &mut slots, 10, DequeueStrategy::OldestFirst);
        // Keys are scoped per queue, so q2's user-1 is independent.
        assert_eq!(ids(&candidates, &picked), vec!["a", "d"]);
    }

    #[test]
    fn test_round_robin_interleaves_queues() {
        let candidates = vec![
            message("a1", "qa", 60, None),
            message("a2", "qa", 50, None),
            message("a3", "qa", 40, None),
            message("b1", "qb", 30, None),
            message("b2", "qb", 20, None),
        ];
        let mut slots = SlotState::default();

        let picked =
            select_admissible(&candidates, &mut slots, 4, DequeueStrategy::QueueRoundRobin);
        assert_eq!(ids(&candidates, &picked), vec!["a1", "b1", "a2", "b2"]);

        let mut slots = SlotState::default();
        let picked = select_admissible(&candidates, &mut slots, 4, DequeueStrategy::OldestFirst);
        assert_eq!(ids(&candidates, &picked), vec!["a1", "a2", "a3", "b1"]);
    }

    #[test]
    fn test_strategy_parse_and_display() {
        for strategy in [DequeueStrategy::OldestFirst, DequeueStrategy::QueueRoundRobin] {
            let parsed: DequeueStrategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
        assert!("fifo".parse::<DequeueStrategy>().is_err());
    }

    #[test]
    fn test_page_size_is_bounded_for_any_batch_hint() {
        let mut request = DequeueRequest {
            consumer_id: "w".to_string(),
            worker_queue: "env-1".to_string(),
            max_messages: 1,
            lease_ttl: Duration::from_secs(30),
            strategy: DequeueStrategy::OldestFirst,
            now: Utc::now(),
        };
        assert_eq!(request.page_size(), 200);

        request.max_messages = usize::MAX;
        assert_eq!(request.page_size(), (MAX_DEQUEUE_BATCH * 4) as i64);
    }
}
