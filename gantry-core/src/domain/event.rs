//! Event domain types
//!
//! An event is a queued request to execute one pipeline run. The queue-state
//! fields (`queue_status`, `in_time`, `out_time`, `retry`) belong to the event
//! store; the embedded record belongs to the worker holding the lease.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::pipeline::{Pipeline, Project};
use super::record::PipelineRecord;

/// Time after which a claimed but unresolved event can be claimed again
pub const LEASE_WINDOW_SECS: i64 = 3 * 60;

/// Retry count after which the backoff delay stops growing
pub const RETRY_THRESHOLD: u32 = 10;

/// One retry unit, in seconds
pub const RETRY_UNIT_SECS: i64 = 60;

pub fn lease_window() -> Duration {
    Duration::seconds(LEASE_WINDOW_SECS)
}

/// Queue state of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting to be claimed
    InQueue,
    /// Claimed by a worker, leased until `out_time + LEASE_WINDOW`
    OutQueue,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::InQueue => "in",
            QueueStatus::OutQueue => "out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(QueueStatus::InQueue),
            "out" => Some(QueueStatus::OutQueue),
            _ => None,
        }
    }
}

/// Retry bookkeeping of a re-enqueued event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    pub retry_count: u32,
    pub next_eligible_at: DateTime<Utc>,
}

impl RetryBackoff {
    /// Delay applied after the given retry, capped at `RETRY_THRESHOLD` units
    pub fn delay_for(retry_count: u32) -> Duration {
        let units = retry_count.min(RETRY_THRESHOLD) as i64;
        Duration::seconds(units * RETRY_UNIT_SECS)
    }

    /// Computes the backoff for the next attempt
    ///
    /// The new eligibility time is pushed past both the previous `in_time`
    /// and `now`, so a reset event never jumps ahead of its own delay.
    pub fn next(retry_count: u32, in_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let retry_count = retry_count.saturating_add(1);
        let base = in_time.max(now);
        Self {
            retry_count,
            next_eligible_at: base + Self::delay_for(retry_count),
        }
    }
}

/// A queued pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub queue_status: QueueStatus,
    pub in_time: DateTime<Utc>,
    pub out_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry: u32,
    pub project: Project,
    pub pipeline: Pipeline,
    pub record: PipelineRecord,
}

impl Event {
    /// Creates a new event in the queue
    pub fn new(project: Project, pipeline: Pipeline, record: PipelineRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue_status: QueueStatus::InQueue,
            in_time: now,
            out_time: None,
            retry: 0,
            project,
            pipeline,
            record,
        }
    }

    /// Whether `next_event` may hand this event out at `now`
    ///
    /// A claimed event is reclaimable once its lease is strictly older than
    /// the lease window.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.queue_status {
            QueueStatus::InQueue => self.in_time <= now,
            QueueStatus::OutQueue => match self.out_time {
                Some(out) => out < now - lease_window(),
                None => true,
            },
        }
    }

    /// Marks the event as claimed at `now`
    pub fn claim(&mut self, now: DateTime<Utc>) {
        self.queue_status = QueueStatus::OutQueue;
        self.out_time = Some(now);
    }

    /// Re-enqueues the event with backoff
    pub fn reset(&mut self, now: DateTime<Utc>) -> RetryBackoff {
        let backoff = RetryBackoff::next(self.retry, self.in_time, now);
        self.retry = backoff.retry_count;
        self.in_time = backoff.next_eligible_at;
        self.queue_status = QueueStatus::InQueue;
        backoff
    }

    /// Copies the worker-owned snapshot of `other`, keeping this event's queue state
    pub fn apply_snapshot(&mut self, other: Event) {
        self.project = other.project;
        self.pipeline = other.pipeline;
        self.record = other.record;
    }
}
