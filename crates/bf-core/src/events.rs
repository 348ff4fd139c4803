//! Per-job progress event relay.
//!
//! [`EventRelay`] keeps one channel per job: a `tokio::sync::broadcast`
//! sender paired with a bounded ring buffer of already-published events.
//! New subscribers replay the buffer first and then join the live stream,
//! so a late joiner sees the job's history (best effort, bounded) followed
//! by every further event in publish order with no gaps or duplicates.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::RelayConfig;
use crate::error::{Error, Result};
use crate::ids::JobId;

// ---------------------------------------------------------------------------
// Job state
// ---------------------------------------------------------------------------

/// Lifecycle state of a compression job.
///
/// Transitions are strictly forward: `Queued -> Probing -> Encoding` and
/// then either `Completed` or `Failed`. Terminal states are never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Probing,
    Encoding,
    Completed,
    Failed,
}

impl JobState {
    /// Stable string form for logs and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Probing => "probing",
            JobState::Encoding => "encoding",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    /// Whether this state ends the job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// Payload describing one unit of job advancement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// A raw diagnostic line from the encoder, passed through untouched.
    Log { line: String },
    /// A structured progress sample derived from the encoder's progress
    /// stream. `ratio` is clamped to [0, 1].
    Progress {
        ratio: f64,
        fps: Option<f64>,
        speed: Option<String>,
    },
    /// The job entered a new state. `reason` is set for failures.
    Status {
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// The job completed; carries the output artifact descriptor.
    Result { output: String, output_bytes: u64 },
}

impl EventPayload {
    /// Whether this payload closes the job's event stream.
    ///
    /// Exactly one terminal event is published per job: a `Result` on
    /// success or a failing `Status` otherwise.
    pub fn is_terminal(&self) -> bool {
        match self {
            EventPayload::Result { .. } => true,
            EventPayload::Status { state, .. } => state.is_terminal(),
            _ => false,
        }
    }
}

/// A sequenced, timestamped event for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// The job this event belongs to.
    pub job_id: JobId,
    /// Strictly increasing per job, starting at 0.
    pub seq: u64,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub payload: EventPayload,
}

impl ProgressEvent {
    /// Whether this event closes the job's stream.
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// EventRelay
// ---------------------------------------------------------------------------

/// One job's channel: live broadcast plus bounded replay history.
struct JobChannel {
    tx: broadcast::Sender<ProgressEvent>,
    replay: VecDeque<ProgressEvent>,
    next_seq: u64,
    terminal: bool,
}

struct RelayInner {
    channels: Mutex<HashMap<JobId, JobChannel>>,
    replay_capacity: usize,
    broadcast_capacity: usize,
    teardown_grace: Duration,
}

/// Ordered fan-out of per-job events to any number of subscribers.
///
/// Cloning is cheap; all clones share the same channel table. Publishing
/// never blocks on subscribers: a subscriber that falls more than the
/// broadcast capacity behind is dropped rather than back-pressuring the
/// job.
#[derive(Clone)]
pub struct EventRelay {
    inner: Arc<RelayInner>,
}

impl EventRelay {
    /// Create a relay with the given tuning.
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                channels: Mutex::new(HashMap::new()),
                replay_capacity: config.replay_capacity.max(1),
                broadcast_capacity: config.broadcast_capacity.max(1),
                teardown_grace: Duration::from_secs(config.teardown_grace_secs),
            }),
        }
    }

    /// Publish an event for a job, assigning its sequence number.
    ///
    /// The channel is created on first publish. After a terminal payload the
    /// channel stays available for the configured grace period so late
    /// subscribers still get the full replay, then it is torn down;
    /// publishing after the terminal event is a no-op (the job state machine
    /// never does this, but the relay does not rely on that).
    pub fn publish(&self, job_id: JobId, payload: EventPayload) {
        let terminal = payload.is_terminal();

        {
            let mut channels = self.inner.channels.lock();
            let channel = channels.entry(job_id).or_insert_with(|| JobChannel {
                tx: broadcast::channel(self.inner.broadcast_capacity).0,
                replay: VecDeque::with_capacity(self.inner.replay_capacity),
                next_seq: 0,
                terminal: false,
            });

            if channel.terminal {
                tracing::warn!(job_id = %job_id, "event published after terminal event; dropped");
                return;
            }

            let event = ProgressEvent {
                job_id,
                seq: channel.next_seq,
                timestamp: Utc::now(),
                payload,
            };
            channel.next_seq += 1;

            if channel.replay.len() >= self.inner.replay_capacity {
                channel.replay.pop_front();
            }
            channel.replay.push_back(event.clone());
            channel.terminal = terminal;

            // Ignore send errors (no live subscribers).
            let _ = channel.tx.send(event);
        }

        if terminal {
            self.schedule_teardown(job_id);
        }
    }

    /// Subscribe to a job's events.
    ///
    /// The replay snapshot and the live receiver are taken under the same
    /// lock that `publish` holds, so the resulting stream has no gap and no
    /// duplicate at the replay/live boundary.
    pub fn subscribe(&self, job_id: JobId) -> Result<Subscription> {
        let channels = self.inner.channels.lock();
        let channel = channels
            .get(&job_id)
            .ok_or_else(|| Error::not_found("job", job_id))?;

        let replay: VecDeque<ProgressEvent> = channel.replay.iter().cloned().collect();
        let replay_tail = replay.back().map(|e| e.seq);

        Ok(Subscription {
            replay,
            replay_tail,
            rx: channel.tx.subscribe(),
            finished: false,
        })
    }

    /// Whether the relay currently holds a channel for the job.
    pub fn has_channel(&self, job_id: JobId) -> bool {
        self.inner.channels.lock().contains_key(&job_id)
    }

    /// Remove the channel after the grace period. Subscribers already
    /// attached keep their broadcast receivers until drained.
    fn schedule_teardown(&self, job_id: JobId) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.teardown_grace).await;
            inner.channels.lock().remove(&job_id);
        });
    }
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// A live, ordered view of one job's events.
///
/// Yields the replayed history first, then live events, and ends (returns
/// `None`) after the terminal event has been delivered, after the channel
/// closes, or when this subscriber has lagged too far behind.
pub struct Subscription {
    replay: VecDeque<ProgressEvent>,
    replay_tail: Option<u64>,
    rx: broadcast::Receiver<ProgressEvent>,
    finished: bool,
}

impl Subscription {
    /// Receive the next event, or `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.replay.pop_front() {
            if event.is_terminal() {
                self.finished = true;
            }
            return Some(event);
        }

        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    // Events at or below the replay tail were already seen.
                    if let Some(tail) = self.replay_tail {
                        if event.seq <= tail {
                            continue;
                        }
                    }
                    if event.is_terminal() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Slow subscribers are dropped rather than stalling the
                    // publisher or delivering a gapped sequence.
                    tracing::debug!("subscriber lagged by {n} events; dropping");
                    self.finished = true;
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }
}
