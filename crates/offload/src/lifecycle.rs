//! Task lifecycle: pending requests, timeouts, and the retry decision
//!
//! ```text
//!            submit
//!              │
//!              ▼
//!   ┌──────▶ Queued ───────────┐
//!   │          │ unit frees    │ no units for type
//!   │ retry    ▼               ▼
//!   └────── Assigned       Fallback
//!              │               │
//!              ▼               ▼
//!          Terminal ◀──────────┘   (success | retries exhausted | shutdown)
//! ```
//!
//! Each attempt owns exactly one timeout timer. The timer is armed when the
//! task is submitted and re-armed whenever a retry starts a new attempt; it is
//! cleared exactly once, when the task reaches a terminal outcome.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::dispatcher::Event;
use crate::error::{FailureReason, SchedulerError};
use crate::task::{Task, TaskId, TaskOutcome};
use crate::unit::UnitId;

/// Where an outstanding task currently is
#[derive(Debug)]
pub(crate) enum TaskState {
    Queued,
    Assigned {
        unit_id: UnitId,
        dispatch: u64,
        started_at: Instant,
    },
    Fallback {
        job: AbortHandle,
    },
}

/// Armed timeout for one attempt
#[derive(Debug)]
struct TimeoutTimer {
    epoch: u64,
    handle: JoinHandle<()>,
}

impl TimeoutTimer {
    fn arm(task_id: TaskId, epoch: u64, after: Duration, events: mpsc::Sender<Event>) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = events.send(Event::Timeout { task_id, epoch }).await;
        });
        Self { epoch, handle }
    }

    fn clear(self) {
        self.handle.abort();
    }
}

/// Bookkeeping for one outstanding task
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub task: Task,
    pub state: TaskState,
    completion: oneshot::Sender<TaskOutcome>,
    timer: Option<TimeoutTimer>,
    last_error: Option<String>,
}

/// What to do after an attempt failed
#[derive(Debug, PartialEq)]
pub(crate) enum RetryDecision {
    /// Run again; the retry counter has been incremented
    Retry,
    /// Retries are exhausted; resolve with this error
    Fail(SchedulerError),
}

/// Owns every outstanding task from submission to terminal resolution
#[derive(Debug)]
pub(crate) struct TaskLifecycleManager {
    pending: HashMap<TaskId, PendingRequest>,
    events: mpsc::Sender<Event>,
    next_dispatch: u64,
    next_epoch: u64,
}

impl TaskLifecycleManager {
    pub fn new(events: mpsc::Sender<Event>) -> Self {
        Self {
            pending: HashMap::new(),
            events,
            next_dispatch: 0,
            next_epoch: 0,
        }
    }

    /// Track a new task and arm its first timeout
    pub fn admit(&mut self, task: Task, completion: oneshot::Sender<TaskOutcome>) {
        let task_id = task.id;
        let timeout = task.timeout;
        self.pending.insert(
            task_id,
            PendingRequest {
                task,
                state: TaskState::Queued,
                completion,
                timer: None,
                last_error: None,
            },
        );
        self.arm_timeout(task_id, timeout);
    }

    fn arm_timeout(&mut self, task_id: TaskId, timeout: Duration) {
        self.next_epoch += 1;
        let epoch = self.next_epoch;
        let events = self.events.clone();
        if let Some(pending) = self.pending.get_mut(&task_id) {
            if let Some(previous) = pending.timer.take() {
                previous.clear();
            }
            pending.timer = Some(TimeoutTimer::arm(task_id, epoch, timeout, events));
        }
    }

    pub fn get(&self, task_id: TaskId) -> Option<&PendingRequest> {
        self.pending.get(&task_id)
    }

    pub fn get_mut(&mut self, task_id: TaskId) -> Option<&mut PendingRequest> {
        self.pending.get_mut(&task_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Outstanding tasks of one task type
    pub fn in_flight(&self, task_type: &str) -> usize {
        self.pending
            .values()
            .filter(|p| p.task.task_type == task_type)
            .count()
    }

    /// Allocate the sequence number for a new dispatch
    pub fn next_dispatch(&mut self) -> u64 {
        self.next_dispatch += 1;
        self.next_dispatch
    }

    /// Whether a timer expiry belongs to the task's current attempt
    pub fn is_current_timer(&self, task_id: TaskId, epoch: u64) -> bool {
        self.pending
            .get(&task_id)
            .and_then(|p| p.timer.as_ref())
            .is_some_and(|t| t.epoch == epoch)
    }

    /// Apply the retry policy after a failed attempt
    ///
    /// On retry the counter is incremented, the task is marked queued, and a
    /// fresh timeout is armed for the next attempt. The caller is not
    /// resolved in that case.
    pub fn on_failure(
        &mut self,
        task_id: TaskId,
        reason: FailureReason,
        error: String,
    ) -> Option<RetryDecision> {
        let pending = self.pending.get_mut(&task_id)?;
        pending.last_error = Some(error.clone());

        let failure = SchedulerError::WorkerTaskFailed {
            reason,
            last_error: error.clone(),
        };
        if !failure.is_retryable() || !pending.task.has_retries_remaining() {
            return Some(RetryDecision::Fail(failure));
        }

        pending.task.retry_count += 1;
        pending.state = TaskState::Queued;
        let timeout = pending.task.timeout;
        warn!(
            %task_id,
            %reason,
            retry = pending.task.retry_count,
            max_retries = pending.task.max_retries,
            error = %error,
            "Task attempt failed, retrying"
        );
        self.arm_timeout(task_id, timeout);
        Some(RetryDecision::Retry)
    }

    /// Resolve a task exactly once and drop its bookkeeping
    ///
    /// Returns the finished task, or `None` if it was no longer outstanding.
    pub fn finish(&mut self, task_id: TaskId, outcome: TaskOutcome) -> Option<Task> {
        let mut pending = self.pending.remove(&task_id)?;
        if let Some(timer) = pending.timer.take() {
            timer.clear();
        }
        if let TaskState::Fallback { job } = &pending.state {
            job.abort();
        }
        if let Err(err) = &outcome {
            debug!(
                %task_id,
                error = %err,
                last_error = ?pending.last_error,
                "Task resolved with error"
            );
        }
        // The submitter may have dropped its handle
        let _ = pending.completion.send(outcome);
        Some(pending.task)
    }

    /// Reject every outstanding task
    pub fn reject_all(&mut self, error: SchedulerError) -> usize {
        let ids: Vec<TaskId> = self.pending.keys().copied().collect();
        for task_id in &ids {
            self.finish(*task_id, Err(error.clone()));
        }
        ids.len()
    }
}
