//! Dispatcher event loop
//!
//! One tokio task owns the pools, queues, pending table and statistics. All
//! mutation happens here, driven by two channels:
//!
//! - API commands from [`crate::Scheduler`] handles (submit, statistics, shutdown)
//! - internal events from units, timeout timers and fallback jobs
//!
//! Because nothing else touches this state, no locks are needed.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{FailureReason, SchedulerError};
use crate::fallback::FallbackExecutor;
use crate::lifecycle::{RetryDecision, TaskLifecycleManager, TaskState};
use crate::protocol::{MessageKind, UnitMessage, UnitRequest};
use crate::queue::TaskQueue;
use crate::stats::{PoolStatistics, StatsCollector, UnitStatistics};
use crate::task::{Task, TaskId, TaskOutcome};
use crate::unit::{Assignment, UnitId, WorkerPool};

/// Requests from scheduler handles
pub(crate) enum Command {
    Submit {
        task: Task,
        completion: oneshot::Sender<TaskOutcome>,
    },
    PoolStatistics {
        reply: oneshot::Sender<Vec<PoolStatistics>>,
    },
    UnitStatistics {
        reply: oneshot::Sender<Vec<UnitStatistics>>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Internal notifications
#[derive(Debug)]
pub(crate) enum Event {
    /// A message from a unit incarnation, for one dispatch
    Unit {
        unit_id: UnitId,
        generation: u64,
        dispatch: u64,
        message: UnitMessage,
    },
    /// A task's attempt timer expired
    Timeout { task_id: TaskId, epoch: u64 },
    /// A fallback job finished
    FallbackDone { task_id: TaskId, outcome: TaskOutcome },
}

pub(crate) struct Dispatcher {
    pools: HashMap<String, WorkerPool>,
    queues: HashMap<String, TaskQueue>,
    lifecycle: TaskLifecycleManager,
    stats: StatsCollector,
    fallback: Arc<FallbackExecutor>,
    events: mpsc::Sender<Event>,
}

impl Dispatcher {
    pub fn new(
        pools: HashMap<String, WorkerPool>,
        fallback: Arc<FallbackExecutor>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        let queues = pools
            .keys()
            .map(|task_type| (task_type.clone(), TaskQueue::new()))
            .collect();

        Self {
            pools,
            queues,
            lifecycle: TaskLifecycleManager::new(events.clone()),
            stats: StatsCollector::new(),
            fallback,
            events,
        }
    }

    /// Run until shutdown is requested or every scheduler handle is dropped
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::Receiver<Event>,
    ) {
        let mut shutdown_ack = None;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { ack }) => {
                        shutdown_ack = Some(ack);
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All scheduler handles dropped");
                        break;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event),
            }
        }

        self.teardown();

        // Late shutdown requests from other handles
        commands.close();
        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown { ack } => {
                    let _ = ack.send(());
                }
                Command::Submit { completion, .. } => {
                    let _ = completion.send(Err(SchedulerError::SchedulerShutdown));
                }
                _ => {}
            }
        }

        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }
        info!("Dispatcher stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Submit { task, completion } => self.submit(task, completion),
            Command::PoolStatistics { reply } => {
                let _ = reply.send(self.pool_statistics());
            }
            Command::UnitStatistics { reply } => {
                let _ = reply.send(self.unit_statistics());
            }
            Command::Shutdown { ack } => {
                let _ = ack.send(());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Unit {
                unit_id,
                generation,
                dispatch,
                message,
            } => self.on_unit_message(unit_id, generation, dispatch, message),
            Event::Timeout { task_id, epoch } => self.handle_timeout(task_id, epoch),
            Event::FallbackDone { task_id, outcome } => self.on_fallback_done(task_id, outcome),
        }
    }

    fn submit(&mut self, task: Task, completion: oneshot::Sender<TaskOutcome>) {
        let task_id = task.id;
        let task_type = task.task_type.clone();
        let priority = task.priority;
        debug!(%task_id, task_type = %task_type, operation = %task.operation, "Task submitted");

        self.lifecycle.admit(task, completion);

        if !self.has_live_units(&task_type) {
            self.run_fallback(task_id);
            return;
        }

        let idle = self.pools.get(&task_type).and_then(WorkerPool::find_idle);
        match idle {
            Some(unit_id) => self.assign(unit_id, task_id),
            None => {
                if let Some(queue) = self.queues.get_mut(&task_type) {
                    queue.push(task_id, priority);
                    debug!(%task_id, depth = queue.len(), "Task queued");
                }
            }
        }
    }

    fn has_live_units(&self, task_type: &str) -> bool {
        self.pools
            .get(task_type)
            .is_some_and(|pool| pool.live_count() > 0)
    }

    /// Post a task to an idle unit
    fn assign(&mut self, unit_id: UnitId, task_id: TaskId) {
        let dispatch = self.lifecycle.next_dispatch();
        let Some(pending) = self.lifecycle.get_mut(task_id) else {
            return;
        };

        pending.state = TaskState::Assigned {
            unit_id: unit_id.clone(),
            dispatch,
            started_at: tokio::time::Instant::now(),
        };
        let attempt = pending.task.attempt();
        let assignment = Assignment {
            request: UnitRequest {
                task_id,
                operation: pending.task.operation.clone(),
                payload: pending.task.payload.clone(),
                options: json!({
                    "attempt": attempt,
                    "timeoutMs": pending.task.timeout.as_millis() as u64,
                }),
            },
            attempt,
            dispatch,
        };

        let Some(pool) = self.pools.get_mut(unit_id.task_type()) else {
            return;
        };
        pool.mark_busy(&unit_id, task_id);
        self.stats.record_dispatch(&unit_id);
        debug!(%task_id, %unit_id, attempt, "Task assigned");

        if !pool.post(&unit_id, assignment) {
            warn!(%task_id, %unit_id, "Execution unit stopped accepting work");
            self.stats.record_error(&unit_id);
            self.replace_unit(&unit_id);
            self.fail_attempt(
                task_id,
                FailureReason::ApplicationError,
                "execution unit is unavailable".to_string(),
            );
            self.after_unit_change(unit_id.task_type());
        }
    }

    /// Assign queued tasks to idle units until one side runs out
    fn pump(&mut self, task_type: &str) {
        loop {
            let Some(unit_id) = self.pools.get(task_type).and_then(WorkerPool::find_idle) else {
                return;
            };
            let Some(task_id) = self.queues.get_mut(task_type).and_then(TaskQueue::pop) else {
                return;
            };
            self.assign(unit_id, task_id);
        }
    }

    fn on_unit_message(
        &mut self,
        unit_id: UnitId,
        generation: u64,
        dispatch: u64,
        message: UnitMessage,
    ) {
        let task_id = message.task_id;
        let task_type = unit_id.task_type().to_string();

        let current_generation = self.pools.get(&task_type).and_then(|p| p.generation(&unit_id));
        if current_generation != Some(generation) {
            debug!(%unit_id, generation, %task_id, "Ignoring message from replaced unit");
            return;
        }

        let Some(pending) = self.lifecycle.get(task_id) else {
            debug!(%unit_id, %task_id, kind = ?message.kind, "Ignoring message for finished task");
            return;
        };
        let started_at = match &pending.state {
            TaskState::Assigned {
                unit_id: assigned,
                dispatch: current,
                started_at,
            } if *assigned == unit_id && *current == dispatch => *started_at,
            _ => {
                debug!(%unit_id, %task_id, kind = ?message.kind, "Ignoring stale unit message");
                return;
            }
        };

        match message.kind {
            MessageKind::Progress => {
                if let (Some(callback), Some(progress)) =
                    (pending.task.on_progress.clone(), message.progress)
                {
                    // The callback belongs to the submitter; a panic there must
                    // not take the dispatcher down with it.
                    if catch_unwind(AssertUnwindSafe(|| callback(progress))).is_err() {
                        warn!(%task_id, %unit_id, "Progress callback panicked");
                    }
                }
            }
            MessageKind::Success => {
                self.stats.record_success(&unit_id, started_at.elapsed());
                self.free_unit(&unit_id);
                self.lifecycle
                    .finish(task_id, Ok(message.result.unwrap_or(Value::Null)));
                debug!(%task_id, %unit_id, "Task succeeded");
                self.pump(&task_type);
            }
            MessageKind::Error => {
                self.stats.record_error(&unit_id);
                self.free_unit(&unit_id);
                let error = message
                    .error
                    .unwrap_or_else(|| "unit reported an error".to_string());
                self.fail_attempt(task_id, FailureReason::ApplicationError, error);
                self.pump(&task_type);
            }
        }
    }

    fn free_unit(&mut self, unit_id: &UnitId) {
        if let Some(pool) = self.pools.get_mut(unit_id.task_type()) {
            pool.mark_free(unit_id);
        }
    }

    /// Apply the retry policy to a failed attempt
    fn fail_attempt(&mut self, task_id: TaskId, reason: FailureReason, error: String) {
        let Some(task_type) = self.lifecycle.get(task_id).map(|p| p.task.task_type.clone())
        else {
            return;
        };
        if let Some(queue) = self.queues.get_mut(&task_type) {
            queue.remove(task_id);
        }

        match self.lifecycle.on_failure(task_id, reason, error) {
            Some(RetryDecision::Retry) => {
                if let Some(queue) = self.queues.get_mut(&task_type) {
                    queue.push_retry(task_id);
                }
            }
            Some(RetryDecision::Fail(err)) => {
                error!(%task_id, task_type = %task_type, error = %err, "Task failed");
                self.lifecycle.finish(task_id, Err(err));
            }
            None => {}
        }
    }

    /// A task exceeded its time budget
    ///
    /// A unit that ran out of time is discarded and recreated, never reused.
    fn handle_timeout(&mut self, task_id: TaskId, epoch: u64) {
        if !self.lifecycle.is_current_timer(task_id, epoch) {
            return;
        }
        let Some(pending) = self.lifecycle.get(task_id) else {
            return;
        };
        let task_type = pending.task.task_type.clone();
        let budget = pending.task.timeout;
        let error = format!("task exceeded its {}ms time budget", budget.as_millis());

        match &pending.state {
            TaskState::Assigned { unit_id, .. } => {
                let unit_id = unit_id.clone();
                warn!(%task_id, %unit_id, "Task timed out on unit, replacing unit");
                self.replace_unit(&unit_id);
                self.fail_attempt(task_id, FailureReason::Timeout, error);
                self.after_unit_change(&task_type);
            }
            TaskState::Queued => {
                warn!(%task_id, "Task timed out while queued");
                self.fail_attempt(task_id, FailureReason::Timeout, error);
                self.pump(&task_type);
            }
            TaskState::Fallback { .. } => {
                warn!(%task_id, "Fallback execution timed out");
                self.lifecycle.finish(
                    task_id,
                    Err(SchedulerError::WorkerTaskFailed {
                        reason: FailureReason::Timeout,
                        last_error: error,
                    }),
                );
            }
        }
    }

    fn replace_unit(&mut self, unit_id: &UnitId) {
        let Some(pool) = self.pools.get_mut(unit_id.task_type()) else {
            return;
        };
        self.stats.reset(unit_id);
        match pool.replace(unit_id) {
            Ok(generation) => info!(%unit_id, generation, "Execution unit replaced"),
            Err(err) => error!(%unit_id, error = %err, "Execution unit could not be recreated"),
        }
    }

    /// Re-balance a type after units were replaced or lost
    fn after_unit_change(&mut self, task_type: &str) {
        if self.has_live_units(task_type) {
            self.pump(task_type);
            return;
        }

        let stranded = self
            .queues
            .get_mut(task_type)
            .map(TaskQueue::drain)
            .unwrap_or_default();
        if !stranded.is_empty() {
            warn!(
                task_type,
                count = stranded.len(),
                "No execution units left, moving queued tasks to fallback"
            );
        }
        for task_id in stranded {
            self.run_fallback(task_id);
        }
    }

    fn run_fallback(&mut self, task_id: TaskId) {
        let Some(pending) = self.lifecycle.get_mut(task_id) else {
            return;
        };
        let task_type = pending.task.task_type.clone();
        let operation = pending.task.operation.clone();

        if !self.fallback.supports(&task_type, &operation) {
            debug!(%task_id, task_type = %task_type, operation = %operation, "No local implementation");
            self.lifecycle.finish(
                task_id,
                Err(SchedulerError::UnsupportedOperation {
                    task_type,
                    operation,
                }),
            );
            return;
        }

        let payload = pending.task.payload.clone();
        debug!(%task_id, task_type = %task_type, operation = %operation, "Routing task to fallback");

        let fallback = Arc::clone(&self.fallback);
        let events = self.events.clone();
        let job = tokio::spawn(async move {
            let outcome = fallback.execute(&task_type, &operation, payload).await;
            let _ = events.send(Event::FallbackDone { task_id, outcome }).await;
        });
        pending.state = TaskState::Fallback {
            job: job.abort_handle(),
        };
    }

    fn on_fallback_done(&mut self, task_id: TaskId, outcome: TaskOutcome) {
        let is_fallback = self
            .lifecycle
            .get(task_id)
            .is_some_and(|p| matches!(p.state, TaskState::Fallback { .. }));
        if is_fallback {
            self.lifecycle.finish(task_id, outcome);
        }
    }

    fn pool_statistics(&self) -> Vec<PoolStatistics> {
        let mut task_types: Vec<&String> = self.pools.keys().collect();
        task_types.sort();

        task_types
            .into_iter()
            .map(|task_type| {
                let pool = &self.pools[task_type];
                let units = pool.live_count();
                let busy = pool.busy_count();
                PoolStatistics {
                    task_type: task_type.clone(),
                    units,
                    busy,
                    idle: units - busy,
                    queued: self.queues.get(task_type).map_or(0, TaskQueue::len),
                    in_flight: self.lifecycle.in_flight(task_type),
                    fallback: units == 0,
                }
            })
            .collect()
    }

    fn unit_statistics(&self) -> Vec<UnitStatistics> {
        let mut task_types: Vec<&String> = self.pools.keys().collect();
        task_types.sort();

        let mut snapshot = Vec::new();
        for task_type in task_types {
            let pool = &self.pools[task_type];
            for unit_id in pool.unit_ids() {
                let stats = self.stats.get(unit_id);
                snapshot.push(UnitStatistics {
                    unit_id: unit_id.clone(),
                    task_type: task_type.clone(),
                    busy: pool.is_busy(unit_id),
                    assigned_task: pool.assigned_task(unit_id),
                    generation: pool.generation(unit_id).unwrap_or_default(),
                    tasks_dispatched: stats.tasks_dispatched,
                    tasks_completed: stats.tasks_completed,
                    errors: stats.errors,
                    average_processing_time_ms: stats
                        .average_processing_time()
                        .map(|d| d.as_secs_f64() * 1000.0),
                    last_task_time_ms: stats.last_task_time.map(|d| d.as_secs_f64() * 1000.0),
                    last_used_at: pool.last_used_at(unit_id),
                });
            }
        }
        snapshot
    }

    fn teardown(&mut self) {
        debug!(outstanding = self.lifecycle.len(), "Tearing down scheduler");
        let rejected = self.lifecycle.reject_all(SchedulerError::SchedulerShutdown);
        for queue in self.queues.values_mut() {
            queue.drain();
        }
        for pool in self.pools.values_mut() {
            pool.shutdown();
        }
        info!(rejected, "Scheduler torn down");
    }
}
