//! Task model and caller-facing handle

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;

/// Monotonic task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue priority class. Retries are always re-queued as [`Priority::High`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

/// Final outcome delivered to a submitter
pub type TaskOutcome = Result<Value, SchedulerError>;

/// Progress callback, invoked on the dispatcher for every progress message
pub type ProgressCallback = Arc<dyn Fn(Value) + Send + Sync>;

/// Per-submission options. Unset fields fall back to [`SchedulerConfig`].
#[derive(Clone, Default)]
pub struct TaskOptions {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub priority: Priority,
    pub on_progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for TaskOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskOptions")
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("priority", &self.priority)
            .field("on_progress", &self.on_progress.is_some())
            .finish()
    }
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time budget for each attempt
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the number of retries allowed after the first attempt
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Register a progress callback
    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.on_progress = Some(Arc::new(callback));
        self
    }
}

/// A unit of offloaded work, owned by the dispatcher until it terminates
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub operation: String,
    pub payload: Value,
    pub timeout: Duration,
    pub max_retries: u32,
    pub priority: Priority,
    pub retry_count: u32,
    pub submitted_at: DateTime<Utc>,
    pub on_progress: Option<ProgressCallback>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        task_type: String,
        operation: String,
        payload: Value,
        options: TaskOptions,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            id,
            task_type,
            operation,
            payload,
            timeout: options.timeout.unwrap_or(config.default_timeout),
            max_retries: options.max_retries.unwrap_or(config.default_max_retries),
            priority: options.priority,
            retry_count: 0,
            submitted_at: Utc::now(),
            on_progress: options.on_progress,
        }
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn has_retries_remaining(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("task_type", &self.task_type)
            .field("operation", &self.operation)
            .field("priority", &self.priority)
            .field("retry_count", &self.retry_count)
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

/// Handle to the eventual result of a submitted task
///
/// Await it to get the task's single terminal outcome. If the scheduler goes
/// away first the handle resolves to [`SchedulerError::SchedulerShutdown`].
#[derive(Debug)]
pub struct TaskHandle {
    task_id: TaskId,
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub(crate) fn new(task_id: TaskId, rx: oneshot::Receiver<TaskOutcome>) -> Self {
        Self { task_id, rx }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }
}

impl Future for TaskHandle {
    type Output = TaskOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(SchedulerError::SchedulerShutdown)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_task_resolves_defaults_from_config() {
        let config = SchedulerConfig::default();
        let task = Task::new(
            TaskId::new(1),
            "analytics".into(),
            "summarize".into(),
            json!({}),
            TaskOptions::new(),
            &config,
        );

        assert_eq!(task.timeout, Duration::from_secs(30));
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.attempt(), 1);
        assert!(task.has_retries_remaining());
    }

    #[test]
    fn test_task_options_override_config() {
        let config = SchedulerConfig::default();
        let mut task = Task::new(
            TaskId::new(2),
            "analytics".into(),
            "summarize".into(),
            json!({}),
            TaskOptions::new()
                .with_timeout(Duration::from_millis(10))
                .with_max_retries(0)
                .with_priority(Priority::Low),
            &config,
        );

        assert_eq!(task.timeout, Duration::from_millis(10));
        assert_eq!(task.priority, Priority::Low);
        assert!(!task.has_retries_remaining());

        task.retry_count = 1;
        assert_eq!(task.attempt(), 2);
    }

    #[tokio::test]
    async fn test_handle_resolves_shutdown_when_sender_dropped() {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(TaskId::new(9), rx);
        drop(tx);
        assert_eq!(handle.await, Err(SchedulerError::SchedulerShutdown));
    }

    #[tokio::test]
    async fn test_handle_delivers_outcome() {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle::new(TaskId::new(9), rx);
        assert_eq!(handle.task_id(), TaskId::new(9));
        tx.send(Ok(json!(42))).unwrap();
        assert_eq!(handle.await, Ok(json!(42)));
    }
}
