//! Public scheduler handle
//!
//! # Example
//!
//! ```ignore
//! use offload::prelude::*;
//!
//! let scheduler = Scheduler::builder(SchedulerConfig::from_env())
//!     .register_pool("analytics", PoolConfig::new(), factory)
//!     .register_fallback("analytics", "summarize", Arc::new(summarize))
//!     .start();
//!
//! let handle = scheduler.submit("analytics", "summarize", json!({"values": [1, 2]}), TaskOptions::new());
//! let result = handle.await?;
//!
//! scheduler.shutdown().await;
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::field::Empty;
use tracing::{info, instrument};

use crate::config::{PoolConfig, SchedulerConfig};
use crate::dispatcher::{Command, Dispatcher};
use crate::fallback::{FallbackExecutor, LocalOperation};
use crate::stats::{PoolStatistics, UnitStatistics};
use crate::task::{Task, TaskHandle, TaskId, TaskOptions};
use crate::unit::{UnitFactory, WorkerPool};

struct PoolRegistration {
    task_type: String,
    config: PoolConfig,
    factory: Arc<dyn UnitFactory>,
}

/// Collects unit factories and fallbacks before the scheduler starts
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    pools: Vec<PoolRegistration>,
    fallback: FallbackExecutor,
}

impl SchedulerBuilder {
    /// Register the execution unit implementation for a task type
    ///
    /// Registering the same task type twice replaces the earlier entry.
    pub fn register_pool(
        mut self,
        task_type: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn UnitFactory>,
    ) -> Self {
        let task_type = task_type.into();
        self.pools.retain(|p| p.task_type != task_type);
        self.pools.push(PoolRegistration {
            task_type,
            config,
            factory,
        });
        self
    }

    /// Register a local implementation used when a type has no units
    pub fn register_fallback(
        mut self,
        task_type: impl Into<String>,
        operation: impl Into<String>,
        op: Arc<dyn LocalOperation>,
    ) -> Self {
        self.fallback.register(task_type, operation, op);
        self
    }

    /// Create the unit pools and spawn the dispatcher
    ///
    /// Must be called from within a tokio runtime.
    #[instrument(skip(self))]
    pub fn start(self) -> Scheduler {
        let (events_tx, events_rx) = mpsc::channel(self.config.event_channel_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let mut pools = HashMap::new();
        for registration in self.pools {
            let concurrency = registration
                .config
                .resolved_concurrency(self.config.max_units_per_type);
            let pool = WorkerPool::initialize(
                &registration.task_type,
                concurrency,
                registration.factory,
                events_tx.clone(),
            );
            pools.insert(registration.task_type, pool);
        }

        info!(
            pools = pools.len(),
            default_timeout_ms = self.config.default_timeout.as_millis() as u64,
            default_max_retries = self.config.default_max_retries,
            "Starting scheduler"
        );

        let dispatcher = Dispatcher::new(pools, Arc::new(self.fallback), events_tx);
        tokio::spawn(dispatcher.run(commands_rx, events_rx));

        Scheduler {
            config: Arc::new(self.config),
            commands: commands_tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Handle to a running scheduler. Cheap to clone.
///
/// Dropping the last handle tears the scheduler down the same way
/// [`Scheduler::shutdown`] does.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn builder(config: SchedulerConfig) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            pools: Vec::new(),
            fallback: FallbackExecutor::new(),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Submit work without blocking
    ///
    /// The returned handle resolves exactly once: with the unit's result, or
    /// with the task's terminal error after retries are exhausted.
    #[instrument(
        skip_all,
        fields(task_id = Empty, task_type = Empty, operation = Empty)
    )]
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        operation: impl Into<String>,
        payload: Value,
        options: TaskOptions,
    ) -> TaskHandle {
        let task_id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Task::new(
            task_id,
            task_type.into(),
            operation.into(),
            payload,
            options,
            &self.config,
        );
        tracing::Span::current()
            .record("task_id", task_id.as_u64())
            .record("task_type", task.task_type.as_str())
            .record("operation", task.operation.as_str());

        let (completion, rx) = oneshot::channel();
        // If the dispatcher is gone the completion sender is dropped with the
        // command and the handle resolves to SchedulerShutdown.
        let _ = self.commands.send(Command::Submit { task, completion });
        TaskHandle::new(task_id, rx)
    }

    /// Per task type pool snapshot. Empty once the scheduler has stopped.
    pub async fn pool_statistics(&self) -> Vec<PoolStatistics> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::PoolStatistics { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Per unit snapshot. Empty once the scheduler has stopped.
    pub async fn unit_statistics(&self) -> Vec<UnitStatistics> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::UnitStatistics { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Reject every outstanding task and terminate all units. Idempotent.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown { ack }).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Whether the dispatcher is still accepting work
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("running", &self.is_running())
            .finish()
    }
}
