//! # Offload
//!
//! Background task scheduler that moves CPU-heavy work off the caller's task
//! onto pools of long-lived execution units.
//!
//! ## Features
//!
//! - **Per-type pools**: a fixed number of execution units per task type
//! - **Priority queueing**: waiting tasks are ordered by priority, retries jump ahead
//! - **Timeouts**: a unit that exceeds a task's budget is replaced, never reused
//! - **Bounded retries**: every task resolves exactly once
//! - **Fallback**: task types without units run on a local implementation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (cloneable handle: submit, statistics, shutdown)           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ commands
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Dispatcher                             │
//! │  (owns queues, pending tasks, timers and unit pools)        │
//! └─────────────────────────────────────────────────────────────┘
//!                  │ requests                ▲ messages
//!                  ▼                         │
//! ┌─────────────────────────────────────────────────────────────┐
//! │              WorkerPool / FallbackExecutor                   │
//! │  (execution units per task type, local fallbacks)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use offload::prelude::*;
//!
//! let scheduler = analytics::register(
//!     Scheduler::builder(SchedulerConfig::from_env()),
//!     PoolConfig::new(),
//! )
//! .start();
//!
//! let tss = scheduler
//!     .submit(
//!         analytics::TASK_TYPE,
//!         analytics::OP_CALCULATE_TSS,
//!         json!({"segments": [{"duration": 3600, "power_start": 0.8}], "ftp": 250}),
//!         TaskOptions::new().with_priority(Priority::High),
//!     )
//!     .await?;
//! ```

pub mod analytics;
pub mod config;
pub(crate) mod dispatcher;
pub mod error;
pub mod fallback;
pub(crate) mod lifecycle;
pub mod protocol;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod task;
pub mod unit;

/// Prelude for common imports
pub mod prelude {
    pub use crate::analytics;
    pub use crate::config::{PoolConfig, SchedulerConfig};
    pub use crate::error::{FailureReason, SchedulerError};
    pub use crate::fallback::LocalOperation;
    pub use crate::protocol::{MessageKind, UnitMessage, UnitRequest};
    pub use crate::scheduler::{Scheduler, SchedulerBuilder};
    pub use crate::stats::{PoolStatistics, UnitStatistics};
    pub use crate::task::{Priority, TaskHandle, TaskId, TaskOptions, TaskOutcome};
    pub use crate::unit::{UnitContext, UnitFactory, UnitHandler, UnitId, UnitResult};
}

// Re-export key types at crate root
pub use config::{PoolConfig, SchedulerConfig};
pub use error::{FailureReason, SchedulerError};
pub use fallback::{FallbackExecutor, LocalOperation};
pub use protocol::{MessageKind, UnitMessage, UnitRequest};
pub use scheduler::{Scheduler, SchedulerBuilder};
pub use stats::{PoolStatistics, UnitStatistics};
pub use task::{Priority, TaskHandle, TaskId, TaskOptions, TaskOutcome};
pub use unit::{UnitChannelError, UnitContext, UnitFactory, UnitHandler, UnitId, UnitResult};
