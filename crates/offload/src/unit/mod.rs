//! Execution units
//!
//! An execution unit is a long-lived tokio task that receives one request at
//! a time, runs it through a [`UnitHandler`], and reports back to the
//! dispatcher using the [`crate::protocol`] messages.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   UnitRequest    ┌──────────────────────────┐
//! │  Dispatcher  │ ───────────────▶ │  ExecutionUnit (task)    │
//! │              │                  │  ┌────────────────────┐  │
//! │              │ ◀─────────────── │  │    UnitHandler     │  │
//! └──────────────┘   UnitMessage    │  └────────────────────┘  │
//!                   (progress*,     └──────────────────────────┘
//!                    terminal)
//! ```

mod pool;

pub use pool::WorkerPool;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::dispatcher::Event;
use crate::protocol::{UnitMessage, UnitRequest};
use crate::task::TaskId;

/// Result produced by a unit handler
pub type UnitResult = Result<Value, String>;

/// Identity of an execution unit: task type plus slot index
///
/// The identity survives replacement; a replaced unit gets a new generation
/// under the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId {
    task_type: String,
    index: usize,
}

impl UnitId {
    pub fn new(task_type: impl Into<String>, index: usize) -> Self {
        Self {
            task_type: task_type.into(),
            index,
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn index(&self) -> usize {
        self.index
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.task_type, self.index)
    }
}

impl Serialize for UnitId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Executes requests for one task type
///
/// Return `Ok` for success and `Err` for an application error; the unit
/// runtime converts the return value into exactly one terminal message.
#[async_trait]
pub trait UnitHandler: Send + Sync {
    async fn handle(&self, request: UnitRequest, ctx: UnitContext) -> UnitResult;
}

/// Creates unit handlers for a task type
///
/// Called once per unit at pool initialization and again whenever a unit is
/// replaced after a timeout.
pub trait UnitFactory: Send + Sync {
    fn create(&self, unit_id: &UnitId) -> anyhow::Result<Arc<dyn UnitHandler>>;
}

impl<F> UnitFactory for F
where
    F: Fn(&UnitId) -> anyhow::Result<Arc<dyn UnitHandler>> + Send + Sync,
{
    fn create(&self, unit_id: &UnitId) -> anyhow::Result<Arc<dyn UnitHandler>> {
        self(unit_id)
    }
}

/// Error from unit channel operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum UnitChannelError {
    /// The dispatcher is gone
    #[error("dispatcher channel closed")]
    ChannelClosed,
}

/// Context handed to a handler for one request
#[derive(Debug, Clone)]
pub struct UnitContext {
    task_id: TaskId,
    attempt: u32,
    unit_id: UnitId,
    generation: u64,
    dispatch: u64,
    events: mpsc::Sender<Event>,
}

impl UnitContext {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// 1-based attempt number of this request
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn unit_id(&self) -> &UnitId {
        &self.unit_id
    }

    /// Stream a progress update to the submitter
    pub async fn report_progress(&self, progress: Value) -> Result<(), UnitChannelError> {
        self.emit(UnitMessage::progress(self.task_id, progress))
            .await
    }

    /// Send a raw protocol message
    ///
    /// Meant for bridged units that relay messages from elsewhere. Terminal
    /// messages beyond the first for a request are ignored by the dispatcher.
    pub async fn emit(&self, message: UnitMessage) -> Result<(), UnitChannelError> {
        self.events
            .send(Event::Unit {
                unit_id: self.unit_id.clone(),
                generation: self.generation,
                dispatch: self.dispatch,
                message,
            })
            .await
            .map_err(|_| UnitChannelError::ChannelClosed)
    }
}

/// A request as delivered to a unit's inbox
#[derive(Debug)]
pub(crate) struct Assignment {
    pub request: UnitRequest,
    pub attempt: u32,
    pub dispatch: u64,
}

/// Spawn the task backing one unit incarnation
pub(crate) fn spawn_unit(
    unit_id: UnitId,
    generation: u64,
    handler: Arc<dyn UnitHandler>,
    events: mpsc::Sender<Event>,
) -> (mpsc::UnboundedSender<Assignment>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Assignment>();

    let handle = tokio::spawn(async move {
        while let Some(assignment) = rx.recv().await {
            let task_id = assignment.request.task_id;
            let ctx = UnitContext {
                task_id,
                attempt: assignment.attempt,
                unit_id: unit_id.clone(),
                generation,
                dispatch: assignment.dispatch,
                events: events.clone(),
            };

            debug!(%unit_id, %task_id, attempt = assignment.attempt, "Unit executing request");

            let outcome = AssertUnwindSafe(handler.handle(assignment.request, ctx.clone()))
                .catch_unwind()
                .await;

            let message = match outcome {
                Ok(Ok(result)) => UnitMessage::success(task_id, result),
                Ok(Err(err)) => UnitMessage::error(task_id, err),
                Err(_) => {
                    error!(%unit_id, %task_id, "Unit handler panicked");
                    UnitMessage::error(task_id, "unit handler panicked")
                }
            };

            if ctx.emit(message).await.is_err() {
                break;
            }
        }

        debug!(%unit_id, generation, "Unit loop exited");
    });

    (tx, handle)
}
