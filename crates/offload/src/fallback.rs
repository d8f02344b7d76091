//! Local best-effort execution for task types without execution units
//!
//! Trades performance for availability: operations run on tokio's blocking
//! pool so CPU-bound work never stalls the dispatcher or its timers.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FailureReason, SchedulerError};
use crate::task::TaskOutcome;

/// A local implementation of one operation
pub trait LocalOperation: Send + Sync {
    fn run(&self, payload: &Value) -> Result<Value, String>;
}

impl<F> LocalOperation for F
where
    F: Fn(&Value) -> Result<Value, String> + Send + Sync,
{
    fn run(&self, payload: &Value) -> Result<Value, String> {
        self(payload)
    }
}

/// Registry of local operations keyed by task type and operation name
#[derive(Default)]
pub struct FallbackExecutor {
    operations: HashMap<String, HashMap<String, Arc<dyn LocalOperation>>>,
}

impl FallbackExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local implementation
    pub fn register(
        &mut self,
        task_type: impl Into<String>,
        operation: impl Into<String>,
        op: Arc<dyn LocalOperation>,
    ) {
        self.operations
            .entry(task_type.into())
            .or_default()
            .insert(operation.into(), op);
    }

    pub fn supports(&self, task_type: &str, operation: &str) -> bool {
        self.lookup(task_type, operation).is_some()
    }

    fn lookup(&self, task_type: &str, operation: &str) -> Option<Arc<dyn LocalOperation>> {
        self.operations
            .get(task_type)
            .and_then(|ops| ops.get(operation))
            .cloned()
    }

    /// Run an operation locally
    ///
    /// Fails fast with [`SchedulerError::UnsupportedOperation`] when no local
    /// implementation is registered. Errors are terminal; nothing is retried.
    ///
    /// Dropping the returned future stops waiting for the result but cannot
    /// interrupt an operation already running on the blocking pool.
    pub async fn execute(&self, task_type: &str, operation: &str, payload: Value) -> TaskOutcome {
        let Some(op) = self.lookup(task_type, operation) else {
            debug!(task_type, operation, "No local implementation");
            return Err(SchedulerError::UnsupportedOperation {
                task_type: task_type.to_string(),
                operation: operation.to_string(),
            });
        };

        let result = tokio::task::spawn_blocking(move || op.run(&payload))
            .await
            .unwrap_or_else(|join_err| {
                warn!(task_type, operation, error = %join_err, "Local operation panicked");
                Err("local operation panicked".to_string())
            });

        result.map_err(|last_error| SchedulerError::WorkerTaskFailed {
            reason: FailureReason::ApplicationError,
            last_error,
        })
    }
}

impl std::fmt::Debug for FallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: HashMap<&str, Vec<&str>> = self
            .operations
            .iter()
            .map(|(t, ops)| (t.as_str(), ops.keys().map(String::as_str).collect()))
            .collect();
        f.debug_struct("FallbackExecutor")
            .field("operations", &registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn double(payload: &Value) -> Result<Value, String> {
        let n = payload["n"].as_i64().ok_or("missing n")?;
        Ok(json!(n * 2))
    }

    fn executor() -> FallbackExecutor {
        let mut executor = FallbackExecutor::new();
        executor.register("math", "double", Arc::new(double));
        executor
    }

    #[tokio::test]
    async fn test_runs_registered_operation() {
        let executor = executor();
        assert!(executor.supports("math", "double"));
        assert_eq!(
            executor.execute("math", "double", json!({"n": 21})).await,
            Ok(json!(42))
        );
    }

    #[tokio::test]
    async fn test_unknown_operation_is_unsupported() {
        let executor = executor();
        let result = executor.execute("math", "triple", json!({})).await;
        assert_eq!(
            result,
            Err(SchedulerError::UnsupportedOperation {
                task_type: "math".into(),
                operation: "triple".into(),
            })
        );

        let result = executor.execute("reports", "double", json!({})).await;
        assert!(matches!(
            result,
            Err(SchedulerError::UnsupportedOperation { .. })
        ));
    }

    #[tokio::test]
    async fn test_operation_panic_is_task_failure() {
        let mut executor = executor();
        executor.register(
            "math",
            "explode",
            Arc::new(|_: &Value| -> Result<Value, String> { panic!("overflow") }),
        );

        let result = executor.execute("math", "explode", json!({})).await;
        assert_eq!(
            result,
            Err(SchedulerError::WorkerTaskFailed {
                reason: FailureReason::ApplicationError,
                last_error: "local operation panicked".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_operation_error_is_task_failure() {
        let executor = executor();
        let result = executor.execute("math", "double", json!({})).await;
        assert_eq!(
            result,
            Err(SchedulerError::WorkerTaskFailed {
                reason: FailureReason::ApplicationError,
                last_error: "missing n".into(),
            })
        );
    }
}
