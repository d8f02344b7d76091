//! Dispatcher <-> unit message protocol
//!
//! The JSON shape of these messages is stable across hosts:
//!
//! ```text
//! Dispatcher -> Unit: { taskId, operation, payload, options }
//! Unit -> Dispatcher: { taskId, type: "progress"|"success"|"error", progress?, result?, error? }
//! ```
//!
//! A unit emits zero or more `progress` messages followed by exactly one
//! terminal (`success` or `error`) message per accepted request.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::task::TaskId;

/// Work posted to an execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitRequest {
    pub task_id: TaskId,
    pub operation: String,
    pub payload: Value,
    #[serde(default)]
    pub options: Value,
}

/// Kind of a unit message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Progress,
    Success,
    Error,
}

/// Message emitted by an execution unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitMessage {
    pub task_id: TaskId,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitMessage {
    pub fn progress(task_id: TaskId, progress: Value) -> Self {
        Self {
            task_id,
            kind: MessageKind::Progress,
            progress: Some(progress),
            result: None,
            error: None,
        }
    }

    pub fn success(task_id: TaskId, result: Value) -> Self {
        Self {
            task_id,
            kind: MessageKind::Success,
            progress: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(task_id: TaskId, error: impl Into<String>) -> Self {
        Self {
            task_id,
            kind: MessageKind::Error,
            progress: None,
            result: None,
            error: Some(error.into()),
        }
    }
}
