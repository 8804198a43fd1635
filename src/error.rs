/// Error taxonomy for graph building, spec loading and task execution
///
/// Build-time and load-time errors are returned to the caller immediately.
/// Run-time errors (`TaskError`, `RemoteError`) never unwind out of a run:
/// they are recorded on the failing task's status and surface in the report.

use crate::workflow::types::NodeId;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Structural errors raised while building or starting a graph
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("connecting {from} -> {to} would create a cycle")]
    Cycle { from: NodeId, to: NodeId },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("graph structure is frozen while a run is active")]
    Frozen,

    #[error("invalid loop task {node}: {reason}")]
    InvalidLoop { node: NodeId, reason: String },

    #[error("task {node} references unregistered function '{name}'")]
    UnknownFunction { node: NodeId, name: String },

    #[error("no node ids left to allocate")]
    IdsExhausted,
}

/// Errors raised while reading or writing a graph specification document
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("malformed graph spec: {0}")]
    Malformed(String),

    #[error("spec I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("spec JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Failure of a single remote call, always retryable
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("endpoint '{endpoint}' failed: {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("endpoint '{endpoint}' returned a non-object payload")]
    InvalidResponse { endpoint: String },
}

/// Failure of one task dispatch
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("local function failed: {0}")]
    LocalFunction(String),

    #[error("binding {from} -> {to}: source output has no key '{key}'")]
    Binding { from: NodeId, to: NodeId, key: String },

    #[error("loop expansion failed: {0}")]
    Loop(String),

    #[error("{} loop element(s) failed: {failed:?}", failed.len())]
    LoopElement { failed: BTreeMap<usize, String> },

    #[error("run cancelled before dispatch")]
    Cancelled,
}

impl TaskError {
    /// Whether another attempt could change the outcome
    pub fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Remote(_) | TaskError::LocalFunction(_))
    }
}

/// Failure of the run task itself (not of any workflow task)
#[derive(Debug, Error)]
pub enum RunError {
    #[error("run aborted: {0}")]
    Aborted(String),
}
