/// Taskgraph: DAG workflow orchestrator for remote and local tasks
/// 
/// This library builds task graphs, persists them as JSON specs and runs them
/// with dependency-driven concurrency, per-task retries, loop fan-out and
/// failure isolation.

// Core configuration and setup
pub mod config;

// Error types shared across layers
pub mod error;

// Workflow layer - task graph definitions, persistence and the build API
pub mod workflow;

// Runtime execution engine - dispatch, retries, loops and artifacts
pub mod runtime;

// Re-export commonly used types for external consumers
pub use config::{Config, EngineConfig};
pub use error::{GraphError, RemoteError, RunError, SpecError, TaskError};
pub use runtime::{CallerAdapter, FunctionRegistry, HttpCaller, RunHandle, RunOutcome, RunReport, TaskStatus};
pub use workflow::{FunctionRef, LoopEnd, NodeId, ParameterBinding, Payload, TaskKind, TaskState, Workflow};
