/// Runtime Execution Engine
/// 
/// This module runs task graphs. It handles:
/// - Dependency-driven dispatch with concurrent independent branches
/// - Per-task retries and failure isolation
/// - Loop fan-out and per-element aggregation
/// - Remote calls, local functions and run artifacts

// Core execution engine driving one run of a frozen graph
pub mod engine;

// Single-attempt task execution per variant
pub mod executor;

// Pluggable transport for RemoteCall tasks
pub mod caller;

// HTTP transport used by the binary
pub mod http;

// Named functions and embedded Lua scripts for LocalFunction tasks
pub mod functions;
pub mod lua;

// Lock-free per-run status board and run reports
pub mod state;

// Input/output artifacts under a project directory
pub mod store;

// Re-export main types
pub use caller::{CallerAdapter, Disconnected};
pub use engine::{ExecutionEngine, RunHandle, RunRequest};
pub use executor::TaskExecutor;
pub use functions::FunctionRegistry;
pub use http::HttpCaller;
pub use state::{ElementOutcome, LoopAggregate, RunOutcome, RunReport, TaskStatus};
pub use store::ArtifactStore;
