/// Workflow Management Layer
/// 
/// This module handles task graph definitions and persistence:
/// - Type definitions (Task, TaskKind, Edge, ParameterBinding)
/// - The append-only DAG store backed by petgraph
/// - JSON specs for saving and reloading graphs
/// - The `Workflow` facade tying a graph to the execution engine

// Core type definitions
pub mod types;

// DAG store with cycle rejection and topological queries
pub mod graph;

// JSON spec serialization
pub mod spec;

// Graph building and run entry point
pub mod builder;

// Re-export commonly used types
pub use builder::Workflow;
pub use graph::GraphStore;
pub use spec::{GraphSpec, SpecCodec};
pub use types::{Edge, FunctionRef, LoopEnd, NodeId, ParameterBinding, Payload, Task, TaskKind, TaskState};
