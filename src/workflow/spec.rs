/// Graph specification document codec
///
/// Serializes the structure of a graph (tasks, edges, bindings) to pretty JSON
/// and restores it with node ids preserved. Runtime state is never part of a
/// spec, so a loaded graph always starts every task at `pending`.

use crate::error::SpecError;
use crate::workflow::graph::GraphStore;
use crate::workflow::types::{Edge, LoopEnd, Task, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Current document format version
pub const SPEC_VERSION: u32 = 1;

/// On-disk representation of a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    /// Format version, checked on load
    pub version: u32,
    /// Free-form description of the workflow
    #[serde(default)]
    pub description: String,
    /// Task definitions in ascending id order
    pub nodes: Vec<Task>,
    /// Edges in insertion order
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Save/load entry points for graph specs
pub struct SpecCodec;

impl SpecCodec {
    /// Snapshot the structure of a graph
    pub fn to_spec(graph: &GraphStore, description: &str) -> GraphSpec {
        GraphSpec {
            version: SPEC_VERSION,
            description: description.to_string(),
            nodes: graph.tasks().cloned().collect(),
            edges: graph.edges().to_vec(),
        }
    }

    pub fn to_string(graph: &GraphStore, description: &str) -> Result<String, SpecError> {
        Ok(serde_json::to_string_pretty(&Self::to_spec(graph, description))?)
    }

    /// Parse and validate a spec document, returning the graph and its description
    pub fn from_str(text: &str) -> Result<(GraphStore, String), SpecError> {
        let spec: GraphSpec = serde_json::from_str(text)?;
        let description = spec.description.clone();
        Ok((Self::from_spec(spec)?, description))
    }

    /// Rebuild a graph from a parsed spec
    ///
    /// Rejects unsupported versions, duplicate ids, edges referencing unknown
    /// ids, cycles and loop ends naming unknown ids. Loops without an end are
    /// accepted here, as they are while building; `ExecutionEngine::start`
    /// rejects them.
    pub fn from_spec(spec: GraphSpec) -> Result<GraphStore, SpecError> {
        if spec.version != SPEC_VERSION {
            return Err(SpecError::Malformed(format!(
                "unsupported spec version {} (expected {})",
                spec.version, SPEC_VERSION
            )));
        }

        let mut graph = GraphStore::new();
        let mut seen = BTreeSet::new();
        for task in spec.nodes {
            if !seen.insert(task.id) {
                return Err(SpecError::Malformed(format!("duplicate node id {}", task.id)));
            }
            graph.insert_task(task);
        }

        for edge in spec.edges {
            for id in [edge.source, edge.target] {
                if !graph.contains(id) {
                    return Err(SpecError::Malformed(format!(
                        "edge {} -> {} references unknown node {}",
                        edge.source, edge.target, id
                    )));
                }
            }
            graph
                .connect(edge.source, edge.target, edge.binding)
                .map_err(|e| SpecError::Malformed(e.to_string()))?;
        }

        for task in graph.tasks() {
            if let TaskKind::Loop { loop_end: Some(LoopEnd::Node(end)), .. } = &task.kind {
                if !graph.contains(*end) {
                    return Err(SpecError::Malformed(format!(
                        "loop task {} references unknown loop end {}",
                        task.id, end
                    )));
                }
            }
        }

        tracing::debug!("📥 Loaded graph spec with {} tasks and {} edges", graph.len(), graph.edges().len());
        Ok(graph)
    }

    /// Write the spec of `graph` to `path`
    pub fn save(graph: &GraphStore, description: &str, path: impl AsRef<Path>) -> Result<(), SpecError> {
        let path = path.as_ref();
        std::fs::write(path, Self::to_string(graph, description)?)?;
        tracing::info!("💾 Saved workflow spec to {}", path.display());
        Ok(())
    }

    /// Read a spec from `path`
    pub fn load(path: impl AsRef<Path>) -> Result<(GraphStore, String), SpecError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let loaded = Self::from_str(&text)?;
        tracing::info!("📂 Loaded workflow spec from {}", path.display());
        Ok(loaded)
    }
}
