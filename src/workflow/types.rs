/// Core task graph type definitions
///
/// Defines tasks, their execution variants, parameter bindings and edges.
/// These types serialize directly into the graph specification document, so
/// field names double as the on-disk format.

use crate::error::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Untyped key/value payload exchanged between tasks
pub type Payload = Map<String, Value>;

/// Identifier of a task node, unique within its graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a local function
///
/// Named functions are looked up in a `FunctionRegistry` when a run starts.
/// Lua functions carry their own script and are portable with the spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionRef {
    /// Function registered under this name
    Named(String),
    /// Inline Lua chunk reading the global `input` table and returning a table
    Lua(String),
}

/// Loop-end designation: a node id, or a title resolved when the run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopEnd {
    Node(NodeId),
    Title(String),
}

/// Execution strategy of a task
///
/// Closed set of variants so dispatch in the executor is exhaustive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum TaskKind {
    /// Call a remote endpoint through the injected `CallerAdapter`
    /// Expected config: whatever the endpoint accepts
    RemoteCall { endpoint: String },

    /// Invoke a local pure function with the merged input
    LocalFunction { function: FunctionRef },

    /// Fan the body between this task and `loop_end` out over the array
    /// found under `mapper_arg` in the merged input
    Loop {
        mapper_arg: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        loop_end: Option<LoopEnd>,
    },

    /// Output equals input; used for providers, joins and collectors
    #[default]
    Passthrough,
}

impl TaskKind {
    pub fn remote(endpoint: impl Into<String>) -> Self {
        TaskKind::RemoteCall { endpoint: endpoint.into() }
    }

    pub fn function(name: impl Into<String>) -> Self {
        TaskKind::LocalFunction { function: FunctionRef::Named(name.into()) }
    }

    pub fn lua(script: impl Into<String>) -> Self {
        TaskKind::LocalFunction { function: FunctionRef::Lua(script.into()) }
    }

    /// Loop over `mapper_arg`; the loop end is set later with `Workflow::set_loop_end`
    /// or given by title up front via `looped_until`
    pub fn looped(mapper_arg: impl Into<String>) -> Self {
        TaskKind::Loop { mapper_arg: mapper_arg.into(), loop_end: None }
    }

    pub fn looped_until(mapper_arg: impl Into<String>, loop_end: LoopEnd) -> Self {
        TaskKind::Loop { mapper_arg: mapper_arg.into(), loop_end: Some(loop_end) }
    }

    /// Short variant name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::RemoteCall { .. } => "remote_call",
            TaskKind::LocalFunction { .. } => "local_function",
            TaskKind::Loop { .. } => "loop",
            TaskKind::Passthrough => "passthrough",
        }
    }
}

fn default_store_output() -> bool {
    true
}

/// A single task node definition
///
/// Holds only what is persisted in a spec. Per-run state (attempts, output,
/// lifecycle) lives in the run's status board so every run starts clean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique node identifier within the graph
    pub id: NodeId,
    /// Human-readable label, not used for control flow
    pub title: String,
    /// Variant and variant-specific settings
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Constant inputs merged first at dispatch time
    #[serde(default)]
    pub config: Payload,
    /// Additional attempts allowed after the first failure
    #[serde(default)]
    pub retry_count: u32,
    /// Whether input/output are written under the run's project directory
    #[serde(default = "default_store_output")]
    pub store_output: bool,
}

impl Task {
    pub fn new(id: NodeId, title: impl Into<String>, kind: TaskKind, config: Payload) -> Self {
        Self {
            id,
            title: title.into(),
            kind,
            config,
            retry_count: 0,
            store_output: true,
        }
    }

    /// Merge constant inputs into the task config
    pub fn set_input(&mut self, input: Payload) {
        self.config.extend(input);
    }
}

/// Lifecycle state of a task within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Skipped)
    }
}

/// Mapping of a source task's output keys onto a target task's input keys
///
/// An empty key list forwards the whole output. Keys are matched exactly;
/// no case folding is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterBinding {
    #[serde(default)]
    pub source_output_keys: Vec<String>,
    #[serde(default)]
    pub key_renames: BTreeMap<String, String>,
}

impl ParameterBinding {
    /// Forward the entire source output
    pub fn all() -> Self {
        Self::default()
    }

    /// Forward only the given keys, unrenamed
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        keys.into_iter().fold(Self::default(), |binding, key| binding.select(key))
    }

    pub fn select(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        if !self.source_output_keys.contains(&key) {
            self.source_output_keys.push(key);
        }
        self
    }

    /// Forward `from` under the name `to`; also selects `from`
    pub fn rename(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        let from = from.into();
        let mut binding = self.select(from.clone());
        binding.key_renames.insert(from, to.into());
        binding
    }

    pub fn forwards_all(&self) -> bool {
        self.source_output_keys.is_empty()
    }

    /// Target key name for a source key
    pub fn target_key<'a>(&'a self, source_key: &'a str) -> &'a str {
        self.key_renames
            .get(source_key)
            .map(String::as_str)
            .unwrap_or(source_key)
    }

    /// Copy the selected (and renamed) entries of `output` into `input`
    pub fn apply(
        &self,
        from: NodeId,
        to: NodeId,
        output: &Payload,
        input: &mut Payload,
    ) -> Result<(), TaskError> {
        if self.forwards_all() {
            for (key, value) in output {
                input.insert(self.target_key(key).to_string(), value.clone());
            }
            return Ok(());
        }

        for key in &self.source_output_keys {
            let value = output.get(key).ok_or_else(|| TaskError::Binding {
                from,
                to,
                key: key.clone(),
            })?;
            input.insert(self.target_key(key).to_string(), value.clone());
        }
        Ok(())
    }
}

/// Connection between two tasks carrying a parameter binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node ID
    pub source: NodeId,
    /// Target node ID
    pub target: NodeId,
    #[serde(flatten)]
    pub binding: ParameterBinding,
}

/// Build a payload from a `json!` object literal; non-objects yield an empty payload
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rename_selects_and_maps_key() {
        let binding = ParameterBinding::all().rename("mol", "ligand_file");
        assert_eq!(binding.source_output_keys, vec!["mol".to_string()]);

        let output = payload(json!({"mol": "C1CC1", "charge": 0}));
        let mut input = Payload::new();
        binding.apply(NodeId(1), NodeId(2), &output, &mut input).unwrap();

        assert_eq!(input, payload(json!({"ligand_file": "C1CC1"})));
    }

    #[test]
    fn empty_binding_forwards_everything() {
        let output = payload(json!({"a": 1, "b": 2}));
        let mut input = payload(json!({"c": 3}));
        ParameterBinding::all()
            .apply(NodeId(1), NodeId(2), &output, &mut input)
            .unwrap();
        assert_eq!(input.len(), 3);
    }

    #[test]
    fn missing_key_is_not_case_folded() {
        let output = payload(json!({"PATH": "/tmp/a.mol2"}));
        let mut input = Payload::new();
        let err = ParameterBinding::keys(["path"])
            .apply(NodeId(6), NodeId(7), &output, &mut input)
            .unwrap_err();
        assert_eq!(
            err,
            TaskError::Binding { from: NodeId(6), to: NodeId(7), key: "path".to_string() }
        );
        assert!(!err.is_retryable());
    }

    #[test]
    fn task_kind_serializes_with_variant_tag() {
        let task = Task::new(NodeId(3), "Make_3D", TaskKind::remote("structures.make3d"), Payload::new());
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["variant"], "remote_call");
        assert_eq!(value["endpoint"], "structures.make3d");
        assert_eq!(value["store_output"], true);

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn loop_end_accepts_id_or_title() {
        let by_id: Task = serde_json::from_value(json!({
            "id": 2, "title": "Loop", "variant": "loop", "mapper_arg": "smiles", "loop_end": 5
        }))
        .unwrap();
        assert_eq!(
            by_id.kind,
            TaskKind::looped_until("smiles", LoopEnd::Node(NodeId(5)))
        );

        let by_title: Task = serde_json::from_value(json!({
            "id": 2, "title": "Loop", "variant": "loop", "mapper_arg": "smiles", "loop_end": "Collector"
        }))
        .unwrap();
        assert_eq!(
            by_title.kind,
            TaskKind::looped_until("smiles", LoopEnd::Title("Collector".into()))
        );
    }
}
