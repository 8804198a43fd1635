/// Workflow facade: build a task graph, persist it and run it
///
/// A `Workflow` owns one graph plus everything a run needs (caller adapter,
/// function registry, engine configuration). Structural edits are rejected
/// with `GraphError::Frozen` while a run started from it is in progress.

use crate::config::EngineConfig;
use crate::error::{GraphError, SpecError};
use crate::runtime::caller::{CallerAdapter, Disconnected};
use crate::runtime::engine::{ExecutionEngine, RunHandle, RunRequest};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::functions::FunctionRegistry;
use crate::workflow::graph::GraphStore;
use crate::workflow::spec::SpecCodec;
use crate::workflow::types::{LoopEnd, NodeId, ParameterBinding, Payload, TaskKind};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;

pub struct Workflow {
    description: String,
    graph: GraphStore,
    /// Per-run inputs, merged last and never persisted
    inputs: HashMap<NodeId, Payload>,
    caller: Arc<dyn CallerAdapter>,
    functions: FunctionRegistry,
    config: EngineConfig,
    /// Running flag of the most recent run
    running: Option<watch::Receiver<bool>>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("description", &self.description)
            .field("tasks", &self.graph.len())
            .field("edges", &self.graph.edges().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Workflow {
    /// Empty workflow with a disconnected caller and default engine settings
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            graph: GraphStore::new(),
            inputs: HashMap::new(),
            caller: Arc::new(Disconnected),
            functions: FunctionRegistry::new(),
            config: EngineConfig::default(),
            running: None,
        }
    }

    /// Workflow with the graph stored at `path`
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SpecError> {
        let (graph, description) = SpecCodec::load(path)?;
        let mut workflow = Self::new(description);
        workflow.graph = graph;
        Ok(workflow)
    }

    pub fn with_caller(mut self, caller: Arc<dyn CallerAdapter>) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_functions(mut self, functions: FunctionRegistry) -> Self {
        self.functions = functions;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn graph(&self) -> &GraphStore {
        &self.graph
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    /// True while the most recent run has not finished
    pub fn is_running(&self) -> bool {
        self.running.as_ref().is_some_and(|running| *running.borrow())
    }

    fn ensure_idle(&self) -> Result<(), GraphError> {
        if self.is_running() {
            return Err(GraphError::Frozen);
        }
        Ok(())
    }

    /// Add a task with an empty config and return its id
    pub fn add_task(&mut self, title: impl Into<String>, kind: TaskKind) -> Result<NodeId, GraphError> {
        self.ensure_idle()?;
        self.graph.add_task(title, kind, Payload::new())
    }

    /// Merge constant inputs into a task's persisted config
    pub fn set_input(&mut self, id: NodeId, input: Payload) -> Result<(), GraphError> {
        self.ensure_idle()?;
        self.graph.task_mut(id)?.set_input(input);
        Ok(())
    }

    pub fn set_retry_count(&mut self, id: NodeId, retry_count: u32) -> Result<(), GraphError> {
        self.ensure_idle()?;
        self.graph.task_mut(id)?.retry_count = retry_count;
        Ok(())
    }

    pub fn set_store_output(&mut self, id: NodeId, store_output: bool) -> Result<(), GraphError> {
        self.ensure_idle()?;
        self.graph.task_mut(id)?.store_output = store_output;
        Ok(())
    }

    /// Point a loop task at its loop-end task
    pub fn set_loop_end(&mut self, loop_id: NodeId, end: NodeId) -> Result<(), GraphError> {
        self.ensure_idle()?;
        if !self.graph.contains(end) {
            return Err(GraphError::UnknownNode(end));
        }
        match &mut self.graph.task_mut(loop_id)?.kind {
            TaskKind::Loop { loop_end, .. } => {
                *loop_end = Some(LoopEnd::Node(end));
                Ok(())
            }
            _ => Err(GraphError::InvalidLoop {
                node: loop_id,
                reason: "not a loop task".to_string(),
            }),
        }
    }

    /// Connect two tasks; the edge is rejected if it would close a cycle
    pub fn connect_task(
        &mut self,
        source: NodeId,
        target: NodeId,
        binding: ParameterBinding,
    ) -> Result<(), GraphError> {
        self.ensure_idle()?;
        self.graph.connect(source, target, binding)
    }

    /// Merge per-run input for a task; applied after config and bindings
    pub fn input(&mut self, id: NodeId, input: Payload) -> Result<(), GraphError> {
        if !self.graph.contains(id) {
            return Err(GraphError::UnknownNode(id));
        }
        self.inputs.entry(id).or_default().extend(input);
        Ok(())
    }

    pub fn clear_inputs(&mut self) {
        self.inputs.clear();
    }

    /// Persist the graph (not per-run inputs) as a JSON spec
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), SpecError> {
        SpecCodec::save(&self.graph, &self.description, path)
    }

    /// Replace the graph and description with the spec stored at `path`
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<(), SpecError> {
        self.ensure_idle()?;
        let (graph, description) = SpecCodec::load(path)?;
        self.graph = graph;
        self.description = description;
        self.inputs.clear();
        Ok(())
    }

    /// Start a run in the background
    ///
    /// Artifacts go to `project_dir`, falling back to the configured project
    /// directory. Fails without dispatching anything when the graph has an
    /// unresolvable loop or an unregistered function, or when a previous run
    /// is still in progress.
    pub fn run(&mut self, project_dir: Option<&Path>) -> Result<RunHandle, GraphError> {
        self.ensure_idle()?;

        let executor = TaskExecutor::new(Arc::clone(&self.caller), self.functions.clone(), &self.config);
        let engine = ExecutionEngine::new(Arc::new(executor), self.config.clone());
        let request = RunRequest {
            inputs: self.inputs.clone(),
            project_dir: project_dir.map(PathBuf::from),
            description: self.description.clone(),
        };

        let handle = engine.start(&self.graph, request)?;
        self.running = Some(handle.running_signal());
        Ok(handle)
    }
}
