/// Task graph execution engine
///
/// Drives one run of a frozen graph: tasks are dispatched as soon as all their
/// predecessors completed, independent tasks run concurrently, failures are
/// retried per task and otherwise skip the failed task's descendants while
/// unrelated branches drain to completion. Loop tasks fan their body out into
/// one sub-run per element.

use crate::config::EngineConfig;
use crate::error::{GraphError, RunError, TaskError};
use crate::runtime::executor::TaskExecutor;
use crate::runtime::state::{ElementOutcome, LoopAggregate, RunReport, StatusBoard, TaskStatus};
use crate::runtime::store::ArtifactStore;
use crate::workflow::graph::GraphStore;
use crate::workflow::spec::SpecCodec;
use crate::workflow::types::{FunctionRef, NodeId, Payload, Task, TaskKind, TaskState};
use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Per-run parameters
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Inputs merged last into a task's input, keyed by task
    pub inputs: HashMap<NodeId, Payload>,
    /// Where `store_output` artifacts go (None = nothing written)
    pub project_dir: Option<PathBuf>,
    /// Description recorded in the stored spec
    pub description: String,
}

/// Execution engine for task graphs
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    /// Executor for individual task attempts
    executor: Arc<TaskExecutor>,
    config: EngineConfig,
}

/// Everything a run needs, shared by all of its scopes
struct RunContext {
    run_id: Uuid,
    graph: Arc<GraphStore>,
    executor: Arc<TaskExecutor>,
    inputs: HashMap<NodeId, Payload>,
    retry_delay: std::time::Duration,
    cancel: CancellationToken,
}

/// A set of tasks scheduled together: the whole graph, or one loop element
struct Scope {
    /// Tasks owned by this scope
    members: BTreeSet<NodeId>,
    /// Status of every member
    board: Arc<StatusBoard>,
    /// Completed outputs visible from outside the scope
    external: HashMap<NodeId, Payload>,
    store: Option<ArtifactStore>,
    label: String,
}

impl Scope {
    fn state(&self, id: NodeId) -> Option<TaskState> {
        if self.external.contains_key(&id) {
            return Some(TaskState::Completed);
        }
        self.board.state(id)
    }

    fn output(&self, id: NodeId) -> Option<Payload> {
        if let Some(output) = self.external.get(&id) {
            return Some(output.clone());
        }
        self.board.get(id).and_then(|status| status.output.clone())
    }
}

/// Sets `is_running` to false when the run task ends, even on panic
struct RunningGuard(watch::Sender<bool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

impl ExecutionEngine {
    /// Create new execution engine with task executor
    pub fn new(executor: Arc<TaskExecutor>, config: EngineConfig) -> Self {
        Self { executor, config }
    }

    /// Validate `graph` and start running it in the background
    ///
    /// Structural problems (unresolvable loops, unregistered functions) are
    /// returned here before anything is dispatched. On success the returned
    /// handle already reports `is_running() == true`. Must be called from
    /// within a tokio runtime.
    pub fn start(&self, graph: &GraphStore, request: RunRequest) -> Result<RunHandle, GraphError> {
        graph.validate()?;
        for task in graph.tasks() {
            if let TaskKind::LocalFunction { function } = &task.kind {
                if !self.executor.functions().resolves(function) {
                    let name = match function {
                        FunctionRef::Named(name) => name.clone(),
                        FunctionRef::Lua(_) => "<lua>".to_string(),
                    };
                    return Err(GraphError::UnknownFunction { node: task.id, name });
                }
            }
        }

        let mut frozen = graph.clone();
        frozen.freeze();
        let graph = Arc::new(frozen);

        let run_id = Uuid::new_v4();
        let board = Arc::new(StatusBoard::new(graph.node_ids()));
        let (running_tx, running_rx) = watch::channel(true);
        let cancel = CancellationToken::new();

        let project_dir = request
            .project_dir
            .or_else(|| self.config.project_dir.as_ref().map(PathBuf::from));
        let context = RunContext {
            run_id,
            graph,
            executor: Arc::clone(&self.executor),
            inputs: request.inputs,
            retry_delay: self.config.retry_delay(),
            cancel: cancel.clone(),
        };

        let run_board = Arc::clone(&board);
        let description = request.description;
        let join = tokio::spawn(async move {
            let _running = RunningGuard(running_tx);
            execute_run(context, run_board, project_dir.map(ArtifactStore::new), description).await
        });

        Ok(RunHandle {
            run_id,
            board,
            running: running_rx,
            cancel,
            join,
        })
    }
}

/// Handle on a background run
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    board: Arc<StatusBoard>,
    running: watch::Receiver<bool>,
    cancel: CancellationToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// True until every task reached a terminal state and the report is built
    pub fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    /// Receiver of the `is_running` flag, for owners that wait elsewhere
    pub fn running_signal(&self) -> watch::Receiver<bool> {
        self.running.clone()
    }

    /// Wait until the run has finished without consuming the handle
    pub async fn finished(&self) {
        let mut running = self.running.clone();
        let _ = running.wait_for(|is_running| !*is_running).await;
    }

    /// Current status of one task
    pub fn status(&self, id: NodeId) -> Option<TaskStatus> {
        self.board.get(id).map(|status| TaskStatus::clone(&status))
    }

    /// Current status of every task
    pub fn snapshot(&self) -> BTreeMap<NodeId, TaskStatus> {
        self.board.snapshot()
    }

    /// Stop issuing new dispatches; in-flight calls are allowed to return
    pub fn cancel(&self) {
        tracing::info!("🛑 Cancellation requested for run {}", self.run_id);
        self.cancel.cancel();
    }

    /// Wait for the run to finish and return its report
    pub async fn wait(self) -> Result<RunReport, RunError> {
        self.join.await.map_err(|e| RunError::Aborted(e.to_string()))
    }
}

async fn execute_run(
    context: RunContext,
    board: Arc<StatusBoard>,
    store: Option<ArtifactStore>,
    description: String,
) -> RunReport {
    let started_at = Utc::now();
    let run_start_time = std::time::Instant::now();
    tracing::info!("🚀 Starting run {} with {} tasks and {} edges",
        context.run_id, context.graph.len(), context.graph.edges().len());

    if let Some(store) = &store {
        let spec = SpecCodec::to_spec(&context.graph, &description);
        if let Err(e) = store.write_document("workflow.json", &spec).await {
            tracing::warn!("⚠️ Failed to store workflow spec in {}: {}", store.root().display(), e);
        }
    }

    let scope = Scope {
        members: context.graph.node_ids().collect(),
        board: Arc::clone(&board),
        external: HashMap::new(),
        store: store.clone(),
        label: format!("run {}", context.run_id),
    };
    drive(&context, &scope).await;

    let report = RunReport::collect(context.run_id, &board, context.cancel.is_cancelled(), started_at);

    if let Some(store) = &store {
        if let Err(e) = store.write_document("run.json", &report).await {
            tracing::warn!("⚠️ Failed to store run report in {}: {}", store.root().display(), e);
        }
    }

    tracing::info!("🎉 Run {} finished as {:?} in {:?} ({} failed, {} skipped)",
        context.run_id, report.outcome, run_start_time.elapsed(), report.failed.len(), report.skipped.len());
    report
}

/// Schedule every member of `scope` until all are terminal
fn drive<'a>(context: &'a RunContext, scope: &'a Scope) -> BoxFuture<'a, ()> {
    async move {
        let graph = &context.graph;

        // Loops claim their bodies; claimed tasks run inside element sub-runs
        let mut bodies: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        let mut claimed = BTreeSet::new();
        for id in graph.topological_order() {
            if !scope.members.contains(&id) || claimed.contains(&id) {
                continue;
            }
            if matches!(graph.task(id).map(|task| &task.kind), Ok(TaskKind::Loop { .. })) {
                let body = graph.loop_body(id).unwrap_or_default();
                claimed.extend(body.iter().copied());
                bodies.insert(id, body);
            }
        }

        // What each schedulable task waits on; loops also wait on inputs their body reads from outside
        let mut pending: BTreeSet<NodeId> = scope.members.difference(&claimed).copied().collect();
        let dependencies: HashMap<NodeId, Vec<NodeId>> = pending
            .iter()
            .map(|&id| {
                let mut deps = graph.predecessors(id);
                if let Some(body) = bodies.get(&id) {
                    for member in body {
                        for pred in graph.predecessors(*member) {
                            if pred != id && !body.contains(&pred) && !deps.contains(&pred) {
                                deps.push(pred);
                            }
                        }
                    }
                }
                (id, deps)
            })
            .collect();

        tracing::debug!("📋 {}: scheduling {} tasks ({} loops)", scope.label, pending.len(), bodies.len());

        let mut in_flight = FuturesUnordered::new();
        loop {
            if context.cancel.is_cancelled() && !pending.is_empty() {
                tracing::warn!("⏸️ {}: cancelled, skipping {} undispatched tasks", scope.label, pending.len());
                for id in std::mem::take(&mut pending) {
                    settle_skipped(scope, id, bodies.get(&id), &TaskError::Cancelled.to_string());
                }
            }

            // Skip everything downstream of a failure, repeating until stable
            loop {
                let blocked: Vec<NodeId> = pending
                    .iter()
                    .copied()
                    .filter(|id| {
                        dependencies[id].iter().any(|dep| {
                            matches!(scope.state(*dep), Some(TaskState::Failed | TaskState::Skipped))
                        })
                    })
                    .collect();
                if blocked.is_empty() {
                    break;
                }
                for id in blocked {
                    pending.remove(&id);
                    tracing::info!("⏭️ {}: skipping task {} (upstream failure)", scope.label, id);
                    settle_skipped(scope, id, bodies.get(&id), "upstream task failed");
                }
            }

            // Ready tasks in ascending id order
            let ready: Vec<NodeId> = pending
                .iter()
                .copied()
                .filter(|id| {
                    dependencies[id]
                        .iter()
                        .all(|dep| scope.state(*dep) == Some(TaskState::Completed))
                })
                .collect();
            for id in ready {
                pending.remove(&id);
                let dispatch = match bodies.get(&id) {
                    Some(body) => dispatch_loop(context, scope, id, body.clone()).boxed(),
                    None => dispatch_task(context, scope, id).boxed(),
                };
                in_flight.push(dispatch);
            }

            if in_flight.next().await.is_none() {
                break;
            }
        }

        // Unreachable in a valid graph: dependencies outside the scope that never completed
        for id in pending {
            tracing::warn!("⚠️ {}: task {} never became ready", scope.label, id);
            settle_skipped(scope, id, bodies.get(&id), "dependencies never completed");
        }
    }
    .boxed()
}

fn skip_tasks(scope: &Scope, ids: impl IntoIterator<Item = NodeId>, reason: &str) {
    for id in ids {
        scope.board.update(id, |status| {
            status.state = TaskState::Skipped;
            status.error = Some(reason.to_string());
            status.finished_at = Some(Utc::now());
        });
    }
}

/// Mark a task, and the body of a loop task, as skipped
fn settle_skipped(scope: &Scope, id: NodeId, body: Option<&BTreeSet<NodeId>>, reason: &str) {
    skip_tasks(scope, std::iter::once(id).chain(body.into_iter().flatten().copied()), reason);
}

/// Merge config, bound outputs of predecessors and per-run input, in that order
fn resolve_input(context: &RunContext, scope: &Scope, task: &Task) -> Result<Payload, TaskError> {
    let mut input = task.config.clone();

    for edge in context.graph.incoming(task.id) {
        let output = scope.output(edge.source).unwrap_or_default();
        edge.binding.apply(edge.source, task.id, &output, &mut input)?;
    }

    if let Some(extra) = context.inputs.get(&task.id) {
        input.extend(extra.clone());
    }

    tracing::debug!("🔌 Resolved {} input keys for task {}", input.len(), task.id);
    Ok(input)
}

fn mark_failed(scope: &Scope, id: NodeId, error: &TaskError) {
    scope.board.update(id, |status| {
        status.state = TaskState::Failed;
        status.error = Some(error.to_string());
        status.finished_at = Some(Utc::now());
    });
}

/// Run a non-loop task to a terminal state, retrying per its policy
async fn dispatch_task(context: &RunContext, scope: &Scope, id: NodeId) {
    let Ok(task) = context.graph.task(id) else {
        return;
    };

    scope.board.update(id, |status| {
        status.state = TaskState::Running;
        status.started_at = Some(Utc::now());
    });

    let input = match resolve_input(context, scope, task) {
        Ok(input) => input,
        Err(e) => {
            tracing::error!("❌ {}: task {} has a broken binding: {}", scope.label, id, e);
            mark_failed(scope, id, &e);
            return;
        }
    };

    let mut attempts_made = 0;
    loop {
        attempts_made += 1;
        scope.board.update(id, |status| status.attempts_made = attempts_made);

        match context.executor.execute(task, &input).await {
            Ok(output) => {
                if task.store_output {
                    if let Some(store) = &scope.store {
                        if let Err(e) = store.write_task(task, &input, &output).await {
                            tracing::warn!("⚠️ Failed to store output of task {}: {}", id, e);
                        }
                    }
                }
                scope.board.update(id, |status| {
                    status.state = TaskState::Completed;
                    status.output = Some(output);
                    status.error = None;
                    status.finished_at = Some(Utc::now());
                });
                return;
            }
            Err(e) if e.is_retryable() && attempts_made <= task.retry_count && !context.cancel.is_cancelled() => {
                tracing::warn!("🔁 {}: task {} failed attempt {}/{}: {}; retrying",
                    scope.label, id, attempts_made, task.retry_count.saturating_add(1), e);
                scope.board.update(id, |status| status.error = Some(e.to_string()));
                if !context.retry_delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(context.retry_delay) => {}
                        _ = context.cancel.cancelled() => {}
                    }
                }
                if context.cancel.is_cancelled() {
                    tracing::error!("❌ {}: task {} not retried, run cancelled: {}", scope.label, id, e);
                    mark_failed(scope, id, &e);
                    return;
                }
            }
            Err(e) => {
                tracing::error!("❌ {}: task {} failed after {} attempt(s): {}", scope.label, id, attempts_made, e);
                mark_failed(scope, id, &e);
                return;
            }
        }
    }
}

/// Expand a loop task over its mapper array and settle its body and loop end
async fn dispatch_loop(context: &RunContext, scope: &Scope, id: NodeId, body: BTreeSet<NodeId>) {
    let graph = &context.graph;
    let Ok(task) = graph.task(id) else {
        return;
    };
    let TaskKind::Loop { mapper_arg, .. } = &task.kind else {
        return;
    };

    scope.board.update(id, |status| {
        status.state = TaskState::Running;
        status.attempts_made = 1;
        status.started_at = Some(Utc::now());
    });

    let expansion = resolve_input(context, scope, task).and_then(|input| {
        let end = graph.loop_end(id).map_err(|e| TaskError::Loop(e.to_string()))?;
        if !body.is_subset(&scope.members) {
            return Err(TaskError::Loop("loop body crosses the enclosing loop boundary".to_string()));
        }
        let elements = match input.get(mapper_arg) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => {
                return Err(TaskError::Loop(format!(
                    "input '{}' must be an array, got {}",
                    mapper_arg, other
                )))
            }
            None => return Err(TaskError::Loop(format!("input has no '{}' to iterate", mapper_arg))),
        };
        Ok((input, end, elements))
    });

    let (input, end, elements) = match expansion {
        Ok(expansion) => expansion,
        Err(e) => {
            tracing::error!("❌ {}: loop {} could not expand: {}", scope.label, id, e);
            mark_failed(scope, id, &e);
            skip_tasks(scope, body.iter().copied(), "loop task failed");
            return;
        }
    };

    scope.board.update(id, |status| {
        status.state = TaskState::Completed;
        status.output = Some(input.clone());
        status.finished_at = Some(Utc::now());
    });
    tracing::info!("🔁 {}: loop {} fanning out over {} elements", scope.label, id, elements.len());

    // Outputs the body reads from outside the loop, captured once for every element
    let mut shared = HashMap::new();
    for member in &body {
        for pred in graph.predecessors(*member) {
            if pred != id && !body.contains(&pred) {
                if let Some(output) = scope.output(pred) {
                    shared.insert(pred, output);
                }
            }
        }
    }

    for member in &body {
        scope.board.update(*member, |status| {
            status.state = TaskState::Running;
            status.started_at = Some(Utc::now());
        });
    }

    let runs = elements.iter().enumerate().map(|(index, element)| {
        let mut element_input = input.clone();
        element_input.insert(mapper_arg.clone(), element.clone());
        let mut external = shared.clone();
        external.insert(id, element_input);

        let child = Scope {
            members: body.clone(),
            board: Arc::new(StatusBoard::new(body.iter().copied())),
            external,
            store: scope.store.as_ref().map(|store| store.element(id, index)),
            label: format!("{} loop {} element {}", scope.label, id, index),
        };
        run_element(context, child, end, index, element.clone())
    });
    let outcomes = join_all(runs).await;

    let aggregate = LoopAggregate {
        elements: outcomes.into_iter().collect(),
    };
    settle_loop_body(scope, &body, end, aggregate);
}

/// Run one element sub-run and summarize it
async fn run_element(
    context: &RunContext,
    child: Scope,
    end: NodeId,
    index: usize,
    element: Value,
) -> (usize, ElementOutcome) {
    drive(context, &child).await;

    let tasks = child.board.snapshot();
    let failed_tasks: Vec<NodeId> = tasks
        .iter()
        .filter(|(_, status)| status.state == TaskState::Failed)
        .map(|(id, _)| *id)
        .collect();
    let end_status = tasks.get(&end).cloned().unwrap_or_default();

    let error = if end_status.state == TaskState::Completed {
        None
    } else if failed_tasks.is_empty() {
        end_status.error.clone()
    } else {
        Some(
            failed_tasks
                .iter()
                .map(|id| {
                    let message = tasks[id].error.as_deref().unwrap_or("failed");
                    format!("task {}: {}", id, message)
                })
                .collect::<Vec<_>>()
                .join("; "),
        )
    };

    match &error {
        None => tracing::debug!("✅ {}: completed", child.label),
        Some(message) => tracing::warn!("⚠️ {}: did not complete: {}", child.label, message),
    }

    let outcome = ElementOutcome {
        element,
        state: end_status.state,
        output: end_status.output,
        error,
        failed_tasks,
        tasks,
    };
    (index, outcome)
}

/// Publish aggregated body states and the loop-end result in the enclosing scope
fn settle_loop_body(scope: &Scope, body: &BTreeSet<NodeId>, end: NodeId, aggregate: LoopAggregate) {
    let now = Utc::now();

    for member in body.iter().filter(|member| **member != end) {
        let states: Vec<TaskState> = aggregate
            .elements
            .values()
            .filter_map(|outcome| outcome.tasks.get(member).map(|status| status.state))
            .collect();
        let attempts = aggregate
            .elements
            .values()
            .filter_map(|outcome| outcome.tasks.get(member).map(|status| status.attempts_made))
            .max()
            .unwrap_or_default();
        let failed_in: Vec<usize> = aggregate
            .elements
            .iter()
            .filter(|(_, outcome)| outcome.failed_tasks.contains(member))
            .map(|(index, _)| *index)
            .collect();

        scope.board.update(*member, |status| {
            status.attempts_made = attempts;
            status.finished_at = Some(now);
            if !failed_in.is_empty() {
                status.state = TaskState::Failed;
                status.error = Some(format!("failed in loop element(s) {:?}", failed_in));
            } else if states.iter().all(|state| *state == TaskState::Completed) {
                status.state = TaskState::Completed;
            } else {
                status.state = TaskState::Skipped;
            }
        });
    }

    let failed = aggregate.failed_elements();
    // Elements that only stopped because the run was cancelled leave the end skipped
    let any_task_failed = aggregate.elements.values().any(|outcome| !outcome.failed_tasks.is_empty());
    let output = aggregate.to_output();
    scope.board.update(end, |status| {
        status.finished_at = Some(now);
        status.attempts_made = 1;
        let error = TaskError::LoopElement { failed: failed.clone() };
        if failed.is_empty() {
            status.state = TaskState::Completed;
            status.output = Some(output);
        } else if any_task_failed {
            status.state = TaskState::Failed;
            status.error = Some(error.to_string());
        } else {
            status.state = TaskState::Skipped;
            status.error = Some(error.to_string());
        }
        status.loop_aggregate = Some(aggregate);
    });

    if failed.is_empty() {
        tracing::info!("✅ Loop end {} collected all element results", end);
    } else if !any_task_failed {
        tracing::warn!("⏭️ Loop end {} skipped: {} element(s) did not finish", end, failed.len());
    } else {
        tracing::error!("❌ Loop end {} failed: {} element(s) did not complete", end, failed.len());
    }
}
