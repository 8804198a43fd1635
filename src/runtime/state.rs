/// Per-run task status board and run reports
///
/// Every task status is held in its own `ArcSwap`, so a transition is published
/// as one pointer swap: pollers never observe a half-updated status. The
/// engine is the only writer.

use crate::workflow::types::{NodeId, Payload, TaskState};
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;

/// Runtime status of one task within one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub attempts_made: u32,
    /// Set once on completion and never changed afterwards
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-element results, present on loop-end tasks only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_aggregate: Option<LoopAggregate>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            state: TaskState::Pending,
            attempts_made: 0,
            output: None,
            error: None,
            started_at: None,
            finished_at: None,
            loop_aggregate: None,
        }
    }
}

/// Result of one loop element sub-run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementOutcome {
    /// The element injected into this sub-run
    pub element: Value,
    /// Terminal state of the loop-end task in this sub-run
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Payload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Body tasks that failed in this sub-run
    #[serde(default)]
    pub failed_tasks: Vec<NodeId>,
    /// Status of every body task in this sub-run
    #[serde(default)]
    pub tasks: BTreeMap<NodeId, TaskStatus>,
}

/// Loop results keyed by element index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopAggregate {
    pub elements: BTreeMap<usize, ElementOutcome>,
}

impl LoopAggregate {
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Elements whose sub-run did not complete, with their error messages
    pub fn failed_elements(&self) -> BTreeMap<usize, String> {
        self.elements
            .iter()
            .filter(|(_, outcome)| outcome.state != TaskState::Completed)
            .map(|(index, outcome)| {
                let message = outcome.error.clone().unwrap_or_else(|| format!("{:?}", outcome.state));
                (*index, message)
            })
            .collect()
    }

    /// Completed element outputs as `{ "<index>": <output> }`
    pub fn to_output(&self) -> Payload {
        self.elements
            .iter()
            .filter_map(|(index, outcome)| {
                outcome
                    .output
                    .as_ref()
                    .map(|output| (index.to_string(), Value::Object(output.clone())))
            })
            .collect()
    }
}

/// Atomically published task statuses for one scope of a run
#[derive(Debug)]
pub struct StatusBoard {
    slots: BTreeMap<NodeId, ArcSwap<TaskStatus>>,
}

impl StatusBoard {
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            slots: ids
                .into_iter()
                .map(|id| (id, ArcSwap::from_pointee(TaskStatus::default())))
                .collect(),
        }
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<TaskStatus>> {
        self.slots.get(&id).map(|slot| slot.load_full())
    }

    pub fn state(&self, id: NodeId) -> Option<TaskState> {
        self.slots.get(&id).map(|slot| slot.load().state)
    }

    /// Publish a new status derived from the current one
    pub(crate) fn update(&self, id: NodeId, change: impl FnOnce(&mut TaskStatus)) {
        if let Some(slot) = self.slots.get(&id) {
            let mut next = TaskStatus::clone(&slot.load());
            change(&mut next);
            slot.store(Arc::new(next));
        }
    }

    /// Copy of every status; each entry is individually consistent
    pub fn snapshot(&self) -> BTreeMap<NodeId, TaskStatus> {
        self.slots
            .iter()
            .map(|(id, slot)| (*id, TaskStatus::clone(&slot.load())))
            .collect()
    }
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// Final, inspectable result of a run including partial outputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub failed: BTreeSet<NodeId>,
    pub skipped: BTreeSet<NodeId>,
    pub tasks: BTreeMap<NodeId, TaskStatus>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub(crate) fn collect(
        run_id: Uuid,
        board: &StatusBoard,
        cancelled: bool,
        started_at: DateTime<Utc>,
    ) -> Self {
        let tasks = board.snapshot();
        let with_state = |wanted: TaskState| -> BTreeSet<NodeId> {
            tasks
                .iter()
                .filter(|(_, status)| status.state == wanted)
                .map(|(id, _)| *id)
                .collect()
        };
        let failed = with_state(TaskState::Failed);
        let skipped = with_state(TaskState::Skipped);

        let outcome = if cancelled {
            RunOutcome::Cancelled
        } else if failed.is_empty() {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };

        Self {
            run_id,
            outcome,
            failed,
            skipped,
            tasks,
            started_at,
            finished_at: Utc::now(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::Succeeded
    }

    pub fn status(&self, id: NodeId) -> Option<&TaskStatus> {
        self.tasks.get(&id)
    }

    pub fn state(&self, id: NodeId) -> Option<TaskState> {
        self.tasks.get(&id).map(|status| status.state)
    }

    /// Output of a completed task
    pub fn output(&self, id: NodeId) -> Option<&Payload> {
        self.tasks.get(&id).and_then(|status| status.output.as_ref())
    }

    /// Outputs of every completed task
    pub fn outputs(&self) -> BTreeMap<NodeId, &Payload> {
        self.tasks
            .iter()
            .filter_map(|(id, status)| status.output.as_ref().map(|output| (*id, output)))
            .collect()
    }
}
