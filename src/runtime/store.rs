/// On-disk run artifacts under a project directory
///
/// Layout:
/// - {project_dir}/workflow.json: spec of the graph that ran
/// - {project_dir}/task-{id}-{slug}/input.json and output.json for `store_output` tasks
/// - {project_dir}/loop-{id}/element-{index}/...: same layout per loop element
/// - {project_dir}/run.json: final run report
///
/// Writes never influence task state; failures are logged by the caller.

use crate::workflow::types::{NodeId, Payload, Task};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};

/// Artifact writer rooted at one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store for one element sub-run of a loop
    pub fn element(&self, loop_id: NodeId, index: usize) -> Self {
        Self::new(
            self.root
                .join(format!("loop-{}", loop_id))
                .join(format!("element-{}", index)),
        )
    }

    /// Directory holding a task's input and output
    pub fn task_dir(&self, task: &Task) -> PathBuf {
        self.root.join(format!("task-{}-{}", task.id, slug(&task.title)))
    }

    /// Write a task's merged input and its output
    pub async fn write_task(&self, task: &Task, input: &Payload, output: &Payload) -> io::Result<PathBuf> {
        let dir = self.task_dir(task);
        tokio::fs::create_dir_all(&dir).await?;
        write_json(&dir.join("input.json"), input).await?;
        write_json(&dir.join("output.json"), output).await?;
        Ok(dir)
    }

    /// Write any serializable document at `{root}/{name}`
    pub async fn write_document<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.root.join(name);
        write_json(&path, value).await?;
        Ok(path)
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    tokio::fs::write(path, bytes).await
}

/// Lowercase, filesystem-safe version of a task title
fn slug(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "task".to_string()
    } else {
        trimmed.to_string()
    }
}
