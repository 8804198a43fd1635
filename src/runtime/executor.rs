/// Task execution handlers, one attempt at a time
///
/// Dispatches a single attempt of a task to the strategy of its variant:
/// - RemoteCall: the injected `CallerAdapter`, bounded by timeout and concurrency
/// - LocalFunction: a registered Rust closure or an inline Lua script
/// - Passthrough: identity
///
/// Loop tasks are expanded by the engine and never reach this executor.
/// Retries are the engine's concern too.

use crate::config::EngineConfig;
use crate::error::{RemoteError, TaskError};
use crate::runtime::caller::CallerAdapter;
use crate::runtime::functions::FunctionRegistry;
use crate::workflow::types::{Payload, Task, TaskKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Executor shared by every dispatch of a run
pub struct TaskExecutor {
    /// Transport for RemoteCall tasks
    caller: Arc<dyn CallerAdapter>,
    /// Functions for LocalFunction tasks
    functions: FunctionRegistry,
    /// Upper bound for one remote call
    call_timeout: Option<Duration>,
    /// Limits concurrent remote calls
    permits: Semaphore,
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("functions", &self.functions)
            .field("call_timeout", &self.call_timeout)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

impl TaskExecutor {
    pub fn new(caller: Arc<dyn CallerAdapter>, functions: FunctionRegistry, config: &EngineConfig) -> Self {
        Self {
            caller,
            functions,
            call_timeout: config.call_timeout(),
            permits: Semaphore::new(config.max_concurrency.max(1)),
        }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Execute one attempt of `task` with its fully merged input
    pub async fn execute(&self, task: &Task, input: &Payload) -> Result<Payload, TaskError> {
        tracing::info!("🚀 Starting task execution: {} '{}' (type: {})", task.id, task.title, task.kind.name());
        tracing::debug!("📥 Input data: {}", serde_json::to_string(input).unwrap_or_else(|_| "invalid_json".to_string()));

        let start_time = std::time::Instant::now();

        let result = match &task.kind {
            TaskKind::RemoteCall { endpoint } => self.call_remote(endpoint, input.clone()).await,
            TaskKind::LocalFunction { function } => self.functions.call(function, input),
            TaskKind::Passthrough => Ok(input.clone()),
            TaskKind::Loop { .. } => Err(TaskError::Loop(format!(
                "loop task {} must be expanded by the engine",
                task.id
            ))),
        };

        let duration = start_time.elapsed();
        match &result {
            Ok(output) => {
                tracing::info!("✅ Task execution completed: {} in {:?}", task.id, duration);
                tracing::debug!("📤 Output data: {}", serde_json::to_string(output).unwrap_or_else(|_| "invalid_json".to_string()));
            }
            Err(e) => {
                tracing::warn!("❌ Task attempt failed: {} in {:?} - Error: {}", task.id, duration, e);
            }
        }

        result
    }

    async fn call_remote(&self, endpoint: &str, input: Payload) -> Result<Payload, TaskError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RemoteError::Transport("executor is shutting down".to_string()))?;

        tracing::debug!("📡 Invoking remote endpoint: {}", endpoint);
        let call = self.caller.invoke(endpoint, input);
        let output = match self.call_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| RemoteError::Timeout(limit))??,
            None => call.await?,
        };
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::caller::Disconnected;
    use crate::workflow::types::{payload, NodeId};
    use futures::future::BoxFuture;
    use serde_json::json;

    struct Slow;

    impl CallerAdapter for Slow {
        fn invoke(&self, _endpoint: &str, input: Payload) -> BoxFuture<'_, Result<Payload, RemoteError>> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(input)
            })
        }
    }

    fn task(kind: TaskKind) -> Task {
        Task::new(NodeId(1), "t", kind, Payload::new())
    }

    #[tokio::test]
    async fn passthrough_returns_input() {
        let executor = TaskExecutor::new(Arc::new(Disconnected), FunctionRegistry::new(), &EngineConfig::default());
        let input = payload(json!({"a": 1}));
        assert_eq!(executor.execute(&task(TaskKind::Passthrough), &input).await.unwrap(), input);
    }

    #[tokio::test]
    async fn disconnected_caller_fails_remote_tasks() {
        let executor = TaskExecutor::new(Arc::new(Disconnected), FunctionRegistry::new(), &EngineConfig::default());
        let err = executor
            .execute(&task(TaskKind::remote("svc.op")), &Payload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Remote(RemoteError::Transport(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let config = EngineConfig { call_timeout_secs: 1, ..EngineConfig::default() };
        let executor = TaskExecutor::new(Arc::new(Slow), FunctionRegistry::new(), &config);
        let err = executor
            .execute(&task(TaskKind::remote("svc.slow")), &Payload::new())
            .await
            .unwrap_err();
        assert_eq!(err, TaskError::Remote(RemoteError::Timeout(Duration::from_secs(1))));
        assert!(err.is_retryable());
    }
}
