/// Registry of local functions callable from LocalFunction tasks
///
/// Named functions are plain Rust closures registered before a run; their
/// names are what a saved spec refers to. Lua functions need no registration.

use crate::error::TaskError;
use crate::runtime::lua;
use crate::workflow::types::{FunctionRef, Payload};
use std::collections::HashMap;
use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// A pure function from merged task input to task output
pub type LocalFn = Arc<dyn Fn(&Payload) -> anyhow::Result<Payload> + Send + Sync>;

/// Named local functions available to a run
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, LocalFn>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under `name`, replacing any previous entry
    pub fn register<F>(&mut self, name: impl Into<String>, function: F) -> &mut Self
    where
        F: Fn(&Payload) -> anyhow::Result<Payload> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Whether a function reference can be invoked
    pub fn resolves(&self, function: &FunctionRef) -> bool {
        match function {
            FunctionRef::Named(name) => self.contains(name),
            FunctionRef::Lua(_) => true,
        }
    }

    /// Invoke a function reference with the merged task input
    pub fn call(&self, function: &FunctionRef, input: &Payload) -> Result<Payload, TaskError> {
        let result = match function {
            FunctionRef::Named(name) => {
                let Some(local) = self.functions.get(name) else {
                    return Err(TaskError::LocalFunction(format!("function '{name}' is not registered")));
                };
                // A panicking function fails its task, not the run
                std::panic::catch_unwind(AssertUnwindSafe(|| local(input)))
                    .unwrap_or_else(|panic| Err(anyhow::anyhow!("function '{name}' panicked: {}", panic_message(&*panic))))
            }
            FunctionRef::Lua(script) => lua::run_script(script, input),
        };
        result.map_err(|e| TaskError::LocalFunction(format!("{e:#}")))
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
