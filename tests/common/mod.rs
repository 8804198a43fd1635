//! Scripted remote callers for engine tests

#![allow(dead_code)]

use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use taskgraph::error::RemoteError;
use taskgraph::{CallerAdapter, Payload};
use tokio::sync::Notify;

type Handler = Arc<dyn Fn(&Payload, u32) -> Result<Payload, RemoteError> + Send + Sync>;

/// Caller whose endpoints are closures of (input, attempt number)
///
/// Unknown endpoints echo their input. Every invocation is recorded.
#[derive(Default)]
pub struct ScriptedCaller {
    handlers: HashMap<String, Handler>,
    gates: HashMap<String, Arc<Notify>>,
    calls: Mutex<Vec<(String, Payload)>>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ScriptedCaller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(mut self, endpoint: &str, handler: F) -> Self
    where
        F: Fn(&Payload, u32) -> Result<Payload, RemoteError> + Send + Sync + 'static,
    {
        self.handlers.insert(endpoint.to_string(), Arc::new(handler));
        self
    }

    /// Hold calls to `endpoint` until the returned gate is notified
    pub fn gated(mut self, endpoint: &str) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.gates.insert(endpoint.to_string(), Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self, endpoint: &str) -> Vec<Payload> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == endpoint)
            .map(|(_, input)| input.clone())
            .collect()
    }
}

impl CallerAdapter for ScriptedCaller {
    fn invoke(&self, endpoint: &str, input: Payload) -> BoxFuture<'_, Result<Payload, RemoteError>> {
        let endpoint = endpoint.to_string();
        Box::pin(async move {
            self.calls.lock().unwrap().push((endpoint.clone(), input.clone()));
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(endpoint.clone()).or_insert(0);
                *count += 1;
                *count
            };
            if let Some(gate) = self.gates.get(&endpoint) {
                gate.notified().await;
            }
            match self.handlers.get(&endpoint) {
                Some(handler) => handler(&input, attempt),
                None => Ok(input),
            }
        })
    }
}

pub fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

pub fn fails(message: &str) -> RemoteError {
    RemoteError::Endpoint {
        endpoint: "scripted".to_string(),
        message: message.to_string(),
    }
}

pub fn ok(value: Value) -> Result<Payload, RemoteError> {
    Ok(object(value))
}

pub fn empty() -> Payload {
    object(json!({}))
}
