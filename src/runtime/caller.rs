/// Remote call capability injected into the engine
///
/// The engine never talks to a transport directly; every RemoteCall task goes
/// through a `CallerAdapter`. Timeouts are applied by the executor, so adapters
/// only report transport and endpoint failures.

use crate::error::RemoteError;
use crate::workflow::types::Payload;
use futures::future::BoxFuture;

/// Asynchronous invocation of a named remote endpoint
pub trait CallerAdapter: Send + Sync + 'static {
    /// Invoke `endpoint` with `input` and resolve to its output payload
    fn invoke(&self, endpoint: &str, input: Payload) -> BoxFuture<'_, Result<Payload, RemoteError>>;
}

/// Caller used when no transport has been attached; every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct Disconnected;

impl CallerAdapter for Disconnected {
    fn invoke(&self, endpoint: &str, _input: Payload) -> BoxFuture<'_, Result<Payload, RemoteError>> {
        let message = format!("no caller attached for endpoint '{endpoint}'");
        Box::pin(async move { Err(RemoteError::Transport(message)) })
    }
}
