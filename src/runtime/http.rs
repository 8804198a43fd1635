/// HTTP caller adapter
///
/// Posts the task input as a JSON body to `{base_url}/{endpoint}` and expects a
/// JSON object back. Connection failures map to `RemoteError::Transport`,
/// non-success statuses to `RemoteError::Endpoint`.

use crate::error::RemoteError;
use crate::runtime::caller::CallerAdapter;
use crate::workflow::types::Payload;
use futures::future::BoxFuture;
use serde_json::Value;

/// `CallerAdapter` over plain HTTP+JSON
#[derive(Debug, Clone)]
pub struct HttpCaller {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCaller {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

impl CallerAdapter for HttpCaller {
    fn invoke(&self, endpoint: &str, input: Payload) -> BoxFuture<'_, Result<Payload, RemoteError>> {
        let url = self.url_for(endpoint);
        let endpoint = endpoint.to_string();

        Box::pin(async move {
            tracing::debug!("🌐 POST {}", url);

            let response = self
                .client
                .post(&url)
                .json(&input)
                .send()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RemoteError::Endpoint {
                    endpoint,
                    message: format!("HTTP {}: {}", status, body),
                });
            }

            let value: Value = response
                .json()
                .await
                .map_err(|e| RemoteError::Transport(e.to_string()))?;

            match value {
                Value::Object(map) => Ok(map),
                _ => Err(RemoteError::InvalidResponse { endpoint }),
            }
        })
    }
}
