use super::{Invoker, LivenessProbe};
use crate::core::{FleetError, InvocationDescriptor, Result, Target};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};

fn http_parts(target: &Target) -> Result<(&str, Option<&str>)> {
    match &target.descriptor {
        InvocationDescriptor::Http { url, auth_header } => {
            Ok((url.trim_end_matches('/'), auth_header.as_deref()))
        }
        other => Err(FleetError::AttemptFailure(format!(
            "target '{}' is not reachable over HTTP ({})",
            target.name, other
        ))),
    }
}

/// Probes `GET {url}/health`.
#[derive(Clone, Default)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, target: &Target) -> Result<()> {
        let (url, auth) = http_parts(target)?;
        let mut request = self.client.get(format!("{}/health", url));
        if let Some(auth) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FleetError::AttemptFailure(format!("health request failed: {}", err)))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            status if status == reqwest::StatusCode::UNAUTHORIZED => {
                Err(FleetError::AttemptFailure("authentication failed".to_string()))
            }
            status => Err(FleetError::AttemptFailure(format!(
                "health endpoint returned {}",
                status
            ))),
        }
    }
}

/// Calls an operation as a JSON-RPC `tools/call` request.
#[derive(Default)]
pub struct HttpInvoker {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Invoker for HttpInvoker {
    async fn invoke(&self, target: &Target, operation: &str, payload: &Value) -> Result<Value> {
        let (url, auth) = http_parts(target)?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            "method": "tools/call",
            "params": { "name": operation, "arguments": payload },
        });

        let mut request = self.client.post(url).json(&body);
        if let Some(auth) = auth {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FleetError::AttemptFailure(format!("request failed: {}", err)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FleetError::AttemptFailure(format!(
                "{} returned {}",
                operation, status
            )));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|err| FleetError::AttemptFailure(format!("malformed response: {}", err)))?;
        unwrap_rpc_reply(reply)
    }
}

fn unwrap_rpc_reply(reply: Value) -> Result<Value> {
    if let Some(error) = reply.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(FleetError::AttemptFailure(message));
    }
    Ok(reply.get("result").cloned().unwrap_or(reply))
}
