//! Reference handlers: echo, outbound HTTP, fixed delay and forced error.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::errors;
use crate::handler::{ExecutionContext, HandlerError, HandlerRegistry, TaskHandler, TaskOutput};
use crate::task::{Payload, Task, TaskMetrics};

/// Register echo, http_request, delay and error on `registry`
pub fn register_builtin_handlers(registry: &HandlerRegistry) -> errors::Result<()> {
    registry.register(Arc::new(EchoHandler))?;
    registry.register(Arc::new(HttpRequestHandler::new()))?;
    registry.register(Arc::new(DelayHandler))?;
    registry.register(Arc::new(ErrorHandler))?;
    Ok(())
}

/// Read a duration field: a humantime string (`"250ms"`) or a number of seconds
fn parse_duration_value(value: &Value) -> anyhow::Result<Duration> {
    match value {
        Value::String(s) => humantime::parse_duration(s.trim())
            .map_err(|e| anyhow!("invalid duration format: {}", e)),
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .ok_or_else(|| anyhow!("duration must be a finite number"))?;
            if !secs.is_finite() || secs < 0.0 {
                bail!("duration cannot be negative");
            }
            Duration::try_from_secs_f64(secs).map_err(|e| anyhow!("duration out of range: {}", e))
        }
        _ => bail!("duration must be a string or number"),
    }
}

fn into_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

/// Returns the payload, metadata and type of the task
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl TaskHandler for EchoHandler {
    fn task_type(&self) -> &str {
        "echo"
    }

    fn validate(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
    ) -> Result<TaskOutput, HandlerError> {
        if ctx.is_cancelled() {
            return Err(ctx.interruption());
        }

        let data = json!({
            "echo": task.payload,
            "metadata": task.metadata,
            "type": task.task_type,
        });
        Ok(TaskOutput::new(into_payload(data)))
    }
}

/// Performs the request described by `url`, `method`, optional `headers`
/// (string map) and optional `body` (string)
#[derive(Debug, Clone)]
pub struct HttpRequestHandler {
    client: reqwest::Client,
}

impl Default for HttpRequestHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestHandler {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(&self, task: &Task) -> anyhow::Result<Payload> {
        let payload = &task.payload;
        let url = payload.get("url").and_then(Value::as_str).unwrap_or_default();
        let method = payload.get("method").and_then(Value::as_str).unwrap_or_default();

        let method = reqwest::Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|e| anyhow!("failed to create request: {}", e))?;
        let mut request = self.client.request(method.clone(), url);

        if let Some(Value::Object(headers)) = payload.get("headers") {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }
        if let Some(body) = payload.get("body").and_then(Value::as_str) {
            if !body.is_empty() {
                request = request.body(body.to_string());
            }
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow!("request failed: {}", e))?;

        let status_code = response.status().as_u16();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| anyhow!("failed to read response: {}", e))?;
        let body = serde_json::from_slice::<Value>(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok(into_payload(json!({
            "status_code": status_code,
            "headers": headers,
            "body": body,
            "url": url,
            "method": method.as_str(),
        })))
    }
}

#[async_trait]
impl TaskHandler for HttpRequestHandler {
    fn task_type(&self) -> &str {
        "http_request"
    }

    fn validate(&self, task: &Task) -> anyhow::Result<()> {
        for field in ["url", "method"] {
            match task.payload.get(field) {
                Some(Value::String(s)) if !s.is_empty() => {}
                Some(_) => bail!("field {} must be a non-empty string", field),
                None => bail!("missing required field: {}", field),
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
    ) -> Result<TaskOutput, HandlerError> {
        tokio::select! {
            _ = ctx.cancelled() => Err(ctx.interruption()),
            result = self.send(task) => {
                let data = result?;
                let metrics = TaskMetrics {
                    network_requests: 1,
                    ..Default::default()
                };
                Ok(TaskOutput::new(data).with_metrics(metrics))
            }
        }
    }
}

/// Sleeps for the payload's `duration`, honouring cancellation
#[derive(Debug, Default, Clone, Copy)]
pub struct DelayHandler;

#[async_trait]
impl TaskHandler for DelayHandler {
    fn task_type(&self) -> &str {
        "delay"
    }

    fn validate(&self, task: &Task) -> anyhow::Result<()> {
        let value = task
            .payload
            .get("duration")
            .ok_or_else(|| anyhow!("missing required field: duration"))?;
        parse_duration_value(value)?;
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
    ) -> Result<TaskOutput, HandlerError> {
        let value = task
            .payload
            .get("duration")
            .ok_or_else(|| HandlerError::failed("missing required field: duration"))?;
        let duration = parse_duration_value(value)?;

        debug!(task_id = %task.id, ?duration, "Delaying");
        ctx.sleep(duration).await?;

        Ok(TaskOutput::new(into_payload(json!({
            "duration": humantime::format_duration(duration).to_string(),
            "duration_ms": duration.as_millis() as u64,
            "completed": true,
        }))))
    }
}

/// Always fails with the payload's `message`, after an optional `delay`
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorHandler;

impl ErrorHandler {
    pub const DEFAULT_MESSAGE: &'static str = "simulated error";
}

#[async_trait]
impl TaskHandler for ErrorHandler {
    fn task_type(&self) -> &str {
        "error"
    }

    fn validate(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        task: &Task,
    ) -> Result<TaskOutput, HandlerError> {
        let message = task
            .payload
            .get("message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(Self::DEFAULT_MESSAGE)
            .to_string();

        // An unparsable delay is ignored
        if let Some(delay) = task
            .payload
            .get("delay")
            .and_then(|v| parse_duration_value(v).ok())
        {
            if !delay.is_zero() {
                ctx.sleep(delay).await?;
            }
        }

        Err(HandlerError::Failed(message))
    }
}
