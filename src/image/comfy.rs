//! Workflow-submission image backend (ComfyUI-style HTTP API)
//!
//! A workflow template is a JSON document with placeholder strings:
//! `{{prompt}}`, `{{batch_size}}` and `{{seed}}`. The backend fills them in,
//! submits the workflow, polls its history until outputs appear, and
//! downloads each output image.

use super::{ImageBackend, ImageError, ImageResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Connection settings for [`ComfyBackend`].
#[derive(Debug, Clone)]
pub struct ComfySettings {
    pub base_url: String,
    pub workflow: Value,
    pub poll_interval: Duration,
}

impl ComfySettings {
    /// Read the workflow template from a JSON file.
    pub fn from_template_file(
        base_url: impl Into<String>,
        template: &Path,
        poll_interval: Duration,
    ) -> ImageResult<Self> {
        let raw = std::fs::read_to_string(template)?;
        Ok(Self {
            base_url: base_url.into(),
            workflow: serde_json::from_str(&raw)?,
            poll_interval,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    prompt_id: String,
}

#[derive(Debug, Deserialize)]
struct OutputImage {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default = "default_image_type")]
    kind: String,
}

fn default_image_type() -> String {
    "output".to_string()
}

/// HTTP client for a workflow-submission image server.
pub struct ComfyBackend {
    http: reqwest::Client,
    settings: ComfySettings,
    client_id: String,
}

impl ComfyBackend {
    pub fn new(settings: ComfySettings) -> ImageResult<Self> {
        let http = reqwest::Client::builder().build()?;
        Ok(Self {
            http,
            settings,
            client_id: Uuid::new_v4().to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn submit(&self, workflow: Value) -> ImageResult<String> {
        let body = serde_json::json!({ "prompt": workflow, "client_id": self.client_id });
        let resp = self.http.post(self.endpoint("prompt")).json(&body).send().await?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(ImageError::Unavailable(format!("server returned {}", status)));
        }
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(ImageError::Rejected(format!(
                "{}: {}",
                status,
                detail.chars().take(200).collect::<String>()
            )));
        }
        Ok(resp.json::<SubmitResponse>().await?.prompt_id)
    }

    /// Poll history until the prompt has outputs. The caller bounds total time.
    async fn wait_for_outputs(&self, prompt_id: &str) -> ImageResult<Vec<OutputImage>> {
        loop {
            let history: Value = self
                .http
                .get(self.endpoint(&format!("history/{}", prompt_id)))
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if let Some(entry) = history.get(prompt_id) {
                if let Some(error) = execution_error(entry) {
                    return Err(ImageError::Rejected(error));
                }
                let images = collect_output_images(entry)?;
                if !images.is_empty() {
                    return Ok(images);
                }
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    async fn download(&self, image: &OutputImage) -> ImageResult<Vec<u8>> {
        let bytes = self
            .http
            .get(self.endpoint("view"))
            .query(&[
                ("filename", image.filename.as_str()),
                ("subfolder", image.subfolder.as_str()),
                ("type", image.kind.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

/// Replace placeholder strings throughout a workflow template.
///
/// A string that is exactly a numeric placeholder becomes a JSON number;
/// `{{prompt}}` is substituted inside longer strings too.
pub fn fill_template(template: &Value, prompt: &str, batch_size: u32, seed: u64) -> Value {
    match template {
        Value::String(s) => match s.as_str() {
            "{{batch_size}}" => Value::from(batch_size),
            "{{seed}}" => Value::from(seed),
            _ => Value::String(s.replace("{{prompt}}", prompt)),
        },
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| fill_template(v, prompt, batch_size, seed))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill_template(v, prompt, batch_size, seed)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn execution_error(entry: &Value) -> Option<String> {
    let status = entry.get("status")?;
    if status.get("status_str").and_then(Value::as_str) == Some("error") {
        Some(
            status
                .get("messages")
                .map(|m| m.to_string())
                .unwrap_or_else(|| "workflow execution failed".to_string()),
        )
    } else {
        None
    }
}

fn collect_output_images(entry: &Value) -> ImageResult<Vec<OutputImage>> {
    let mut images = Vec::new();
    if let Some(outputs) = entry.get("outputs").and_then(Value::as_object) {
        for node in outputs.values() {
            if let Some(list) = node.get("images") {
                images.extend(serde_json::from_value::<Vec<OutputImage>>(list.clone())?);
            }
        }
    }
    Ok(images)
}

#[async_trait]
impl ImageBackend for ComfyBackend {
    async fn is_available(&self) -> bool {
        match self.http.get(self.endpoint("system_stats")).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn generate(&self, prompt: &str, count: u32) -> ImageResult<Vec<Vec<u8>>> {
        let seed = chrono::Utc::now().timestamp_millis().unsigned_abs();
        let workflow = fill_template(&self.settings.workflow, prompt, count, seed);

        let prompt_id = self.submit(workflow).await.map_err(|e| match e {
            ImageError::Http(err) if err.is_connect() => ImageError::Unavailable(err.to_string()),
            other => other,
        })?;
        debug!(prompt_id = %prompt_id, "workflow submitted");

        let outputs = self.wait_for_outputs(&prompt_id).await?;
        let mut images = Vec::with_capacity(outputs.len());
        for output in &outputs {
            images.push(self.download(output).await?);
        }
        Ok(images)
    }
}
