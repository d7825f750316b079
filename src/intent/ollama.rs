//! Ollama HTTP backend for the model classifier
//!
//! Talks to a local Ollama server (default `localhost:11434`). The server
//! owns the weights; the model file only gates whether the classifier is
//! considered installed.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::model::{ClassifierError, LanguageModel};

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Debug, Deserialize)]
struct ModelInfo {
    name: String,
}

/// Language model served by Ollama
#[derive(Debug, Clone)]
pub struct OllamaModel {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaModel {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self, ClassifierError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client,
        })
    }

    /// Whether `name` refers to the configured model, with or without a tag
    fn matches(&self, name: &str) -> bool {
        name == self.model || name.split(':').next() == Some(self.model.as_str())
    }
}

#[async_trait]
impl LanguageModel for OllamaModel {
    async fn load(&self, model_path: &Path) -> Result<(), ClassifierError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClassifierError::Unavailable(format!(
                "tags request returned {}",
                response.status()
            )));
        }

        let tags: TagsResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        if !tags.models.iter().any(|m| self.matches(&m.name)) {
            return Err(ClassifierError::Unavailable(format!(
                "model '{}' is not pulled on the server",
                self.model
            )));
        }

        debug!(model = %self.model, ?model_path, "ollama model available");
        Ok(())
    }

    async fn generate(&self, prompt: &str) -> Result<String, ClassifierError> {
        let url = format!("{}/api/generate", self.base_url);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            options: GenerateOptions { temperature: 0.0 },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Request(format!("{}: {}", status, body)));
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ClassifierError::Request(e.to_string()))?;

        Ok(body.response)
    }
}
