//! Text-generation client over the runtime's HTTP API.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::supervisor::RuntimeSupervisor;

/// Returned by [`GenerationClient::generate_or_fallback`] when generation fails.
pub const OFFLINE_RESPONSE: &str =
    "The local AI runtime is not available right now, so no generated answer could be produced.";

/// Default request timeout for a generation call.
pub const DEFAULT_GENERATE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

/// Issues generation requests once the supervisor reports the runtime and
/// model ready.
pub struct GenerationClient {
    supervisor: RuntimeSupervisor,
    client: reqwest::Client,
    model: String,
}

impl GenerationClient {
    pub fn new(supervisor: RuntimeSupervisor) -> Self {
        Self::with_timeout(supervisor, DEFAULT_GENERATE_TIMEOUT)
    }

    pub fn with_timeout(supervisor: RuntimeSupervisor, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        let model = supervisor.default_model().to_string();
        Self {
            supervisor,
            client,
            model,
        }
    }

    /// Set the model used when `generate` is not given one.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Get the current model name.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a completion for `prompt`.
    ///
    /// The runtime must be running and the model present; both are ensured
    /// through the supervisor before the request is sent.
    pub async fn generate(&self, prompt: &str, model: Option<&str>) -> Result<String, ClientError> {
        let model = model.unwrap_or(self.model.as_str());

        self.supervisor.ensure_service_running().await?;
        self.supervisor.ensure_model_ready(model, None).await?;

        let url = format!("{}/api/generate", self.supervisor.base_url());
        debug!("Generating with {} via {}", model, url);

        let response = self
            .client
            .post(&url)
            .json(&GenerateRequest {
                model,
                prompt,
                stream: false,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ClientError::Api(format!("{}: {}", status, text)));
        }

        let body: GenerateResponse = response.json().await?;
        if let Some(error) = body.error {
            return Err(ClientError::Api(error));
        }

        Ok(body.response)
    }

    /// Like [`GenerationClient::generate`], but never fails.
    pub async fn generate_or_fallback(&self, prompt: &str, model: Option<&str>) -> String {
        match self.generate(prompt, model).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Generation failed, using offline response: {}", e);
                OFFLINE_RESPONSE.to_string()
            }
        }
    }
}
