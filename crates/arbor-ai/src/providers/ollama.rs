//! Ollama enrichment backend

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::super::bridge::{AnalysisSummary, Enrichment, EnrichmentBackend};
use super::super::prompt::{enrichment_prompt, parse_response};

pub struct OllamaBackend {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(endpoint: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, endpoint, model })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[async_trait::async_trait]
impl EnrichmentBackend for OllamaBackend {
    async fn enrich(&self, summaries: &[AnalysisSummary]) -> Result<Enrichment> {
        let request = GenerateRequest {
            model: &self.model,
            prompt: enrichment_prompt(summaries),
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("Failed to send request to Ollama")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            anyhow::bail!("Ollama API error ({}): {}", status, error_text);
        }

        let body: GenerateResponse = response
            .json()
            .await
            .context("Failed to parse Ollama response JSON")?;
        let (insights, recommendations) = parse_response(&body.response);

        Ok(Enrichment {
            backend: self.name().to_string(),
            insights,
            recommendations,
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
