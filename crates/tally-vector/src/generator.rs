//! Answer generators.
//!
//! The core only needs `generate(context, question, prompt) -> answer`.
//! [`OpenAiGenerator`] talks to any OpenAI-compatible chat endpoint (Ollama,
//! llama.cpp server, OpenAI itself); [`ExtractiveGenerator`] answers offline
//! from the retrieved context alone.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use tally_core::config::GeneratorConfig;
use tally_core::error::{Result, TallyError};

use crate::rag::build_prompt;

/// Answer returned by [`ExtractiveGenerator`] when nothing was retrieved.
pub const NO_CONTEXT_ANSWER: &str = "No relevant transactions found.";

/// Produces an answer from retrieved context.
#[async_trait]
pub trait Generator: Send + Sync {
    /// `prompt`, when given, is sent as-is; otherwise one is built from
    /// `context` and `question`.
    async fn generate(&self, context: &str, question: &str, prompt: Option<&str>)
        -> Result<String>;
}

// ---------------------------------------------------------------------------
// OpenAI-compatible chat completions
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Generator backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    system_prompt: String,
    temperature: f32,
}

impl OpenAiGenerator {
    pub fn new(config: &GeneratorConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(TallyError::Config("generator endpoint is empty".to_string()));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TallyError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: self.temperature,
            stream: false,
        }
    }
}

/// Pull the first choice's text out of a completion response.
fn parse_answer(response: ChatResponse) -> Result<String> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .ok_or_else(|| TallyError::ExternalCall("completion contained no answer".to_string()))
}

#[async_trait]
impl Generator for OpenAiGenerator {
    async fn generate(
        &self,
        context: &str,
        question: &str,
        prompt: Option<&str>,
    ) -> Result<String> {
        let built;
        let prompt = match prompt {
            Some(p) => p,
            None => {
                built = build_prompt(context, question);
                &built
            }
        };

        let mut request = self
            .http
            .post(self.completions_url())
            .json(&self.request_body(prompt));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TallyError::ExternalCall(format!("generator request: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TallyError::ExternalCall(format!(
                "generator returned {}: {}",
                status, body
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TallyError::ExternalCall(format!("generator response: {}", e)))?;
        let answer = parse_answer(parsed)?;
        debug!(model = %self.model, chars = answer.len(), "Generated answer");
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// ExtractiveGenerator
// ---------------------------------------------------------------------------

/// Offline generator: answers with the best-ranked context line.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveGenerator;

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(
        &self,
        context: &str,
        _question: &str,
        _prompt: Option<&str>,
    ) -> Result<String> {
        Ok(context
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| format!("Most relevant transaction: {}", line))
            .unwrap_or_else(|| NO_CONTEXT_ANSWER.to_string()))
    }
}
