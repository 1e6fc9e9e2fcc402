use async_trait::async_trait;
use reqwest::Client;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::types::{Message, PipeRequest, PipeResponse, ScoringResponse};
use super::ConversationEngine;
use crate::config::{EngineConfig, PipeConfig, RequestConfig};
use crate::error::{EngineError, EngineResult};
use crate::prompts::SCORING_PROMPT;
use crate::storage::{AspectScore, Turn};

/// Client for the conversational engine's pipes API
#[derive(Clone)]
pub struct PipeClient {
    client: Client,
    base_url: String,
    api_key: String,
    request_config: RequestConfig,
    pipes: PipeConfig,
}

impl PipeClient {
    /// Create a new pipe client
    pub fn new(
        config: &EngineConfig,
        request_config: RequestConfig,
        pipes: PipeConfig,
    ) -> EngineResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(EngineError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            request_config,
            pipes,
        })
    }

    /// Call a pipe once. Failures are returned to the caller as is.
    pub async fn call_pipe(&self, request: PipeRequest) -> EngineResult<PipeResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);
        let start = Instant::now();

        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            "Calling pipe"
        );

        match self.execute_request(&url, &request).await {
            Ok(response) => {
                info!(
                    pipe = %request.name,
                    latency_ms = start.elapsed().as_millis(),
                    "Pipe call succeeded"
                );
                Ok(response)
            }
            Err(e) => {
                error!(
                    pipe = %request.name,
                    error = %e,
                    latency_ms = start.elapsed().as_millis(),
                    "Pipe call failed"
                );
                Err(e)
            }
        }
    }

    async fn execute_request(&self, url: &str, request: &PipeRequest) -> EngineResult<PipeResponse> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout {
                        timeout_ms: self.request_config.timeout_ms,
                    }
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(EngineError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let pipe_response: PipeResponse =
            response
                .json()
                .await
                .map_err(|e| EngineError::InvalidResponse {
                    message: format!("Failed to parse response: {}", e),
                })?;

        if !pipe_response.success {
            return Err(EngineError::InvalidResponse {
                message: "Pipe reported success=false".to_string(),
            });
        }

        Ok(pipe_response)
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_turn_messages(system_context: &str, history: &[Turn], message: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(Message::system(system_context));
        messages.extend(history.iter().map(Message::from));
        messages.push(Message::user(message));
        messages
    }

    fn build_scoring_messages(history: &[Turn], aspects: &[String]) -> Vec<Message> {
        let transcript: Vec<String> = history
            .iter()
            .map(|t| {
                let speaker = match t.role {
                    crate::storage::TurnRole::Respondent => "Respondent",
                    crate::storage::TurnRole::Interviewer => "Interviewer",
                };
                format!("{}: {}", speaker, t.content)
            })
            .collect();

        vec![
            Message::system(SCORING_PROMPT),
            Message::user(format!(
                "Aspects to score: {}\n\nTranscript:\n{}",
                aspects.join(", "),
                transcript.join("\n")
            )),
        ]
    }
}

#[async_trait]
impl ConversationEngine for PipeClient {
    async fn generate_turn(
        &self,
        system_context: &str,
        history: &[Turn],
        message: &str,
    ) -> EngineResult<String> {
        let messages = Self::build_turn_messages(system_context, history, message);
        let request = PipeRequest::new(&self.pipes.interview, messages);
        let response = self.call_pipe(request).await?;

        let reply = response.completion.trim();
        if reply.is_empty() {
            return Err(EngineError::InvalidResponse {
                message: "Empty interviewer reply".to_string(),
            });
        }
        Ok(reply.to_string())
    }

    async fn score_transcript(
        &self,
        history: &[Turn],
        aspects: &[String],
    ) -> EngineResult<BTreeMap<String, AspectScore>> {
        let messages = Self::build_scoring_messages(history, aspects);
        let request = PipeRequest::new(&self.pipes.scoring, messages)
            .with_variable("aspects", aspects.join(","));
        let response = self.call_pipe(request).await?;

        ScoringResponse::from_completion(&response.completion)
            .and_then(|parsed| parsed.into_scores(aspects))
            .map_err(|message| EngineError::InvalidResponse { message })
    }
}
