use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::storage::{AspectScore, Turn, TurnRole};

/// Highest score an interview aspect can receive.
pub const MAX_ASPECT_SCORE: u8 = 3;

/// Message in a pipe conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Request to run a pipe
#[derive(Debug, Clone, Serialize)]
pub struct PipeRequest {
    /// Pipe name
    pub name: String,
    pub messages: Vec<Message>,
    /// Always false; responses are read whole
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
}

/// Response from a pipe
#[derive(Debug, Clone, Deserialize)]
pub struct PipeResponse {
    pub success: bool,
    pub completion: String,
    pub raw: Option<RawResponse>,
}

/// Raw model response details
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Token usage information
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

impl From<&Turn> for Message {
    fn from(turn: &Turn) -> Self {
        match turn.role {
            TurnRole::Respondent => Message::user(turn.content.clone()),
            TurnRole::Interviewer => Message::assistant(turn.content.clone()),
        }
    }
}

impl PipeRequest {
    /// Create a new pipe request with name and messages
    pub fn new(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            name: name.into(),
            messages,
            stream: false,
            variables: None,
        }
    }

    /// Add a single variable
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

/// Structured scoring response from the scoring pipe
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringResponse {
    pub scores: BTreeMap<String, RawAspectScore>,
}

/// Aspect score as the engine reports it, before clamping
#[derive(Debug, Clone, Deserialize)]
pub struct RawAspectScore {
    pub score: f64,
    #[serde(default)]
    pub note: Option<String>,
}

impl ScoringResponse {
    /// Parse a scoring response from completion text.
    pub fn from_completion(completion: &str) -> Result<Self, String> {
        let json = extract_json_from_completion(completion)?;
        serde_json::from_str(json).map_err(|e| format!("Malformed scoring JSON: {}", e))
    }

    /// Scores for the requested aspects, clamped to `0..=MAX_ASPECT_SCORE`.
    ///
    /// Every requested aspect must be present.
    pub fn into_scores(
        mut self,
        aspects: &[String],
    ) -> Result<BTreeMap<String, AspectScore>, String> {
        let mut scores = BTreeMap::new();
        for aspect in aspects {
            let raw = self
                .scores
                .remove(aspect)
                .ok_or_else(|| format!("Missing score for aspect '{}'", aspect))?;
            let score = raw.score.round().clamp(0.0, f64::from(MAX_ASPECT_SCORE)) as u8;
            scores.insert(
                aspect.clone(),
                AspectScore {
                    score,
                    note: raw.note.unwrap_or_default(),
                },
            );
        }
        Ok(scores)
    }
}

/// Extract JSON from a completion string, handling markdown code blocks.
///
/// Attempts extraction in this order:
/// 1. Raw JSON
/// 2. ```json ... ``` code blocks
/// 3. ``` ... ``` code blocks
pub(crate) fn extract_json_from_completion(completion: &str) -> Result<&str, String> {
    // Fast path: raw JSON
    let trimmed = completion.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if completion.contains("```json") {
        return completion
            .split("```json")
            .nth(1)
            .and_then(|s| s.split("```").next())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ```json block but content was empty or malformed".to_string());
    }

    if completion.contains("```") {
        return completion
            .split("```")
            .nth(1)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| "Found ``` block but content was empty or malformed".to_string());
    }

    Err(format!(
        "No JSON found in response. First 100 chars: '{}'",
        completion.chars().take(100).collect::<String>()
    ))
}
