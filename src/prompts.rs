//! Prompt definitions for the conversational engine.
//!
//! The interview system context is assembled per session from the pinned
//! interview bundle; these are the fixed parts.

/// Default interviewer persona, used when the interview bundle sets no system prompt.
pub const INTERVIEW_SYSTEM_PROMPT: &str = r#"You are a calm, empathetic screening interviewer conducting a short structured conversation.

Guidelines:
- Ask one open question at a time
- Follow up on what the respondent says before moving to a new topic
- Never diagnose, label, or give medical advice
- Keep replies under 80 words
- If the respondent expresses intent to harm themselves or others, stop probing and point them to emergency services"#;

/// System prompt for transcript scoring.
pub const SCORING_PROMPT: &str = r#"You score screening interview transcripts.

For each requested aspect give an integer score from 0 (no indication) to 3 (strong indication) and a one-sentence note citing the transcript.

Your response MUST be valid JSON in this exact format:
{
  "scores": {
    "<aspect>": {"score": 0, "note": "..."}
  }
}

Score every requested aspect and nothing else. Always respond with valid JSON only, no other text."#;

/// Build the per-session system context from the persona and the aspects to cover.
pub fn interview_system_context(persona: &str, aspects: &[String]) -> String {
    if aspects.is_empty() {
        return persona.to_string();
    }

    let topics: Vec<String> = aspects.iter().map(|a| format!("- {}", a)).collect();
    format!(
        "{}\n\nDuring the conversation, gently explore these aspects:\n{}",
        persona,
        topics.join("\n")
    )
}
