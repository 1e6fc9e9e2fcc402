//! Conversational engine seam and its HTTP pipe client.
//!
//! The interview instrument talks to an external conversational AI through
//! [`ConversationEngine`]. Calls may be slow or fail; callers record a turn
//! only after a call returns successfully and never retry on their own.

mod client;
mod types;


pub use client::PipeClient;
pub use types::*;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::storage::{AspectScore, Turn};

/// The external conversational AI.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConversationEngine: Send + Sync {
    /// Produce the interviewer's reply to `message` given the conversation so far.
    async fn generate_turn(
        &self,
        system_context: &str,
        history: &[Turn],
        message: &str,
    ) -> EngineResult<String>;

    /// Score a finished transcript on each aspect, 0 to 3.
    async fn score_transcript(
        &self,
        history: &[Turn],
        aspects: &[String],
    ) -> EngineResult<BTreeMap<String, AspectScore>>;
}
