//! Per-session instrument content generation.
//!
//! Generation is pure given the bundle parameters, the question pools and an
//! RNG; the orchestrator freezes the result into session metadata once.

use std::collections::BTreeMap;

use chrono::Utc;
use rand::seq::{index, SliceRandom};
use rand::Rng;

use crate::prompts::{interview_system_context, INTERVIEW_SYSTEM_PROMPT};
use crate::storage::{
    InterviewParams, InterviewPlan, PlannedQuestion, Question, QuestionnaireParams,
    QuestionnairePlan,
};

/// Draw the questionnaire for one session.
///
/// For every configured category, `questions_per_category` questions are
/// sampled uniformly without replacement from that category's pool. A pool
/// smaller than that is taken whole. Within a category the pool order is
/// kept; the whole list is shuffled only when `randomize_order` is set.
pub fn generate_questionnaire<R: Rng + ?Sized>(
    settings_id: &str,
    params: &QuestionnaireParams,
    pools: &BTreeMap<String, Vec<Question>>,
    rng: &mut R,
) -> QuestionnairePlan {
    let mut questions = Vec::new();

    for category in &params.categories {
        let pool = match pools.get(category) {
            Some(pool) => pool,
            None => continue,
        };
        let amount = params.questions_per_category.min(pool.len());

        let mut picked = index::sample(rng, pool.len(), amount).into_vec();
        picked.sort_unstable();

        questions.extend(picked.into_iter().map(|i| PlannedQuestion {
            id: pool[i].id.clone(),
            category: category.clone(),
            text: pool[i].text.clone(),
        }));
    }

    if params.randomize_order {
        questions.shuffle(rng);
    }

    QuestionnairePlan {
        settings_id: settings_id.to_string(),
        questions,
        randomized: params.randomize_order,
        scale_min: params.scale_min,
        scale_max: params.scale_max,
        generated_at: Utc::now(),
    }
}

/// Snapshot the interview configuration for one session, with an empty turn log.
pub fn generate_interview(settings_id: &str, params: &InterviewParams) -> InterviewPlan {
    let persona = params
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(INTERVIEW_SYSTEM_PROMPT);

    InterviewPlan {
        settings_id: settings_id.to_string(),
        aspects: params.aspects.clone(),
        opening_instructions: params.opening_instructions.clone(),
        system_context: interview_system_context(persona, &params.aspects),
        turns: Vec::new(),
        generated_at: Utc::now(),
    }
}
