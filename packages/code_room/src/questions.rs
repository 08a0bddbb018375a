//! Interview question bank.
//!
//! Questions are read once at startup from a JSON array. Lookup picks one
//! question at random among those matching the requested difficulty and tags.

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub title: String,
    pub prompt_markdown: String,
    pub difficulty: String,
    #[serde(default)]
    pub topic_tags: Vec<String>,
}

/// Filter for [`QuestionBank::pick`]. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QuestionQuery {
    pub difficulty: Option<String>,
    #[serde(default)]
    pub topic_tags: Vec<String>,
}

impl QuestionQuery {
    fn matches(&self, question: &Question) -> bool {
        let difficulty_ok = self
            .difficulty
            .as_deref()
            .is_none_or(|d| d.eq_ignore_ascii_case(&question.difficulty));

        difficulty_ok
            && self.topic_tags.iter().all(|wanted| {
                question
                    .topic_tags
                    .iter()
                    .any(|tag| tag.eq_ignore_ascii_case(wanted))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuestionError {
    #[error("no question matches the requested difficulty and tags")]
    NoEligibleQuestion,
}

#[derive(Debug, Default)]
pub struct QuestionBank {
    questions: Vec<Question>,
}

impl QuestionBank {
    pub fn new(questions: Vec<Question>) -> Self {
        Self { questions }
    }

    /// Load the bank from `path`, or an empty bank when no path is configured
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read question bank {}", path.display()))?;
        let questions: Vec<Question> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse question bank {}", path.display()))?;

        info!(count = questions.len(), "Loaded question bank from {}", path.display());
        Ok(Self::new(questions))
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    /// Pick uniformly among the questions `query` matches
    pub fn pick(&self, query: &QuestionQuery) -> Result<Question, QuestionError> {
        let eligible: Vec<&Question> = self.questions.iter().filter(|q| query.matches(q)).collect();
        eligible
            .choose(&mut rand::rng())
            .map(|q| (*q).clone())
            .ok_or(QuestionError::NoEligibleQuestion)
    }
}
