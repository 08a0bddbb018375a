use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::debug;

use crate::AppState;
use crate::questions::QuestionQuery;

#[derive(Debug, Deserialize)]
pub struct RandomQuestionParams {
    pub difficulty: Option<String>,
    /// Comma separated
    pub topic_tags: Option<String>,
}

impl From<RandomQuestionParams> for QuestionQuery {
    fn from(params: RandomQuestionParams) -> Self {
        QuestionQuery {
            difficulty: params.difficulty.filter(|d| !d.trim().is_empty()),
            topic_tags: params
                .topic_tags
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

/// One random question matching the filter, or 404 when none is eligible
pub async fn random_question_handler(
    State(state): State<AppState>,
    Query(params): Query<RandomQuestionParams>,
) -> Response {
    let query = QuestionQuery::from(params);
    match state.questions.pick(&query) {
        Ok(question) => Json(question).into_response(),
        Err(e) => {
            debug!(?query, "{}", e);
            (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "no_eligible_question" })),
            )
                .into_response()
        }
    }
}
