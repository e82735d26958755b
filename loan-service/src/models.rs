use loan_flow::{IntentPayload, ResponsePayload, Stage};
use serde::{Deserialize, Serialize};

/// Body of `POST /turn`.
#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    /// Omit to start a new session.
    pub session_id: Option<String>,
    #[serde(default)]
    pub intent: IntentPayload,
}

#[derive(Debug, Serialize)]
pub struct TurnResponse {
    pub session_id: String,
    pub stage: Stage,
    #[serde(flatten)]
    pub response: ResponsePayload,
}
