use async_trait::async_trait;
use tracing::info;

use crate::{
    error::Result,
    handler::{GreetingOutcome, StageHandler, StageResult},
    intent::IntentPayload,
    state::{ApplicationState, Stage, StateUpdate},
};

/// Opens the conversation and remembers who the customer says they are.
pub struct GreetingHandler;

#[async_trait]
impl StageHandler for GreetingHandler {
    fn stage(&self) -> Stage {
        Stage::Greeting
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        info!(session_id = %state.session_id, "Greeting customer");

        let applicant_ref = payload
            .customer_ref
            .as_deref()
            .map(str::trim)
            .filter(|reference| !reference.is_empty())
            .map(str::to_string);

        let response = "Welcome! I can help you with a personal loan: competitive rates, \
            quick approval and flexible tenures. How much would you like to borrow, \
            and over how many months?";

        Ok(StageResult::new(GreetingOutcome::Welcomed, response).with_update(StateUpdate {
            applicant_ref,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn welcomes_and_records_claimed_identity() {
        let state = ApplicationState::new("s-1");
        let payload = IntentPayload {
            customer_ref: Some(" CUST001 ".into()),
            ..Default::default()
        };
        let result = GreetingHandler.handle(&state, &payload).await.unwrap();
        assert_eq!(result.outcome, GreetingOutcome::Welcomed.into());
        assert_eq!(result.update.applicant_ref.as_deref(), Some("CUST001"));
        assert!(!result.response.is_empty());
    }
}
