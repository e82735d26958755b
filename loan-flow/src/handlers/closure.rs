use async_trait::async_trait;

use crate::{
    error::Result,
    handler::{ClosureOutcome, StageHandler, StageResult},
    intent::IntentPayload,
    state::{ApplicationState, ApplicationStatus, Stage},
};

/// Terminal stage. Summarises the result and changes nothing.
pub struct ClosureHandler;

#[async_trait]
impl StageHandler for ClosureHandler {
    fn stage(&self) -> Stage {
        Stage::Closure
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        _payload: &IntentPayload,
    ) -> Result<StageResult> {
        let mut response = match state.application_status {
            ApplicationStatus::Approved => format!(
                "Your application is complete. Sanction reference: {}. Thank you for choosing us!",
                state.sanction_reference.as_deref().unwrap_or("pending")
            ),
            ApplicationStatus::Rejected => match &state.decision_reason {
                Some(reason) => format!("This application is closed: {reason}."),
                None => "This application is closed and could not be approved.".to_string(),
            },
            ApplicationStatus::Abandoned if state.service_unavailable => {
                "This application is closed because our systems are unavailable right now. \
                 Please start a new application a little later."
                    .to_string()
            }
            ApplicationStatus::Abandoned => {
                "This application is closed. Feel free to start a new one any time.".to_string()
            }
            ApplicationStatus::InProgress => "This application is closed.".to_string(),
        };
        if state.application_status == ApplicationStatus::Rejected {
            for tip in &state.recommendations {
                response.push_str("\n- ");
                response.push_str(tip);
            }
        }
        Ok(StageResult::new(ClosureOutcome::Closed, response))
    }
}
