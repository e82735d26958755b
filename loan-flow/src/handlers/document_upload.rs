use async_trait::async_trait;
use tracing::info;

use crate::{
    error::{FlowError, Result},
    handler::{StageHandler, StageResult, UploadOutcome},
    intent::{IntentPayload, SalaryEvidence},
    state::{ApplicationState, Stage, StateUpdate},
};

/// Waits for salary evidence, then hands back to underwriting.
pub struct DocumentUploadHandler;

#[async_trait]
impl StageHandler for DocumentUploadHandler {
    fn stage(&self) -> Stage {
        Stage::DocumentUpload
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        let Some(evidence) = &payload.salary_evidence else {
            return Ok(StageResult::new(
                UploadOutcome::Awaiting,
                "Please upload your latest salary slip so we can complete the assessment.",
            ));
        };

        let document_ref = evidence.document_ref.trim();
        if document_ref.is_empty() {
            return Err(FlowError::validation(
                "salary_evidence",
                "the uploaded document could not be identified",
            ));
        }
        if !evidence.monthly_salary.is_finite() || evidence.monthly_salary <= 0.0 {
            return Err(FlowError::validation(
                "salary_evidence",
                "the monthly salary on the slip must be a positive amount",
            ));
        }

        info!(
            session_id = %state.session_id,
            document_ref,
            monthly_salary = evidence.monthly_salary,
            "Salary evidence received"
        );
        Ok(StageResult::new(
            UploadOutcome::Received,
            "Thanks, I've got your salary slip. Re-assessing your application now.",
        )
        .with_update(StateUpdate {
            salary: Some(SalaryEvidence {
                document_ref: document_ref.to_string(),
                monthly_salary: evidence.monthly_salary,
            }),
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(document_ref: &str, monthly_salary: f64) -> IntentPayload {
        IntentPayload {
            salary_evidence: Some(SalaryEvidence {
                document_ref: document_ref.into(),
                monthly_salary,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn waits_until_evidence_arrives() {
        let state = ApplicationState::new("s-1");
        let result = DocumentUploadHandler
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap();
        assert_eq!(result.outcome, UploadOutcome::Awaiting.into());
        assert!(result.update.is_empty());

        let result = DocumentUploadHandler
            .handle(&state, &upload("slip-0925.pdf", 85_000.0))
            .await
            .unwrap();
        assert_eq!(result.outcome, UploadOutcome::Received.into());
        assert_eq!(result.update.salary.unwrap().monthly_salary, 85_000.0);
    }

    #[tokio::test]
    async fn unusable_evidence_needs_clarification() {
        let state = ApplicationState::new("s-1");
        for payload in [upload("  ", 85_000.0), upload("slip.pdf", 0.0)] {
            let err = DocumentUploadHandler
                .handle(&state, &payload)
                .await
                .unwrap_err();
            assert!(matches!(err, FlowError::Validation { .. }));
        }
    }
}
