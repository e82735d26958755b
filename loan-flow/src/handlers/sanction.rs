use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    collaborators::{DocumentIssuer, RetryPolicy, call_with_retry},
    error::{CollaboratorError, FlowError, Result},
    handler::{SanctionOutcome, StageHandler, StageResult, service_unavailable},
    intent::IntentPayload,
    state::{ApplicationState, Stage, StateUpdate},
};

/// Issues the sanction letter for an approved application.
///
/// Re-running the stage never issues a second reference: an existing one is reported again.
pub struct SanctionHandler {
    issuer: Arc<dyn DocumentIssuer>,
    retry: RetryPolicy,
}

impl SanctionHandler {
    pub fn new(issuer: Arc<dyn DocumentIssuer>, retry: RetryPolicy) -> Self {
        Self { issuer, retry }
    }

    fn issued_message(state: &ApplicationState, reference: &str) -> String {
        let mut message = format!("Your sanction letter is ready. Reference: {reference}.");
        if let (Some(amount), Some(terms)) = (state.approved_amount, state.terms()) {
            message.push_str(&format!(
                " Amount {amount:.0} over {} months at {:.2}% p.a., EMI {:.2}.",
                terms.tenure_months,
                terms.interest_rate * 100.0,
                terms.monthly_emi
            ));
        }
        message
    }
}

#[async_trait]
impl StageHandler for SanctionHandler {
    fn stage(&self) -> Stage {
        Stage::SanctionGeneration
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        _payload: &IntentPayload,
    ) -> Result<StageResult> {
        if !state.underwriting_decision.is_approval() {
            return Err(FlowError::invariant(format!(
                "sanction requested for a {:?} decision",
                state.underwriting_decision
            )));
        }

        if let Some(reference) = &state.sanction_reference {
            return Ok(StageResult::new(
                SanctionOutcome::Issued,
                Self::issued_message(state, reference),
            ));
        }

        match call_with_retry(&self.retry, "document_issuer", || {
            self.issuer.generate_sanction(state)
        })
        .await
        {
            Ok(reference) => {
                info!(session_id = %state.session_id, sanction_reference = %reference, "Sanction letter issued");
                let message = Self::issued_message(state, &reference);
                Ok(
                    StageResult::new(SanctionOutcome::Issued, message).with_update(StateUpdate {
                        sanction_reference: Some(reference),
                        ..Default::default()
                    }),
                )
            }
            Err(CollaboratorError::Failure(message)) => {
                error!(session_id = %state.session_id, error = %message, "Sanction letter generation failed");
                Ok(StageResult::new(
                    SanctionOutcome::Failed,
                    "Your loan is approved, but we could not produce the sanction letter just now. \
                     Send any message to try again.",
                ))
            }
            Err(err) => Err(self.retry.escalate("document_issuer", err)),
        }
    }

    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        Some(service_unavailable(SanctionOutcome::Unavailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{in_memory::ReferenceDocumentIssuer, state::UnderwritingDecision};

    fn approved() -> ApplicationState {
        let mut state = ApplicationState::new("s-1");
        state.customer_id = Some("CUST001".into());
        state.credit_score = Some(800);
        state.underwriting_decision = UnderwritingDecision::InstantApprove;
        state.approved_amount = Some(400_000.0);
        state.tenure_months = Some(36);
        state.interest_rate = Some(0.115);
        state.monthly_emi = Some(13_190.0);
        state
    }

    struct BrokenIssuer;

    #[async_trait]
    impl DocumentIssuer for BrokenIssuer {
        async fn generate_sanction(
            &self,
            _state: &ApplicationState,
        ) -> std::result::Result<String, CollaboratorError> {
            Err(CollaboratorError::Failure("template missing".into()))
        }
    }

    #[tokio::test]
    async fn issues_once() {
        let handler = SanctionHandler::new(
            Arc::new(ReferenceDocumentIssuer::new()),
            RetryPolicy::default(),
        );
        let mut state = approved();
        let result = handler
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap();
        assert_eq!(result.outcome, SanctionOutcome::Issued.into());
        let reference = result.update.sanction_reference.unwrap();
        assert!(reference.starts_with("SL/"));

        state.sanction_reference = Some(reference.clone());
        let again = handler
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap();
        assert!(again.update.sanction_reference.is_none());
        assert!(again.response.contains(&reference));
    }

    #[tokio::test]
    async fn issuer_failure_waits_for_a_retry() {
        let handler = SanctionHandler::new(Arc::new(BrokenIssuer), RetryPolicy::default());
        let result = handler
            .handle(&approved(), &IntentPayload::default())
            .await
            .unwrap();
        assert_eq!(result.outcome, SanctionOutcome::Failed.into());
        assert!(result.update.is_empty());
    }

    #[tokio::test]
    async fn refuses_unapproved_applications() {
        let handler = SanctionHandler::new(
            Arc::new(ReferenceDocumentIssuer::new()),
            RetryPolicy::default(),
        );
        let mut state = approved();
        state.underwriting_decision = UnderwritingDecision::Reject;
        let err = handler
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
    }
}
