use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    collaborators::{OfferCatalog, RetryPolicy, call_with_retry},
    error::{CollaboratorError, FlowError, Result},
    handler::{AssessmentOutcome, StageHandler, StageResult, service_unavailable},
    intent::IntentPayload,
    state::{ApplicationState, Stage, StateUpdate},
};

const MAX_TENURE_MONTHS: u32 = 120;

/// Collects the amount, the tenure preference and the customer reference.
///
/// The reference is checked against the offer catalog before the requirement counts
/// as captured, so a mistyped ID is asked for again here rather than failing later.
pub struct NeedsAssessmentHandler {
    catalog: Arc<dyn OfferCatalog>,
    retry: RetryPolicy,
}

impl NeedsAssessmentHandler {
    pub fn new(catalog: Arc<dyn OfferCatalog>, retry: RetryPolicy) -> Self {
        Self { catalog, retry }
    }
}

#[async_trait]
impl StageHandler for NeedsAssessmentHandler {
    fn stage(&self) -> Stage {
        Stage::NeedsAssessment
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        if let Some(amount) = payload.requested_amount {
            if !amount.is_finite() || amount <= 0.0 {
                return Err(FlowError::validation(
                    "requested_amount",
                    "please give a positive loan amount",
                ));
            }
        }
        if let Some(tenure) = payload.tenure_months {
            if tenure == 0 || tenure > MAX_TENURE_MONTHS {
                return Err(FlowError::validation(
                    "tenure_months",
                    format!("tenure must be between 1 and {MAX_TENURE_MONTHS} months"),
                ));
            }
        }

        let mut update = StateUpdate {
            requested_amount: payload.requested_amount,
            preferred_tenure_months: payload.tenure_months,
            applicant_ref: payload
                .customer_ref
                .as_deref()
                .map(str::trim)
                .filter(|reference| !reference.is_empty())
                .map(str::to_string),
            ..Default::default()
        };

        let amount = update.requested_amount.or(state.requested_amount);
        let tenure = update.preferred_tenure_months.or(state.preferred_tenure_months);
        let reference = update
            .applicant_ref
            .clone()
            .or_else(|| state.applicant_ref.clone());
        let has_ref = reference.is_some();

        let mut missing = Vec::new();
        if amount.is_none() {
            missing.push("the loan amount");
        }
        if tenure.is_none() {
            missing.push("your preferred tenure in months");
        }
        if !has_ref {
            missing.push("your customer ID");
        }

        if let (Some(amount), Some(tenure), Some(reference)) = (amount, tenure, reference) {
            match call_with_retry(&self.retry, "offer_catalog", || {
                self.catalog.pre_approved_limit(&reference)
            })
            .await
            {
                Ok(limit) => update.pre_approved_limit = Some(limit),
                Err(CollaboratorError::NotFound(detail)) => {
                    warn!(
                        session_id = %state.session_id,
                        customer_ref = %reference,
                        detail = %detail,
                        "Unknown customer reference"
                    );
                    update.applicant_ref = None;
                    let response = format!(
                        "I couldn't find customer ID {reference}. \
                         Could you check it and send it again?"
                    );
                    return Ok(
                        StageResult::new(AssessmentOutcome::Incomplete, response)
                            .with_update(update),
                    );
                }
                Err(err) => return Err(self.retry.escalate("offer_catalog", err)),
            }
            info!(
                session_id = %state.session_id,
                requested_amount = amount,
                tenure_months = tenure,
                "Loan requirement captured"
            );
            let response =
                format!("Got it: {amount:.0} over {tenure} months. Let me pull up your offers.");
            return Ok(StageResult::new(AssessmentOutcome::Captured, response).with_update(update));
        }

        let response = format!("To prepare your offers I still need {}.", missing.join(" and "));
        Ok(StageResult::new(AssessmentOutcome::Incomplete, response).with_update(update))
    }

    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        Some(service_unavailable(AssessmentOutcome::Unavailable))
    }
}
