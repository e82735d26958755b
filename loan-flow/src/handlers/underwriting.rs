use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    collaborators::{CreditBureau, OfferCatalog, RetryPolicy, call_with_retry},
    eligibility::{Decision, EligibilityInput, EligibilityPolicy, RiskRating, decide, risk_score},
    error::{CollaboratorError, FlowError, Result},
    handler::{StageHandler, StageResult, UnderwritingOutcome, service_unavailable},
    intent::IntentPayload,
    state::{ApplicationState, DecisionRecord, Stage, StateUpdate, UnderwritingDecision},
};

/// Gathers bureau data and applies the eligibility rules.
pub struct UnderwritingHandler {
    bureau: Arc<dyn CreditBureau>,
    catalog: Arc<dyn OfferCatalog>,
    policy: EligibilityPolicy,
    retry: RetryPolicy,
}

impl UnderwritingHandler {
    pub fn new(
        bureau: Arc<dyn CreditBureau>,
        catalog: Arc<dyn OfferCatalog>,
        policy: EligibilityPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            bureau,
            catalog,
            policy,
            retry,
        }
    }
}

fn outcome_for(decision: &Decision) -> UnderwritingOutcome {
    match decision {
        Decision::InstantApprove => UnderwritingOutcome::InstantApprove,
        Decision::Approve => UnderwritingOutcome::Approve,
        Decision::NeedsSalaryDocs => UnderwritingOutcome::NeedsSalaryDocs,
        Decision::Reject(_) => UnderwritingOutcome::Reject,
    }
}

#[async_trait]
impl StageHandler for UnderwritingHandler {
    fn stage(&self) -> Stage {
        Stage::Underwriting
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        _payload: &IntentPayload,
    ) -> Result<StageResult> {
        let customer = state
            .customer_id
            .as_deref()
            .ok_or_else(|| FlowError::invariant("underwriting reached before KYC"))?;
        let requested_amount = state
            .requested_amount
            .ok_or_else(|| FlowError::invariant("underwriting reached without an amount"))?;
        let terms = state
            .terms()
            .ok_or_else(|| FlowError::invariant("underwriting reached without accepted terms"))?;

        let mut update = StateUpdate::default();

        let credit_score = match state.credit_score {
            Some(score) => score,
            None => {
                match call_with_retry(&self.retry, "credit_bureau", || {
                    self.bureau.get_score(customer)
                })
                .await
                {
                    Ok(score) => {
                        update.credit_score = Some(score);
                        score
                    }
                    Err(CollaboratorError::NotFound(detail)) => {
                        warn!(session_id = %state.session_id, detail = %detail, "No bureau file");
                        update.decision = Some(DecisionRecord::new(
                            UnderwritingDecision::Reject,
                            "no credit history on file",
                        ));
                        return Ok(StageResult::new(
                            UnderwritingOutcome::Reject,
                            "I'm sorry, we could not find a credit history for you, \
                             so we cannot approve this loan.",
                        )
                        .with_update(update));
                    }
                    Err(err) => return Err(self.retry.escalate("credit_bureau", err)),
                }
            }
        };

        let pre_approved_limit = match state.pre_approved_limit {
            Some(limit) => limit,
            None => {
                let limit = call_with_retry(&self.retry, "offer_catalog", || {
                    self.catalog.pre_approved_limit(customer)
                })
                .await
                .map_err(|err| self.retry.escalate("offer_catalog", err))?;
                update.pre_approved_limit = Some(limit);
                limit
            }
        };

        let existing_emi = match state.existing_emi {
            Some(emi) => emi,
            None if state.salary_verified => {
                let emi = call_with_retry(&self.retry, "credit_bureau", || {
                    self.bureau.existing_emi(customer)
                })
                .await
                .map_err(|err| self.retry.escalate("credit_bureau", err))?;
                update.existing_emi = Some(emi);
                emi
            }
            None => 0.0,
        };

        let input = EligibilityInput {
            credit_score,
            requested_amount,
            pre_approved_limit,
            salary_verified: state.salary_verified,
            new_emi: terms.monthly_emi,
            existing_emi,
            monthly_salary: state.monthly_salary,
            interest_rate: terms.interest_rate,
            tenure_months: terms.tenure_months,
        };
        let decision = decide(&self.policy, &input);
        let reason = decision.reason();
        let risk = risk_score(&input);
        let rating = RiskRating::from_score(risk);
        info!(
            session_id = %state.session_id,
            credit_score,
            requested_amount,
            pre_approved_limit,
            risk_score = risk,
            risk_rating = %rating,
            decision = ?decision.as_underwriting(),
            reason = %reason,
            "Underwriting decision"
        );

        let approved_amount = decision
            .as_underwriting()
            .is_approval()
            .then_some(requested_amount);
        let recommendations = decision.recommendations();
        update.decision = Some(DecisionRecord {
            decision: decision.as_underwriting(),
            reason: Some(reason.clone()),
            approved_amount,
            risk_score: Some(risk),
            risk_rating: Some(rating),
            recommendations: recommendations.clone(),
        });

        let response = match decision {
            Decision::InstantApprove | Decision::Approve => format!(
                "Good news: your loan of {requested_amount:.0} is approved. \
                 Preparing your sanction letter."
            ),
            Decision::NeedsSalaryDocs => format!(
                "Your request is above your pre-approved limit of {pre_approved_limit:.0}. \
                 Please upload your latest salary slip to continue."
            ),
            Decision::Reject(_) => {
                let mut message = format!("I'm sorry, we cannot approve this loan: {reason}.");
                for tip in &recommendations {
                    message.push_str("\n- ");
                    message.push_str(tip);
                }
                message
            }
        };

        Ok(StageResult::new(outcome_for(&decision), response).with_update(update))
    }

    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        Some(service_unavailable(UnderwritingOutcome::Unavailable))
    }
}
