use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

use crate::{
    eligibility::{EligibilityPolicy, RiskRating},
    error::{FlowError, Result},
    intent::{ResponsePayload, SalaryEvidence},
    offers::LoanOffer,
};

/// Named phase of the loan workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Greeting,
    NeedsAssessment,
    SalesNegotiation,
    Verification,
    Underwriting,
    DocumentUpload,
    SanctionGeneration,
    Closure,
}

impl Stage {
    pub const ALL: [Stage; 8] = [
        Stage::Greeting,
        Stage::NeedsAssessment,
        Stage::SalesNegotiation,
        Stage::Verification,
        Stage::Underwriting,
        Stage::DocumentUpload,
        Stage::SanctionGeneration,
        Stage::Closure,
    ];

    pub fn is_terminal(self) -> bool {
        self == Stage::Closure
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Greeting => "greeting",
            Stage::NeedsAssessment => "needs_assessment",
            Stage::SalesNegotiation => "sales_negotiation",
            Stage::Verification => "verification",
            Stage::Underwriting => "underwriting",
            Stage::DocumentUpload => "document_upload",
            Stage::SanctionGeneration => "sanction_generation",
            Stage::Closure => "closure",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    InProgress,
    Approved,
    Rejected,
    /// Customer walked away from the final offer.
    Abandoned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderwritingDecision {
    Pending,
    InstantApprove,
    Approve,
    NeedsSalaryDocs,
    Reject,
}

impl UnderwritingDecision {
    pub fn is_approval(self) -> bool {
        matches!(self, Self::InstantApprove | Self::Approve)
    }

    /// Pending and NeedsSalaryDocs are provisional; every other decision is final.
    pub fn can_transition_to(self, next: UnderwritingDecision) -> bool {
        use UnderwritingDecision::*;
        match (self, next) {
            (_, Pending) => false,
            (Pending | NeedsSalaryDocs, _) => true,
            (current, next) => current == next,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Customer,
    Assistant,
    System,
}

/// One entry of the conversation audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub speaker: Speaker,
    pub text: String,
    pub stage: Stage,
    pub turn_id: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// Append-only conversation log. Entries can be read but never edited or removed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TurnLog(Vec<Turn>);

impl TurnLog {
    pub fn append(&mut self, turn: Turn) {
        self.0.push(turn);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Turn> {
        self.0.iter()
    }
}

/// Tenure, rate and installment of an accepted offer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoanTerms {
    pub tenure_months: u32,
    pub interest_rate: f64,
    pub monthly_emi: f64,
}

/// Audit record left behind when a computed value is superseded by re-assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub field: String,
    pub previous: f64,
    pub current: f64,
    pub revised_at: DateTime<Utc>,
}

/// Where a turn id sits relative to the last accepted one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOrder {
    Fresh,
    Duplicate,
    Stale { last_accepted: u64 },
}

/// The single record threaded through the workflow for one customer session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationState {
    pub session_id: String,
    pub customer_id: Option<String>,
    /// Identity claimed at intake, confirmed into `customer_id` by verification.
    pub applicant_ref: Option<String>,
    pub turn_log: TurnLog,

    pub current_stage: Stage,
    pub previous_stage: Option<Stage>,

    pub requested_amount: Option<f64>,
    pub preferred_tenure_months: Option<u32>,
    pub approved_amount: Option<f64>,
    pub tenure_months: Option<u32>,
    pub interest_rate: Option<f64>,
    pub monthly_emi: Option<f64>,
    pub offers: Vec<LoanOffer>,
    pub negotiation_attempts: u32,
    pub final_offer_presented: bool,

    pub kyc_verified: bool,
    pub phone_verified: bool,
    pub address_verified: bool,
    pub otp_issued: bool,
    pub verification_failures: u32,
    pub verification_failed: bool,

    pub credit_score: Option<u32>,
    pub pre_approved_limit: Option<f64>,
    pub salary_verified: bool,
    pub monthly_salary: Option<f64>,
    pub existing_emi: Option<f64>,
    pub salary_document_ref: Option<String>,
    pub underwriting_decision: UnderwritingDecision,
    pub decision_reason: Option<String>,
    pub risk_score: Option<f64>,
    pub risk_rating: Option<RiskRating>,
    /// Suggestions handed to the customer alongside a rejection.
    pub recommendations: Vec<String>,

    pub sanction_reference: Option<String>,
    pub application_status: ApplicationStatus,

    /// Consecutive turns at the current stage that ended in a collaborator or handler timeout.
    pub timed_out_turns: u32,
    /// Set when the session was closed because a collaborator stayed unreachable.
    pub service_unavailable: bool,

    pub revisions: Vec<Revision>,
    pub last_turn_id: Option<u64>,
    pub last_response: Option<ResponsePayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApplicationState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            customer_id: None,
            applicant_ref: None,
            turn_log: TurnLog::default(),
            current_stage: Stage::Greeting,
            previous_stage: None,
            requested_amount: None,
            preferred_tenure_months: None,
            approved_amount: None,
            tenure_months: None,
            interest_rate: None,
            monthly_emi: None,
            offers: Vec::new(),
            negotiation_attempts: 0,
            final_offer_presented: false,
            kyc_verified: false,
            phone_verified: false,
            address_verified: false,
            otp_issued: false,
            verification_failures: 0,
            verification_failed: false,
            credit_score: None,
            pre_approved_limit: None,
            salary_verified: false,
            monthly_salary: None,
            existing_emi: None,
            salary_document_ref: None,
            underwriting_decision: UnderwritingDecision::Pending,
            decision_reason: None,
            risk_score: None,
            risk_rating: None,
            recommendations: Vec::new(),
            sanction_reference: None,
            application_status: ApplicationStatus::InProgress,
            timed_out_turns: 0,
            service_unavailable: false,
            revisions: Vec::new(),
            last_turn_id: None,
            last_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn terms(&self) -> Option<LoanTerms> {
        Some(LoanTerms {
            tenure_months: self.tenure_months?,
            interest_rate: self.interest_rate?,
            monthly_emi: self.monthly_emi?,
        })
    }

    pub fn idle_for(&self) -> TimeDelta {
        Utc::now() - self.updated_at
    }

    pub fn check_turn(&self, turn_id: u64) -> TurnOrder {
        match self.last_turn_id {
            None => TurnOrder::Fresh,
            Some(last) if turn_id > last => TurnOrder::Fresh,
            Some(last) if turn_id == last => TurnOrder::Duplicate,
            Some(last) => TurnOrder::Stale {
                last_accepted: last,
            },
        }
    }

    pub(crate) fn record_turn(
        &mut self,
        speaker: Speaker,
        text: impl Into<String>,
        stage: Stage,
        turn_id: Option<u64>,
    ) {
        self.turn_log.append(Turn {
            speaker,
            text: text.into(),
            stage,
            turn_id,
            timestamp: Utc::now(),
        });
    }

    /// Moves the session to `target`. Only the engine calls this, with a stage the router chose.
    pub(crate) fn advance_to(&mut self, target: Stage) {
        if target == self.current_stage {
            return;
        }
        self.previous_stage = Some(self.current_stage);
        self.current_stage = target;
        if target.is_terminal() {
            self.application_status = self.terminal_status();
        }
    }

    fn terminal_status(&self) -> ApplicationStatus {
        if self.sanction_reference.is_some() {
            ApplicationStatus::Approved
        } else if self.underwriting_decision == UnderwritingDecision::Reject
            || self.verification_failed
        {
            ApplicationStatus::Rejected
        } else {
            ApplicationStatus::Abandoned
        }
    }

    fn revise<T>(&mut self, field: &str, slot: Option<T>, value: T) -> T
    where
        T: Copy + PartialEq + Into<f64>,
    {
        if let Some(previous) = slot {
            if previous != value {
                self.revisions.push(Revision {
                    field: field.to_string(),
                    previous: previous.into(),
                    current: value.into(),
                    revised_at: Utc::now(),
                });
            }
        }
        value
    }
}

/// Read-only view of a session handed to drivers for rendering and audit.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct ApplicationStateSnapshot(ApplicationState);

impl From<&ApplicationState> for ApplicationStateSnapshot {
    fn from(state: &ApplicationState) -> Self {
        Self(state.clone())
    }
}

impl Deref for ApplicationStateSnapshot {
    type Target = ApplicationState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    pub decision: UnderwritingDecision,
    pub reason: Option<String>,
    pub approved_amount: Option<f64>,
    pub risk_score: Option<f64>,
    pub risk_rating: Option<RiskRating>,
    pub recommendations: Vec<String>,
}

impl DecisionRecord {
    pub fn new(decision: UnderwritingDecision, reason: impl Into<String>) -> Self {
        Self {
            decision,
            reason: Some(reason.into()),
            approved_amount: None,
            risk_score: None,
            risk_rating: None,
            recommendations: Vec::new(),
        }
    }
}

/// Partial change produced by a stage handler.
///
/// Boolean flags only ever switch a field on, so verification flags cannot regress.
/// Everything is checked against the session invariants in [`StateUpdate::apply`].
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub applicant_ref: Option<String>,
    pub customer_id: Option<String>,
    pub requested_amount: Option<f64>,
    pub preferred_tenure_months: Option<u32>,
    pub pre_approved_limit: Option<f64>,
    pub offers: Option<Vec<LoanOffer>>,
    pub negotiation_attempts: Option<u32>,
    pub final_offer_presented: bool,
    pub terms: Option<LoanTerms>,
    pub phone_verified: bool,
    pub address_verified: bool,
    pub kyc_verified: bool,
    pub otp_issued: bool,
    pub verification_failures: Option<u32>,
    pub verification_failed: bool,
    pub credit_score: Option<u32>,
    pub existing_emi: Option<f64>,
    pub salary: Option<SalaryEvidence>,
    pub decision: Option<DecisionRecord>,
    pub sanction_reference: Option<String>,
    pub service_unavailable: bool,
}

impl StateUpdate {
    pub fn is_empty(&self) -> bool {
        self.applicant_ref.is_none()
            && self.customer_id.is_none()
            && self.requested_amount.is_none()
            && self.preferred_tenure_months.is_none()
            && self.pre_approved_limit.is_none()
            && self.offers.is_none()
            && self.negotiation_attempts.is_none()
            && !self.final_offer_presented
            && self.terms.is_none()
            && !self.phone_verified
            && !self.address_verified
            && !self.kyc_verified
            && !self.otp_issued
            && self.verification_failures.is_none()
            && !self.verification_failed
            && self.credit_score.is_none()
            && self.existing_emi.is_none()
            && self.salary.is_none()
            && self.decision.is_none()
            && self.sanction_reference.is_none()
            && !self.service_unavailable
    }

    pub fn apply(self, state: &mut ApplicationState, policy: &EligibilityPolicy) -> Result<()> {
        if let Some(customer_id) = self.customer_id {
            match &state.customer_id {
                Some(existing) if *existing != customer_id => {
                    return Err(FlowError::invariant(format!(
                        "customer_id already resolved to {existing}, refusing {customer_id}"
                    )));
                }
                _ => state.customer_id = Some(customer_id),
            }
        }

        if let Some(applicant_ref) = self.applicant_ref {
            if let Some(customer_id) = &state.customer_id {
                if *customer_id != applicant_ref {
                    return Err(FlowError::invariant(
                        "applicant reference cannot change after identity is verified",
                    ));
                }
            }
            state.applicant_ref = Some(applicant_ref);
        }

        if let Some(amount) = self.requested_amount {
            let amount = state.revise("requested_amount", state.requested_amount, amount);
            state.requested_amount = Some(amount);
        }
        if let Some(tenure) = self.preferred_tenure_months {
            state.preferred_tenure_months = Some(tenure);
        }
        if let Some(limit) = self.pre_approved_limit {
            let limit = state.revise("pre_approved_limit", state.pre_approved_limit, limit);
            state.pre_approved_limit = Some(limit);
        }
        if let Some(offers) = self.offers {
            state.offers = offers;
        }
        if let Some(attempts) = self.negotiation_attempts {
            state.negotiation_attempts = attempts;
        }
        state.final_offer_presented |= self.final_offer_presented;

        if let Some(terms) = self.terms {
            let tenure = state.revise("tenure_months", state.tenure_months, terms.tenure_months);
            let rate = state.revise("interest_rate", state.interest_rate, terms.interest_rate);
            let emi = state.revise("monthly_emi", state.monthly_emi, terms.monthly_emi);
            state.tenure_months = Some(tenure);
            state.interest_rate = Some(rate);
            state.monthly_emi = Some(emi);
        }

        state.phone_verified |= self.phone_verified;
        state.address_verified |= self.address_verified;
        state.kyc_verified |= self.kyc_verified;
        state.otp_issued |= self.otp_issued;
        state.verification_failed |= self.verification_failed;
        if let Some(failures) = self.verification_failures {
            if failures < state.verification_failures {
                return Err(FlowError::invariant("verification failure count cannot decrease"));
            }
            state.verification_failures = failures;
        }

        if let Some(score) = self.credit_score {
            let score = state.revise("credit_score", state.credit_score, score);
            state.credit_score = Some(score);
        }
        if let Some(existing_emi) = self.existing_emi {
            let existing_emi = state.revise("existing_emi", state.existing_emi, existing_emi);
            state.existing_emi = Some(existing_emi);
        }
        if let Some(salary) = self.salary {
            let monthly = state.revise("monthly_salary", state.monthly_salary, salary.monthly_salary);
            state.monthly_salary = Some(monthly);
            state.salary_document_ref = Some(salary.document_ref);
            state.salary_verified = true;
        }

        if let Some(record) = self.decision {
            let current = state.underwriting_decision;
            if !current.can_transition_to(record.decision) {
                return Err(FlowError::invariant(format!(
                    "underwriting decision cannot move from {current:?} to {:?}",
                    record.decision
                )));
            }
            if record.decision.is_approval() {
                match state.credit_score {
                    Some(score) if score >= policy.min_credit_score => {}
                    _ => {
                        return Err(FlowError::invariant(
                            "approval requires a credit score at or above the minimum",
                        ));
                    }
                }
            }
            state.underwriting_decision = record.decision;
            state.decision_reason = record.reason;
            if let Some(amount) = record.approved_amount {
                let amount = state.revise("approved_amount", state.approved_amount, amount);
                state.approved_amount = Some(amount);
            }
            if let Some(score) = record.risk_score {
                let score = state.revise("risk_score", state.risk_score, score);
                state.risk_score = Some(score);
            }
            if record.risk_rating.is_some() {
                state.risk_rating = record.risk_rating;
            }
            state.recommendations = record.recommendations;
        }

        if let Some(reference) = self.sanction_reference {
            match &state.sanction_reference {
                Some(existing) if *existing != reference => {
                    return Err(FlowError::invariant(format!(
                        "sanction reference {existing} already issued"
                    )));
                }
                _ => state.sanction_reference = Some(reference),
            }
        }

        state.service_unavailable |= self.service_unavailable;
        state.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> EligibilityPolicy {
        EligibilityPolicy::default()
    }

    #[test]
    fn fresh_session_starts_at_greeting() {
        let state = ApplicationState::new("s-1");
        assert_eq!(state.current_stage, Stage::Greeting);
        assert_eq!(state.application_status, ApplicationStatus::InProgress);
        assert_eq!(state.underwriting_decision, UnderwritingDecision::Pending);
        assert!(state.turn_log.is_empty());
        assert!(state.requested_amount.is_none());
    }

    #[test]
    fn verification_flags_never_reset() {
        let mut state = ApplicationState::new("s-1");
        StateUpdate {
            phone_verified: true,
            ..Default::default()
        }
        .apply(&mut state, &policy())
        .unwrap();

        StateUpdate::default().apply(&mut state, &policy()).unwrap();
        assert!(state.phone_verified);
    }

    #[test]
    fn approval_without_score_is_rejected() {
        let mut state = ApplicationState::new("s-1");
        let err = StateUpdate {
            decision: Some(DecisionRecord {
                approved_amount: Some(100_000.0),
                ..DecisionRecord::new(UnderwritingDecision::Approve, "within limit")
            }),
            ..Default::default()
        }
        .apply(&mut state, &policy())
        .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
        assert_eq!(state.underwriting_decision, UnderwritingDecision::Pending);
    }

    #[test]
    fn final_decisions_do_not_flip() {
        let mut state = ApplicationState::new("s-1");
        state.credit_score = Some(800);
        state.underwriting_decision = UnderwritingDecision::Reject;
        let err = StateUpdate {
            decision: Some(DecisionRecord::new(UnderwritingDecision::Approve, "retry")),
            ..Default::default()
        }
        .apply(&mut state, &policy())
        .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
    }

    #[test]
    fn sanction_reference_is_write_once() {
        let mut state = ApplicationState::new("s-1");
        state.sanction_reference = Some("SL/1".into());
        let err = StateUpdate {
            sanction_reference: Some("SL/2".into()),
            ..Default::default()
        }
        .apply(&mut state, &policy())
        .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
        assert_eq!(state.sanction_reference.as_deref(), Some("SL/1"));
    }

    #[test]
    fn reassessed_terms_leave_a_revision() {
        let mut state = ApplicationState::new("s-1");
        let first = LoanTerms {
            tenure_months: 24,
            interest_rate: 0.11,
            monthly_emi: 18_643.0,
        };
        let second = LoanTerms {
            tenure_months: 36,
            ..first
        };
        for terms in [first, second] {
            StateUpdate {
                terms: Some(terms),
                ..Default::default()
            }
            .apply(&mut state, &policy())
            .unwrap();
        }
        assert_eq!(state.tenure_months, Some(36));
        assert_eq!(state.revisions.len(), 1);
        assert_eq!(state.revisions[0].field, "tenure_months");
        assert_eq!(state.revisions[0].previous, 24.0);
    }

    #[test]
    fn entering_closure_resolves_status() {
        let mut state = ApplicationState::new("s-1");
        state.current_stage = Stage::Underwriting;
        state.underwriting_decision = UnderwritingDecision::Reject;
        state.advance_to(Stage::Closure);
        assert_eq!(state.application_status, ApplicationStatus::Rejected);
        assert_eq!(state.previous_stage, Some(Stage::Underwriting));

        let mut state = ApplicationState::new("s-2");
        state.current_stage = Stage::SanctionGeneration;
        state.sanction_reference = Some("SL/1".into());
        state.advance_to(Stage::Closure);
        assert_eq!(state.application_status, ApplicationStatus::Approved);
    }

    #[test]
    fn status_stays_in_progress_outside_closure() {
        let mut state = ApplicationState::new("s-1");
        state.underwriting_decision = UnderwritingDecision::Reject;
        state.advance_to(Stage::DocumentUpload);
        assert_eq!(state.application_status, ApplicationStatus::InProgress);
    }

    #[test]
    fn turn_ordering() {
        let mut state = ApplicationState::new("s-1");
        assert_eq!(state.check_turn(1), TurnOrder::Fresh);
        state.last_turn_id = Some(4);
        assert_eq!(state.check_turn(5), TurnOrder::Fresh);
        assert_eq!(state.check_turn(4), TurnOrder::Duplicate);
        assert_eq!(state.check_turn(2), TurnOrder::Stale { last_accepted: 4 });
    }
}
