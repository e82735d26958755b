use serde::{Deserialize, Serialize};

use crate::{
    offers::LoanOffer,
    state::{ApplicationState, ApplicationStatus, Stage},
};

/// How the customer responded to the offers on the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationMove {
    /// Accept the offer at this zero-based index.
    Accept(usize),
    /// Ask for a better rate.
    Counter,
    Decline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SalaryEvidence {
    pub document_ref: String,
    pub monthly_salary: f64,
}

/// Structured fields extracted upstream from one customer turn.
///
/// Every field is optional; each stage handler reads the ones it cares about.
/// `utterance` is kept for the audit log only and is never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentPayload {
    pub turn_id: Option<u64>,
    pub utterance: Option<String>,
    pub customer_ref: Option<String>,
    pub requested_amount: Option<f64>,
    pub tenure_months: Option<u32>,
    pub negotiation: Option<NegotiationMove>,
    pub otp_code: Option<String>,
    pub resend_otp: bool,
    pub address_confirmed: Option<bool>,
    pub salary_evidence: Option<SalaryEvidence>,
}

impl IntentPayload {
    pub fn with_turn_id(mut self, turn_id: u64) -> Self {
        self.turn_id = Some(turn_id);
        self
    }

    /// Text recorded in the turn log for this input.
    pub fn summary(&self) -> String {
        if let Some(utterance) = &self.utterance {
            return utterance.clone();
        }

        let mut parts = Vec::new();
        if let Some(customer_ref) = &self.customer_ref {
            parts.push(format!("customer_ref={customer_ref}"));
        }
        if let Some(amount) = self.requested_amount {
            parts.push(format!("requested_amount={amount:.2}"));
        }
        if let Some(tenure) = self.tenure_months {
            parts.push(format!("tenure_months={tenure}"));
        }
        if let Some(negotiation) = self.negotiation {
            parts.push(format!("negotiation={negotiation:?}"));
        }
        // the code itself stays out of the audit trail
        if self.otp_code.is_some() {
            parts.push("otp_code=<redacted>".to_string());
        }
        if self.resend_otp {
            parts.push("resend_otp".to_string());
        }
        if let Some(confirmed) = self.address_confirmed {
            parts.push(format!("address_confirmed={confirmed}"));
        }
        if let Some(evidence) = &self.salary_evidence {
            parts.push(format!("salary_document={}", evidence.document_ref));
        }

        if parts.is_empty() {
            "<no structured input>".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The current stage needs customer input before it can move on.
    WaitingForInput,
    /// The next stage can run without input; send another turn to drive it.
    ReadyToContinue,
    /// The payload was unusable for the current stage; nothing was changed.
    NeedsClarification,
    /// The session reached Closure.
    Completed,
}

/// What the driver renders back to the customer after a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub message: String,
    pub status: ExecutionStatus,
    pub application_status: ApplicationStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offers: Vec<LoanOffer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sanction_reference: Option<String>,
    /// Set when this is a replay of an already processed turn.
    #[serde(default)]
    pub duplicate: bool,
}

impl ResponsePayload {
    pub(crate) fn from_state(
        state: &ApplicationState,
        message: String,
        status: ExecutionStatus,
    ) -> Self {
        let offers = if state.current_stage == Stage::SalesNegotiation {
            state.offers.clone()
        } else {
            Vec::new()
        };
        Self {
            message,
            status,
            application_status: state.application_status,
            offers,
            sanction_reference: state.sanction_reference.clone(),
            duplicate: false,
        }
    }
}

/// Result of [`crate::WorkflowEngine::process_turn`].
#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub response: ResponsePayload,
    pub stage: Stage,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prefers_the_utterance() {
        let payload = IntentPayload {
            utterance: Some("I need 4 lakh".into()),
            requested_amount: Some(400_000.0),
            ..Default::default()
        };
        assert_eq!(payload.summary(), "I need 4 lakh");
    }

    #[test]
    fn summary_never_contains_the_otp() {
        let payload = IntentPayload {
            otp_code: Some("482913".into()),
            address_confirmed: Some(true),
            ..Default::default()
        };
        let summary = payload.summary();
        assert!(!summary.contains("482913"));
        assert!(summary.contains("address_confirmed=true"));
    }

    #[test]
    fn payload_deserializes_from_partial_json() {
        let payload: IntentPayload = serde_json::from_str(
            r#"{"turn_id": 3, "negotiation": {"accept": 1}, "otp_code": "123456"}"#,
        )
        .unwrap();
        assert_eq!(payload.turn_id, Some(3));
        assert_eq!(payload.negotiation, Some(NegotiationMove::Accept(1)));
        assert!(!payload.resend_otp);
        assert!(payload.requested_amount.is_none());
    }
}
