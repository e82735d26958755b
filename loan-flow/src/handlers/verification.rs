use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::{
    collaborators::{OtpProvider, RetryPolicy, call_with_retry},
    config::VerificationPolicy,
    error::{FlowError, Result},
    handler::{StageHandler, StageResult, VerificationOutcome, service_unavailable},
    intent::IntentPayload,
    state::{ApplicationState, Stage, StateUpdate},
};

fn is_well_formed(code: &str) -> bool {
    (4..=8).contains(&code.len()) && code.bytes().all(|byte| byte.is_ascii_digit())
}

/// Phone OTP plus address confirmation. Both must pass before underwriting.
///
/// Codes are issued to the session, so a resend replaces the outstanding code.
pub struct VerificationHandler {
    otp: Arc<dyn OtpProvider>,
    policy: VerificationPolicy,
    retry: RetryPolicy,
}

impl VerificationHandler {
    pub fn new(otp: Arc<dyn OtpProvider>, policy: VerificationPolicy, retry: RetryPolicy) -> Self {
        Self { otp, policy, retry }
    }

    async fn issue(&self, recipient: &str) -> Result<()> {
        call_with_retry(&self.retry, "otp_provider", || self.otp.issue(recipient))
            .await
            .map(|_| ())
            .map_err(|err| self.retry.escalate("otp_provider", err))
    }

    async fn verify(&self, recipient: &str, code: &str) -> Result<bool> {
        call_with_retry(&self.retry, "otp_provider", || self.otp.verify(recipient, code))
            .await
            .map_err(|err| self.retry.escalate("otp_provider", err))
    }
}

#[async_trait]
impl StageHandler for VerificationHandler {
    fn stage(&self) -> Stage {
        Stage::Verification
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        let recipient = state.session_id.as_str();

        if !state.otp_issued || payload.resend_otp {
            self.issue(recipient).await?;
            info!(session_id = %state.session_id, resend = state.otp_issued, "One-time code sent");
            let mut response =
                "I've sent a one-time code to your registered mobile number. Please share it"
                    .to_string();
            if !state.address_verified {
                response.push_str(" and confirm your address on file");
            }
            response.push('.');
            return Ok(
                StageResult::new(VerificationOutcome::Pending, response).with_update(StateUpdate {
                    otp_issued: true,
                    ..Default::default()
                }),
            );
        }

        let mut update = StateUpdate::default();
        let mut phone = state.phone_verified;
        let mut address = state.address_verified;
        let mut failures = state.verification_failures;
        let mut notes = Vec::new();

        if let Some(code) = payload.otp_code.as_deref().map(str::trim) {
            if !phone {
                if !is_well_formed(code) {
                    return Err(FlowError::validation(
                        "otp_code",
                        "the code should be 4 to 8 digits",
                    ));
                }
                if self.verify(recipient, code).await? {
                    phone = true;
                    update.phone_verified = true;
                } else {
                    failures += 1;
                    notes.push("That code didn't match.");
                }
            }
        }

        match payload.address_confirmed {
            Some(true) if !address => {
                address = true;
                update.address_verified = true;
            }
            Some(false) => {
                failures += 1;
                notes.push("We can't continue without confirming the address on file.");
            }
            _ => {}
        }

        if failures != state.verification_failures {
            update.verification_failures = Some(failures);
        }

        if phone && address {
            let customer_id = state.applicant_ref.clone().ok_or_else(|| {
                FlowError::invariant("verification passed without a claimed customer reference")
            })?;
            info!(session_id = %state.session_id, customer_id = %customer_id, "KYC verified");
            update.kyc_verified = true;
            update.customer_id = Some(customer_id);
            return Ok(StageResult::new(
                VerificationOutcome::Verified,
                "Thank you, your identity is verified. Checking your eligibility now.",
            )
            .with_update(update));
        }

        if failures >= self.policy.max_attempts {
            warn!(
                session_id = %state.session_id,
                failures,
                "Verification failed too many times"
            );
            update.verification_failed = true;
            return Ok(StageResult::new(
                VerificationOutcome::Failed,
                "I'm sorry, we could not verify your identity, so we cannot proceed with this application.",
            )
            .with_update(update));
        }

        let mut pending = Vec::new();
        if !phone {
            pending.push("the one-time code");
        }
        if !address {
            pending.push("confirmation of your address");
        }
        let remaining = self.policy.max_attempts - failures;
        let prompt = format!(
            "Please send {} ({remaining} attempt(s) left).",
            pending.join(" and ")
        );
        notes.push(&prompt);
        let response = notes.join(" ");
        Ok(StageResult::new(VerificationOutcome::Pending, response).with_update(update))
    }

    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        Some(service_unavailable(VerificationOutcome::Unavailable))
    }
}
