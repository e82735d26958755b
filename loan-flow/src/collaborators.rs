//! Interfaces to the systems the workflow depends on but does not own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::warn;

use crate::{
    error::{CollaboratorError, FlowError},
    state::ApplicationState,
};

#[async_trait]
pub trait CreditBureau: Send + Sync {
    /// Bureau score, or [`CollaboratorError::NotFound`] when the customer has no file.
    async fn get_score(&self, customer_id: &str) -> Result<u32, CollaboratorError>;

    /// Installments the customer already pays on other loans.
    async fn existing_emi(&self, _customer_id: &str) -> Result<f64, CollaboratorError> {
        Ok(0.0)
    }
}

#[async_trait]
pub trait OfferCatalog: Send + Sync {
    async fn pre_approved_limit(&self, customer_id: &str) -> Result<f64, CollaboratorError>;
}

#[async_trait]
pub trait DocumentIssuer: Send + Sync {
    /// Produces the sanction letter and returns its reference.
    async fn generate_sanction(&self, state: &ApplicationState) -> Result<String, CollaboratorError>;
}

/// One-time codes, keyed by the recipient they were issued to.
#[async_trait]
pub trait OtpProvider: Send + Sync {
    async fn issue(&self, recipient: &str) -> Result<String, CollaboratorError>;
    async fn verify(&self, recipient: &str, code: &str) -> Result<bool, CollaboratorError>;
}

#[derive(Clone)]
pub struct Collaborators {
    pub credit_bureau: Arc<dyn CreditBureau>,
    pub offer_catalog: Arc<dyn OfferCatalog>,
    pub document_issuer: Arc<dyn DocumentIssuer>,
    pub otp_provider: Arc<dyn OtpProvider>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Deadline for a single attempt.
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// First backoff delay, doubled after each retry.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            max_retries: 2,
            backoff_ms: 200,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Turns a collaborator failure that a handler cannot absorb into a flow error.
    pub fn escalate(&self, collaborator: &'static str, error: CollaboratorError) -> FlowError {
        match error {
            CollaboratorError::Timeout => FlowError::CollaboratorTimeout {
                collaborator,
                attempts: self.attempts(),
            },
            other => FlowError::Collaborator {
                collaborator,
                message: other.to_string(),
            },
        }
    }
}

/// Runs `call` under the policy deadline, retrying transient failures with exponential backoff.
///
/// Returns the last error once retries are exhausted or the error is not transient.
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    collaborator: &'static str,
    mut call: F,
) -> Result<T, CollaboratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CollaboratorError>>,
{
    let mut delay = policy.backoff();
    let mut attempt = 1;
    loop {
        let result = tokio::time::timeout(policy.timeout(), call())
            .await
            .unwrap_or(Err(CollaboratorError::Timeout));

        match result {
            Err(error) if error.is_transient() && attempt < policy.attempts() => {
                warn!(
                    collaborator,
                    attempt,
                    error = %error,
                    retry_in_ms = delay.as_millis() as u64,
                    "Collaborator call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            timeout_ms: 50,
            max_retries: 2,
            backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = call_with_retry(&fast_policy(), "bureau", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CollaboratorError::Unavailable("503".into()))
            } else {
                Ok(780)
            }
        })
        .await;
        assert_eq!(result, Ok(780));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn final_answers_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, _> = call_with_retry(&fast_policy(), "bureau", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CollaboratorError::NotFound("CUST404".into()))
        })
        .await;
        assert!(matches!(result, Err(CollaboratorError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_after_every_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = fast_policy();
        let result: Result<u32, _> = call_with_retry(&policy, "bureau", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(800)
        })
        .await;
        assert_eq!(result, Err(CollaboratorError::Timeout));
        assert_eq!(calls.load(Ordering::SeqCst), policy.attempts());

        let escalated = policy.escalate("bureau", CollaboratorError::Timeout);
        assert!(matches!(
            escalated,
            FlowError::CollaboratorTimeout { attempts: 3, .. }
        ));
        assert!(escalated.is_recoverable());
    }
}
