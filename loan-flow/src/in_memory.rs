//! Directory-backed collaborators for local runs, demos and tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    collaborators::{CreditBureau, DocumentIssuer, OfferCatalog, OtpProvider},
    error::CollaboratorError,
    state::ApplicationState,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerRecord {
    pub customer_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `None` models a customer with no bureau file.
    #[serde(default)]
    pub credit_score: Option<u32>,
    pub pre_approved_limit: f64,
    #[serde(default)]
    pub existing_emi: f64,
}

/// Customer master data serving both the credit bureau and the offer catalog.
pub struct CustomerDirectory {
    customers: DashMap<String, CustomerRecord>,
}

impl CustomerDirectory {
    pub fn new(records: impl IntoIterator<Item = CustomerRecord>) -> Self {
        let customers = DashMap::new();
        for record in records {
            customers.insert(record.customer_id.clone(), record);
        }
        Self { customers }
    }

    /// Three customers covering instant approval, salary-backed approval and rejection.
    pub fn demo() -> Self {
        Self::new([
            CustomerRecord {
                customer_id: "CUST001".into(),
                name: Some("Rajesh Kumar".into()),
                credit_score: Some(800),
                pre_approved_limit: 500_000.0,
                existing_emi: 0.0,
            },
            CustomerRecord {
                customer_id: "CUST002".into(),
                name: Some("Priya Sharma".into()),
                credit_score: Some(750),
                pre_approved_limit: 400_000.0,
                existing_emi: 12_000.0,
            },
            CustomerRecord {
                customer_id: "CUST003".into(),
                name: Some("Amit Patel".into()),
                credit_score: Some(680),
                pre_approved_limit: 200_000.0,
                existing_emi: 0.0,
            },
        ])
    }

    pub fn len(&self) -> usize {
        self.customers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.customers.is_empty()
    }

    fn lookup(&self, customer_id: &str) -> Result<CustomerRecord, CollaboratorError> {
        self.customers
            .get(customer_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CollaboratorError::NotFound(customer_id.to_string()))
    }
}

#[async_trait]
impl CreditBureau for CustomerDirectory {
    async fn get_score(&self, customer_id: &str) -> Result<u32, CollaboratorError> {
        self.lookup(customer_id)?
            .credit_score
            .ok_or_else(|| CollaboratorError::NotFound(format!("no bureau file for {customer_id}")))
    }

    async fn existing_emi(&self, customer_id: &str) -> Result<f64, CollaboratorError> {
        Ok(self.lookup(customer_id)?.existing_emi)
    }
}

#[async_trait]
impl OfferCatalog for CustomerDirectory {
    async fn pre_approved_limit(&self, customer_id: &str) -> Result<f64, CollaboratorError> {
        Ok(self.lookup(customer_id)?.pre_approved_limit)
    }
}

/// Issues six-digit codes and remembers the latest one per recipient.
pub struct InMemoryOtpProvider {
    issued: DashMap<String, String>,
    fixed_code: Option<String>,
}

impl InMemoryOtpProvider {
    pub fn new() -> Self {
        Self {
            issued: DashMap::new(),
            fixed_code: None,
        }
    }

    /// Always issues `code`, for demos and deterministic tests.
    pub fn with_fixed_code(code: impl Into<String>) -> Self {
        Self {
            issued: DashMap::new(),
            fixed_code: Some(code.into()),
        }
    }
}

impl Default for InMemoryOtpProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OtpProvider for InMemoryOtpProvider {
    async fn issue(&self, recipient: &str) -> Result<String, CollaboratorError> {
        let code = self
            .fixed_code
            .clone()
            .unwrap_or_else(|| rand::random_range(100_000..1_000_000u32).to_string());
        self.issued.insert(recipient.to_string(), code.clone());
        debug!(recipient, "Issued one-time code");
        Ok(code)
    }

    async fn verify(&self, recipient: &str, code: &str) -> Result<bool, CollaboratorError> {
        let matches = self
            .issued
            .get(recipient)
            .map(|issued| issued.value() == code)
            .unwrap_or(false);
        if matches {
            self.issued.remove(recipient);
        }
        Ok(matches)
    }
}

/// Hands out sanction references without rendering a document.
///
/// References look like `SL/20251019/CUST001/1a2b3c4d`. Repeated requests for the
/// same session return the reference issued the first time.
pub struct ReferenceDocumentIssuer {
    issued: DashMap<String, String>,
}

impl ReferenceDocumentIssuer {
    pub fn new() -> Self {
        Self {
            issued: DashMap::new(),
        }
    }
}

impl Default for ReferenceDocumentIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentIssuer for ReferenceDocumentIssuer {
    async fn generate_sanction(
        &self,
        state: &ApplicationState,
    ) -> Result<String, CollaboratorError> {
        let customer_id = state
            .customer_id
            .as_deref()
            .ok_or_else(|| CollaboratorError::Failure("customer identity is not verified".into()))?;
        if state.approved_amount.is_none() || state.terms().is_none() {
            return Err(CollaboratorError::Failure(
                "approved amount and loan terms are required".into(),
            ));
        }

        let reference = self
            .issued
            .entry(state.session_id.clone())
            .or_insert_with(|| {
                let suffix = Uuid::new_v4().simple().to_string();
                format!(
                    "SL/{}/{}/{}",
                    Utc::now().format("%Y%m%d"),
                    customer_id,
                    &suffix[..8]
                )
            })
            .value()
            .clone();
        info!(session_id = %state.session_id, reference = %reference, "Sanction reference issued");
        Ok(reference)
    }
}
