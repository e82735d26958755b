//! Stage-based workflow engine for loan origination conversations.
//!
//! A session moves through Greeting, NeedsAssessment, SalesNegotiation, Verification,
//! Underwriting, DocumentUpload, SanctionGeneration and Closure. Each stage has a
//! [`StageHandler`] that inspects the typed [`ApplicationState`] and returns an
//! [`Outcome`]; the [`Router`] maps (stage, outcome) to the next stage, and the
//! [`WorkflowEngine`] drives the loop one customer turn at a time.
//!
//! ```no_run
//! use std::sync::Arc;
//! use loan_flow::{
//!     Collaborators, EngineConfig, InMemorySessionStore, IntentPayload, WorkflowEngine,
//!     in_memory::{CustomerDirectory, InMemoryOtpProvider, ReferenceDocumentIssuer},
//! };
//!
//! # async fn demo() -> loan_flow::Result<()> {
//! let directory = Arc::new(CustomerDirectory::demo());
//! let collaborators = Collaborators {
//!     credit_bureau: directory.clone(),
//!     offer_catalog: directory,
//!     document_issuer: Arc::new(ReferenceDocumentIssuer::new()),
//!     otp_provider: Arc::new(InMemoryOtpProvider::new()),
//! };
//! let engine = WorkflowEngine::standard(
//!     collaborators,
//!     EngineConfig::default(),
//!     Arc::new(InMemorySessionStore::new()),
//! )?;
//!
//! let outcome = engine.process_turn("session-1", IntentPayload::default()).await?;
//! println!("{} ({:?})", outcome.response.message, outcome.stage);
//! # Ok(())
//! # }
//! ```

pub mod collaborators;
pub mod config;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod in_memory;
pub mod intent;
pub mod offers;
pub mod router;
pub mod state;
pub mod storage;

// Re-export commonly used types
pub use collaborators::{
    Collaborators, CreditBureau, DocumentIssuer, OfferCatalog, OtpProvider, RetryPolicy,
};
pub use config::{EngineConfig, RunMode, VerificationPolicy};
pub use eligibility::{
    Affordability, Decision, EligibilityInput, EligibilityPolicy, RejectReason, RiskRating,
    affordability, decide, risk_score,
};
pub use engine::{WorkflowEngine, WorkflowEngineBuilder};
pub use error::{CollaboratorError, FlowError, Result};
pub use handler::{Outcome, StageHandler, StageResult};
pub use intent::{
    ExecutionStatus, IntentPayload, NegotiationMove, ResponsePayload, SalaryEvidence, TurnOutcome,
};
pub use offers::{LoanOffer, NegotiationPolicy, RateTable};
pub use router::{Flow, Router, RouterBuilder, Transition};
pub use state::{
    ApplicationState, ApplicationStateSnapshot, ApplicationStatus, DecisionRecord, Stage,
    StateUpdate, UnderwritingDecision,
};
pub use storage::{InMemorySessionStore, SessionHandle, SessionStore};
