//! One handler per workflow stage.

mod closure;
mod document_upload;
mod greeting;
mod needs_assessment;
mod sales;
mod sanction;
mod underwriting;
mod verification;

pub use closure::ClosureHandler;
pub use document_upload::DocumentUploadHandler;
pub use greeting::GreetingHandler;
pub use needs_assessment::NeedsAssessmentHandler;
pub use sales::SalesNegotiationHandler;
pub use sanction::SanctionHandler;
pub use underwriting::UnderwritingHandler;
pub use verification::VerificationHandler;

use std::sync::Arc;

use crate::{collaborators::Collaborators, config::EngineConfig, handler::StageHandler};

/// The full set of handlers for the loan journey, wired to `collaborators`.
pub fn standard_handlers(
    collaborators: &Collaborators,
    config: &EngineConfig,
) -> Vec<Arc<dyn StageHandler>> {
    vec![
        Arc::new(GreetingHandler),
        Arc::new(NeedsAssessmentHandler::new(
            collaborators.offer_catalog.clone(),
            config.retry.clone(),
        )),
        Arc::new(SalesNegotiationHandler::new(
            collaborators.offer_catalog.clone(),
            config.rates.clone(),
            config.negotiation.clone(),
            config.retry.clone(),
        )),
        Arc::new(VerificationHandler::new(
            collaborators.otp_provider.clone(),
            config.verification.clone(),
            config.retry.clone(),
        )),
        Arc::new(UnderwritingHandler::new(
            collaborators.credit_bureau.clone(),
            collaborators.offer_catalog.clone(),
            config.eligibility.clone(),
            config.retry.clone(),
        )),
        Arc::new(DocumentUploadHandler),
        Arc::new(SanctionHandler::new(
            collaborators.document_issuer.clone(),
            config.retry.clone(),
        )),
        Arc::new(ClosureHandler),
    ]
}
