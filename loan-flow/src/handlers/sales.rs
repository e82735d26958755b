use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::{
    collaborators::{OfferCatalog, RetryPolicy, call_with_retry},
    error::{FlowError, Result},
    handler::{NegotiationOutcome, StageHandler, StageResult, service_unavailable},
    intent::{IntentPayload, NegotiationMove},
    offers::{LoanOffer, NegotiationPolicy, RateTable, recommended_index},
    state::{ApplicationState, Stage, StateUpdate},
};

/// Presents offers, handles counter-offers and records the accepted terms.
pub struct SalesNegotiationHandler {
    catalog: Arc<dyn OfferCatalog>,
    rates: RateTable,
    negotiation: NegotiationPolicy,
    retry: RetryPolicy,
}

impl SalesNegotiationHandler {
    pub fn new(
        catalog: Arc<dyn OfferCatalog>,
        rates: RateTable,
        negotiation: NegotiationPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            catalog,
            rates,
            negotiation,
            retry,
        }
    }

    async fn fetch_limit(&self, state: &ApplicationState) -> Result<f64> {
        if let Some(limit) = state.pre_approved_limit {
            return Ok(limit);
        }
        let customer = state
            .customer_id
            .as_deref()
            .or(state.applicant_ref.as_deref())
            .ok_or_else(|| FlowError::validation("customer_ref", "we need your customer ID first"))?;

        call_with_retry(&self.retry, "offer_catalog", || {
            self.catalog.pre_approved_limit(customer)
        })
        .await
        .map_err(|err| self.retry.escalate("offer_catalog", err))
    }

    fn present(offers: &[LoanOffer], preferred: Option<u32>, intro: &str) -> String {
        let recommended = recommended_index(offers, preferred);
        let mut lines = vec![intro.to_string()];
        for (index, offer) in offers.iter().enumerate() {
            let marker = if index == recommended { " (recommended)" } else { "" };
            lines.push(format!("{}. {}{marker}", index + 1, offer.describe()));
        }
        lines.join("\n")
    }
}

#[async_trait]
impl StageHandler for SalesNegotiationHandler {
    fn stage(&self) -> Stage {
        Stage::SalesNegotiation
    }

    async fn handle(
        &self,
        state: &ApplicationState,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        let amount = state.requested_amount.ok_or_else(|| {
            FlowError::invariant("sales negotiation reached without a requested amount")
        })?;
        let preferred = state.preferred_tenure_months;

        if state.offers.is_empty() {
            let limit = self.fetch_limit(state).await?;
            let discount = self.negotiation.discount_for(state.negotiation_attempts);
            let offers = self.rates.offers(amount, limit, discount);
            info!(
                session_id = %state.session_id,
                pre_approved_limit = limit,
                offers = offers.len(),
                "Presenting loan offers"
            );
            if payload.negotiation.is_none() {
                let response =
                    Self::present(&offers, preferred, "Here are the offers I can make you:");
                return Ok(
                    StageResult::new(NegotiationOutcome::Negotiating, response).with_update(
                        StateUpdate {
                            pre_approved_limit: Some(limit),
                            offers: Some(offers),
                            ..Default::default()
                        },
                    ),
                );
            }

            // A move sent alongside the first presentation is answered against the fresh offers.
            let mut seeded = state.clone();
            seeded.pre_approved_limit = Some(limit);
            seeded.offers = offers.clone();
            let mut result = self.respond(&seeded, amount, payload).await?;
            result.update.pre_approved_limit.get_or_insert(limit);
            result.update.offers.get_or_insert(offers);
            return Ok(result);
        }

        self.respond(state, amount, payload).await
    }

    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        Some(service_unavailable(NegotiationOutcome::Unavailable))
    }
}

impl SalesNegotiationHandler {
    /// Answers a negotiation move against the offers already on `state`.
    async fn respond(
        &self,
        state: &ApplicationState,
        amount: f64,
        payload: &IntentPayload,
    ) -> Result<StageResult> {
        let preferred = state.preferred_tenure_months;
        match payload.negotiation {
            Some(NegotiationMove::Accept(index)) => {
                let offer = state.offers.get(index).ok_or_else(|| {
                    FlowError::validation(
                        "negotiation",
                        format!("please pick an offer between 1 and {}", state.offers.len()),
                    )
                })?;
                info!(
                    session_id = %state.session_id,
                    tenure_months = offer.tenure_months,
                    interest_rate = offer.interest_rate,
                    "Offer accepted"
                );
                let response = format!(
                    "Great choice: {}. Next I need to verify your identity.",
                    offer.describe()
                );
                Ok(
                    StageResult::new(NegotiationOutcome::Accepted, response).with_update(
                        StateUpdate {
                            terms: Some(offer.terms()),
                            ..Default::default()
                        },
                    ),
                )
            }
            Some(NegotiationMove::Counter) if state.final_offer_presented => {
                let response = Self::present(
                    &state.offers,
                    preferred,
                    "These rates are already our final offer. You can accept one or decline.",
                );
                Ok(StageResult::new(NegotiationOutcome::Negotiating, response))
            }
            Some(NegotiationMove::Counter) => {
                let attempts = state.negotiation_attempts + 1;
                let limit = self.fetch_limit(state).await?;
                let discount = self.negotiation.discount_for(attempts);
                let offers = self.rates.offers(amount, limit, discount);
                let final_offer = attempts >= self.negotiation.max_attempts;
                info!(
                    session_id = %state.session_id,
                    attempts,
                    discount,
                    final_offer,
                    "Counter-offer requested"
                );
                let intro = if final_offer {
                    "This is the best I can do, and it is our final offer:"
                } else {
                    "I managed to improve the rates:"
                };
                let response = Self::present(&offers, preferred, intro);
                Ok(
                    StageResult::new(NegotiationOutcome::Negotiating, response).with_update(
                        StateUpdate {
                            offers: Some(offers),
                            negotiation_attempts: Some(attempts),
                            final_offer_presented: final_offer,
                            ..Default::default()
                        },
                    ),
                )
            }
            Some(NegotiationMove::Decline) => {
                info!(session_id = %state.session_id, "Offers declined");
                Ok(StageResult::new(
                    NegotiationOutcome::Declined,
                    "Understood. Thank you for considering us; you are welcome back any time.",
                ))
            }
            None => {
                let response = Self::present(
                    &state.offers,
                    preferred,
                    "Which offer would you like? You can also ask for a better rate.",
                );
                Ok(StageResult::new(NegotiationOutcome::Negotiating, response))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::in_memory::CustomerDirectory;

    fn handler() -> SalesNegotiationHandler {
        SalesNegotiationHandler::new(
            Arc::new(CustomerDirectory::demo()),
            RateTable::default(),
            NegotiationPolicy::default(),
            RetryPolicy::default(),
        )
    }

    fn assessed() -> ApplicationState {
        let mut state = ApplicationState::new("s-1");
        state.applicant_ref = Some("CUST001".into());
        state.requested_amount = Some(400_000.0);
        state.preferred_tenure_months = Some(36);
        state
    }

    fn negotiate(negotiation: NegotiationMove) -> IntentPayload {
        IntentPayload {
            negotiation: Some(negotiation),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_visit_presents_offers() {
        let state = assessed();
        let result = handler()
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap();
        assert_eq!(result.outcome, NegotiationOutcome::Negotiating.into());
        assert_eq!(result.update.pre_approved_limit, Some(500_000.0));
        assert_eq!(result.update.offers.as_ref().map(Vec::len), Some(3));
        assert!(result.response.contains("(recommended)"));
    }

    #[tokio::test]
    async fn accepting_records_terms() {
        let mut state = assessed();
        state.pre_approved_limit = Some(500_000.0);
        state.offers = RateTable::default().offers(400_000.0, 500_000.0, 0.0);

        let result = handler()
            .handle(&state, &negotiate(NegotiationMove::Accept(2)))
            .await
            .unwrap();
        assert_eq!(result.outcome, NegotiationOutcome::Accepted.into());
        let terms = result.update.terms.unwrap();
        assert_eq!(terms.tenure_months, 36);
        assert_eq!(terms.interest_rate, 0.115);
    }

    #[tokio::test]
    async fn accept_on_the_first_visit_is_honoured() {
        let state = assessed();
        let result = handler()
            .handle(&state, &negotiate(NegotiationMove::Accept(2)))
            .await
            .unwrap();
        assert_eq!(result.outcome, NegotiationOutcome::Accepted.into());
        assert_eq!(result.update.terms.unwrap().tenure_months, 36);
        assert_eq!(result.update.pre_approved_limit, Some(500_000.0));
        assert_eq!(result.update.offers.as_ref().map(Vec::len), Some(3));
    }

    #[tokio::test]
    async fn unknown_offer_index_needs_clarification() {
        let mut state = assessed();
        state.offers = RateTable::default().offers(400_000.0, 500_000.0, 0.0);
        let err = handler()
            .handle(&state, &negotiate(NegotiationMove::Accept(7)))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::Validation {
                field: "negotiation",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn counters_end_with_a_final_offer() {
        let handler = handler();
        let mut state = assessed();
        state.pre_approved_limit = Some(500_000.0);
        state.offers = RateTable::default().offers(400_000.0, 500_000.0, 0.0);

        for expected in 1..=3u32 {
            let result = handler
                .handle(&state, &negotiate(NegotiationMove::Counter))
                .await
                .unwrap();
            assert_eq!(result.update.negotiation_attempts, Some(expected));
            state.negotiation_attempts = expected;
            state.offers = result.update.offers.unwrap();
            state.final_offer_presented |= result.update.final_offer_presented;
        }
        assert!(state.final_offer_presented);
        assert_eq!(state.offers[0].interest_rate, 0.095);

        let result = handler
            .handle(&state, &negotiate(NegotiationMove::Counter))
            .await
            .unwrap();
        assert!(result.update.is_empty());
        assert!(result.response.contains("final offer"));
    }

    #[tokio::test]
    async fn decline_closes_the_negotiation() {
        let mut state = assessed();
        state.offers = RateTable::default().offers(400_000.0, 500_000.0, 0.0);
        let result = handler()
            .handle(&state, &negotiate(NegotiationMove::Decline))
            .await
            .unwrap();
        assert_eq!(result.outcome, NegotiationOutcome::Declined.into());
    }

    #[tokio::test]
    async fn unknown_customer_is_a_collaborator_error() {
        let mut state = assessed();
        state.applicant_ref = Some("CUST404".into());
        let err = handler()
            .handle(&state, &IntentPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::Collaborator {
                collaborator: "offer_catalog",
                ..
            }
        ));
    }
}
