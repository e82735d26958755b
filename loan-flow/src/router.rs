use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::error;

use crate::{
    error::{FlowError, Result},
    handler::{
        AssessmentOutcome, ClosureOutcome, GreetingOutcome, NegotiationOutcome, Outcome,
        SanctionOutcome, UnderwritingOutcome, UploadOutcome, VerificationOutcome,
    },
    state::{ApplicationState, Stage},
};

/// Whether the engine may run the target stage straight away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    /// Stop and wait for the next customer turn.
    Await,
    /// The target stage needs no input; it can run in the same turn.
    Proceed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub target: Stage,
    pub flow: Flow,
}

/// Transition table keyed by (stage, outcome).
///
/// Lookup only. Every decision about *which* outcome applies is made by the handler
/// that produced it.
#[derive(Debug, Clone)]
pub struct Router {
    table: HashMap<(Stage, Outcome), Transition>,
}

impl Router {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::default()
    }

    /// The loan journey wiring.
    pub fn standard() -> Self {
        use AssessmentOutcome as A;
        use NegotiationOutcome as N;
        use SanctionOutcome as S;
        use Stage::*;
        use UnderwritingOutcome as U;
        use UploadOutcome as D;
        use VerificationOutcome as V;

        Router::builder()
            .wait(Greeting, GreetingOutcome::Welcomed, NeedsAssessment)
            .proceed(NeedsAssessment, A::Captured, SalesNegotiation)
            .wait(NeedsAssessment, A::Incomplete, NeedsAssessment)
            .proceed(NeedsAssessment, A::Unavailable, Closure)
            .wait(SalesNegotiation, N::Negotiating, SalesNegotiation)
            .proceed(SalesNegotiation, N::Accepted, Verification)
            .proceed(SalesNegotiation, N::Declined, Closure)
            .proceed(SalesNegotiation, N::Unavailable, Closure)
            .wait(Verification, V::Pending, Verification)
            .proceed(Verification, V::Verified, Underwriting)
            .proceed(Verification, V::Failed, Closure)
            .proceed(Verification, V::Unavailable, Closure)
            .proceed(Underwriting, U::InstantApprove, SanctionGeneration)
            .proceed(Underwriting, U::Approve, SanctionGeneration)
            .wait(Underwriting, U::NeedsSalaryDocs, DocumentUpload)
            .proceed(Underwriting, U::Reject, Closure)
            .proceed(Underwriting, U::Unavailable, Closure)
            .wait(DocumentUpload, D::Awaiting, DocumentUpload)
            .proceed(DocumentUpload, D::Received, Underwriting)
            .proceed(SanctionGeneration, S::Issued, Closure)
            .wait(SanctionGeneration, S::Failed, SanctionGeneration)
            .proceed(SanctionGeneration, S::Unavailable, Closure)
            .wait(Closure, ClosureOutcome::Closed, Closure)
            .build()
    }

    /// Looks up where `outcome` leads from `stage`.
    ///
    /// A missing entry means a handler returned a tag the table was never wired for,
    /// which is a defect and reported as [`FlowError::InvariantViolation`].
    pub fn next_stage(
        &self,
        stage: Stage,
        outcome: Outcome,
        _state: &ApplicationState,
    ) -> Result<Transition> {
        self.table.get(&(stage, outcome)).copied().ok_or_else(|| {
            error!(stage = %stage, outcome = %outcome, "No transition defined");
            FlowError::invariant(format!("no transition for outcome {outcome} at stage {stage}"))
        })
    }

    /// Checks that every tag each stage can produce has an entry, that entries are keyed
    /// by the stage that owns the tag, and that Closure only leads back to itself.
    pub fn validate(&self) -> Result<()> {
        for stage in Stage::ALL {
            for outcome in Outcome::for_stage(stage) {
                if !self.table.contains_key(&(stage, outcome)) {
                    return Err(FlowError::Config(format!(
                        "router has no transition for outcome {outcome} at stage {stage}"
                    )));
                }
            }
        }
        for ((stage, outcome), transition) in &self.table {
            if outcome.stage() != *stage {
                return Err(FlowError::Config(format!(
                    "outcome {outcome} is wired at stage {stage}, which never produces it"
                )));
            }
            if stage.is_terminal() && transition.target != *stage {
                return Err(FlowError::Config(format!(
                    "{stage} is terminal but routes to {}",
                    transition.target
                )));
            }
        }
        Ok(())
    }

}

/// Builder for creating routers
#[derive(Debug, Default)]
pub struct RouterBuilder {
    table: HashMap<(Stage, Outcome), Transition>,
}

impl RouterBuilder {
    pub fn route(
        mut self,
        from: Stage,
        outcome: impl Into<Outcome>,
        to: Stage,
        flow: Flow,
    ) -> Self {
        self.table
            .insert((from, outcome.into()), Transition { target: to, flow });
        self
    }

    pub fn wait(self, from: Stage, outcome: impl Into<Outcome>, to: Stage) -> Self {
        self.route(from, outcome, to, Flow::Await)
    }

    pub fn proceed(self, from: Stage, outcome: impl Into<Outcome>, to: Stage) -> Self {
        self.route(from, outcome, to, Flow::Proceed)
    }

    pub fn build(self) -> Router {
        Router { table: self.table }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_table_is_total() {
        let router = Router::standard();
        router.validate().unwrap();

        let state = ApplicationState::new("s-1");
        for stage in Stage::ALL {
            for outcome in Outcome::for_stage(stage) {
                assert!(router.next_stage(stage, outcome, &state).is_ok());
            }
        }
    }

    #[test]
    fn scenario_transitions() {
        let router = Router::standard();
        let state = ApplicationState::new("s-1");
        let next = |stage, outcome: UnderwritingOutcome| {
            router.next_stage(stage, outcome.into(), &state).unwrap()
        };

        assert_eq!(
            next(Stage::Underwriting, UnderwritingOutcome::InstantApprove).target,
            Stage::SanctionGeneration
        );
        assert_eq!(
            next(Stage::Underwriting, UnderwritingOutcome::NeedsSalaryDocs),
            Transition {
                target: Stage::DocumentUpload,
                flow: Flow::Await
            }
        );
        assert_eq!(
            next(Stage::Underwriting, UnderwritingOutcome::Reject).target,
            Stage::Closure
        );
    }

    #[test]
    fn unreachable_collaborators_close_the_session() {
        let router = Router::standard();
        let state = ApplicationState::new("s-1");
        let outcomes: [Outcome; 5] = [
            AssessmentOutcome::Unavailable.into(),
            NegotiationOutcome::Unavailable.into(),
            VerificationOutcome::Unavailable.into(),
            UnderwritingOutcome::Unavailable.into(),
            SanctionOutcome::Unavailable.into(),
        ];
        for outcome in outcomes {
            let transition = router.next_stage(outcome.stage(), outcome, &state).unwrap();
            assert_eq!(transition.target, Stage::Closure);
        }
    }

    #[test]
    fn closure_is_absorbing() {
        let router = Router::standard();
        let state = ApplicationState::new("s-1");
        let transition = router
            .next_stage(Stage::Closure, ClosureOutcome::Closed.into(), &state)
            .unwrap();
        assert_eq!(transition.target, Stage::Closure);
    }

    #[test]
    fn foreign_outcome_is_an_invariant_violation() {
        let router = Router::standard();
        let state = ApplicationState::new("s-1");
        let err = router
            .next_stage(Stage::Greeting, VerificationOutcome::Verified.into(), &state)
            .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));
    }

    #[test]
    fn incomplete_tables_fail_validation() {
        let router = Router::builder()
            .wait(Stage::Greeting, GreetingOutcome::Welcomed, Stage::NeedsAssessment)
            .build();
        assert!(matches!(router.validate(), Err(FlowError::Config(_))));
    }

    #[test]
    fn closure_cannot_escape() {
        let mut builder = Router::builder();
        for stage in Stage::ALL {
            for outcome in Outcome::for_stage(stage) {
                builder = builder.wait(stage, outcome, stage);
            }
        }
        let router = builder
            .wait(Stage::Closure, ClosureOutcome::Closed, Stage::Greeting)
            .build();
        assert!(matches!(router.validate(), Err(FlowError::Config(_))));
    }
}
