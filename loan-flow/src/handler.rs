use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{
    error::Result,
    intent::IntentPayload,
    state::{ApplicationState, Stage, StateUpdate},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GreetingOutcome {
    Welcomed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentOutcome {
    Captured,
    Incomplete,
    /// A collaborator stayed unreachable for too many turns; the session is closed.
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationOutcome {
    Negotiating,
    Accepted,
    Declined,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationOutcome {
    Pending,
    Verified,
    Failed,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderwritingOutcome {
    InstantApprove,
    Approve,
    NeedsSalaryDocs,
    Reject,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Awaiting,
    Received,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SanctionOutcome {
    Issued,
    /// The issuer refused; the stage waits and tries again on the next turn.
    Failed,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosureOutcome {
    Closed,
}

/// Tag a handler returns to tell the router what happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Greeting(GreetingOutcome),
    NeedsAssessment(AssessmentOutcome),
    SalesNegotiation(NegotiationOutcome),
    Verification(VerificationOutcome),
    Underwriting(UnderwritingOutcome),
    DocumentUpload(UploadOutcome),
    SanctionGeneration(SanctionOutcome),
    Closure(ClosureOutcome),
}

macro_rules! outcome_from {
    ($($variant:ident => $tag:ty),* $(,)?) => {
        $(
            impl From<$tag> for Outcome {
                fn from(tag: $tag) -> Self {
                    Outcome::$variant(tag)
                }
            }
        )*
    };
}

outcome_from!(
    Greeting => GreetingOutcome,
    NeedsAssessment => AssessmentOutcome,
    SalesNegotiation => NegotiationOutcome,
    Verification => VerificationOutcome,
    Underwriting => UnderwritingOutcome,
    DocumentUpload => UploadOutcome,
    SanctionGeneration => SanctionOutcome,
    Closure => ClosureOutcome,
);

impl Outcome {
    /// Stage whose handler produces this tag.
    pub fn stage(self) -> Stage {
        match self {
            Outcome::Greeting(_) => Stage::Greeting,
            Outcome::NeedsAssessment(_) => Stage::NeedsAssessment,
            Outcome::SalesNegotiation(_) => Stage::SalesNegotiation,
            Outcome::Verification(_) => Stage::Verification,
            Outcome::Underwriting(_) => Stage::Underwriting,
            Outcome::DocumentUpload(_) => Stage::DocumentUpload,
            Outcome::SanctionGeneration(_) => Stage::SanctionGeneration,
            Outcome::Closure(_) => Stage::Closure,
        }
    }

    /// Every tag the handler for `stage` can return.
    pub fn for_stage(stage: Stage) -> Vec<Outcome> {
        use AssessmentOutcome as A;
        use NegotiationOutcome as N;
        use SanctionOutcome as S;
        use UnderwritingOutcome as U;
        use UploadOutcome as D;
        use VerificationOutcome as V;

        match stage {
            Stage::Greeting => vec![GreetingOutcome::Welcomed.into()],
            Stage::NeedsAssessment => vec![
                A::Captured.into(),
                A::Incomplete.into(),
                A::Unavailable.into(),
            ],
            Stage::SalesNegotiation => vec![
                N::Negotiating.into(),
                N::Accepted.into(),
                N::Declined.into(),
                N::Unavailable.into(),
            ],
            Stage::Verification => vec![
                V::Pending.into(),
                V::Verified.into(),
                V::Failed.into(),
                V::Unavailable.into(),
            ],
            Stage::Underwriting => vec![
                U::InstantApprove.into(),
                U::Approve.into(),
                U::NeedsSalaryDocs.into(),
                U::Reject.into(),
                U::Unavailable.into(),
            ],
            Stage::DocumentUpload => vec![D::Awaiting.into(), D::Received.into()],
            Stage::SanctionGeneration => {
                vec![S::Issued.into(), S::Failed.into(), S::Unavailable.into()]
            }
            Stage::Closure => vec![ClosureOutcome::Closed.into()],
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Outcome::Greeting(tag) => format!("{tag:?}"),
            Outcome::NeedsAssessment(tag) => format!("{tag:?}"),
            Outcome::SalesNegotiation(tag) => format!("{tag:?}"),
            Outcome::Verification(tag) => format!("{tag:?}"),
            Outcome::Underwriting(tag) => format!("{tag:?}"),
            Outcome::DocumentUpload(tag) => format!("{tag:?}"),
            Outcome::SanctionGeneration(tag) => format!("{tag:?}"),
            Outcome::Closure(tag) => format!("{tag:?}"),
        };
        write!(f, "{}.{}", self.stage(), tag)
    }
}

/// Result of one handler invocation
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Changes to apply to the session
    pub update: StateUpdate,
    /// What the router should act on
    pub outcome: Outcome,
    /// Text for the customer
    pub response: String,
}

impl StageResult {
    pub fn new(outcome: impl Into<Outcome>, response: impl Into<String>) -> Self {
        Self {
            update: StateUpdate::default(),
            outcome: outcome.into(),
            response: response.into(),
        }
    }

    pub fn with_update(mut self, update: StateUpdate) -> Self {
        self.update = update;
        self
    }
}

/// Core trait every stage handler implements
#[async_trait]
pub trait StageHandler: Send + Sync {
    /// Stage this handler serves
    fn stage(&self) -> Stage;

    /// Inspect the session and the turn's intent, and describe what should change.
    ///
    /// Handlers only see the state; the engine applies the returned update and
    /// asks the router where to go next.
    async fn handle(&self, state: &ApplicationState, payload: &IntentPayload)
    -> Result<StageResult>;

    /// Result to settle on once the engine stops retrying a stage whose turns keep
    /// timing out. `None` leaves the stage in place and the error with the caller.
    fn unavailable(&self, _state: &ApplicationState) -> Option<StageResult> {
        None
    }
}

/// Give-up result shared by handlers that depend on a collaborator.
pub(crate) fn service_unavailable(outcome: impl Into<Outcome>) -> StageResult {
    StageResult::new(
        outcome,
        "I'm sorry, our systems are not responding right now, so I have to close this \
         application. Please try again a little later.",
    )
    .with_update(StateUpdate {
        service_unavailable: true,
        ..Default::default()
    })
}
