//! WorkflowEngine: the step-or-run entry point for conversation drivers.
//!
//! One call to [`WorkflowEngine::process_turn`] goes through these steps:
//!
//! 1. Lock the session; unknown ids get a fresh session at Greeting.
//! 2. Check the turn id: duplicates replay the cached response, stale ids are refused.
//! 3. Run the current stage's handler on a working copy of the state, apply its update
//!    and let the [`Router`] pick the next stage. In [`RunMode::RunUntilInput`] this
//!    repeats while transitions say [`Flow::Proceed`].
//! 4. Commit the working copy, or keep the pre-call state if anything failed.
//!
//! Validation failures are answered with a clarification instead of an error, so the
//! customer is re-prompted at the same stage. Timeouts are counted per stage; once
//! [`EngineConfig::max_timed_out_turns`] is reached the handler's
//! [`StageHandler::unavailable`] result is applied and the session closes.

use chrono::Utc;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, error, info, instrument, warn};

use crate::{
    collaborators::Collaborators,
    config::{EngineConfig, RunMode},
    error::{FlowError, Result},
    handler::{StageHandler, StageResult},
    handlers::standard_handlers,
    intent::{ExecutionStatus, IntentPayload, ResponsePayload, TurnOutcome},
    router::{Flow, Router, Transition},
    state::{ApplicationState, ApplicationStateSnapshot, Speaker, Stage, TurnOrder},
    storage::{InMemorySessionStore, SessionStore},
};

pub struct WorkflowEngine {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    router: Router,
    store: Arc<dyn SessionStore>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn builder() -> WorkflowEngineBuilder {
        WorkflowEngineBuilder::default()
    }

    /// Engine with the stock handlers and router.
    pub fn standard(
        collaborators: Collaborators,
        config: EngineConfig,
        store: Arc<dyn SessionStore>,
    ) -> Result<Self> {
        standard_handlers(&collaborators, &config)
            .into_iter()
            .fold(Self::builder(), WorkflowEngineBuilder::add_handler)
            .router(Router::standard())
            .store(store)
            .config(config)
            .build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Read-only copy of a session, or `None` if the id was never seen.
    pub async fn get_state(&self, session_id: &str) -> Result<Option<ApplicationStateSnapshot>> {
        self.store.get(session_id).await
    }

    /// Drops a session. Returns `false` if there was nothing to drop.
    pub async fn discard_session(&self, session_id: &str) -> Result<bool> {
        let removed = self.store.remove(session_id).await?;
        if removed {
            info!(session_id, "Session discarded");
        }
        Ok(removed)
    }

    /// Processes one customer turn.
    ///
    /// Turns for the same session are serialized by the session lock; turns for
    /// different sessions run concurrently. On error the session is left exactly as
    /// it was before the call.
    #[instrument(skip(self, payload), fields(turn_id = ?payload.turn_id))]
    pub async fn process_turn(
        &self,
        session_id: &str,
        payload: IntentPayload,
    ) -> Result<TurnOutcome> {
        let handle = self.store.acquire(session_id).await?;
        let mut state = handle.lock().await;

        if let Some(turn_id) = payload.turn_id {
            match state.check_turn(turn_id) {
                TurnOrder::Fresh => {}
                TurnOrder::Duplicate => {
                    if let Some(cached) = &state.last_response {
                        info!(turn_id, stage = %state.current_stage, "Replaying duplicate turn");
                        let mut response = cached.clone();
                        response.duplicate = true;
                        return Ok(TurnOutcome {
                            response,
                            stage: state.current_stage,
                        });
                    }
                }
                TurnOrder::Stale { last_accepted } => {
                    warn!(turn_id, last_accepted, "Rejecting out-of-order turn");
                    return Err(FlowError::OutOfOrderTurn {
                        received: turn_id,
                        last_accepted,
                    });
                }
            }
        }

        let mut working = state.clone();
        match self.drive(&mut working, &payload).await {
            Ok(outcome) => {
                *state = working;
                Ok(outcome)
            }
            Err(FlowError::Validation { field, message }) => {
                info!(field, message = %message, stage = %state.current_stage, "Asking for clarification");
                Ok(Self::clarify(&mut state, &payload, &message))
            }
            Err(err) if err.is_timeout() => self.absorb_timeout(&mut state, &payload, err),
            Err(err) => {
                match &err {
                    FlowError::InvariantViolation(detail) => {
                        error!(stage = %state.current_stage, detail = %detail, "Invariant violated, turn discarded");
                    }
                    err => {
                        warn!(stage = %state.current_stage, error = %err, "Turn failed, state reverted");
                    }
                }
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut ApplicationState,
        payload: &IntentPayload,
    ) -> Result<TurnOutcome> {
        let turn_id = payload.turn_id;
        let entry_stage = state.current_stage;
        state.record_turn(Speaker::Customer, payload.summary(), entry_stage, turn_id);

        let chained = IntentPayload::default();
        let mut messages = Vec::new();
        let mut steps = 0;

        let status = loop {
            let stage = state.current_stage;
            let handler = self.handlers.get(&stage).ok_or_else(|| {
                FlowError::invariant(format!("no handler registered for stage {stage}"))
            })?;
            let input = if steps == 0 { payload } else { &chained };

            let result = tokio::time::timeout(
                self.config.handler_deadline(),
                handler.handle(state, input),
            )
            .await
            .map_err(|_| FlowError::HandlerTimeout(stage))??;
            steps += 1;

            let transition = self.settle(state, result, &mut messages)?;

            if state.current_stage.is_terminal() {
                break ExecutionStatus::Completed;
            }
            if transition.flow == Flow::Await {
                break ExecutionStatus::WaitingForInput;
            }
            if self.config.run_mode == RunMode::Step || steps >= self.config.max_steps_per_turn {
                break ExecutionStatus::ReadyToContinue;
            }
        };

        Ok(Self::finish(state, turn_id, messages, status, steps))
    }

    /// Applies a handler result, routes it and moves the session on.
    fn settle(
        &self,
        state: &mut ApplicationState,
        result: StageResult,
        messages: &mut Vec<String>,
    ) -> Result<Transition> {
        let stage = state.current_stage;
        let outcome = result.outcome;
        result.update.apply(state, &self.config.eligibility)?;
        let transition = self.router.next_stage(stage, outcome, state)?;
        state.advance_to(transition.target);
        messages.push(result.response);

        debug!(
            stage = %stage,
            outcome = %outcome,
            target = %transition.target,
            flow = ?transition.flow,
            "Stage handled"
        );
        Ok(transition)
    }

    /// Records the reply and caches it for duplicate turns.
    fn finish(
        state: &mut ApplicationState,
        turn_id: Option<u64>,
        messages: Vec<String>,
        status: ExecutionStatus,
        steps: usize,
    ) -> TurnOutcome {
        let message = messages.join("\n\n");
        let final_stage = state.current_stage;
        state.record_turn(Speaker::Assistant, &message, final_stage, turn_id);
        let response = ResponsePayload::from_state(state, message, status);
        if turn_id.is_some() {
            state.last_turn_id = turn_id;
        }
        state.last_response = Some(response.clone());
        state.timed_out_turns = 0;

        info!(
            stage = %state.current_stage,
            status = ?status,
            application_status = ?state.application_status,
            steps,
            "Turn processed"
        );
        TurnOutcome {
            response,
            stage: state.current_stage,
        }
    }

    /// Counts a timed-out turn against the committed state. Below the limit the error is
    /// returned as is; at the limit the stage's unavailable result closes the session.
    fn absorb_timeout(
        &self,
        state: &mut ApplicationState,
        payload: &IntentPayload,
        err: FlowError,
    ) -> Result<TurnOutcome> {
        let stage = state.current_stage;
        state.timed_out_turns += 1;
        let limit = self.config.max_timed_out_turns;
        if state.timed_out_turns < limit {
            warn!(stage = %stage, error = %err, timed_out_turns = state.timed_out_turns, limit, "Turn timed out, state reverted");
            return Err(err);
        }

        let Some(result) = self
            .handlers
            .get(&stage)
            .and_then(|handler| handler.unavailable(&*state))
        else {
            warn!(stage = %stage, error = %err, timed_out_turns = state.timed_out_turns, "Turn timed out and the stage cannot be abandoned");
            return Err(err);
        };

        error!(stage = %stage, error = %err, timed_out_turns = state.timed_out_turns, "Giving up on unresponsive collaborator");
        let mut working = state.clone();
        working.record_turn(Speaker::Customer, payload.summary(), stage, payload.turn_id);
        working.record_turn(
            Speaker::System,
            format!("{err}; giving up after {} timed-out turns", working.timed_out_turns),
            stage,
            payload.turn_id,
        );

        let mut messages = Vec::new();
        let transition = self.settle(&mut working, result, &mut messages)?;
        let status = if working.current_stage.is_terminal() {
            ExecutionStatus::Completed
        } else if transition.flow == Flow::Await {
            ExecutionStatus::WaitingForInput
        } else {
            ExecutionStatus::ReadyToContinue
        };
        let outcome = Self::finish(&mut working, payload.turn_id, messages, status, 1);
        *state = working;
        Ok(outcome)
    }

    /// Records the exchange and re-prompts at the same stage. Nothing else changes.
    fn clarify(state: &mut ApplicationState, payload: &IntentPayload, problem: &str) -> TurnOutcome {
        let stage = state.current_stage;
        state.record_turn(Speaker::Customer, payload.summary(), stage, payload.turn_id);

        let message = format!("Sorry, I couldn't use that: {problem}. Could you try again?");
        state.record_turn(Speaker::Assistant, &message, stage, payload.turn_id);

        let response = ResponsePayload::from_state(state, message, ExecutionStatus::NeedsClarification);
        if payload.turn_id.is_some() {
            state.last_turn_id = payload.turn_id;
        }
        state.last_response = Some(response.clone());
        state.timed_out_turns = 0;
        state.updated_at = Utc::now();
        TurnOutcome { response, stage }
    }
}

/// Builder for [`WorkflowEngine`]
#[derive(Default)]
pub struct WorkflowEngineBuilder {
    handlers: HashMap<Stage, Arc<dyn StageHandler>>,
    router: Option<Router>,
    store: Option<Arc<dyn SessionStore>>,
    config: EngineConfig,
}

impl WorkflowEngineBuilder {
    /// Registers `handler` for the stage it reports, replacing any earlier one.
    pub fn add_handler(mut self, handler: Arc<dyn StageHandler>) -> Self {
        self.handlers.insert(handler.stage(), handler);
        self
    }

    pub fn router(mut self, router: Router) -> Self {
        self.router = Some(router);
        self
    }

    pub fn store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<WorkflowEngine> {
        self.config.validate()?;
        if let Some(stage) = Stage::ALL
            .into_iter()
            .find(|stage| !self.handlers.contains_key(stage))
        {
            return Err(FlowError::Config(format!("no handler registered for stage {stage}")));
        }
        let router = self.router.unwrap_or_else(Router::standard);
        router.validate()?;

        Ok(WorkflowEngine {
            handlers: self.handlers,
            router,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        handler::{GreetingOutcome, StageResult, VerificationOutcome},
        handlers::{GreetingHandler, NeedsAssessmentHandler},
        in_memory::{CustomerDirectory, InMemoryOtpProvider, ReferenceDocumentIssuer},
        state::ApplicationStatus,
    };
    use async_trait::async_trait;
    use std::time::Duration;

    fn collaborators() -> Collaborators {
        let directory = Arc::new(CustomerDirectory::demo());
        Collaborators {
            credit_bureau: directory.clone(),
            offer_catalog: directory,
            document_issuer: Arc::new(ReferenceDocumentIssuer::new()),
            otp_provider: Arc::new(InMemoryOtpProvider::with_fixed_code("1234")),
        }
    }

    fn engine(run_mode: RunMode) -> WorkflowEngine {
        let config = EngineConfig {
            run_mode,
            ..EngineConfig::default()
        };
        WorkflowEngine::standard(collaborators(), config, Arc::new(InMemorySessionStore::new()))
            .unwrap()
    }

    fn intake() -> IntentPayload {
        IntentPayload {
            customer_ref: Some("CUST001".into()),
            requested_amount: Some(400_000.0),
            tenure_months: Some(36),
            ..Default::default()
        }
    }

    /// Stands in for any stage and returns whatever it was built with.
    struct ScriptedHandler {
        stage: Stage,
        delay: Duration,
        result: fn() -> Result<StageResult>,
    }

    #[async_trait]
    impl StageHandler for ScriptedHandler {
        fn stage(&self) -> Stage {
            self.stage
        }

        async fn handle(
            &self,
            _state: &ApplicationState,
            _payload: &IntentPayload,
        ) -> Result<StageResult> {
            tokio::time::sleep(self.delay).await;
            (self.result)()
        }
    }

    fn engine_with(handler: ScriptedHandler) -> WorkflowEngine {
        standard_handlers(&collaborators(), &EngineConfig::default())
            .into_iter()
            .fold(WorkflowEngine::builder(), WorkflowEngineBuilder::add_handler)
            .add_handler(Arc::new(handler))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn step_mode_runs_one_handler_per_call() {
        let engine = engine(RunMode::Step);

        let first = engine.process_turn("s-1", IntentPayload::default()).await.unwrap();
        assert_eq!(first.stage, Stage::NeedsAssessment);
        assert_eq!(first.response.status, ExecutionStatus::WaitingForInput);

        let second = engine.process_turn("s-1", intake()).await.unwrap();
        assert_eq!(second.stage, Stage::SalesNegotiation);
        assert_eq!(second.response.status, ExecutionStatus::ReadyToContinue);
        assert!(second.response.offers.is_empty());

        let third = engine.process_turn("s-1", IntentPayload::default()).await.unwrap();
        assert_eq!(third.stage, Stage::SalesNegotiation);
        assert_eq!(third.response.status, ExecutionStatus::WaitingForInput);
        assert_eq!(third.response.offers.len(), 3);

        let state = engine.get_state("s-1").await.unwrap().unwrap();
        assert_eq!(state.turn_log.len(), 6);
        assert_eq!(state.previous_stage, Some(Stage::NeedsAssessment));
    }

    #[tokio::test]
    async fn run_mode_chains_until_input_is_needed() {
        let engine = engine(RunMode::RunUntilInput);
        engine.process_turn("s-1", IntentPayload::default()).await.unwrap();

        let outcome = engine.process_turn("s-1", intake()).await.unwrap();
        assert_eq!(outcome.stage, Stage::SalesNegotiation);
        assert_eq!(outcome.response.status, ExecutionStatus::WaitingForInput);
        assert_eq!(outcome.response.offers.len(), 3);
        assert!(outcome.response.message.contains("(recommended)"));
    }

    #[tokio::test]
    async fn validation_errors_leave_the_state_alone() {
        let engine = engine(RunMode::Step);
        engine.process_turn("s-1", IntentPayload::default()).await.unwrap();

        let bad = IntentPayload {
            requested_amount: Some(-10.0),
            tenure_months: Some(36),
            ..Default::default()
        };
        let outcome = engine.process_turn("s-1", bad).await.unwrap();
        assert_eq!(outcome.stage, Stage::NeedsAssessment);
        assert_eq!(outcome.response.status, ExecutionStatus::NeedsClarification);

        let state = engine.get_state("s-1").await.unwrap().unwrap();
        assert!(state.requested_amount.is_none());
        assert!(state.preferred_tenure_months.is_none());
        assert_eq!(state.turn_log.len(), 4);
        assert_eq!(state.application_status, ApplicationStatus::InProgress);
    }

    #[tokio::test]
    async fn foreign_outcomes_are_invariant_violations() {
        let engine = engine_with(ScriptedHandler {
            stage: Stage::Greeting,
            delay: Duration::ZERO,
            result: || Ok(StageResult::new(VerificationOutcome::Verified, "wrong tag")),
        });

        let err = engine
            .process_turn("s-1", IntentPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::InvariantViolation(_)));

        let state = engine.get_state("s-1").await.unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::Greeting);
        assert!(state.turn_log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handlers_hit_the_deadline() {
        let engine = engine_with(ScriptedHandler {
            stage: Stage::Greeting,
            delay: Duration::from_secs(60),
            result: || Ok(StageResult::new(GreetingOutcome::Welcomed, "too late")),
        });

        let err = engine
            .process_turn("s-1", IntentPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::HandlerTimeout(Stage::Greeting)));
        assert!(err.is_recoverable());

        let state = engine.get_state("s-1").await.unwrap().unwrap();
        assert_eq!(state.current_stage, Stage::Greeting);
        assert_eq!(state.timed_out_turns, 1);
        assert!(state.turn_log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stages_without_a_fallback_keep_failing() {
        let engine = engine_with(ScriptedHandler {
            stage: Stage::Greeting,
            delay: Duration::from_secs(60),
            result: || Ok(StageResult::new(GreetingOutcome::Welcomed, "too late")),
        });

        for expected in 1..=4 {
            let err = engine
                .process_turn("s-1", IntentPayload::default())
                .await
                .unwrap_err();
            assert!(err.is_timeout());
            let state = engine.get_state("s-1").await.unwrap().unwrap();
            assert_eq!(state.timed_out_turns, expected);
            assert_eq!(state.current_stage, Stage::Greeting);
        }
    }

    #[tokio::test]
    async fn discarded_sessions_start_over() {
        let engine = engine(RunMode::Step);
        engine.process_turn("s-1", IntentPayload::default()).await.unwrap();

        assert!(engine.discard_session("s-1").await.unwrap());
        assert!(!engine.discard_session("s-1").await.unwrap());
        assert!(engine.get_state("s-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_turns_replay_and_stale_turns_fail() {
        let engine = engine(RunMode::Step);
        let first = engine
            .process_turn("s-1", IntentPayload::default().with_turn_id(1))
            .await
            .unwrap();
        let replay = engine
            .process_turn("s-1", IntentPayload::default().with_turn_id(1))
            .await
            .unwrap();
        assert!(replay.response.duplicate);
        assert_eq!(replay.response.message, first.response.message);
        assert_eq!(replay.stage, first.stage);

        engine
            .process_turn("s-1", intake().with_turn_id(5))
            .await
            .unwrap();
        let err = engine
            .process_turn("s-1", IntentPayload::default().with_turn_id(3))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FlowError::OutOfOrderTurn {
                received: 3,
                last_accepted: 5
            }
        ));

        let state = engine.get_state("s-1").await.unwrap().unwrap();
        assert_eq!(state.turn_log.len(), 4);
        assert_eq!(state.last_turn_id, Some(5));
    }

    #[test]
    fn build_requires_every_stage() {
        let result = WorkflowEngine::builder()
            .add_handler(Arc::new(GreetingHandler))
            .add_handler(Arc::new(NeedsAssessmentHandler::new(
                Arc::new(CustomerDirectory::demo()),
                Default::default(),
            )))
            .build();
        assert!(matches!(result, Err(FlowError::Config(_))));
    }

    #[test]
    fn build_rejects_invalid_config() {
        let config = EngineConfig {
            max_steps_per_turn: 0,
            ..EngineConfig::default()
        };
        let result =
            WorkflowEngine::standard(collaborators(), config, Arc::new(InMemorySessionStore::new()));
        assert!(matches!(result, Err(FlowError::Config(_))));
    }
}
