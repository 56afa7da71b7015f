//! Conversation orchestrator: one call per inbound user message.
//!
//! A turn goes through, in order:
//!
//! 1. escalation check (an open human task pauses the bot),
//! 2. the first-message path (fixed welcome, deterministic move to `tagged`),
//! 3. duplicate suppression and batch aggregation,
//! 4. claiming the pending user messages, prompt assembly and a single
//!    model call,
//! 5. escalation or reply persistence, then the transition guard.
//!
//! Each model call answers exactly the user messages it claimed, so a
//! message arriving while another call is in flight is neither lost nor
//! answered twice. When the call fails the claim is handed back and a
//! resend of the same text is answered normally.
//!
//! Session state is read from the store at the start of every turn and is
//! never cached here.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, info_span, Instrument};

use crate::agent::batch::{coalesce_pending, BatchWaiters};
use crate::agent::context::PromptBuilder;
use crate::agent::normalizer::{parse_model_response, ModelDecision, ReplyFragment};
use crate::config::FunnelSettings;
use crate::errors::{ChatError, StoreError};
use crate::funnel::{Stage, StageCatalog, TransitionGuard};
use crate::providers::base::ModelFactory;
use crate::store::conversation::{
    ClaimedBatch, ConversationStore, EscalationTask, MessageRow, NewTask, Role, SessionRow,
};

const DEFAULT_TASK_TITLE: &str = "Human assistance required";
const DEFAULT_TASK_DESCRIPTION: &str =
    "The assistant could not handle the last message and asked for a human operator.";
/// Pause between the welcome message and the first model fragment.
const WELCOME_DELAY_MS: u64 = 2000;
const HEALTH_PROMPT: &str = "Reply with the single word: ok";

/// One inbound user message.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// External session id (phone number, chat id...).
    pub session_id: String,
    pub text: String,
    /// Model override for this turn.
    pub model: Option<String>,
    /// Batch window override in seconds; 0 answers immediately.
    pub batch_wait_secs: Option<u64>,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            model: None,
            batch_wait_secs: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_batch_wait(mut self, secs: u64) -> Self {
        self.batch_wait_secs = Some(secs);
        self
    }
}

/// What happened to the inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    /// The model answered.
    Replied,
    /// Stored and folded into a batch another turn is waiting on.
    Queued,
    /// Identical to the previous user message; dropped.
    Duplicate,
    /// A human task is open; the model was not asked or asked for help.
    Escalated,
}

/// Result of [`Orchestrator::chat`].
#[derive(Debug, Clone, Serialize)]
pub struct ChatOutcome {
    pub status: TurnStatus,
    pub reply_fragments: Vec<ReplyFragment>,
    pub current_stage: Stage,
    pub stage_changed: bool,
    pub previous_stage: Option<Stage>,
    pub reasoning: String,
    pub confidence: f64,
    pub is_conversation_finished: bool,
    pub requires_human: bool,
    pub escalation_task: Option<EscalationTask>,
    pub next_actions: Vec<String>,
}

/// Snapshot of a session for dashboards and the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub stage: Stage,
    pub is_conversation_finished: bool,
    pub batch_waiting: bool,
    pub message_count: i64,
    pub open_tasks: usize,
    pub info: Value,
    pub next_actions: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives leads through the funnel. Construct once and share.
pub struct Orchestrator {
    store: Arc<ConversationStore>,
    catalog: Arc<StageCatalog>,
    models: Arc<dyn ModelFactory>,
    settings: FunnelSettings,
    guard: TransitionGuard,
    prompts: PromptBuilder,
    waiters: BatchWaiters,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        catalog: Arc<StageCatalog>,
        models: Arc<dyn ModelFactory>,
        settings: FunnelSettings,
    ) -> Self {
        let guard = TransitionGuard::new(settings.confidence_threshold);
        let prompts = PromptBuilder::new(Arc::clone(&catalog), &settings.persona, guard.threshold());
        Self {
            store,
            catalog,
            models,
            settings,
            guard,
            prompts,
            waiters: BatchWaiters::new(),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &FunnelSettings {
        &self.settings
    }

    /// Handle one inbound user message.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatOutcome, ChatError> {
        let span = info_span!("turn", session = %request.session_id);
        self.chat_inner(request).instrument(span).await
    }

    async fn chat_inner(&self, request: ChatRequest) -> Result<ChatOutcome, ChatError> {
        let external_id = request.session_id.trim();
        if external_id.is_empty() {
            return Err(ChatError::Chatbot("session id must not be empty".to_string()));
        }
        let text = request.text.trim();
        if text.is_empty() {
            return Err(ChatError::Chatbot("message text must not be empty".to_string()));
        }
        let model = request.model.as_deref();

        let (session, _) = self.store.get_or_create_session(external_id)?;

        if let Some(task) = self.store.open_tasks(session.id)?.into_iter().next() {
            self.store.append_message(
                session.id,
                Role::User,
                text,
                Some(session.stage),
                Some(self.settings.duplicate_window),
            )?;
            info!("Open human task #{}, model not invoked", task.id);
            return Ok(self.escalated(&session, task));
        }

        if session.stage == Stage::NewLead && !self.store.has_assistant_message(session.id)? {
            return self.first_turn(&session, text, model).await;
        }

        let Some(own_id) = self.record_user_message(&session, text)? else {
            info!("Duplicate user message ignored");
            return Ok(self.passive(&session, TurnStatus::Duplicate));
        };

        let window = request
            .batch_wait_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.batch_wait);
        if !window.is_zero() {
            if !self
                .store
                .try_begin_batch(session.id, self.settings.batch_stale_after)?
            {
                if self.waiters.notify(session.id) {
                    debug!("Message queued into the open batch window");
                } else {
                    debug!("Message queued; the batch window is held by another process");
                }
                return Ok(self.passive(&session, TurnStatus::Queued));
            }
            info!("Batch window opened ({:?})", window);
            let ticket = self.waiters.register(session.id);
            let waited = ticket
                .wait_for_quiet(window, self.settings.batch_max_wait.max(window))
                .await;
            drop(ticket);
            self.store.end_batch(session.id)?;
            info!("Batch window closed after {:?}", waited);
        }

        // Re-read: the wait may have spanned other turns.
        let session = self.store.get_session(session.id)?;
        if let Some(task) = self.store.open_tasks(session.id)?.into_iter().next() {
            return Ok(self.escalated(&session, task));
        }

        let Some(batch) = self.store.claim_pending(session.id, own_id)? else {
            debug!("Message #{} already taken by another turn", own_id);
            return Ok(self.passive(&session, TurnStatus::Queued));
        };
        let Some(first_pending) = batch.messages.first() else {
            return Ok(self.passive(&session, TurnStatus::Queued));
        };
        let history =
            self.store
                .messages_before(session.id, first_pending, self.settings.history_limit)?;
        let block = coalesce_pending(&batch.messages);

        let result = self.model_turn(&session, &history, &block, model).await;
        if let Err(ref e) = result {
            self.roll_back(session.id, &batch, None, e);
        }
        result
    }

    /// Store the inbound text and return its id.
    ///
    /// A resend of a message still waiting for an answer reuses that row.
    /// `None` means the text repeats a message a model call already took.
    fn record_user_message(&self, session: &SessionRow, text: &str) -> Result<Option<i64>, StoreError> {
        if let Some(id) = self.store.pending_user_message(session.id, text)? {
            debug!("Resend of unanswered message #{}", id);
            return Ok(Some(id));
        }
        let appended = self.store.append_message(
            session.id,
            Role::User,
            text,
            Some(session.stage),
            Some(self.settings.duplicate_window),
        )?;
        Ok((!appended.is_duplicate()).then_some(appended.id()))
    }

    /// Undo the bookkeeping of a turn whose model call or response parsing
    /// failed, so that the caller can retry. Store failures after the reply
    /// was written are left alone.
    fn roll_back(&self, session_id: i64, batch: &ClaimedBatch, welcome_id: Option<i64>, err: &ChatError) {
        if !matches!(err, ChatError::Ai(_) | ChatError::Parsing { .. }) {
            return;
        }
        if let Some(welcome_id) = welcome_id {
            if let Err(e) = self.store.revert_welcome(session_id, welcome_id) {
                error!("Could not revert the welcome: {}", e);
            }
        }
        match self.store.release_claim(session_id, batch) {
            Ok(true) => info!("{} message(s) left pending for a retry", batch.messages.len()),
            Ok(false) => {}
            Err(e) => error!("Could not release claimed messages: {}", e),
        }
    }

    /// Brand-new lead: fixed welcome, move to `tagged`, then one model
    /// call at `tagged` for the same message.
    async fn first_turn(
        &self,
        session: &SessionRow,
        text: &str,
        model: Option<&str>,
    ) -> Result<ChatOutcome, ChatError> {
        let Some(user_id) = self.record_user_message(session, text)? else {
            info!("Duplicate first message ignored");
            return Ok(self.passive(session, TurnStatus::Duplicate));
        };
        let Some(batch) = self.store.claim_pending(session.id, user_id)? else {
            return Ok(self.passive(session, TurnStatus::Queued));
        };

        self.store.update_session_stage(session.id, Stage::Tagged)?;
        let welcome = self.catalog.welcome_text();
        let welcome_id = self
            .store
            .append_message(session.id, Role::Assistant, &welcome, Some(Stage::Tagged), None)?
            .id();
        self.store.record_transition(
            session.id,
            Some(Stage::NewLead),
            Stage::Tagged,
            Some(welcome_id),
            1.0,
        )?;
        info!("New lead welcomed, stage new_lead -> tagged");

        let session = self.store.get_session(session.id)?;
        let claimed = |m: &MessageRow| batch.messages.iter().any(|c| c.id == m.id);
        let history: Vec<MessageRow> = self
            .store
            .recent_messages(session.id, self.settings.history_limit + batch.messages.len())?
            .into_iter()
            .filter(|m| !claimed(m))
            .collect();
        let block = coalesce_pending(&batch.messages);

        let mut outcome = match self.model_turn(&session, &history, &block, model).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.roll_back(session.id, &batch, Some(welcome_id), &e);
                return Err(e);
            }
        };

        outcome
            .reply_fragments
            .insert(0, ReplyFragment::new(welcome, WELCOME_DELAY_MS));
        outcome.stage_changed = true;
        outcome.previous_stage = Some(Stage::NewLead);
        Ok(outcome)
    }

    /// Prompt, call, parse, then either escalate or persist and guard.
    async fn model_turn(
        &self,
        session: &SessionRow,
        history: &[MessageRow],
        user_block: &str,
        model: Option<&str>,
    ) -> Result<ChatOutcome, ChatError> {
        let client = self
            .models
            .client_for(model)
            .map_err(|e| ChatError::Ai(format!("{:#}", e)))?;

        let prompt = self.prompts.build(session.stage, history, user_block);
        debug!("Prompt for stage {} ({} chars):\n{}", session.stage, prompt.len(), prompt);

        let raw = client.run(&prompt).await.map_err(|e| {
            error!("Model {} failed: {:#}", client.model_name(), e);
            ChatError::Ai(format!("{:#}", e))
        })?;

        let decision = parse_model_response(&raw).map_err(|e| {
            error!("Unusable model response: {}", e);
            e
        })?;

        if let Some(facts) = &decision.user_info {
            self.store.merge_session_info(session.id, facts)?;
        }

        if decision.requires_human {
            let task = self.open_escalation(session, &decision, user_block)?;
            return Ok(ChatOutcome {
                reasoning: decision.reasoning,
                confidence: decision.confidence,
                ..self.escalated(session, task)
            });
        }

        let reply_text = decision
            .fragments
            .iter()
            .map(|f| f.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        let message_id = self
            .store
            .append_message(
                session.id,
                Role::Assistant,
                &reply_text,
                Some(session.stage),
                Some(self.settings.duplicate_window),
            )?
            .id();

        let mut outcome = ChatOutcome {
            status: TurnStatus::Replied,
            reply_fragments: decision.fragments,
            current_stage: session.stage,
            stage_changed: false,
            previous_stage: None,
            reasoning: decision.reasoning,
            confidence: decision.confidence,
            is_conversation_finished: session.finished,
            requires_human: false,
            escalation_task: None,
            next_actions: Vec::new(),
        };

        if decision.should_change_stage {
            if let Some(target) = decision.target_stage.as_deref() {
                self.apply_proposal(session, target, decision.confidence, message_id, &mut outcome)?;
            }
        }

        outcome.next_actions = self.catalog.get(outcome.current_stage).next_actions.clone();
        Ok(outcome)
    }

    fn apply_proposal(
        &self,
        session: &SessionRow,
        target: &str,
        confidence: f64,
        message_id: i64,
        outcome: &mut ChatOutcome,
    ) -> Result<(), StoreError> {
        let verdict = self.guard.evaluate(session.stage, target, confidence);
        let Some(next) = verdict.approved() else {
            debug!("Stage stays {} ({:?})", session.stage, verdict);
            return Ok(());
        };

        self.store.update_session_stage(session.id, next)?;
        self.store.record_transition(
            session.id,
            Some(session.stage),
            next,
            Some(message_id),
            confidence,
        )?;
        info!(
            "Stage {} -> {} (confidence {:.2})",
            session.stage, next, confidence
        );
        outcome.current_stage = next;
        outcome.stage_changed = true;
        outcome.previous_stage = Some(session.stage);
        outcome.is_conversation_finished = session.finished || next.is_terminal();
        Ok(())
    }

    fn open_escalation(
        &self,
        session: &SessionRow,
        decision: &ModelDecision,
        user_block: &str,
    ) -> Result<EscalationTask, StoreError> {
        let draft = decision.human_task.clone().unwrap_or_default();
        let description = draft.description.unwrap_or_else(|| {
            let reasoning = decision.reasoning.trim();
            if reasoning.is_empty() {
                DEFAULT_TASK_DESCRIPTION.to_string()
            } else {
                reasoning.to_string()
            }
        });

        let mut metadata = draft.metadata;
        metadata.insert("stage".into(), json!(session.stage.as_str()));
        metadata.insert("last_user_message".into(), json!(user_block));

        let task = self.store.create_task(&NewTask {
            session_id: Some(session.id),
            title: draft.title.unwrap_or_else(|| DEFAULT_TASK_TITLE.to_string()),
            description,
            assigned_to: draft.assigned_to,
            metadata: Value::Object(metadata),
        })?;
        info!("Escalated to a human: task #{} '{}'", task.id, task.title);
        Ok(task)
    }

    fn passive(&self, session: &SessionRow, status: TurnStatus) -> ChatOutcome {
        ChatOutcome {
            status,
            reply_fragments: Vec::new(),
            current_stage: session.stage,
            stage_changed: false,
            previous_stage: None,
            reasoning: String::new(),
            confidence: 0.0,
            is_conversation_finished: session.finished,
            requires_human: false,
            escalation_task: None,
            next_actions: self.catalog.get(session.stage).next_actions.clone(),
        }
    }

    fn escalated(&self, session: &SessionRow, task: EscalationTask) -> ChatOutcome {
        ChatOutcome {
            requires_human: true,
            escalation_task: Some(task),
            ..self.passive(session, TurnStatus::Escalated)
        }
    }

    // ------------------------------------------------------------------
    // Read-only views
    // ------------------------------------------------------------------

    pub fn session_info(&self, external_id: &str) -> Result<SessionInfo, ChatError> {
        let session = self
            .store
            .find_session(external_id)?
            .ok_or_else(|| StoreError::SessionNotFound(external_id.to_string()))?;
        Ok(SessionInfo {
            session_id: session.external_id.clone(),
            stage: session.stage,
            is_conversation_finished: session.finished,
            batch_waiting: session.batch_waiting,
            message_count: self.store.message_count(session.id)?,
            open_tasks: self.store.open_tasks(session.id)?.len(),
            info: session.info,
            next_actions: self.catalog.get(session.stage).next_actions.clone(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        })
    }

    /// The last `limit` messages of a session, oldest first.
    pub fn transcript(&self, external_id: &str, limit: usize) -> Result<Vec<MessageRow>, ChatError> {
        let session = self
            .store
            .find_session(external_id)?
            .ok_or_else(|| StoreError::SessionNotFound(external_id.to_string()))?;
        Ok(self.store.recent_messages(session.id, limit)?)
    }

    /// Ask the default model for a trivial completion.
    pub async fn health_check(&self) -> HealthReport {
        let model = self.models.default_model().to_string();
        let result = match self.models.client_for(None) {
            Ok(client) => client.run(HEALTH_PROMPT).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(_) => HealthReport {
                status: "healthy",
                model,
                error: None,
            },
            Err(e) => HealthReport {
                status: "unhealthy",
                model,
                error: Some(format!("{:#}", e)),
            },
        }
    }
}
