//! Turn orchestration: node creation, pipeline invocation, streaming,
//! finalization, and the history breakpoints around it all.
//!
//! Mutations within one session are serialized through that session's mutex;
//! different sessions run independently. The streaming loop holds the lock
//! only while applying a coalesced flush, so tree edits and branch switches
//! stay responsive while a turn is in flight.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use trellis_core::{
    AgentDefinition, AgentId, AgentSnapshot, AssetRef, NodeDraft, NodeId, NodeStatus, NodeUpdate,
    PerfStats, RegexPreset, RegexRule, Role, RuleBinding, SamplingParams, Session, SessionId,
    TokenUsage, TrellisConfig, UserProfile,
};
use trellis_pipeline::{
    ModelProfile, Pipeline, PipelineContext, PipelineDeps, PipelineInput, PipelineOutput,
    TokenEstimator,
};
use trellis_tree::{
    create_child, delete_subtree, ensure_valid_active_leaf, history::NodeDelta, set_enabled,
    switch_sibling, switch_to, update_node, Direction, HistoryLog, RelationChange, TreeError,
};

use crate::client::{ChatRequest, LlmClient, LlmError, LlmErrorKind, StreamChunk};
use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::persistence::PersistenceAdapter;
use crate::preview::ContextPreviewData;
use crate::stream::ChunkBatcher;

/// A live session plus its engine-side undo log. The log never persists.
pub struct SessionState {
    pub session: Session,
    pub history: HistoryLog,
}

struct Inner {
    config: TrellisConfig,
    persistence: Arc<dyn PersistenceAdapter>,
    client: Arc<dyn LlmClient>,
    estimator: Arc<dyn TokenEstimator>,
    pipeline: Pipeline,
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
    agents: DashMap<AgentId, AgentDefinition>,
    profiles: DashMap<String, UserProfile>,
    models: DashMap<String, ModelProfile>,
    global_regex: RwLock<Vec<RegexPreset>>,
    /// Streaming nodes and their stop signals, with the owning session.
    generating: DashMap<NodeId, (SessionId, CancellationToken)>,
    events: broadcast::Sender<EngineEvent>,
}

/// The engine's public surface. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct ChatExecutor {
    inner: Arc<Inner>,
}

enum StreamOutcome {
    Finished,
    Cancelled,
    TimedOut,
}

impl ChatExecutor {
    pub fn new(
        config: TrellisConfig,
        persistence: Arc<dyn PersistenceAdapter>,
        client: Arc<dyn LlmClient>,
        deps: PipelineDeps,
    ) -> Self {
        let estimator = deps.estimator.clone();
        let pipeline = Pipeline::standard(deps);
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                config,
                persistence,
                client,
                estimator,
                pipeline,
                sessions: DashMap::new(),
                agents: DashMap::new(),
                profiles: DashMap::new(),
                models: DashMap::new(),
                global_regex: RwLock::new(Vec::new()),
                generating: DashMap::new(),
                events: events.clone(),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub fn register_agent(&self, agent: AgentDefinition) {
        self.inner.agents.insert(agent.id.clone(), agent);
    }

    pub fn register_profile(&self, profile: UserProfile) {
        self.inner.profiles.insert(profile.id.clone(), profile);
    }

    /// Modality/cost profile for a model id. Unregistered models are treated
    /// as text-only.
    pub fn register_model(&self, model_id: &str, profile: ModelProfile) {
        self.inner.models.insert(model_id.to_string(), profile);
    }

    pub async fn set_global_regex(&self, presets: Vec<RegexPreset>) {
        *self.inner.global_regex.write().await = presets;
    }

    /// True while any node is streaming, in any session.
    pub fn is_sending(&self) -> bool {
        !self.inner.generating.is_empty()
    }

    // ------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------

    #[instrument(skip(self, system_prompt), fields(agent = %agent_id))]
    pub async fn create_session(&self, agent_id: &AgentId, system_prompt: &str) -> Result<SessionId> {
        if !self.inner.agents.contains_key(agent_id) {
            return Err(EngineError::AgentNotFound {
                id: agent_id.clone(),
            });
        }
        let mut session = Session::new(system_prompt);
        session.display_agent_id = Some(agent_id.clone());
        let id = session.id.clone();
        let history = HistoryLog::new(self.inner.config.history, &session.nodes);
        self.inner.persistence.save_session(&session).await?;
        self.inner
            .sessions
            .insert(id.clone(), Arc::new(Mutex::new(SessionState { session, history })));
        info!(session = %id, "session created");
        Ok(id)
    }

    /// Bring a persisted session into memory with a fresh (empty) undo log.
    pub async fn open_session(&self, id: &SessionId) -> Result<()> {
        if self.inner.sessions.contains_key(id) {
            return Ok(());
        }
        let session = self
            .inner
            .persistence
            .load_session(id)
            .await?
            .ok_or_else(|| EngineError::SessionNotFound { id: id.clone() })?;
        let history = HistoryLog::new(self.inner.config.history, &session.nodes);
        self.inner
            .sessions
            .insert(id.clone(), Arc::new(Mutex::new(SessionState { session, history })));
        Ok(())
    }

    /// Read-only copy for rendering and tests.
    pub async fn session_snapshot(&self, id: &SessionId) -> Result<Session> {
        let state = self.state(id)?;
        let guard = state.lock().await;
        Ok(guard.session.clone())
    }

    fn state(&self, id: &SessionId) -> Result<Arc<Mutex<SessionState>>> {
        self.inner
            .sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| EngineError::SessionNotFound { id: id.clone() })
    }

    fn agent_for(&self, session: &Session) -> Result<AgentDefinition> {
        let id = session
            .display_agent_id
            .clone()
            .unwrap_or_else(AgentId::main);
        self.inner
            .agents
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::AgentNotFound { id })
    }

    fn profile_for(&self, agent: &AgentDefinition) -> Option<UserProfile> {
        let id = agent.user_profile_id.as_ref()?;
        self.inner.profiles.get(id).map(|entry| entry.value().clone())
    }

    /// The rules in effect right now, captured onto nodes in message-bound
    /// sessions.
    async fn current_rules(
        &self,
        agent: &AgentDefinition,
        profile: Option<&UserProfile>,
    ) -> Vec<RegexRule> {
        let mut rules = Vec::new();
        for preset in self.inner.global_regex.read().await.iter() {
            if preset.enabled {
                rules.extend(preset.rules.iter().cloned());
            }
        }
        for preset in agent.regex_config.iter().filter(|p| p.enabled) {
            rules.extend(preset.rules.iter().cloned());
        }
        if let Some(profile) = profile {
            for preset in profile.regex_config.iter().filter(|p| p.enabled) {
                rules.extend(preset.rules.iter().cloned());
            }
        }
        rules
    }

    fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    async fn save(&self, session: &Session) -> Result<()> {
        self.inner.persistence.save_session(session).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------

    /// Run one full turn: create the user and assistant nodes, assemble the
    /// context, stream the response into the assistant node, finalize it,
    /// and clear the undo log (breakpoint). Streaming failures surface on
    /// the node, not through the returned `Result`.
    #[instrument(skip(self, text, attachments), fields(session = %session_id))]
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        text: &str,
        attachments: Vec<AssetRef>,
    ) -> Result<NodeId> {
        let state = self.state(session_id)?;
        let (agent, profile, assistant_id, user_id, snapshot) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let agent = self.agent_for(session)?;
            let profile = self.profile_for(&agent);

            let mut user_draft = NodeDraft::new(Role::User, text).with_attachments(attachments);
            if session.regex_binding == RuleBinding::MessageBound {
                user_draft.metadata.rule_snapshot =
                    Some(self.current_rules(&agent, profile.as_ref()).await);
            }
            let leaf = session.active_leaf_id.clone();
            let user = create_child(session, &leaf, user_draft)?;
            let user_id = user.id.clone();

            let mut assistant_draft =
                NodeDraft::new(Role::Assistant, "").with_status(NodeStatus::Generating);
            assistant_draft.metadata.agent = Some(AgentSnapshot {
                id: agent.id.clone(),
                name: agent.name.clone(),
                icon: agent.icon.clone(),
            });
            assistant_draft.metadata.model_id = Some(agent.model_id.clone());
            let assistant = create_child(session, &user_id, assistant_draft)?;
            let assistant_id = assistant.id.clone();
            session.active_leaf_id = assistant_id.clone();

            // Provisional: the turn ends with a breakpoint that erases this.
            history.record(
                "send_message",
                vec![
                    NodeDelta::Create {
                        node: user.node,
                        relation: user.relation,
                    },
                    NodeDelta::Create {
                        node: assistant.node,
                        relation: assistant.relation,
                    },
                ],
                None,
                &session.nodes,
            );
            let snapshot = session.clone();
            (agent, profile, assistant_id, user_id, snapshot)
        };

        self.emit(EngineEvent::NodeCreated {
            session_id: session_id.clone(),
            node_id: user_id,
        });
        self.emit(EngineEvent::NodeCreated {
            session_id: session_id.clone(),
            node_id: assistant_id.clone(),
        });
        self.save(&snapshot).await?;

        self.run_turn(session_id, &state, snapshot, assistant_id.clone(), &agent, profile)
            .await;
        Ok(assistant_id)
    }

    /// Create a fresh assistant sibling under the nearest user ancestor of
    /// `node_id` and stream into it.
    #[instrument(skip(self), fields(session = %session_id, node = %node_id))]
    pub async fn regenerate_from(&self, session_id: &SessionId, node_id: &NodeId) -> Result<NodeId> {
        let state = self.state(session_id)?;
        let (agent, profile, assistant_id, snapshot) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let agent = self.agent_for(session)?;
            let profile = self.profile_for(&agent);

            let user_id = nearest_user(session, node_id).ok_or_else(|| {
                EngineError::Tree(TreeError::InvalidMutation(format!(
                    "no user ancestor for {node_id}"
                )))
            })?;

            let mut assistant_draft =
                NodeDraft::new(Role::Assistant, "").with_status(NodeStatus::Generating);
            assistant_draft.metadata.agent = Some(AgentSnapshot {
                id: agent.id.clone(),
                name: agent.name.clone(),
                icon: agent.icon.clone(),
            });
            assistant_draft.metadata.model_id = Some(agent.model_id.clone());
            let assistant = create_child(session, &user_id, assistant_draft)?;
            let assistant_id = assistant.id.clone();
            session.active_leaf_id = assistant_id.clone();

            history.record(
                "regenerate",
                vec![NodeDelta::Create {
                    node: assistant.node,
                    relation: assistant.relation,
                }],
                None,
                &session.nodes,
            );
            let snapshot = session.clone();
            (agent, profile, assistant_id, snapshot)
        };

        self.emit(EngineEvent::NodeCreated {
            session_id: session_id.clone(),
            node_id: assistant_id.clone(),
        });
        self.save(&snapshot).await?;

        self.run_turn(session_id, &state, snapshot, assistant_id.clone(), &agent, profile)
            .await;
        Ok(assistant_id)
    }

    /// Cancel one streaming node, or every streaming node in the session.
    pub fn abort(&self, session_id: &SessionId, node_id: Option<&NodeId>) {
        match node_id {
            Some(node_id) => {
                if let Some(entry) = self.inner.generating.get(node_id) {
                    let (owner, token) = entry.value();
                    if owner == session_id {
                        token.cancel();
                    }
                }
            }
            None => {
                for entry in self.inner.generating.iter() {
                    let (owner, token) = entry.value();
                    if owner == session_id {
                        token.cancel();
                    }
                }
            }
        }
    }

    /// Pipeline + streaming + finalization. Always ends with the history
    /// breakpoint, whatever the stream did.
    async fn run_turn(
        &self,
        session_id: &SessionId,
        state: &Arc<Mutex<SessionState>>,
        snapshot: Session,
        assistant_id: NodeId,
        agent: &AgentDefinition,
        profile: Option<UserProfile>,
    ) {
        let output = match self
            .assemble(&snapshot, agent, profile.as_ref(), Some(&assistant_id))
            .await
        {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, "pipeline failed, aborting turn");
                self.finalize_error(session_id, state, &assistant_id, err.to_string())
                    .await;
                return;
            }
        };

        let mut sampling = agent.parameters.sampling.clone();
        apply_overrides(&mut sampling, &snapshot);
        let timeout = Duration::from_secs(self.inner.config.stream.request_timeout_secs);
        let cancel = CancellationToken::new();
        self.inner
            .generating
            .insert(assistant_id.clone(), (session_id.clone(), cancel.clone()));

        let request = ChatRequest {
            model: agent.model_id.clone(),
            messages: output.messages,
            sampling,
            timeout,
            cancel: cancel.clone(),
        };

        let (tx, mut rx) = mpsc::channel::<StreamChunk>(64);
        let client = self.inner.client.clone();
        let stream_request = request.clone();
        let stream_task =
            tokio::spawn(async move { client.stream(stream_request, tx).await });

        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        let mut batcher =
            ChunkBatcher::new(Duration::from_millis(self.inner.config.stream.flush_ms));
        let mut first_token_ms: Option<u64> = None;
        let mut usage: Option<TokenUsage> = None;

        let flush_window = Duration::from_millis(self.inner.config.stream.flush_ms);
        let outcome = loop {
            tokio::select! {
                _ = cancel.cancelled() => break StreamOutcome::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StreamOutcome::TimedOut,
                // Quiet stream with buffered content: flush on the window.
                _ = tokio::time::sleep(flush_window), if !batcher.is_empty() => {
                    if let Some(flush) = batcher.take() {
                        self.apply_flush(session_id, state, &assistant_id, flush).await;
                    }
                }
                chunk = rx.recv() => match chunk {
                    Some(chunk) => {
                        if first_token_ms.is_none() && chunk.has_delta() {
                            first_token_ms = Some(started.elapsed().as_millis() as u64);
                        }
                        if let Some(u) = chunk.usage {
                            usage = Some(u);
                        }
                        batcher.push(&chunk);
                        if batcher.due() {
                            if let Some(flush) = batcher.take() {
                                self.apply_flush(session_id, state, &assistant_id, flush).await;
                            }
                        }
                    }
                    None => break StreamOutcome::Finished,
                }
            }
        };
        // Stop the provider task on timeout/cancel; harmless after a clean
        // finish.
        cancel.cancel();
        let stream_result = match stream_task.await {
            Ok(result) => result,
            Err(join_err) => Err(LlmError::new(LlmErrorKind::Unknown, join_err.to_string())),
        };
        // Drain whatever the provider emitted before it stopped, then flush.
        while let Ok(chunk) = rx.try_recv() {
            if first_token_ms.is_none() && chunk.has_delta() {
                first_token_ms = Some(started.elapsed().as_millis() as u64);
            }
            if let Some(u) = chunk.usage {
                usage = Some(u);
            }
            batcher.push(&chunk);
        }
        if let Some(flush) = batcher.take() {
            self.apply_flush(session_id, state, &assistant_id, flush).await;
        }

        self.inner.generating.remove(&assistant_id);
        let elapsed = started.elapsed();

        let mut guard = state.lock().await;
        let mut failure: Option<String> = None;
        if let Some(node) = guard.session.node_mut(&assistant_id) {
            match outcome {
                StreamOutcome::Finished => match stream_result {
                    Ok(()) => {
                        node.status = NodeStatus::Complete;
                        node.metadata.usage = usage;
                        node.metadata.performance = Some(PerfStats {
                            first_token_ms,
                            tokens_per_second: usage.and_then(|u| {
                                let secs = elapsed.as_secs_f64();
                                (secs > 0.0)
                                    .then(|| u.completion_tokens as f64 / secs)
                            }),
                        });
                    }
                    Err(err) if err.kind == LlmErrorKind::Cancelled => {
                        finalize_cancelled(node, &mut failure);
                    }
                    Err(err) => {
                        node.status = NodeStatus::Error;
                        node.metadata.error = Some(err.to_string());
                        failure = Some(err.to_string());
                    }
                },
                StreamOutcome::Cancelled => finalize_cancelled(node, &mut failure),
                StreamOutcome::TimedOut => {
                    node.status = NodeStatus::Error;
                    node.metadata.error = Some("timeout".to_string());
                    failure = Some("timeout".to_string());
                }
            }
        }

        // Turn bookkeeping: which agent answered, how often.
        guard.session.display_agent_id = Some(agent.id.clone());
        *guard
            .session
            .agent_usage
            .entry(agent.id.as_str().to_string())
            .or_insert(0) += 1;
        guard.session.touch();

        // Breakpoint: the turn is done, provisional records are erased.
        let nodes = guard.session.nodes.clone();
        guard.history.clear(&nodes);
        let to_save = guard.session.clone();
        drop(guard);

        if let Err(err) = self.save(&to_save).await {
            warn!(error = %err, "session save failed after turn");
        }

        match failure {
            None => {
                info!(session = %session_id, node = %assistant_id, "turn complete");
                self.emit(EngineEvent::TurnCompleted {
                    session_id: session_id.clone(),
                    node_id: assistant_id,
                });
            }
            Some(error) => {
                self.emit(EngineEvent::TurnFailed {
                    session_id: session_id.clone(),
                    node_id: assistant_id,
                    error,
                });
            }
        }
    }

    /// Run the pipeline against a frozen copy of the session.
    async fn assemble(
        &self,
        snapshot: &Session,
        agent: &AgentDefinition,
        profile: Option<&UserProfile>,
        exclude: Option<&NodeId>,
    ) -> std::result::Result<PipelineOutput, trellis_pipeline::PipelineError> {
        let model = self
            .inner
            .models
            .get(&agent.model_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        let global = self.inner.global_regex.read().await.clone();
        let input = PipelineInput {
            session: snapshot,
            agent,
            user_profile: profile,
            global_regex: &global,
            model: &model,
            exclude,
            format: &self.inner.config.format,
        };
        self.inner.pipeline.run(PipelineContext::new(input)).await
    }

    async fn apply_flush(
        &self,
        session_id: &SessionId,
        state: &Arc<Mutex<SessionState>>,
        node_id: &NodeId,
        flush: crate::stream::Flush,
    ) {
        let mut guard = state.lock().await;
        if let Some(node) = guard.session.node_mut(node_id) {
            node.content.push_str(&flush.text);
            if !flush.reasoning.is_empty() {
                node.metadata
                    .reasoning
                    .get_or_insert_with(String::new)
                    .push_str(&flush.reasoning);
            }
        }
        drop(guard);
        self.emit(EngineEvent::NodeUpdated {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
        });
    }

    async fn finalize_error(
        &self,
        session_id: &SessionId,
        state: &Arc<Mutex<SessionState>>,
        node_id: &NodeId,
        error: String,
    ) {
        let mut guard = state.lock().await;
        if let Some(node) = guard.session.node_mut(node_id) {
            node.status = NodeStatus::Error;
            node.metadata.error = Some(error.clone());
        }
        let nodes = guard.session.nodes.clone();
        guard.history.clear(&nodes);
        let to_save = guard.session.clone();
        drop(guard);
        if let Err(err) = self.save(&to_save).await {
            warn!(error = %err, "session save failed after pipeline error");
        }
        self.emit(EngineEvent::TurnFailed {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
            error,
        });
    }

    // ------------------------------------------------------------------
    // Tree editing (recorded in history)
    // ------------------------------------------------------------------

    pub async fn edit_content(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        new_text: &str,
        new_attachments: Option<Vec<AssetRef>>,
    ) -> Result<()> {
        let state = self.state(session_id)?;
        let snapshot = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let change = update_node(
                session,
                node_id,
                NodeUpdate {
                    content: Some(new_text.to_string()),
                    attachments: new_attachments,
                    ..NodeUpdate::default()
                },
            )?;
            history.record("edit_content", vec![change.into()], None, &session.nodes);
            session.clone()
        };
        self.save(&snapshot).await?;
        self.emit(EngineEvent::NodeUpdated {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
        });
        Ok(())
    }

    pub async fn toggle_enabled(&self, session_id: &SessionId, node_id: &NodeId) -> Result<bool> {
        let state = self.state(session_id)?;
        let (snapshot, enabled) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let current = session
                .node(node_id)
                .ok_or_else(|| EngineError::NodeNotFound {
                    id: node_id.clone(),
                })?
                .enabled;
            let change = set_enabled(session, node_id, !current)?;
            let enabled = change.after.enabled;
            history.record("toggle_enabled", vec![change.into()], None, &session.nodes);
            (session.clone(), enabled)
        };
        self.save(&snapshot).await?;
        self.emit(EngineEvent::NodeUpdated {
            session_id: session_id.clone(),
            node_id: node_id.clone(),
        });
        Ok(enabled)
    }

    pub async fn delete_subtree(&self, session_id: &SessionId, node_id: &NodeId) -> Result<usize> {
        let state = self.state(session_id)?;
        let (snapshot, removed) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let deleted = delete_subtree(session, node_id)?;
            let removed = deleted.nodes.len();
            let top_relation = deleted.relation;
            let deltas: Vec<NodeDelta> = deleted
                .nodes
                .into_iter()
                .enumerate()
                .map(|(i, node)| {
                    let relation = if i == 0 {
                        top_relation.clone()
                    } else {
                        RelationChange::identity(&node)
                    };
                    NodeDelta::Delete { node, relation }
                })
                .collect();
            ensure_valid_active_leaf(session);
            history.record("delete_subtree", deltas, None, &session.nodes);
            (session.clone(), removed)
        };
        self.save(&snapshot).await?;
        self.emit(EngineEvent::HistoryChanged {
            session_id: session_id.clone(),
        });
        Ok(removed)
    }

    /// Duplicate a node as its own rightmost sibling, copying content,
    /// attachments, and metadata (children are not copied).
    pub async fn create_branch(&self, session_id: &SessionId, source_node_id: &NodeId) -> Result<NodeId> {
        let state = self.state(session_id)?;
        let (snapshot, new_id) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let source = session
                .node(source_node_id)
                .ok_or_else(|| EngineError::NodeNotFound {
                    id: source_node_id.clone(),
                })?
                .clone();
            let parent_id = source
                .parent_id
                .clone()
                .ok_or(EngineError::Tree(TreeError::RootImmutable))?;

            let mut draft = NodeDraft::new(source.role, source.content.clone())
                .with_attachments(source.attachments.clone())
                .with_metadata(source.metadata.clone());
            draft.status = source.status;
            draft.enabled = source.enabled;
            let created = create_child(session, &parent_id, draft)?;
            let new_id = created.id.clone();
            history.record(
                "create_branch",
                vec![NodeDelta::Create {
                    node: created.node,
                    relation: created.relation,
                }],
                None,
                &session.nodes,
            );
            switch_to(session, &new_id)?;
            (session.clone(), new_id)
        };
        self.save(&snapshot).await?;
        self.emit(EngineEvent::NodeCreated {
            session_id: session_id.clone(),
            node_id: new_id.clone(),
        });
        Ok(new_id)
    }

    // ------------------------------------------------------------------
    // Navigation (not recorded)
    // ------------------------------------------------------------------

    pub async fn switch_active_leaf(&self, session_id: &SessionId, node_id: &NodeId) -> Result<NodeId> {
        let state = self.state(session_id)?;
        let (snapshot, leaf) = {
            let mut guard = state.lock().await;
            let leaf = switch_to(&mut guard.session, node_id)?;
            (guard.session.clone(), leaf)
        };
        self.save(&snapshot).await?;
        Ok(leaf)
    }

    pub async fn switch_sibling(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
        direction: Direction,
    ) -> Result<NodeId> {
        let state = self.state(session_id)?;
        let (snapshot, leaf) = {
            let mut guard = state.lock().await;
            let leaf = switch_sibling(&mut guard.session, node_id, direction)?;
            (guard.session.clone(), leaf)
        };
        self.save(&snapshot).await?;
        Ok(leaf)
    }

    // ------------------------------------------------------------------
    // Undo / redo
    // ------------------------------------------------------------------

    pub async fn undo(&self, session_id: &SessionId) -> Result<bool> {
        let state = self.state(session_id)?;
        let (snapshot, changed) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let changed = history.undo(session)?;
            (session.clone(), changed)
        };
        if changed {
            self.save(&snapshot).await?;
            self.emit(EngineEvent::HistoryChanged {
                session_id: session_id.clone(),
            });
        }
        Ok(changed)
    }

    pub async fn redo(&self, session_id: &SessionId) -> Result<bool> {
        let state = self.state(session_id)?;
        let (snapshot, changed) = {
            let mut guard = state.lock().await;
            let SessionState { session, history } = &mut *guard;
            let changed = history.redo(session)?;
            (session.clone(), changed)
        };
        if changed {
            self.save(&snapshot).await?;
            self.emit(EngineEvent::HistoryChanged {
                session_id: session_id.clone(),
            });
        }
        Ok(changed)
    }

    pub async fn can_undo(&self, session_id: &SessionId) -> Result<bool> {
        let state = self.state(session_id)?;
        let guard = state.lock().await;
        Ok(guard.history.can_undo())
    }

    pub async fn can_redo(&self, session_id: &SessionId) -> Result<bool> {
        let state = self.state(session_id)?;
        let guard = state.lock().await;
        Ok(guard.history.can_redo())
    }

    // ------------------------------------------------------------------
    // Preview
    // ------------------------------------------------------------------

    /// Run the pipeline as if sending from `node_id` and return the
    /// structured report. The session is untouched.
    pub async fn preview_context(
        &self,
        session_id: &SessionId,
        node_id: &NodeId,
    ) -> Result<ContextPreviewData> {
        let state = self.state(session_id)?;
        let (mut snapshot, agent, profile) = {
            let guard = state.lock().await;
            let agent = self.agent_for(&guard.session)?;
            let profile = self.profile_for(&agent);
            (guard.session.clone(), agent, profile)
        };
        if !snapshot.contains(node_id) {
            return Err(EngineError::NodeNotFound {
                id: node_id.clone(),
            });
        }
        snapshot.active_leaf_id = node_id.clone();
        let output = self
            .assemble(&snapshot, &agent, profile.as_ref(), None)
            .await?;
        Ok(ContextPreviewData::from_output(
            output,
            self.inner.estimator.as_ref(),
            &agent.model_id,
        ))
    }
}

/// Walk up from `node_id` to the nearest node with role `User` (the node
/// itself counts).
fn nearest_user(session: &Session, node_id: &NodeId) -> Option<NodeId> {
    let mut cursor = Some(node_id.clone());
    let mut steps = 0usize;
    while let Some(id) = cursor {
        let node = session.node(&id)?;
        if node.role == Role::User {
            return Some(id);
        }
        steps += 1;
        if steps > session.nodes.len() {
            return None;
        }
        cursor = node.parent_id.clone();
    }
    None
}

fn apply_overrides(sampling: &mut SamplingParams, session: &Session) {
    if let Some(overrides) = &session.parameter_overrides {
        if let Some(temperature) = overrides.temperature {
            sampling.temperature = temperature;
        }
        if let Some(top_p) = overrides.top_p {
            sampling.top_p = Some(top_p);
        }
        if let Some(max_tokens) = overrides.max_tokens {
            sampling.max_tokens = max_tokens;
        }
    }
}

/// Abort semantics: partial content finalizes as complete, an empty node
/// becomes an error.
fn finalize_cancelled(node: &mut trellis_core::Node, failure: &mut Option<String>) {
    if node.content.is_empty() {
        node.status = NodeStatus::Error;
        node.metadata.error = Some("aborted".to_string());
        *failure = Some("aborted".to_string());
    } else {
        node.status = NodeStatus::Complete;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::NodeDraft;

    #[test]
    fn nearest_user_walks_up_through_assistants() {
        let mut session = Session::new("sys");
        let root = session.root_node_id.clone();
        let user = create_child(&mut session, &root, NodeDraft::new(Role::User, "q"))
            .unwrap()
            .id;
        let assistant = create_child(&mut session, &user, NodeDraft::new(Role::Assistant, "a"))
            .unwrap()
            .id;
        assert_eq!(nearest_user(&session, &assistant), Some(user.clone()));
        assert_eq!(nearest_user(&session, &user), Some(user));
        assert_eq!(nearest_user(&session, &root), None);
    }

    #[test]
    fn overrides_apply_partially() {
        let mut session = Session::new("sys");
        session.parameter_overrides = Some(trellis_core::SamplingOverrides {
            temperature: Some(0.2),
            top_p: None,
            max_tokens: Some(128),
        });
        let mut sampling = SamplingParams::default();
        apply_overrides(&mut sampling, &session);
        assert_eq!(sampling.temperature, 0.2);
        assert_eq!(sampling.max_tokens, 128);
        assert!(sampling.top_p.is_none());
    }
}
