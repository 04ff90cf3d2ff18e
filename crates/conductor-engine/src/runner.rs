use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use conductor_core::content::Content;
use conductor_core::event::Event;
use conductor_core::ids::InvocationId;
use conductor_core::state::StateMap;
use conductor_store::{
    ArtifactService, MemoryService, Session, SessionKey, SessionService, StoreError,
};

use crate::agent::Agent;
use crate::context::{InvocationContext, RunConfig};
use crate::error::EngineError;
use crate::tree::AgentTree;

pub const ERROR_BEFORE_CALLBACK: &str = "before_agent_callback";
pub const ERROR_AGENT_START: &str = "agent_start";
pub const ERROR_AGENT: &str = "agent_error";
pub const ERROR_AFTER_CALLBACK: &str = "after_agent_callback";
pub const ERROR_DEADLINE: &str = "deadline_exceeded";

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// Caller-facing event sequence of one invocation.
pub type RunStream = ReceiverStream<Event>;

/// Configuration for the runner.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Events buffered between the worker and the caller.
    pub channel_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Input of one Runner call.
#[derive(Clone, Debug)]
pub struct RunRequest {
    pub user_id: String,
    pub session_id: String,
    pub new_message: Option<Content>,
    pub run_config: RunConfig,
}

impl RunRequest {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            new_message: None,
            run_config: RunConfig::default(),
        }
    }

    pub fn with_message(mut self, content: Content) -> Self {
        self.new_message = Some(content);
        self
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }
}

/// Drives one agent tree against one app's sessions.
///
/// Each call resolves the session, records the new message, picks the agent
/// and spawns a worker that persists then relays every event the agent
/// produces. The Runner holds no per-call state.
pub struct Runner {
    app_name: String,
    tree: AgentTree,
    session_service: Arc<dyn SessionService>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
    config: RunnerConfig,
}

impl Runner {
    pub fn new(
        app_name: impl Into<String>,
        root: Arc<dyn Agent>,
        session_service: Arc<dyn SessionService>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            tree: AgentTree::new(root),
            session_service,
            artifact_service: None,
            memory_service: None,
            config: RunnerConfig::default(),
        }
    }

    pub fn with_artifact_service(mut self, service: Arc<dyn ArtifactService>) -> Self {
        self.artifact_service = Some(service);
        self
    }

    pub fn with_memory_service(mut self, service: Arc<dyn MemoryService>) -> Self {
        self.memory_service = Some(service);
        self
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn root_agent(&self) -> &Arc<dyn Agent> {
        self.tree.root()
    }

    pub fn tree(&self) -> &AgentTree {
        &self.tree
    }

    /// Start one invocation. Session lookup/creation failures are returned
    /// here; everything after that is reported as events on the stream.
    #[instrument(skip(self, cancel, request), fields(app = %self.app_name, user = %request.user_id, session = %request.session_id))]
    pub async fn run_async(
        &self,
        cancel: CancellationToken,
        request: RunRequest,
    ) -> Result<RunStream, EngineError> {
        if request.user_id.is_empty() {
            return Err(EngineError::InvalidRequest("user_id is empty".into()));
        }
        if request.session_id.is_empty() {
            return Err(EngineError::InvalidRequest("session_id is empty".into()));
        }

        let key = SessionKey::new(
            self.app_name.clone(),
            request.user_id.clone(),
            request.session_id.clone(),
        );
        let session = self.resolve_session(&key).await?;
        let agent = self.route(&session);
        let invocation_id = InvocationId::new();
        debug!(agent = agent.name(), invocation_id = %invocation_id, "routed");

        let token = cancel.child_token();
        let deadline_hit = Arc::new(AtomicBool::new(false));
        if let Some(timeout) = request.run_config.timeout {
            let token = token.clone();
            let hit = Arc::clone(&deadline_hit);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        hit.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                    _ = token.cancelled() => {}
                }
            });
        }

        let handle = Arc::new(RwLock::new(session));
        let mut last_timestamp = None;
        if let Some(content) = &request.new_message {
            let user_event = Event::user_message(invocation_id.clone(), content.clone());
            if let Err(e) = self.session_service.append_event(&key, &user_event).await {
                error!(error = %e, "failed to persist user message");
            }
            handle.write().apply_event(&user_event);
            last_timestamp = Some(user_event.timestamp);
        }

        let ctx = InvocationContext::new(
            invocation_id,
            agent,
            handle,
            Arc::clone(&self.session_service),
        )
        .with_user_content(request.new_message)
        .with_run_config(request.run_config)
        .with_cancel(token.clone())
        .with_artifact_service(self.artifact_service.clone())
        .with_memory_service(self.memory_service.clone());

        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let worker = Worker {
            ctx,
            key,
            tx,
            cancel: token,
            deadline_hit,
            last_timestamp,
            turn_events: Vec::new(),
        };
        tokio::spawn(worker.drive());

        Ok(ReceiverStream::new(rx))
    }

    /// Run one invocation to completion and return every relayed event.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        request: RunRequest,
    ) -> Result<Vec<Event>, EngineError> {
        let stream = self.run_async(cancel, request).await?;
        Ok(stream.collect::<Vec<_>>().await)
    }

    /// Release every agent in the tree. Returns the first failure; the rest
    /// are logged.
    #[instrument(skip(self), fields(app = %self.app_name))]
    pub async fn close(&self) -> Result<(), EngineError> {
        let mut first = None;
        for agent in self.tree.agents() {
            if let Err(e) = agent.cleanup().await {
                error!(agent = agent.name(), error = %e, "agent cleanup failed");
                if first.is_none() {
                    first = Some(e);
                }
            }
        }
        match first {
            Some(e) => Err(EngineError::Agent(e)),
            None => Ok(()),
        }
    }

    async fn resolve_session(&self, key: &SessionKey) -> Result<Session, EngineError> {
        if let Some(session) = self.session_service.get_session(key).await? {
            return Ok(session);
        }
        match self.session_service.create_session(key, StateMap::new()).await {
            Ok(session) => {
                info!(session = %key, "session created");
                Ok(session)
            }
            // Lost a race with a concurrent call creating the same session.
            Err(StoreError::Conflict(_)) => self
                .session_service
                .get_session(key)
                .await?
                .ok_or_else(|| EngineError::Internal(format!("session {key} vanished after conflict"))),
            Err(e) => Err(e.into()),
        }
    }

    /// Pick the agent for the next call from the most recent non-user event.
    fn route(&self, session: &Session) -> Arc<dyn Agent> {
        let root = Arc::clone(self.tree.root());
        let Some(last) = session.last_agent_event() else {
            return root;
        };

        if let Some(target) = &last.actions.transfer_to_agent {
            match self.tree.resolve(target) {
                Some(agent) => return agent,
                None => warn!(transfer_to = %target, "transfer target not found in agent tree"),
            }
        }
        if self.tree.is_reenterable(&last.author) {
            if let Some(agent) = self.tree.resolve(&last.author) {
                return agent;
            }
        }
        root
    }
}

/// How the agent phase of a worker ended.
enum Outcome {
    Finished,
    Stopped,
}

struct Worker {
    ctx: InvocationContext,
    key: SessionKey,
    tx: mpsc::Sender<Event>,
    cancel: CancellationToken,
    deadline_hit: Arc<AtomicBool>,
    last_timestamp: Option<DateTime<Utc>>,
    turn_events: Vec<Event>,
}

impl Worker {
    #[instrument(skip(self), fields(invocation_id = %self.ctx.invocation_id(), agent = %self.ctx.agent_name()))]
    async fn drive(mut self) {
        let outcome = self.execute().await;

        if matches!(outcome, Outcome::Stopped) && self.deadline_hit.load(Ordering::SeqCst) {
            warn!("invocation deadline exceeded");
            let event = self
                .ctx
                .new_event()
                .with_error(ERROR_DEADLINE, "invocation deadline exceeded");
            let event = self.record(event).await;
            if self.tx.try_send(event).is_err() {
                debug!("deadline event not relayed");
            }
        }

        // Stops the deadline timer, if any.
        self.cancel.cancel();
    }

    async fn execute(&mut self) -> Outcome {
        let agent = Arc::clone(self.ctx.agent());

        if let Some(callback) = agent.before_callback() {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stopped,
                r = callback.before_agent(&self.ctx) => r,
            };
            match result {
                Ok(None) => {}
                Ok(Some(content)) => {
                    let event = self.ctx.new_event().with_content(content);
                    self.emit(event).await;
                    return Outcome::Finished;
                }
                Err(e) => {
                    let event = self.ctx.new_event().with_error(ERROR_BEFORE_CALLBACK, e.to_string());
                    self.emit(event).await;
                    return Outcome::Finished;
                }
            }
        }

        let started = tokio::select! {
            _ = self.cancel.cancelled() => return Outcome::Stopped,
            r = agent.run(self.ctx.clone()) => r,
        };
        let mut stream = match started {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "agent failed to start");
                let event = self.ctx.new_event().with_error(ERROR_AGENT_START, e.to_string());
                self.emit(event).await;
                return Outcome::Finished;
            }
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Outcome::Stopped,
                _ = self.tx.closed() => return Outcome::Stopped,
                n = stream.next() => n,
            };
            match next {
                None => break,
                Some(Ok(event)) => {
                    let ends = event.actions.ends_invocation();
                    if !self.emit(event).await {
                        return Outcome::Stopped;
                    }
                    if ends {
                        self.ctx.end_invocation();
                    }
                    if self.ctx.is_ended() {
                        debug!("invocation ended by agent");
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "agent reported an error");
                    let event = self.ctx.new_event().with_error(ERROR_AGENT, e.to_string());
                    self.emit(event).await;
                    return Outcome::Finished;
                }
            }
        }
        drop(stream);

        if let Some(callback) = agent.after_callback() {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Outcome::Stopped,
                r = callback.after_agent(&self.ctx, &self.turn_events) => r,
            };
            match result {
                Ok(None) => {}
                Ok(Some(content)) => {
                    let event = self.ctx.new_event().with_content(content);
                    self.emit(event).await;
                }
                Err(e) => {
                    let event = self.ctx.new_event().with_error(ERROR_AFTER_CALLBACK, e.to_string());
                    self.emit(event).await;
                }
            }
        }
        Outcome::Finished
    }

    /// Persist (unless partial), mirror and notify collaborators, then relay.
    /// Returns false once the caller is gone or the call was cancelled.
    async fn emit(&mut self, event: Event) -> bool {
        let event = self.record(event).await;
        self.turn_events.push(event.clone());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    async fn record(&mut self, mut event: Event) -> Event {
        if let Some(last) = self.last_timestamp {
            if event.timestamp < last {
                event.timestamp = last;
            }
        }
        self.last_timestamp = Some(event.timestamp);

        if event.is_partial() {
            return event;
        }

        if let Err(e) = self.ctx.session_service().append_event(&self.key, &event).await {
            error!(error = %e, event_id = %event.id, "failed to persist event");
        }
        self.ctx.mirror(&event);

        if !event.actions.artifact_delta.is_empty() {
            if let Some(artifacts) = self.ctx.artifact_service() {
                if let Err(e) = artifacts
                    .record_versions(&self.key, &event.actions.artifact_delta)
                    .await
                {
                    warn!(error = %e, event_id = %event.id, "artifact bookkeeping failed");
                }
            }
        }

        if event.is_final_response() || event.has_function_calls() {
            if let Some(memory) = self.ctx.memory_service() {
                let snapshot = self.ctx.session_snapshot();
                if let Err(e) = memory.add_session(&snapshot).await {
                    warn!(error = %e, event_id = %event.id, "memory notification failed");
                }
            }
        }
        event
    }
}
