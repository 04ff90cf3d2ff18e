use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use conductor_core::content::Content;
use conductor_core::event::Event;
use conductor_core::ids::InvocationId;
use conductor_store::{ArtifactService, MemoryService, Session, SessionKey, SessionService};

use crate::agent::Agent;
use crate::error::AgentError;

/// In-flight view of the session, shared by the Runner and the acting agent.
/// The Runner mirrors every durable event into it after persisting.
pub type SessionHandle = Arc<RwLock<Session>>;

/// Per-call limits.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunConfig {
    /// Upper bound on model/tool rounds counted via `record_turn`.
    pub max_turns: Option<u32>,
    /// Deadline for the whole call, measured from `run_async`.
    pub timeout: Option<Duration>,
}

impl RunConfig {
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct InvocationFlags {
    ended: AtomicBool,
    turns: AtomicU32,
}

/// Everything one Runner call hands to its agent. Cheap to clone; clones
/// and delegates derived with `for_agent` share flags, session and
/// cancellation.
#[derive(Clone)]
pub struct InvocationContext {
    invocation_id: InvocationId,
    agent: Arc<dyn Agent>,
    session: SessionHandle,
    session_service: Arc<dyn SessionService>,
    artifact_service: Option<Arc<dyn ArtifactService>>,
    memory_service: Option<Arc<dyn MemoryService>>,
    user_content: Option<Content>,
    branch: Option<String>,
    run_config: RunConfig,
    cancel: CancellationToken,
    flags: Arc<InvocationFlags>,
}

impl InvocationContext {
    pub fn new(
        invocation_id: InvocationId,
        agent: Arc<dyn Agent>,
        session: SessionHandle,
        session_service: Arc<dyn SessionService>,
    ) -> Self {
        Self {
            invocation_id,
            agent,
            session,
            session_service,
            artifact_service: None,
            memory_service: None,
            user_content: None,
            branch: None,
            run_config: RunConfig::default(),
            cancel: CancellationToken::new(),
            flags: Arc::new(InvocationFlags::default()),
        }
    }

    pub fn with_user_content(mut self, content: Option<Content>) -> Self {
        self.user_content = content;
        self
    }

    pub fn with_run_config(mut self, run_config: RunConfig) -> Self {
        self.run_config = run_config;
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_artifact_service(mut self, service: Option<Arc<dyn ArtifactService>>) -> Self {
        self.artifact_service = service;
        self
    }

    pub fn with_memory_service(mut self, service: Option<Arc<dyn MemoryService>>) -> Self {
        self.memory_service = service;
        self
    }

    /// Context for a delegate agent within the same invocation.
    pub fn for_agent(&self, agent: Arc<dyn Agent>) -> Self {
        Self {
            agent,
            ..self.clone()
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.invocation_id
    }

    pub fn agent(&self) -> &Arc<dyn Agent> {
        &self.agent
    }

    pub fn agent_name(&self) -> &str {
        self.agent.name()
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Point-in-time copy of the in-flight session.
    pub fn session_snapshot(&self) -> Session {
        self.session.read().clone()
    }

    pub fn session_key(&self) -> SessionKey {
        self.session.read().key()
    }

    pub fn state_value(&self, key: &str) -> Option<serde_json::Value> {
        self.session.read().state.get(key).cloned()
    }

    pub fn session_service(&self) -> &Arc<dyn SessionService> {
        &self.session_service
    }

    pub fn artifact_service(&self) -> Option<&Arc<dyn ArtifactService>> {
        self.artifact_service.as_ref()
    }

    pub fn memory_service(&self) -> Option<&Arc<dyn MemoryService>> {
        self.memory_service.as_ref()
    }

    pub fn user_content(&self) -> Option<&Content> {
        self.user_content.as_ref()
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch.as_deref()
    }

    pub fn run_config(&self) -> &RunConfig {
        &self.run_config
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Event stamped with this invocation, the acting agent and the branch.
    pub fn new_event(&self) -> Event {
        Event::new(self.invocation_id.clone(), self.agent.name())
            .with_branch(self.branch.clone())
    }

    /// Count one model/tool round. Fails once `max_turns` is exceeded.
    pub fn record_turn(&self) -> Result<u32, AgentError> {
        let turn = self.flags.turns.fetch_add(1, Ordering::SeqCst) + 1;
        match self.run_config.max_turns {
            Some(max) if turn > max => Err(AgentError::MaxTurnsExceeded(max)),
            _ => Ok(turn),
        }
    }

    pub fn turns(&self) -> u32 {
        self.flags.turns.load(Ordering::SeqCst)
    }

    /// Ask the Runner to stop consuming this invocation after the current event.
    pub fn end_invocation(&self) {
        self.flags.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.flags.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn mirror(&self, event: &Event) {
        self.session.write().apply_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;
    use conductor_core::state::StateMap;
    use conductor_store::InMemorySessionService;
    use serde_json::json;

    fn context(max_turns: Option<u32>) -> InvocationContext {
        let session = Session::new(SessionKey::new("app", "u1", "s1"), StateMap::new());
        InvocationContext::new(
            InvocationId::from_raw("inv_test"),
            Arc::new(MockAgent::new("root", vec![])),
            Arc::new(RwLock::new(session)),
            Arc::new(InMemorySessionService::new()),
        )
        .with_run_config(RunConfig {
            max_turns,
            timeout: None,
        })
    }

    #[test]
    fn new_event_is_stamped() {
        let ctx = context(None).with_branch("root.sub");
        let event = ctx.new_event();
        assert_eq!(event.invocation_id.as_str(), "inv_test");
        assert_eq!(event.author, "root");
        assert_eq!(event.branch.as_deref(), Some("root.sub"));
    }

    #[test]
    fn record_turn_enforces_limit() {
        let ctx = context(Some(2));
        assert_eq!(ctx.record_turn(), Ok(1));
        assert_eq!(ctx.record_turn(), Ok(2));
        assert_eq!(ctx.record_turn(), Err(AgentError::MaxTurnsExceeded(2)));
    }

    #[test]
    fn unlimited_turns() {
        let ctx = context(None);
        for _ in 0..100 {
            ctx.record_turn().unwrap();
        }
        assert_eq!(ctx.turns(), 100);
    }

    #[test]
    fn delegate_shares_flags_and_session() {
        let ctx = context(Some(1));
        let delegate = ctx.for_agent(Arc::new(MockAgent::new("helper", vec![])));
        assert_eq!(delegate.agent_name(), "helper");
        assert_eq!(delegate.new_event().author, "helper");

        delegate.record_turn().unwrap();
        assert!(ctx.record_turn().is_err());

        delegate.end_invocation();
        assert!(ctx.is_ended());

        delegate.mirror(&delegate.new_event().with_state_delta([("k", json!(1))]));
        assert_eq!(ctx.state_value("k"), Some(json!(1)));
    }

    #[test]
    fn cancellation_is_shared() {
        let token = CancellationToken::new();
        let ctx = context(None).with_cancel(token.clone());
        let delegate = ctx.for_agent(Arc::new(MockAgent::new("helper", vec![])));
        token.cancel();
        assert!(delegate.is_cancelled());
    }
}
