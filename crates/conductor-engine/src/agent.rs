use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use conductor_core::content::Content;
use conductor_core::event::Event;

use crate::context::InvocationContext;
use crate::error::{AgentError, CallbackError};

/// Events produced by one agent run, in production order.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, AgentError>> + Send>>;

/// Runs before the agent. `Ok(Some(content))` answers the turn without
/// invoking the agent at all.
#[async_trait]
pub trait BeforeAgentCallback: Send + Sync {
    async fn before_agent(&self, ctx: &InvocationContext)
        -> Result<Option<Content>, CallbackError>;
}

/// Runs once the agent's sequence has closed, with every event it produced.
/// `Ok(Some(content))` appends one more event to the turn.
#[async_trait]
pub trait AfterAgentCallback: Send + Sync {
    async fn after_agent(
        &self,
        ctx: &InvocationContext,
        events: &[Event],
    ) -> Result<Option<Content>, CallbackError>;
}

/// Capability set every agent exposes to the Runner.
///
/// Agents form a tree: each owns its sub-agents. `run` receives the
/// invocation context by value and returns a `'static` stream, so agents
/// clone whatever they need into it.
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    async fn run(&self, ctx: InvocationContext) -> Result<EventStream, AgentError>;

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &[]
    }

    /// Depth-first search over descendants. Does not match `self`.
    fn find_agent(&self, name: &str) -> Option<Arc<dyn Agent>> {
        for sub in self.sub_agents() {
            if sub.name() == name {
                return Some(Arc::clone(sub));
            }
            if let Some(found) = sub.find_agent(name) {
                return Some(found);
            }
        }
        None
    }

    fn before_callback(&self) -> Option<Arc<dyn BeforeAgentCallback>> {
        None
    }

    fn after_callback(&self) -> Option<Arc<dyn AfterAgentCallback>> {
        None
    }

    /// Whether the conversation may stay with this agent across turns
    /// (and hand control back to its parent).
    fn allows_transfer_to_parent(&self) -> bool {
        true
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        Ok(())
    }
}
