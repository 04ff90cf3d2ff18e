use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use conductor_core::content::Content;
use conductor_core::event::Event;
use conductor_core::ids::InvocationId;

use crate::agent::{AfterAgentCallback, Agent, BeforeAgentCallback, EventStream};
use crate::context::InvocationContext;
use crate::error::AgentError;

/// Scripted reply for one `run` call.
///
/// Scripted events are templates: the agent stamps each with the live
/// invocation id and branch, and with its own name when `author` is empty.
pub enum MockResponse {
    /// Yield these events, then close.
    Events(Vec<Event>),
    /// Yield these events, then one `Err` item.
    EventsThenError(Vec<Event>, AgentError),
    /// Fail the `run` call itself.
    StartError(AgentError),
    /// Wait before starting, then behave like the inner response.
    Delay(Duration, Box<MockResponse>),
    /// Yield these events, then never produce another item.
    Pending(Vec<Event>),
}

impl MockResponse {
    /// One final model event with this text.
    pub fn text(text: &str) -> Self {
        Self::Events(vec![template().with_content(Content::model_text(text))])
    }

    /// Partial chunks for each piece, then one final event with the joined text.
    pub fn chunked(chunks: &[&str]) -> Self {
        let mut events: Vec<Event> = chunks
            .iter()
            .map(|c| template().with_content(Content::model_text(*c)).partial())
            .collect();
        events.push(template().with_content(Content::model_text(chunks.concat())));
        Self::Events(events)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Blank event for building scripts. Author and invocation are filled in
/// when the mock replays it.
pub fn template() -> Event {
    Event::new(InvocationId::from_raw(""), "")
}

/// Agent that replays pre-programmed responses in call order.
pub struct MockAgent {
    name: String,
    description: String,
    responses: Mutex<VecDeque<MockResponse>>,
    call_count: AtomicUsize,
    cleanup_count: AtomicUsize,
    sub_agents: Vec<Arc<dyn Agent>>,
    before: Option<Arc<dyn BeforeAgentCallback>>,
    after: Option<Arc<dyn AfterAgentCallback>>,
    transfer_to_parent: bool,
    cleanup_error: Option<AgentError>,
}

impl MockAgent {
    pub fn new(name: &str, responses: Vec<MockResponse>) -> Self {
        Self {
            name: name.to_string(),
            description: format!("mock agent {name}"),
            responses: Mutex::new(responses.into()),
            call_count: AtomicUsize::new(0),
            cleanup_count: AtomicUsize::new(0),
            sub_agents: Vec::new(),
            before: None,
            after: None,
            transfer_to_parent: true,
            cleanup_error: None,
        }
    }

    pub fn with_sub_agents(mut self, sub_agents: Vec<Arc<dyn Agent>>) -> Self {
        self.sub_agents = sub_agents;
        self
    }

    pub fn with_before_callback(mut self, callback: Arc<dyn BeforeAgentCallback>) -> Self {
        self.before = Some(callback);
        self
    }

    pub fn with_after_callback(mut self, callback: Arc<dyn AfterAgentCallback>) -> Self {
        self.after = Some(callback);
        self
    }

    pub fn disallow_transfer_to_parent(mut self) -> Self {
        self.transfer_to_parent = false;
        self
    }

    pub fn with_cleanup_error(mut self, error: AgentError) -> Self {
        self.cleanup_error = Some(error);
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.cleanup_count.load(Ordering::SeqCst)
    }

    fn stamp(&self, ctx: &InvocationContext, mut event: Event) -> Event {
        event.invocation_id = ctx.invocation_id().clone();
        if event.author.is_empty() {
            event.author = self.name.clone();
        }
        if event.branch.is_none() {
            event.branch = ctx.branch().map(str::to_string);
        }
        event
    }

    fn stamp_all(&self, ctx: &InvocationContext, events: Vec<Event>) -> Vec<Result<Event, AgentError>> {
        events.into_iter().map(|e| Ok(self.stamp(ctx, e))).collect()
    }
}

#[async_trait]
impl Agent for MockAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, ctx: InvocationContext) -> Result<EventStream, AgentError> {
        let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
        let mut response = self.responses.lock().pop_front().ok_or_else(|| {
            AgentError::Failed(format!("MockAgent {}: no response configured for call {idx}", self.name))
        })?;

        loop {
            match response {
                MockResponse::Delay(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    response = *inner;
                }
                MockResponse::StartError(e) => return Err(e),
                MockResponse::Events(events) => {
                    return Ok(Box::pin(stream::iter(self.stamp_all(&ctx, events))));
                }
                MockResponse::EventsThenError(events, e) => {
                    let mut items = self.stamp_all(&ctx, events);
                    items.push(Err(e));
                    return Ok(Box::pin(stream::iter(items)));
                }
                MockResponse::Pending(events) => {
                    let items = self.stamp_all(&ctx, events);
                    return Ok(Box::pin(stream::iter(items).chain(stream::pending())));
                }
            }
        }
    }

    fn sub_agents(&self) -> &[Arc<dyn Agent>] {
        &self.sub_agents
    }

    fn before_callback(&self) -> Option<Arc<dyn BeforeAgentCallback>> {
        self.before.clone()
    }

    fn after_callback(&self) -> Option<Arc<dyn AfterAgentCallback>> {
        self.after.clone()
    }

    fn allows_transfer_to_parent(&self) -> bool {
        self.transfer_to_parent
    }

    async fn cleanup(&self) -> Result<(), AgentError> {
        self.cleanup_count.fetch_add(1, Ordering::SeqCst);
        match &self.cleanup_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}
