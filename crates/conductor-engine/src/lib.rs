pub mod agent;
pub mod cache;
pub mod context;
pub mod error;
pub mod mock;
pub mod runner;
pub mod tree;

pub use agent::{AfterAgentCallback, Agent, BeforeAgentCallback, EventStream};
pub use cache::RunnerCache;
pub use context::{InvocationContext, RunConfig, SessionHandle};
pub use error::{AgentError, CallbackError, EngineError};
pub use runner::{RunRequest, RunStream, Runner, RunnerConfig};
pub use tree::AgentTree;
