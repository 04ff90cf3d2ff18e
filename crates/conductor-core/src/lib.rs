pub mod content;
pub mod event;
pub mod ids;
pub mod state;

pub use content::{Content, Part};
pub use event::{Event, EventActions, USER_AUTHOR};
pub use ids::{EventId, InvocationId, SessionId};
pub use state::StateMap;
