use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::content::{Content, Part};
use crate::ids::{EventId, InvocationId};
use crate::state::StateMap;

/// Author recorded on events synthesized from caller input.
pub const USER_AUTHOR: &str = "user";

/// Side effects carried by an event. The Runner routes them; it never
/// interprets `state_delta` scopes itself.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventActions {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_delta: StateMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_to_agent: Option<String>,
    /// Advisory filename → version map.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub artifact_delta: HashMap<String, i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_invocation: Option<bool>,
}

impl EventActions {
    pub fn is_empty(&self) -> bool {
        self.state_delta.is_empty()
            && self.transfer_to_agent.is_none()
            && self.artifact_delta.is_empty()
            && self.end_invocation.is_none()
    }

    pub fn ends_invocation(&self) -> bool {
        self.end_invocation.unwrap_or(false)
    }
}

/// One fragment of agent output.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub invocation_id: InvocationId,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "EventActions::is_empty")]
    pub actions: EventActions,
    /// Relay-only when true. Absent and `false` are the same thing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(invocation_id: InvocationId, author: impl Into<String>) -> Self {
        Self {
            id: EventId::new(),
            invocation_id,
            author: author.into(),
            branch: None,
            content: None,
            actions: EventActions::default(),
            partial: None,
            turn_complete: None,
            error_code: None,
            error_message: None,
            timestamp: Utc::now(),
        }
    }

    /// Event recording caller input. The role is forced to `user`.
    pub fn user_message(invocation_id: InvocationId, mut content: Content) -> Self {
        content.role = Some(crate::content::ROLE_USER.to_string());
        Self::new(invocation_id, USER_AUTHOR).with_content(content)
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_content(Content::model_text(text))
    }

    pub fn with_branch(mut self, branch: Option<String>) -> Self {
        self.branch = branch;
        self
    }

    pub fn partial(mut self) -> Self {
        self.partial = Some(true);
        self
    }

    pub fn turn_complete(mut self) -> Self {
        self.turn_complete = Some(true);
        self
    }

    pub fn with_state_delta<K, I>(mut self, delta: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, serde_json::Value)>,
    {
        self.actions
            .state_delta
            .extend(delta.into_iter().map(|(k, v)| (k.into(), v)));
        self
    }

    pub fn with_transfer(mut self, agent_name: impl Into<String>) -> Self {
        self.actions.transfer_to_agent = Some(agent_name.into());
        self
    }

    pub fn with_artifact(mut self, filename: impl Into<String>, version: i64) -> Self {
        self.actions.artifact_delta.insert(filename.into(), version);
        self
    }

    pub fn with_end_invocation(mut self) -> Self {
        self.actions.end_invocation = Some(true);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn is_partial(&self) -> bool {
        self.partial.unwrap_or(false)
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }

    pub fn is_user(&self) -> bool {
        self.author == USER_AUTHOR
    }

    fn parts(&self) -> impl Iterator<Item = &Part> {
        self.content.iter().flat_map(|c| c.parts.iter())
    }

    pub fn function_calls(&self) -> Vec<&Part> {
        self.parts().filter(|p| p.is_function_call()).collect()
    }

    pub fn function_responses(&self) -> Vec<&Part> {
        self.parts().filter(|p| p.is_function_response()).collect()
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts().any(Part::is_function_call)
    }

    /// A complete, user-presentable answer: durable and not part of a tool round-trip.
    pub fn is_final_response(&self) -> bool {
        !self.is_partial()
            && !self.has_function_calls()
            && !self.parts().any(Part::is_function_response)
    }

    pub fn text(&self) -> String {
        self.content.as_ref().map(Content::text).unwrap_or_default()
    }
}
