use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::event::Event;
use conductor_core::ids::SessionId;
use conductor_core::state::{self, StateMap, StateScope};

/// Identity of a session: the (app, user, id) triple.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionKey {
    pub app_name: String,
    pub user_id: String,
    pub session_id: SessionId,
}

impl SessionKey {
    pub fn new(
        app_name: impl Into<String>,
        user_id: impl Into<String>,
        session_id: impl Into<SessionId>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.app_name, self.user_id, self.session_id)
    }
}

/// Durable conversation record: ordered event log plus merged state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub app_name: String,
    pub user_id: String,
    pub state: StateMap,
    pub events: Vec<Event>,
    pub last_update_time: DateTime<Utc>,
}

impl Session {
    pub fn new(key: SessionKey, state: StateMap) -> Self {
        Self {
            id: key.session_id,
            app_name: key.app_name,
            user_id: key.user_id,
            state,
            events: Vec::new(),
            last_update_time: Utc::now(),
        }
    }

    pub fn key(&self) -> SessionKey {
        SessionKey {
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            session_id: self.id.clone(),
        }
    }

    /// Apply one event to this value. Partial events are ignored; anything
    /// else is appended and its state delta merged shallowly.
    /// Returns whether the session changed.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        if event.is_partial() {
            return false;
        }
        if !event.actions.state_delta.is_empty() {
            state::merge_into(&mut self.state, &event.actions.state_delta);
        }
        self.events.push(event.clone());
        self.touch(event.timestamp);
        true
    }

    /// Refresh `last_update_time`, never moving it backwards.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        let now = Utc::now().max(at);
        if now > self.last_update_time {
            self.last_update_time = now;
        }
    }

    pub fn last_event(&self) -> Option<&Event> {
        self.events.last()
    }

    /// Most recent event not authored by the caller.
    pub fn last_agent_event(&self) -> Option<&Event> {
        self.events.iter().rev().find(|e| !e.is_user())
    }

    /// Copy without the event log, as listings return it.
    pub fn without_events(&self) -> Self {
        Self {
            id: self.id.clone(),
            app_name: self.app_name.clone(),
            user_id: self.user_id.clone(),
            state: self.state.clone(),
            events: Vec::new(),
            last_update_time: self.last_update_time,
        }
    }
}

/// Copy of an event as storage keeps it: `temp:` keys removed from its delta.
pub(crate) fn persisted_form(event: &Event) -> Event {
    let mut stored = event.clone();
    stored
        .actions
        .state_delta
        .retain(|k, _| StateScope::of(k) != StateScope::Temp);
    stored
}
