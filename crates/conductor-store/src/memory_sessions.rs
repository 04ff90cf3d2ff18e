//! In-process `SessionService`.
//!
//! Each session sits behind its own `parking_lot::Mutex` inside a `DashMap`,
//! so appends to one session are linearized while other sessions proceed.
//! App- and user-scoped state live in separate maps and are merged into the
//! view returned by `get_session`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument};

use conductor_core::event::Event;
use conductor_core::state::{self, ScopedDelta, StateMap};

use crate::error::StoreError;
use crate::service::SessionService;
use crate::session::{persisted_form, Session, SessionKey};

type UserKey = (String, String);

#[derive(Default)]
pub struct InMemorySessionService {
    sessions: DashMap<SessionKey, Arc<Mutex<Session>>>,
    app_state: DashMap<String, StateMap>,
    user_state: DashMap<UserKey, StateMap>,
}

impl InMemorySessionService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn user_key(app_name: &str, user_id: &str) -> UserKey {
        (app_name.to_string(), user_id.to_string())
    }

    fn apply_scoped(&self, app_name: &str, user_id: &str, scoped: &ScopedDelta) {
        if !scoped.app.is_empty() {
            let mut app = self.app_state.entry(app_name.to_string()).or_default();
            state::merge_into(&mut app, &scoped.app);
        }
        if !scoped.user.is_empty() {
            let mut user = self
                .user_state
                .entry(Self::user_key(app_name, user_id))
                .or_default();
            state::merge_into(&mut user, &scoped.user);
        }
    }

    fn view(&self, session: &Session) -> Session {
        let app = self
            .app_state
            .get(&session.app_name)
            .map(|s| s.value().clone())
            .unwrap_or_default();
        let user = self
            .user_state
            .get(&Self::user_key(&session.app_name, &session.user_id))
            .map(|s| s.value().clone())
            .unwrap_or_default();
        let mut view = session.clone();
        view.state = state::merged_view(&app, &user, &session.state);
        view
    }
}

#[async_trait]
impl SessionService for InMemorySessionService {
    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        let Some(entry) = self.sessions.get(key).map(|e| Arc::clone(e.value())) else {
            return Ok(None);
        };
        let session = entry.lock();
        Ok(Some(self.view(&session)))
    }

    #[instrument(skip(self, initial_state), fields(session = %key))]
    async fn create_session(
        &self,
        key: &SessionKey,
        initial_state: StateMap,
    ) -> Result<Session, StoreError> {
        let scoped = ScopedDelta::split(&initial_state);
        let session = Session::new(key.clone(), scoped.session.clone());

        match self.sessions.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(StoreError::Conflict(format!("session {key} already exists")));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(session.clone())));
            }
        }
        self.apply_scoped(&key.app_name, &key.user_id, &scoped);
        debug!("session created");
        Ok(self.view(&session))
    }

    async fn append_event(&self, key: &SessionKey, event: &Event) -> Result<(), StoreError> {
        if event.is_partial() {
            return Ok(());
        }
        let entry = self
            .sessions
            .get(key)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StoreError::NotFound(format!("session {key}")))?;

        let stored = persisted_form(event);
        let scoped = ScopedDelta::split(&stored.actions.state_delta);

        let mut session = entry.lock();
        self.apply_scoped(&key.app_name, &key.user_id, &scoped);
        state::merge_into(&mut session.state, &scoped.session);
        session.events.push(stored);
        session.touch(event.timestamp);
        Ok(())
    }

    async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<Session>, StoreError> {
        let entries: Vec<Arc<Mutex<Session>>> = self
            .sessions
            .iter()
            .filter(|e| e.key().app_name == app_name && e.key().user_id == user_id)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut sessions: Vec<Session> = entries
            .iter()
            .map(|entry| self.view(&entry.lock().without_events()))
            .collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(sessions)
    }

    #[instrument(skip(self), fields(session = %key))]
    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.sessions.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::ids::InvocationId;
    use serde_json::json;

    fn key(id: &str) -> SessionKey {
        SessionKey::new("app", "u1", id)
    }

    fn event(author: &str) -> Event {
        Event::new(InvocationId::new(), author)
    }

    #[tokio::test]
    async fn create_then_get() {
        let svc = InMemorySessionService::new();
        assert!(svc.get_session(&key("s1")).await.unwrap().is_none());
        let created = svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        let fetched = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(created.id, fetched.id);
        assert!(fetched.events.is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let svc = InMemorySessionService::new();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        let err = svc.create_session(&key("s1"), StateMap::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_not_found() {
        let svc = InMemorySessionService::new();
        let err = svc.append_event(&key("missing"), &event("root")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn partial_events_are_not_stored() {
        let svc = InMemorySessionService::new();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        svc.append_event(&key("s1"), &event("root").partial()).await.unwrap();
        svc.append_event(&key("s1"), &event("root").with_text("done")).await.unwrap();
        let s = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.events[0].text(), "done");
    }

    #[tokio::test]
    async fn scoped_state_is_shared_and_temp_is_dropped() {
        let svc = InMemorySessionService::new();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        svc.create_session(&key("s2"), StateMap::new()).await.unwrap();
        svc.create_session(&SessionKey::new("app", "u2", "s3"), StateMap::new())
            .await
            .unwrap();

        let e = event("root").with_state_delta([
            ("app:theme", json!("dark")),
            ("user:name", json!("ada")),
            ("temp:scratch", json!(1)),
            ("counter", json!(1)),
        ]);
        svc.append_event(&key("s1"), &e).await.unwrap();

        let s1 = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(s1.state["counter"], json!(1));
        assert_eq!(s1.state["app:theme"], json!("dark"));
        assert_eq!(s1.state["user:name"], json!("ada"));
        assert!(!s1.state.contains_key("temp:scratch"));
        assert!(!s1.events[0].actions.state_delta.contains_key("temp:scratch"));

        let s2 = svc.get_session(&key("s2")).await.unwrap().unwrap();
        assert_eq!(s2.state["user:name"], json!("ada"));
        assert!(!s2.state.contains_key("counter"));

        let s3 = svc
            .get_session(&SessionKey::new("app", "u2", "s3"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(s3.state["app:theme"], json!("dark"));
        assert!(!s3.state.contains_key("user:name"));
    }

    #[tokio::test]
    async fn list_omits_events_and_filters_by_user() {
        let svc = InMemorySessionService::new();
        svc.create_session(&key("a"), StateMap::new()).await.unwrap();
        svc.create_session(&key("b"), StateMap::new()).await.unwrap();
        svc.create_session(&SessionKey::new("app", "other", "c"), StateMap::new())
            .await
            .unwrap();
        svc.append_event(&key("a"), &event("root")).await.unwrap();

        let listed = svc.list_sessions("app", "u1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(listed.iter().all(|s| s.events.is_empty()));
    }

    #[tokio::test]
    async fn delete_removes_session() {
        let svc = InMemorySessionService::new();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        svc.delete_session(&key("s1")).await.unwrap();
        assert!(svc.get_session(&key("s1")).await.unwrap().is_none());
        assert_eq!(svc.session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_every_event() {
        let svc = Arc::new(InMemorySessionService::new());
        for id in ["s1", "s2"] {
            svc.create_session(&key(id), StateMap::new()).await.unwrap();
        }

        let mut handles = Vec::new();
        for i in 0..40 {
            let svc = Arc::clone(&svc);
            let target = if i % 2 == 0 { "s1" } else { "s2" };
            handles.push(tokio::spawn(async move {
                svc.append_event(&key(target), &event("root")).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        for id in ["s1", "s2"] {
            let s = svc.get_session(&key(id)).await.unwrap().unwrap();
            assert_eq!(s.events.len(), 20);
        }
    }
}
