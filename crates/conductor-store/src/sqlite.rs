//! SQLite-backed `SessionService`.
//!
//! Each append runs in one transaction: read the next sequence number,
//! insert the event, merge the session/app/user state rows. rusqlite is
//! synchronous, so the whole transaction happens without an await point.
//!
//! All sessions share the one mutex-guarded connection of the `Database`,
//! so appends to different sessions are serialized too. Use
//! `InMemorySessionService` where cross-session parallelism matters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use conductor_core::event::Event;
use conductor_core::state::{self, ScopedDelta, StateMap};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;
use crate::service::SessionService;
use crate::session::{persisted_form, Session, SessionKey};

pub struct SqliteSessionService {
    db: Database,
}

impl SqliteSessionService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn session_row(
    conn: &Connection,
    key: &SessionKey,
) -> Result<Option<(StateMap, DateTime<Utc>)>, StoreError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT state, updated_at FROM sessions
             WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
            params![key.app_name, key.user_id, key.session_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((state, updated_at)) => Ok(Some((
            row_helpers::parse_json(&state, "sessions", "state")?,
            row_helpers::parse_time(&updated_at, "sessions", "updated_at")?,
        ))),
        None => Ok(None),
    }
}

fn load_app_state(conn: &Connection, app_name: &str) -> Result<StateMap, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM app_states WHERE app_name = ?1",
            [app_name],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => row_helpers::parse_json(&raw, "app_states", "state"),
        None => Ok(StateMap::new()),
    }
}

fn load_user_state(conn: &Connection, app_name: &str, user_id: &str) -> Result<StateMap, StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT state FROM user_states WHERE app_name = ?1 AND user_id = ?2",
            [app_name, user_id],
            |row| row.get(0),
        )
        .optional()?;
    match raw {
        Some(raw) => row_helpers::parse_json(&raw, "user_states", "state"),
        None => Ok(StateMap::new()),
    }
}

fn merge_scoped(
    conn: &Connection,
    app_name: &str,
    user_id: &str,
    scoped: &ScopedDelta,
    now: &str,
) -> Result<(), StoreError> {
    if !scoped.app.is_empty() {
        let mut app = load_app_state(conn, app_name)?;
        state::merge_into(&mut app, &scoped.app);
        conn.execute(
            "INSERT INTO app_states (app_name, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(app_name) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![app_name, serde_json::to_string(&app)?, now],
        )?;
    }
    if !scoped.user.is_empty() {
        let mut user = load_user_state(conn, app_name, user_id)?;
        state::merge_into(&mut user, &scoped.user);
        conn.execute(
            "INSERT INTO user_states (app_name, user_id, state, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(app_name, user_id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![app_name, user_id, serde_json::to_string(&user)?, now],
        )?;
    }
    Ok(())
}

fn load_events(conn: &Connection, key: &SessionKey) -> Result<Vec<Event>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT payload FROM events
         WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3
         ORDER BY sequence ASC",
    )?;
    let mut rows = stmt.query(params![key.app_name, key.user_id, key.session_id.as_str()])?;
    let mut events = Vec::new();
    while let Some(row) = rows.next()? {
        let payload: String = row_helpers::get(row, 0, "events", "payload")?;
        events.push(row_helpers::parse_json(&payload, "events", "payload")?);
    }
    Ok(events)
}

fn assemble(
    conn: &Connection,
    key: &SessionKey,
    session_state: &StateMap,
    updated_at: DateTime<Utc>,
    events: Vec<Event>,
) -> Result<Session, StoreError> {
    let app = load_app_state(conn, &key.app_name)?;
    let user = load_user_state(conn, &key.app_name, &key.user_id)?;
    let mut session = Session::new(key.clone(), state::merged_view(&app, &user, session_state));
    session.events = events;
    session.last_update_time = updated_at;
    Ok(session)
}

#[async_trait]
impl SessionService for SqliteSessionService {
    #[instrument(skip(self), fields(session = %key))]
    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let Some((session_state, updated_at)) = session_row(conn, key)? else {
                return Ok(None);
            };
            let events = load_events(conn, key)?;
            assemble(conn, key, &session_state, updated_at, events).map(Some)
        })
    }

    #[instrument(skip(self, initial_state), fields(session = %key))]
    async fn create_session(
        &self,
        key: &SessionKey,
        initial_state: StateMap,
    ) -> Result<Session, StoreError> {
        let scoped = ScopedDelta::split(&initial_state);
        let now = Utc::now();
        let now_str = now.to_rfc3339();

        let session = self.db.with_tx(|tx| {
            if session_row(tx, key)?.is_some() {
                return Err(StoreError::Conflict(format!("session {key} already exists")));
            }
            tx.execute(
                "INSERT INTO sessions (app_name, user_id, id, state, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![
                    key.app_name,
                    key.user_id,
                    key.session_id.as_str(),
                    serde_json::to_string(&scoped.session)?,
                    now_str,
                ],
            )?;
            merge_scoped(tx, &key.app_name, &key.user_id, &scoped, &now_str)?;
            assemble(tx, key, &scoped.session, now, Vec::new())
        })?;

        debug!("session created");
        Ok(session)
    }

    #[instrument(skip(self, event), fields(session = %key, event_id = %event.id))]
    async fn append_event(&self, key: &SessionKey, event: &Event) -> Result<(), StoreError> {
        if event.is_partial() {
            return Ok(());
        }
        let stored = persisted_form(event);
        let scoped = ScopedDelta::split(&stored.actions.state_delta);
        let payload = serde_json::to_string(&stored)?;

        self.db.with_tx(|tx| {
            let (mut session_state, previous) = session_row(tx, key)?
                .ok_or_else(|| StoreError::NotFound(format!("session {key}")))?;

            let sequence: i64 = tx.query_row(
                "SELECT COALESCE(MAX(sequence), -1) + 1 FROM events
                 WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id.as_str()],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO events (id, app_name, user_id, session_id, sequence, invocation_id, author, timestamp, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stored.id.as_str(),
                    key.app_name,
                    key.user_id,
                    key.session_id.as_str(),
                    sequence,
                    stored.invocation_id.as_str(),
                    stored.author,
                    stored.timestamp.to_rfc3339(),
                    payload,
                ],
            )?;

            let updated_at = Utc::now().max(event.timestamp).max(previous).to_rfc3339();
            state::merge_into(&mut session_state, &scoped.session);
            tx.execute(
                "UPDATE sessions SET state = ?1, updated_at = ?2
                 WHERE app_name = ?3 AND user_id = ?4 AND id = ?5",
                params![
                    serde_json::to_string(&session_state)?,
                    updated_at,
                    key.app_name,
                    key.user_id,
                    key.session_id.as_str(),
                ],
            )?;
            merge_scoped(tx, &key.app_name, &key.user_id, &scoped, &updated_at)
        })
    }

    async fn list_sessions(
        &self,
        app_name: &str,
        user_id: &str,
    ) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, state, updated_at FROM sessions
                 WHERE app_name = ?1 AND user_id = ?2 ORDER BY id ASC",
            )?;
            let mut rows = stmt.query([app_name, user_id])?;
            let mut listed = Vec::new();
            while let Some(row) = rows.next()? {
                let id: String = row_helpers::get(row, 0, "sessions", "id")?;
                let raw_state: String = row_helpers::get(row, 1, "sessions", "state")?;
                let raw_updated: String = row_helpers::get(row, 2, "sessions", "updated_at")?;
                listed.push((
                    SessionKey::new(app_name, user_id, id),
                    row_helpers::parse_json::<StateMap>(&raw_state, "sessions", "state")?,
                    row_helpers::parse_time(&raw_updated, "sessions", "updated_at")?,
                ));
            }
            listed
                .into_iter()
                .map(|(key, session_state, updated_at)| {
                    assemble(conn, &key, &session_state, updated_at, Vec::new())
                })
                .collect()
        })
    }

    #[instrument(skip(self), fields(session = %key))]
    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError> {
        self.db.with_tx(|tx| {
            tx.execute(
                "DELETE FROM events WHERE app_name = ?1 AND user_id = ?2 AND session_id = ?3",
                params![key.app_name, key.user_id, key.session_id.as_str()],
            )?;
            tx.execute(
                "DELETE FROM sessions WHERE app_name = ?1 AND user_id = ?2 AND id = ?3",
                params![key.app_name, key.user_id, key.session_id.as_str()],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::content::Content;
    use conductor_core::ids::InvocationId;
    use serde_json::json;

    fn service() -> SqliteSessionService {
        SqliteSessionService::new(Database::in_memory().unwrap())
    }

    fn key(id: &str) -> SessionKey {
        SessionKey::new("app", "u1", id)
    }

    fn event(author: &str) -> Event {
        Event::new(InvocationId::new(), author)
    }

    #[tokio::test]
    async fn missing_session_is_none() {
        assert!(service().get_session(&key("nope")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn create_with_initial_state() {
        let svc = service();
        let initial: StateMap = [("topic".to_string(), json!("rust"))].into_iter().collect();
        let created = svc.create_session(&key("s1"), initial).await.unwrap();
        assert_eq!(created.state["topic"], json!("rust"));

        let fetched = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(fetched.state["topic"], json!("rust"));
        assert!(fetched.events.is_empty());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let svc = service();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        let err = svc.create_session(&key("s1"), StateMap::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn append_preserves_order_and_skips_partials() {
        let svc = service();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();

        let user = Event::user_message(InvocationId::new(), Content::user_text("hi"));
        svc.append_event(&key("s1"), &user).await.unwrap();
        svc.append_event(&key("s1"), &event("root").partial().with_text("he"))
            .await
            .unwrap();
        svc.append_event(&key("s1"), &event("root").with_text("hello"))
            .await
            .unwrap();

        let s = svc.get_session(&key("s1")).await.unwrap().unwrap();
        let texts: Vec<String> = s.events.iter().map(Event::text).collect();
        assert_eq!(texts, vec!["hi", "hello"]);
        assert_eq!(s.events[0], user);
    }

    #[tokio::test]
    async fn append_to_unknown_session_is_not_found() {
        let err = service()
            .append_event(&key("ghost"), &event("root"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn state_delta_merges_across_scopes() {
        let svc = service();
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        svc.create_session(&key("s2"), StateMap::new()).await.unwrap();

        svc.append_event(
            &key("s1"),
            &event("root").with_state_delta([
                ("counter", json!(1)),
                ("app:mode", json!("beta")),
                ("user:lang", json!("en")),
                ("temp:draft", json!("x")),
            ]),
        )
        .await
        .unwrap();
        svc.append_event(&key("s1"), &event("root").with_state_delta([("counter", json!(2))]))
            .await
            .unwrap();

        let s1 = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(s1.state["counter"], json!(2));
        assert_eq!(s1.state["app:mode"], json!("beta"));
        assert_eq!(s1.state["user:lang"], json!("en"));
        assert!(!s1.state.contains_key("temp:draft"));

        let s2 = svc.get_session(&key("s2")).await.unwrap().unwrap();
        assert_eq!(s2.state["app:mode"], json!("beta"));
        assert!(!s2.state.contains_key("counter"));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let svc = service();
        svc.create_session(&key("b"), StateMap::new()).await.unwrap();
        svc.create_session(&key("a"), StateMap::new()).await.unwrap();
        svc.append_event(&key("a"), &event("root")).await.unwrap();

        let listed = svc.list_sessions("app", "u1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(listed.iter().all(|s| s.events.is_empty()));

        svc.delete_session(&key("a")).await.unwrap();
        assert!(svc.get_session(&key("a")).await.unwrap().is_none());
        assert_eq!(svc.list_sessions("app", "u1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = std::env::temp_dir().join(format!("conductor-sqlite-{}", uuid::Uuid::now_v7()));
        let path = dir.join("sessions.db");

        {
            let svc = SqliteSessionService::new(Database::open(&path).unwrap());
            svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
            svc.append_event(&key("s1"), &event("root").with_text("persisted"))
                .await
                .unwrap();
        }

        let svc = SqliteSessionService::new(Database::open(&path).unwrap());
        let s = svc.get_session(&key("s1")).await.unwrap().unwrap();
        assert_eq!(s.events.len(), 1);
        assert_eq!(s.events[0].text(), "persisted");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_across_sessions() {
        let svc = std::sync::Arc::new(service());
        svc.create_session(&key("s1"), StateMap::new()).await.unwrap();
        svc.create_session(&key("s2"), StateMap::new()).await.unwrap();

        let mut tasks = Vec::new();
        for id in ["s1", "s2"] {
            let svc = svc.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..25 {
                    svc.append_event(&key(id), &event("root").with_text(format!("{id}-{i}")))
                        .await
                        .unwrap();
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for id in ["s1", "s2"] {
            let s = svc.get_session(&key(id)).await.unwrap().unwrap();
            let texts: Vec<String> = s.events.iter().map(Event::text).collect();
            let expected: Vec<String> = (0..25).map(|i| format!("{id}-{i}")).collect();
            assert_eq!(texts, expected);
        }
    }
}
