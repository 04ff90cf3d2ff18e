use async_trait::async_trait;

use conductor_core::event::Event;
use conductor_core::state::StateMap;

use crate::error::StoreError;
use crate::session::{Session, SessionKey};

/// Storage collaborator for sessions.
///
/// `append_event` is atomic per session and must not serialize appends to
/// different sessions. Partial events are accepted and ignored.
#[async_trait]
pub trait SessionService: Send + Sync {
    async fn get_session(&self, key: &SessionKey) -> Result<Option<Session>, StoreError>;

    /// Fails with `Conflict` if the session already exists.
    async fn create_session(
        &self,
        key: &SessionKey,
        initial_state: StateMap,
    ) -> Result<Session, StoreError>;

    /// Fails with `NotFound` for an unknown session.
    async fn append_event(&self, key: &SessionKey, event: &Event) -> Result<(), StoreError>;

    /// Sessions of one user, without their event logs.
    async fn list_sessions(&self, app_name: &str, user_id: &str)
        -> Result<Vec<Session>, StoreError>;

    async fn delete_session(&self, key: &SessionKey) -> Result<(), StoreError>;
}
