//! Long-term memory sink.
//!
//! The Runner hands over the session after final responses and function
//! calls; `search` is a case-insensitive keyword match over stored text.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use conductor_core::ids::{EventId, SessionId};

use crate::error::ServiceError;
use crate::session::Session;

/// One remembered piece of session text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub session_id: SessionId,
    pub event_id: EventId,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryService: Send + Sync {
    async fn add_session(&self, session: &Session) -> Result<(), ServiceError>;

    async fn search(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, ServiceError>;
}

type UserKey = (String, String);

#[derive(Default)]
struct UserMemory {
    entries: Vec<MemoryEntry>,
    seen: HashSet<EventId>,
}

#[derive(Default)]
pub struct InMemoryMemoryService {
    users: DashMap<UserKey, UserMemory>,
}

impl InMemoryMemoryService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self, app_name: &str, user_id: &str) -> usize {
        self.users
            .get(&(app_name.to_string(), user_id.to_string()))
            .map_or(0, |m| m.entries.len())
    }
}

#[async_trait]
impl MemoryService for InMemoryMemoryService {
    /// Re-adding a session only stores events not seen before.
    async fn add_session(&self, session: &Session) -> Result<(), ServiceError> {
        let mut memory = self
            .users
            .entry((session.app_name.clone(), session.user_id.clone()))
            .or_default();
        for event in &session.events {
            let text = event.text();
            if text.trim().is_empty() || !memory.seen.insert(event.id.clone()) {
                continue;
            }
            memory.entries.push(MemoryEntry {
                session_id: session.id.clone(),
                event_id: event.id.clone(),
                author: event.author.clone(),
                text,
                timestamp: event.timestamp,
            });
        }
        Ok(())
    }

    async fn search(
        &self,
        app_name: &str,
        user_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryEntry>, ServiceError> {
        let words: Vec<String> = query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect();
        if words.is_empty() {
            return Ok(Vec::new());
        }
        let Some(memory) = self
            .users
            .get(&(app_name.to_string(), user_id.to_string()))
        else {
            return Ok(Vec::new());
        };
        Ok(memory
            .entries
            .iter()
            .filter(|m| {
                let haystack = m.text.to_lowercase();
                words.iter().any(|w| haystack.contains(w.as_str()))
            })
            .cloned()
            .collect())
    }
}
