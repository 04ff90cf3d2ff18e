use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use crate::error::ServiceError;
use crate::session::SessionKey;

/// Bookkeeping sink for artifact versions reported by agents.
///
/// Versions are advisory. The Runner calls this after persisting an event
/// with a non-empty `artifact_delta` and only logs failures.
#[async_trait]
pub trait ArtifactService: Send + Sync {
    async fn record_versions(
        &self,
        key: &SessionKey,
        versions: &HashMap<String, i64>,
    ) -> Result<(), ServiceError>;
}

/// Keeps the highest version seen per (session, filename).
#[derive(Default)]
pub struct InMemoryArtifactService {
    versions: DashMap<SessionKey, BTreeMap<String, i64>>,
}

impl InMemoryArtifactService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_version(&self, key: &SessionKey, filename: &str) -> Option<i64> {
        self.versions
            .get(key)
            .and_then(|files| files.get(filename).copied())
    }

    /// Filenames known for a session, sorted.
    pub fn list(&self, key: &SessionKey) -> Vec<String> {
        self.versions
            .get(key)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ArtifactService for InMemoryArtifactService {
    async fn record_versions(
        &self,
        key: &SessionKey,
        versions: &HashMap<String, i64>,
    ) -> Result<(), ServiceError> {
        if let Some((name, version)) = versions.iter().find(|(_, v)| **v < 0) {
            return Err(ServiceError::Rejected(format!(
                "negative version {version} for {name}"
            )));
        }
        let mut files = self.versions.entry(key.clone()).or_default();
        for (name, version) in versions {
            let slot = files.entry(name.clone()).or_insert(*version);
            if *version > *slot {
                *slot = *version;
            }
        }
        debug!(session = %key, count = versions.len(), "artifact versions recorded");
        Ok(())
    }
}
