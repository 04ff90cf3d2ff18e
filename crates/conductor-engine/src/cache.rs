use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use crate::runner::Runner;

/// Runners keyed by app name, owned by whoever serves several apps.
#[derive(Default)]
pub struct RunnerCache {
    runners: DashMap<String, Arc<Runner>>,
}

impl RunnerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_name: &str) -> Option<Arc<Runner>> {
        self.runners.get(app_name).map(|r| Arc::clone(r.value()))
    }

    /// Cached runner for `app_name`, building it with `build` on a miss.
    pub fn get_or_insert_with<F>(&self, app_name: &str, build: F) -> Arc<Runner>
    where
        F: FnOnce() -> Runner,
    {
        let entry = self
            .runners
            .entry(app_name.to_string())
            .or_insert_with(|| {
                debug!(app = app_name, "runner cached");
                Arc::new(build())
            });
        Arc::clone(entry.value())
    }

    /// Drop the cached runner so the next lookup rebuilds it.
    pub fn invalidate(&self, app_name: &str) -> Option<Arc<Runner>> {
        self.runners.remove(app_name).map(|(_, runner)| runner)
    }

    pub fn clear(&self) {
        self.runners.clear();
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}
