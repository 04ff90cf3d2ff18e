//! Session state keys and their scopes.
//!
//! A key's prefix decides where a storage service keeps it:
//! `app:` keys are shared by every session of an app, `user:` keys by every
//! session of one user, `temp:` keys live only in the in-flight invocation
//! and are never persisted. Unprefixed keys belong to the session.

use std::collections::HashMap;

pub type StateMap = HashMap<String, serde_json::Value>;

pub const APP_PREFIX: &str = "app:";
pub const USER_PREFIX: &str = "user:";
pub const TEMP_PREFIX: &str = "temp:";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StateScope {
    App,
    User,
    Temp,
    Session,
}

impl StateScope {
    pub fn of(key: &str) -> Self {
        if key.starts_with(APP_PREFIX) {
            Self::App
        } else if key.starts_with(USER_PREFIX) {
            Self::User
        } else if key.starts_with(TEMP_PREFIX) {
            Self::Temp
        } else {
            Self::Session
        }
    }
}

/// A delta split by scope. App and user keys have their prefix stripped;
/// temp keys are dropped.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ScopedDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl ScopedDelta {
    pub fn split(delta: &StateMap) -> Self {
        let mut scoped = Self::default();
        for (key, value) in delta {
            match StateScope::of(key) {
                StateScope::App => {
                    scoped.app.insert(key[APP_PREFIX.len()..].to_string(), value.clone());
                }
                StateScope::User => {
                    scoped.user.insert(key[USER_PREFIX.len()..].to_string(), value.clone());
                }
                StateScope::Temp => {}
                StateScope::Session => {
                    scoped.session.insert(key.clone(), value.clone());
                }
            }
        }
        scoped
    }

    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

/// Shallow merge: keys in `delta` overwrite keys in `target`.
pub fn merge_into(target: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        target.insert(key.clone(), value.clone());
    }
}

/// The view of state a session exposes: session keys plus re-prefixed
/// app and user keys.
pub fn merged_view(app: &StateMap, user: &StateMap, session: &StateMap) -> StateMap {
    let mut view = session.clone();
    for (key, value) in app {
        view.insert(format!("{APP_PREFIX}{key}"), value.clone());
    }
    for (key, value) in user {
        view.insert(format!("{USER_PREFIX}{key}"), value.clone());
    }
    view
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(pairs: &[(&str, serde_json::Value)]) -> StateMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn scope_from_prefix() {
        assert_eq!(StateScope::of("app:theme"), StateScope::App);
        assert_eq!(StateScope::of("user:name"), StateScope::User);
        assert_eq!(StateScope::of("temp:scratch"), StateScope::Temp);
        assert_eq!(StateScope::of("counter"), StateScope::Session);
        assert_eq!(StateScope::of("application"), StateScope::Session);
    }

    #[test]
    fn split_strips_prefixes_and_drops_temp() {
        let delta = map(&[
            ("app:theme", json!("dark")),
            ("user:name", json!("ada")),
            ("temp:scratch", json!(1)),
            ("counter", json!(2)),
        ]);
        let scoped = ScopedDelta::split(&delta);
        assert_eq!(scoped.app, map(&[("theme", json!("dark"))]));
        assert_eq!(scoped.user, map(&[("name", json!("ada"))]));
        assert_eq!(scoped.session, map(&[("counter", json!(2))]));
    }

    #[test]
    fn temp_only_delta_is_empty_after_split() {
        let scoped = ScopedDelta::split(&map(&[("temp:x", json!(true))]));
        assert!(scoped.is_empty());
    }

    #[test]
    fn merge_overwrites_and_keeps_other_keys() {
        let mut state = map(&[("a", json!(1)), ("b", json!(2))]);
        merge_into(&mut state, &map(&[("b", json!(3)), ("c", json!(4))]));
        assert_eq!(state, map(&[("a", json!(1)), ("b", json!(3)), ("c", json!(4))]));
    }

    #[test]
    fn empty_delta_leaves_state_unchanged() {
        let mut state = map(&[("a", json!(1))]);
        let before = state.clone();
        merge_into(&mut state, &StateMap::new());
        assert_eq!(state, before);
    }

    #[test]
    fn merged_view_reprefixes() {
        let view = merged_view(
            &map(&[("theme", json!("dark"))]),
            &map(&[("name", json!("ada"))]),
            &map(&[("counter", json!(1))]),
        );
        assert_eq!(view["app:theme"], json!("dark"));
        assert_eq!(view["user:name"], json!("ada"));
        assert_eq!(view["counter"], json!(1));
        assert_eq!(view.len(), 3);
    }
}
