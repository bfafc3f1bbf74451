//! Session registry for attributing updates to editing sessions.
//!
//! In-memory only. The registry knows its own session id, labels it
//! `"local"`, and gives every other session a numbered `"Remote N"` alias
//! that stays stable for the life of the registry. Remote sessions are pruned
//! once idle longer than the TTL; the check runs on every upsert.

use crate::config::SessionConfig;
use crate::events::{ActivitySource, EventBus, SessionActivity, Subscription};
use crate::operation::now_millis;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

const MAX_ID_LEN: usize = 128;
const LOCAL_LABEL: &str = "local";

/// Tracked state for one editing session.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    /// `"local"` or `"Remote N"`
    pub label: String,
    pub client_id: Option<String>,
    pub is_local: bool,
    /// Last activity (ms since epoch)
    pub last_seen: u64,
    /// Source of the most recent activity
    pub last_source: ActivitySource,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, SessionInfo>,
    /// Alias numbers handed out so far; kept after pruning so they are never reused.
    aliases: HashMap<String, u32>,
    next_alias: u32,
}

impl State {
    fn alias_for(&mut self, session_id: &str) -> u32 {
        if let Some(alias) = self.aliases.get(session_id) {
            return *alias;
        }
        self.next_alias += 1;
        self.aliases.insert(session_id.to_string(), self.next_alias);
        self.next_alias
    }

    fn prune(&mut self, now_ms: u64, ttl_ms: u64) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.is_local || now_ms.saturating_sub(s.last_seen) <= ttl_ms);
        before - self.sessions.len()
    }
}

/// Registry of local and remote editing sessions.
///
/// Thread-safe; wrap in `Arc` to attach it to an activity bus.
pub struct SessionRegistry {
    local_session_id: String,
    ttl_ms: u64,
    state: RwLock<State>,
}

impl SessionRegistry {
    pub fn new(local_session_id: impl Into<String>, config: &SessionConfig) -> Self {
        Self {
            local_session_id: local_session_id.into(),
            ttl_ms: config.ttl.as_millis() as u64,
            state: RwLock::new(State::default()),
        }
    }

    pub fn local_session_id(&self) -> &str {
        &self.local_session_id
    }

    /// Record activity for a session.
    ///
    /// Malformed session ids are ignored and return `None`; a malformed
    /// client id is recorded as absent.
    pub fn upsert(
        &self,
        session_id: &str,
        client_id: Option<&str>,
        source: ActivitySource,
        now_ms: u64,
    ) -> Option<SessionInfo> {
        let session_id = sanitize_id(session_id)?;
        let client_id = client_id.and_then(sanitize_id);

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let pruned = state.prune(now_ms, self.ttl_ms);
        if pruned > 0 {
            debug!("Pruned {} idle remote sessions", pruned);
        }

        if let Some(existing) = state.sessions.get_mut(&session_id) {
            existing.last_seen = existing.last_seen.max(now_ms);
            existing.last_source = source;
            if client_id.is_some() {
                existing.client_id = client_id;
            }
            return Some(existing.clone());
        }

        let is_local = session_id == self.local_session_id;
        let label = if is_local {
            LOCAL_LABEL.to_string()
        } else {
            format!("Remote {}", state.alias_for(&session_id))
        };
        debug!("New session {} ({})", session_id, label);

        let info = SessionInfo {
            session_id: session_id.clone(),
            label,
            client_id,
            is_local,
            last_seen: now_ms,
            last_source: source,
        };
        state.sessions.insert(session_id, info.clone());
        Some(info)
    }

    pub fn remove(&self, session_id: &str) -> Option<SessionInfo> {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .remove(session_id.trim())
    }

    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .sessions
            .get(session_id.trim())
            .cloned()
    }

    /// Drop remote sessions idle longer than the TTL. Returns how many were removed.
    pub fn prune(&self, now_ms: u64) -> usize {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .prune(now_ms, self.ttl_ms)
    }

    /// Local session first, then remote sessions by alias.
    pub fn list(&self) -> Vec<SessionInfo> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<_> = state.sessions.values().cloned().collect();
        sessions.sort_by_key(|s| {
            let alias = state.aliases.get(&s.session_id).copied().unwrap_or(0);
            (!s.is_local, alias)
        });
        sessions
    }

    pub fn len(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feed every activity signal on `bus` into this registry, stamped with
    /// the current wall clock. Drop the returned subscription to detach.
    pub fn attach(self: &Arc<Self>, bus: &Arc<EventBus<SessionActivity>>) -> Subscription<SessionActivity> {
        let registry = Arc::downgrade(self);
        bus.subscribe(move |activity: SessionActivity| {
            if let Some(registry) = registry.upgrade() {
                registry.upsert(
                    &activity.session_id,
                    activity.client_id.as_deref(),
                    activity.source,
                    now_millis(),
                );
            }
        })
    }
}

/// Trimmed id of 1-128 characters from `[A-Za-z0-9._:-]`, or `None`.
fn sanitize_id(raw: &str) -> Option<String> {
    let id = raw.trim();
    let valid = !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'));
    valid.then(|| id.to_string())
}
