use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::clock::now_millis;

/// Length of a data session token: 32 lowercase hex characters.
pub const SESSION_TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionType {
    Data,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey {
    entity: u64,
    token: String,
    kind: SessionType,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub idle_timeout: Duration,
    pub recycle_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(24 * 60 * 60),
            recycle_interval: Duration::from_secs(60),
        }
    }
}

struct SessionState {
    last_id: AtomicU64,
    last_access: AtomicU64,
}

/// Shared handle on one `(entity, token)` watermark.
#[derive(Clone)]
pub struct SessionHandle {
    state: Arc<SessionState>,
}

impl SessionHandle {
    pub fn last_id(&self) -> u64 {
        self.state.last_id.load(Ordering::Acquire)
    }

    /// A record id at or below the watermark was already processed. Id 0 is never deduplicated.
    pub fn is_duplicate(&self, id: u64) -> bool {
        id != 0 && id <= self.last_id()
    }

    /// Raises the watermark to `id`. Returns the previous watermark when `id`
    /// is below it; the watermark itself never moves backwards.
    pub fn advance(&self, id: u64) -> Result<(), u64> {
        let previous = self.state.last_id.fetch_max(id, Ordering::AcqRel);
        if id < previous {
            Err(previous)
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<SessionRegistryInner>,
}

struct SessionRegistryInner {
    sessions: DashMap<SessionKey, Arc<SessionState>>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            inner: Arc::new(SessionRegistryInner {
                sessions: DashMap::new(),
                config,
            }),
        }
    }

    pub fn get_or_create(&self, entity: u64, token: &str, kind: SessionType) -> SessionHandle {
        let now = now_millis();
        let key = SessionKey {
            entity,
            token: token.to_string(),
            kind,
        };
        let state = match self.inner.sessions.entry(key) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let state = Arc::new(SessionState {
                    last_id: AtomicU64::new(0),
                    last_access: AtomicU64::new(now),
                });
                entry.insert(Arc::clone(&state));
                state
            }
        };
        state.last_access.store(now, Ordering::Release);
        SessionHandle { state }
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Drops sessions not touched within the idle timeout. Returns how many went.
    pub fn evict_idle(&self, now: u64) -> usize {
        let idle = self.inner.config.idle_timeout.as_millis() as u64;
        let before = self.inner.sessions.len();
        self.inner.sessions.retain(|_, state| {
            now.saturating_sub(state.last_access.load(Ordering::Acquire)) < idle
        });
        before.saturating_sub(self.inner.sessions.len())
    }

    pub fn spawn_recycler(&self) -> JoinHandle<()> {
        let registry = self.clone();
        let interval = self.inner.config.recycle_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let evicted = registry.evict_idle(now_millis());
                if evicted > 0 {
                    debug!(evicted, remaining = registry.len(), "evicted idle data sessions");
                }
            }
        })
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

/// Fresh data session token for this process.
pub fn new_session_token() -> String {
    Uuid::new_v4().simple().to_string()
}
