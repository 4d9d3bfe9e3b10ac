use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use unison_core::config::LEADER_LOCK_NAME;
use unison_core::store::{LockSession, LockStore};

/// Advisory key for the global leader lock, stable across the fleet.
pub fn leader_lock_key() -> i64 {
    i64::from(crc32fast::hash(LEADER_LOCK_NAME.as_bytes()))
}

struct LeaderState {
    is_leader: bool,
    session: Option<Box<dyn LockSession>>,
}

/// Holds (or contends for) the single fleet-wide leader lock on a
/// dedicated store session.
///
/// There is no explicit step-down: losing the session *is* stepping down.
/// The loss is detected lazily — the already-leader fast path probes the
/// session, and a dead probe tears the state down and re-runs the
/// election on the spot.
pub struct LeaderElector {
    store: Arc<dyn LockStore>,
    // One mutex for all leadership state, so election checks never see a
    // half-updated leader flag. Job locking has its own mutex and never
    // serializes against this one.
    state: Mutex<LeaderState>,
    key: i64,
}

impl LeaderElector {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            state: Mutex::new(LeaderState {
                is_leader: false,
                session: None,
            }),
            key: leader_lock_key(),
        }
    }

    /// Return true if this process is (still, or now) the leader.
    /// Non-blocking with respect to the lock: a held lock elsewhere means
    /// an immediate `false`, never a wait.
    pub async fn ensure_leader(&self) -> bool {
        let mut state = self.state.lock().await;

        if state.is_leader {
            if let Some(session) = state.session.as_mut() {
                if session.probe().await {
                    return true;
                }
                warn!("leader session lost; re-electing");
                session.close().await;
            }
            state.session = None;
            state.is_leader = false;
        }

        let mut session = match self.store.session().await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "could not open election session");
                return false;
            }
        };

        match session.try_acquire(self.key).await {
            Ok(true) => {
                state.session = Some(session);
                state.is_leader = true;
                info!("acquired scheduler leadership");
                true
            }
            Ok(false) => {
                session.close().await;
                false
            }
            Err(e) => {
                warn!(error = %e, "leader lock attempt failed");
                session.close().await;
                false
            }
        }
    }

    /// Current leadership flag without a store round-trip overhead beyond
    /// taking the state mutex. For diagnostics.
    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.is_leader
    }

    /// Close the leader session (shutdown path).
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut session) = state.session.take() {
            session.close().await;
            info!("released scheduler leadership");
        }
        state.is_leader = false;
    }
}
