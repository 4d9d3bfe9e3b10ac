use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use unison_core::error::{CoreError, Result};
use unison_core::store::{ChangeFeed, ChangeSubscription, LockSession, LockStore, ScheduleStore};
use unison_core::types::{NewRule, ScheduleRule, TriggerSpec};

/// In-process coordination store.
///
/// Keeps the contracts of the Postgres backend — advisory locks scoped to
/// a session and released when the session ends, a broadcast change feed,
/// rule rows — without any external store. Tests share one instance
/// between several coordinator components to simulate a fleet of
/// processes; [`MemoryCoordination::kill_session_holding`] simulates a
/// process crash by dropping a lock-holding session server-side.
#[derive(Clone)]
pub struct MemoryCoordination {
    state: Arc<SharedState>,
    feed: broadcast::Sender<String>,
}

struct SharedState {
    /// key → owning session id.
    locks: Mutex<HashMap<i64, u64>>,
    /// session id → alive flag, shared with the session handle.
    sessions: Mutex<HashMap<u64, Arc<AtomicBool>>>,
    rules: Mutex<Vec<ScheduleRule>>,
    next_session: AtomicU64,
    next_rule: AtomicI64,
}

impl SharedState {
    /// End a session: flip its alive flag and release every lock it held.
    fn end_session(&self, id: u64) {
        if let Some(alive) = self.sessions.lock().unwrap().remove(&id) {
            alive.store(false, Ordering::SeqCst);
        }
        self.locks.lock().unwrap().retain(|_, owner| *owner != id);
    }
}

impl MemoryCoordination {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            state: Arc::new(SharedState {
                locks: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                rules: Mutex::new(Vec::new()),
                next_session: AtomicU64::new(1),
                next_rule: AtomicI64::new(1),
            }),
            feed,
        }
    }

    /// Whether any live session holds `key`.
    pub fn is_locked(&self, key: i64) -> bool {
        self.state.locks.lock().unwrap().contains_key(&key)
    }

    /// Simulate a process crash: end the session currently holding `key`.
    /// Returns false when nobody holds it.
    pub fn kill_session_holding(&self, key: i64) -> bool {
        let owner = self.state.locks.lock().unwrap().get(&key).copied();
        match owner {
            Some(id) => {
                debug!(session = id, key, "killing lock-holding session");
                self.state.end_session(id);
                true
            }
            None => false,
        }
    }
}

impl Default for MemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryLockSession {
    id: u64,
    alive: Arc<AtomicBool>,
    state: Arc<SharedState>,
}

impl MemoryLockSession {
    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CoreError::SessionClosed)
        }
    }
}

#[async_trait]
impl LockSession for MemoryLockSession {
    async fn try_acquire(&mut self, key: i64) -> Result<bool> {
        self.check_alive()?;
        let mut locks = self.state.locks.lock().unwrap();
        match locks.get(&key) {
            Some(owner) => Ok(*owner == self.id),
            None => {
                locks.insert(key, self.id);
                Ok(true)
            }
        }
    }

    async fn release(&mut self, key: i64) -> Result<()> {
        self.check_alive()?;
        let mut locks = self.state.locks.lock().unwrap();
        if locks.get(&key) == Some(&self.id) {
            locks.remove(&key);
        }
        Ok(())
    }

    async fn probe(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.state.end_session(self.id);
    }
}

impl Drop for MemoryLockSession {
    fn drop(&mut self) {
        // Dropping without close still releases the locks, matching the
        // connection-lifetime semantics of the Postgres backend.
        self.state.end_session(self.id);
    }
}

#[async_trait]
impl LockStore for MemoryCoordination {
    async fn session(&self) -> Result<Box<dyn LockSession>> {
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        self.state
            .sessions
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&alive));
        Ok(Box::new(MemoryLockSession {
            id,
            alive,
            state: Arc::clone(&self.state),
        }))
    }
}

#[async_trait]
impl ScheduleStore for MemoryCoordination {
    async fn fetch_enabled(&self) -> Result<Vec<ScheduleRule>> {
        let rules = self.state.rules.lock().unwrap();
        Ok(rules.iter().filter(|r| r.enabled).cloned().collect())
    }

    async fn fetch_all(&self) -> Result<Vec<ScheduleRule>> {
        Ok(self.state.rules.lock().unwrap().clone())
    }

    async fn insert(&self, rule: NewRule) -> Result<i64> {
        let id = self.state.next_rule.fetch_add(1, Ordering::SeqCst);
        self.state.rules.lock().unwrap().push(ScheduleRule {
            id,
            job_name: rule.job_name,
            trigger: rule.trigger,
            enabled: true,
            params: rule.params,
            scope: rule.scope,
        });
        Ok(id)
    }

    async fn update_trigger(&self, id: i64, trigger: TriggerSpec) -> Result<()> {
        let mut rules = self.state.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.trigger = trigger;
                Ok(())
            }
            None => Err(CoreError::RuleNotFound { id }),
        }
    }

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let mut rules = self.state.rules.lock().unwrap();
        match rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                Ok(())
            }
            None => Err(CoreError::RuleNotFound { id }),
        }
    }

    async fn delete(&self, id: i64) -> Result<()> {
        let mut rules = self.state.rules.lock().unwrap();
        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(CoreError::RuleNotFound { id });
        }
        Ok(())
    }
}

pub struct MemoryChangeSubscription {
    rx: broadcast::Receiver<String>,
}

#[async_trait]
impl ChangeSubscription for MemoryChangeSubscription {
    async fn recv(&mut self) -> Result<String> {
        loop {
            match self.rx.recv().await {
                Ok(payload) => return Ok(payload),
                // Missed notifications are fine — the reload re-reads full
                // state, so the next one catches everything up.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoreError::Store("change feed closed".to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for MemoryCoordination {
    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>> {
        Ok(Box::new(MemoryChangeSubscription {
            rx: self.feed.subscribe(),
        }))
    }

    async fn publish(&self, payload: &str) -> Result<()> {
        // send() errors only when nobody is subscribed, which is not an
        // error for a broadcast.
        let _ = self.feed.send(payload.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_session_cannot_take_a_held_key() {
        let store = MemoryCoordination::new();
        let mut a = store.session().await.unwrap();
        let mut b = store.session().await.unwrap();

        assert!(a.try_acquire(42).await.unwrap());
        assert!(!b.try_acquire(42).await.unwrap());
        // Re-acquiring within the owning session stays true.
        assert!(a.try_acquire(42).await.unwrap());

        a.close().await;
        assert!(b.try_acquire(42).await.unwrap());
    }

    #[tokio::test]
    async fn dropping_a_session_releases_its_locks() {
        let store = MemoryCoordination::new();
        {
            let mut a = store.session().await.unwrap();
            assert!(a.try_acquire(7).await.unwrap());
            assert!(store.is_locked(7));
        }
        assert!(!store.is_locked(7));
    }

    #[tokio::test]
    async fn killed_session_fails_probe_and_frees_the_key() {
        let store = MemoryCoordination::new();
        let mut a = store.session().await.unwrap();
        assert!(a.try_acquire(1).await.unwrap());

        assert!(store.kill_session_holding(1));
        assert!(!a.probe().await);
        assert!(a.try_acquire(1).await.is_err());
        assert!(!store.is_locked(1));
    }

    #[tokio::test]
    async fn rule_edits_round_trip() {
        let store = MemoryCoordination::new();
        let id = store
            .insert(NewRule {
                job_name: "archive_tasks".to_string(),
                trigger: TriggerSpec::Interval { every_secs: 60 },
                params: serde_json::json!({}),
                scope: None,
            })
            .await
            .unwrap();

        assert_eq!(store.fetch_enabled().await.unwrap().len(), 1);

        store.set_enabled(id, false).await.unwrap();
        assert!(store.fetch_enabled().await.unwrap().is_empty());
        assert_eq!(store.fetch_all().await.unwrap().len(), 1);

        store.delete(id).await.unwrap();
        assert!(matches!(
            store.delete(id).await,
            Err(CoreError::RuleNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let store = MemoryCoordination::new();
        let mut sub_a = store.subscribe().await.unwrap();
        let mut sub_b = store.subscribe().await.unwrap();

        store.publish("instance-1").await.unwrap();
        assert_eq!(sub_a.recv().await.unwrap(), "instance-1");
        assert_eq!(sub_b.recv().await.unwrap(), "instance-1");
    }
}
