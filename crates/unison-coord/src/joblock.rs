use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use unison_core::store::{LockSession, LockStore};

/// Advisory key for a job's per-fire lock. Stable: the same job id maps
/// to the same key in every process and across restarts, and distinct
/// ids map to distinct keys.
pub fn job_lock_key(job_id: &str) -> i64 {
    i64::from(crc32fast::hash(job_id.as_bytes()))
}

/// Per-job advisory locks, one dedicated store session per held lock.
///
/// A lock is held for the duration of one fire: `try_lock` before the job
/// body, `unlock` after it returns — success or failure. The held-lock
/// map has its own mutex, independent of the leadership mutex, and the
/// store round-trip happens outside it so a slow lock attempt never
/// stalls leader checks or other jobs.
pub struct JobLockManager {
    store: Arc<dyn LockStore>,
    held: Mutex<HashMap<String, Box<dyn LockSession>>>,
}

impl JobLockManager {
    pub fn new(store: Arc<dyn LockStore>) -> Self {
        Self {
            store,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Attempt the advisory lock for `job_id`. Non-blocking: returns
    /// false when any other runner — another process, or an in-flight
    /// fire in this one — holds it.
    pub async fn try_lock(&self, job_id: &str) -> bool {
        if self.held.lock().await.contains_key(job_id) {
            // A previous fire of this job is still running here.
            return false;
        }

        let mut session = match self.store.session().await {
            Ok(s) => s,
            Err(e) => {
                warn!(job_id, error = %e, "could not open job lock session");
                return false;
            }
        };

        match session.try_acquire(job_lock_key(job_id)).await {
            Ok(true) => {}
            Ok(false) => {
                session.close().await;
                return false;
            }
            Err(e) => {
                warn!(job_id, error = %e, "job lock attempt failed");
                session.close().await;
                return false;
            }
        }

        let mut held = self.held.lock().await;
        if held.contains_key(job_id) {
            // Lost a local race while we were at the store. The store
            // would have refused the second acquire, so this is only
            // reachable with a re-entrant backend; back off anyway.
            drop(held);
            session.close().await;
            return false;
        }
        held.insert(job_id.to_string(), session);
        true
    }

    /// Release the lock for `job_id` and close its session. No-op when
    /// the lock is not held.
    pub async fn unlock(&self, job_id: &str) {
        let session = self.held.lock().await.remove(job_id);
        if let Some(mut session) = session {
            if let Err(e) = session.release(job_lock_key(job_id)).await {
                debug!(job_id, error = %e, "explicit unlock failed; closing session releases it");
            }
            session.close().await;
        }
    }

    /// Drop locks for jobs that are no longer scheduled. Called from
    /// reload so entries for removed rules are never orphaned.
    pub async fn release_unused(&self, active: &HashSet<String>) {
        let removed: Vec<(String, Box<dyn LockSession>)> = {
            let mut held = self.held.lock().await;
            let stale: Vec<String> = held
                .keys()
                .filter(|id| !active.contains(*id))
                .cloned()
                .collect();
            stale
                .into_iter()
                .filter_map(|id| held.remove(&id).map(|s| (id, s)))
                .collect()
        };
        for (job_id, mut session) in removed {
            debug!(job_id = %job_id, "releasing lock for unscheduled job");
            session.close().await;
        }
    }

    /// Release every held lock (shutdown path).
    pub async fn release_all(&self) {
        self.release_unused(&HashSet::new()).await;
    }

    /// Job ids currently holding a lock in this process.
    pub async fn held_ids(&self) -> HashSet<String> {
        self.held.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unison_store::MemoryCoordination;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(job_lock_key("rule_1"), job_lock_key("rule_1"));
        assert_ne!(job_lock_key("rule_1"), job_lock_key("rule_2"));
    }

    #[tokio::test]
    async fn two_processes_contend_one_wins() {
        let store = Arc::new(MemoryCoordination::new());
        let a = JobLockManager::new(store.clone());
        let b = JobLockManager::new(store.clone());

        assert!(a.try_lock("rule_1").await);
        assert!(!b.try_lock("rule_1").await);

        a.unlock("rule_1").await;
        assert!(b.try_lock("rule_1").await);
        b.unlock("rule_1").await;
    }

    #[tokio::test]
    async fn in_flight_fire_blocks_a_second_local_fire() {
        let store = Arc::new(MemoryCoordination::new());
        let locks = JobLockManager::new(store);

        assert!(locks.try_lock("rule_1").await);
        assert!(!locks.try_lock("rule_1").await);
        locks.unlock("rule_1").await;
        assert!(locks.try_lock("rule_1").await);
    }

    #[tokio::test]
    async fn release_unused_only_drops_unscheduled_jobs() {
        let store = Arc::new(MemoryCoordination::new());
        let locks = JobLockManager::new(store.clone());

        assert!(locks.try_lock("rule_1").await);
        assert!(locks.try_lock("rule_2").await);

        let active: HashSet<String> = ["rule_1".to_string()].into_iter().collect();
        locks.release_unused(&active).await;

        assert_eq!(locks.held_ids().await, active);
        assert!(!store.is_locked(job_lock_key("rule_2")));
        assert!(store.is_locked(job_lock_key("rule_1")));
    }

    #[tokio::test]
    async fn unlock_is_a_noop_for_unheld_jobs() {
        let store = Arc::new(MemoryCoordination::new());
        let locks = JobLockManager::new(store);
        locks.unlock("rule_9").await;
        assert!(locks.held_ids().await.is_empty());
    }
}
