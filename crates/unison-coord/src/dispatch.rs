use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use unison_core::types::{JobOutcome, OutcomeKind};

use crate::election::LeaderElector;
use crate::joblock::JobLockManager;
use crate::registry::JobRegistry;

/// Wraps every job invocation behind the two distributed gates.
///
/// The order matters: leadership is the coarse fleet-wide gate, so a
/// non-leader never even attempts job locks (no contention, no log
/// noise); the per-job lock then covers the window where a restart can
/// briefly leave two processes both believing they lead.
pub struct Dispatcher {
    elector: Arc<LeaderElector>,
    locks: Arc<JobLockManager>,
    registry: Arc<JobRegistry>,
    /// Optional outcome sink. `try_send` keeps dispatch non-blocking; a
    /// full sink drops the record with a warning.
    outcome_tx: Option<mpsc::Sender<JobOutcome>>,
}

impl Dispatcher {
    pub fn new(
        elector: Arc<LeaderElector>,
        locks: Arc<JobLockManager>,
        registry: Arc<JobRegistry>,
        outcome_tx: Option<mpsc::Sender<JobOutcome>>,
    ) -> Self {
        Self {
            elector,
            locks,
            registry,
            outcome_tx,
        }
    }

    /// Run one fire of `job_id`. Never returns an error and never
    /// panics across this boundary — a failing job body must not take
    /// down the trigger engine or other jobs.
    pub async fn dispatch(
        &self,
        job_id: &str,
        job_name: &str,
        params: &serde_json::Value,
    ) -> JobOutcome {
        if !self.elector.ensure_leader().await {
            return self.emit(JobOutcome::new(job_id, OutcomeKind::SkippedNotLeader));
        }

        if !self.locks.try_lock(job_id).await {
            return self.emit(JobOutcome::new(job_id, OutcomeKind::SkippedLocked));
        }

        // Lock held from here — every path below must go through the
        // single unlock before returning.
        let outcome = match self.registry.get(job_name) {
            Some(handler) => {
                let params = params.clone();
                // Spawned so a panicking body surfaces as a JoinError
                // instead of unwinding into the engine.
                let result =
                    tokio::spawn(async move { handler.run(&params).await }).await;
                match result {
                    Ok(Ok(())) => JobOutcome::new(job_id, OutcomeKind::Ran),
                    Ok(Err(e)) => JobOutcome::failed(job_id, e.to_string()),
                    Err(join_err) => {
                        JobOutcome::failed(job_id, format!("job body panicked: {join_err}"))
                    }
                }
            }
            None => JobOutcome::failed(job_id, format!("no handler registered for '{job_name}'")),
        };

        self.locks.unlock(job_id).await;
        self.emit(outcome)
    }

    /// Log the outcome and forward it to the sink, then hand it back.
    fn emit(&self, outcome: JobOutcome) -> JobOutcome {
        match outcome.kind {
            OutcomeKind::Ran => info!(job_id = %outcome.job_id, "job executed"),
            OutcomeKind::SkippedNotLeader => {
                debug!(job_id = %outcome.job_id, "skipping job; this process is not the leader");
            }
            OutcomeKind::SkippedLocked => {
                debug!(job_id = %outcome.job_id, "skipping job; lock held by another runner");
            }
            OutcomeKind::Failed => {
                error!(
                    job_id = %outcome.job_id,
                    detail = outcome.detail.as_deref().unwrap_or("-"),
                    "job failed"
                );
            }
        }
        if let Some(tx) = &self.outcome_tx {
            if tx.try_send(outcome.clone()).is_err() {
                warn!(job_id = %outcome.job_id, "outcome sink full or closed; record dropped");
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use unison_store::MemoryCoordination;

    use crate::error::JobError;
    use crate::registry::JobHandler;

    struct Counting {
        runs: Arc<AtomicU32>,
    }

    #[async_trait]
    impl JobHandler for Counting {
        async fn run(&self, _params: &serde_json::Value) -> Result<(), JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl JobHandler for AlwaysFails {
        async fn run(&self, _params: &serde_json::Value) -> Result<(), JobError> {
            Err(JobError::new("intentional failure"))
        }
    }

    struct Panics;

    #[async_trait]
    impl JobHandler for Panics {
        async fn run(&self, _params: &serde_json::Value) -> Result<(), JobError> {
            panic!("boom");
        }
    }

    fn process(
        store: &Arc<MemoryCoordination>,
        registry: Arc<JobRegistry>,
    ) -> (Dispatcher, Arc<JobLockManager>) {
        let elector = Arc::new(LeaderElector::new(store.clone()));
        let locks = Arc::new(JobLockManager::new(store.clone()));
        (
            Dispatcher::new(elector, locks.clone(), registry, None),
            locks,
        )
    }

    fn registry_with(name: &str, handler: Arc<dyn JobHandler>) -> Arc<JobRegistry> {
        let mut registry = JobRegistry::new();
        registry.register(name, handler);
        Arc::new(registry)
    }

    #[tokio::test]
    async fn racing_processes_run_a_fire_exactly_once() {
        let store = Arc::new(MemoryCoordination::new());
        let runs = Arc::new(AtomicU32::new(0));
        let registry = registry_with("archive_tasks", Arc::new(Counting { runs: runs.clone() }));

        let (proc_a, _) = process(&store, registry.clone());
        let (proc_b, _) = process(&store, registry);

        let params = serde_json::json!({});
        let (out_a, out_b) = tokio::join!(
            proc_a.dispatch("rule_1", "archive_tasks", &params),
            proc_b.dispatch("rule_1", "archive_tasks", &params)
        );

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        let kinds = [out_a.kind, out_b.kind];
        assert!(kinds.contains(&OutcomeKind::Ran));
        assert!(
            kinds.contains(&OutcomeKind::SkippedNotLeader)
                || kinds.contains(&OutcomeKind::SkippedLocked)
        );
    }

    #[tokio::test]
    async fn non_leader_skips_without_touching_job_locks() {
        let store = Arc::new(MemoryCoordination::new());
        let registry = registry_with("job", Arc::new(AlwaysFails));
        let (leader, _) = process(&store, registry.clone());
        let (follower, follower_locks) = process(&store, registry);

        // Leader wins the election first.
        let params = serde_json::json!({});
        leader.dispatch("rule_1", "job", &params).await;

        let outcome = follower.dispatch("rule_1", "job", &params).await;
        assert_eq!(outcome.kind, OutcomeKind::SkippedNotLeader);
        assert!(follower_locks.held_ids().await.is_empty());
    }

    #[tokio::test]
    async fn failing_body_yields_one_failed_outcome_and_releases_the_lock() {
        let store = Arc::new(MemoryCoordination::new());
        let registry = registry_with("job", Arc::new(AlwaysFails));
        let (dispatcher, locks) = process(&store, registry);

        let outcome = dispatcher
            .dispatch("rule_1", "job", &serde_json::json!({}))
            .await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert!(outcome.detail.unwrap().contains("intentional failure"));
        assert!(locks.held_ids().await.is_empty());

        // The same job can fire again on its next scheduled time.
        let again = dispatcher
            .dispatch("rule_1", "job", &serde_json::json!({}))
            .await;
        assert_eq!(again.kind, OutcomeKind::Failed);
    }

    #[tokio::test]
    async fn panicking_body_is_contained() {
        let store = Arc::new(MemoryCoordination::new());
        let registry = registry_with("job", Arc::new(Panics));
        let (dispatcher, locks) = process(&store, registry);

        let outcome = dispatcher
            .dispatch("rule_1", "job", &serde_json::json!({}))
            .await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert!(outcome.detail.unwrap().contains("panicked"));
        assert!(locks.held_ids().await.is_empty());
    }

    #[tokio::test]
    async fn missing_handler_unlocks_and_reports_failed() {
        let store = Arc::new(MemoryCoordination::new());
        let (dispatcher, locks) = process(&store, Arc::new(JobRegistry::new()));

        let outcome = dispatcher
            .dispatch("rule_1", "vanished_job", &serde_json::json!({}))
            .await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert!(locks.held_ids().await.is_empty());
    }

    #[tokio::test]
    async fn outcomes_reach_the_sink() {
        let store = Arc::new(MemoryCoordination::new());
        let runs = Arc::new(AtomicU32::new(0));
        let registry = registry_with("job", Arc::new(Counting { runs }));
        let elector = Arc::new(LeaderElector::new(store.clone()));
        let locks = Arc::new(JobLockManager::new(store.clone()));
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = Dispatcher::new(elector, locks, registry, Some(tx));

        dispatcher
            .dispatch("rule_1", "job", &serde_json::json!({}))
            .await;
        let record = rx.recv().await.unwrap();
        assert_eq!(record.job_id, "rule_1");
        assert_eq!(record.kind, OutcomeKind::Ran);
    }
}
