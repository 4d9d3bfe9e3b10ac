use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use unison_core::store::{ChangeFeed, LockStore, ScheduleStore};
use unison_core::types::{JobOutcome, ScheduleEdit, ScheduleRule};

use crate::dispatch::Dispatcher;
use crate::election::LeaderElector;
use crate::engine::{JobSnapshot, TriggerEngine};
use crate::error::CoordError;
use crate::joblock::JobLockManager;
use crate::listener::{ChangeListener, ListenerHealth};
use crate::registry::JobRegistry;
use crate::reload::Reloader;
use crate::Result;

/// One coordinator per process: wires election, job locks, dispatch,
/// trigger engine, reload, and the change listener together.
///
/// Every process runs the identical coordinator; the advisory locks in
/// the shared store decide which one actually executes each fire.
pub struct Coordinator {
    elector: Arc<LeaderElector>,
    locks: Arc<JobLockManager>,
    engine: Arc<TriggerEngine>,
    reloader: Arc<Reloader>,
    listener: ChangeListener,
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn ScheduleStore>,
    feed: Arc<dyn ChangeFeed>,
    registry: Arc<JobRegistry>,
    instance_id: String,
    tick_secs: u64,
    shutdown_tx: watch::Sender<bool>,
    health_rx: watch::Receiver<ListenerHealth>,
    started: AtomicBool,
    engine_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Build a coordinator. The three store handles usually point at one
    /// backend instance; `outcome_tx`, when given, receives one
    /// [`JobOutcome`] per fire event.
    pub fn new(
        lock_store: Arc<dyn LockStore>,
        store: Arc<dyn ScheduleStore>,
        feed: Arc<dyn ChangeFeed>,
        registry: Arc<JobRegistry>,
        tick_secs: u64,
        outcome_tx: Option<mpsc::Sender<JobOutcome>>,
    ) -> Self {
        let instance_id = Uuid::new_v4().simple().to_string();
        let elector = Arc::new(LeaderElector::new(Arc::clone(&lock_store)));
        let locks = Arc::new(JobLockManager::new(lock_store));
        let engine = Arc::new(TriggerEngine::new());
        let reloader = Arc::new(Reloader::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::clone(&locks),
            Arc::clone(&registry),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&elector),
            Arc::clone(&locks),
            Arc::clone(&registry),
            outcome_tx,
        ));
        let (listener, health_rx) = ChangeListener::new(
            Arc::clone(&feed),
            Arc::clone(&reloader),
            instance_id.clone(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            elector,
            locks,
            engine,
            reloader,
            listener,
            dispatcher,
            store,
            feed,
            registry,
            instance_id,
            tick_secs,
            shutdown_tx,
            health_rx,
            started: AtomicBool::new(false),
            engine_task: std::sync::Mutex::new(None),
        }
    }

    /// Start the coordinator: initial election attempt, initial schedule
    /// load, the change listener, and the trigger engine loop. Idempotent.
    pub async fn start(&self) -> Result<()> {
        // Claim the flag before the first await; a second caller racing
        // past an is-started check here would spawn a second engine loop.
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if self.elector.ensure_leader().await {
            info!(instance = %self.instance_id, "this process is the scheduler leader");
        } else {
            info!(instance = %self.instance_id, "another process holds scheduler leadership");
        }

        if let Err(e) = self.reloader.reload().await {
            // Leave the coordinator restartable after a failed start.
            self.started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        self.listener.start_once(self.shutdown_tx.subscribe());

        let engine = Arc::clone(&self.engine);
        let dispatcher = Arc::clone(&self.dispatcher);
        let shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(engine.run(dispatcher, self.tick_secs, shutdown_rx));
        *self.engine_task.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Apply a schedule edit: write the store, reload this process
    /// synchronously (low-latency feedback for the editor), then notify
    /// the rest of the fleet. Other processes pick the edit up within one
    /// notification round-trip.
    ///
    /// Rejects rules targeting an unregistered handler and triggers with
    /// out-of-range fields before anything reaches the store.
    pub async fn apply_edit(&self, edit: ScheduleEdit) -> Result<()> {
        match edit {
            ScheduleEdit::Add(rule) => {
                if !self.registry.contains(&rule.job_name) {
                    return Err(CoordError::UnknownHandler {
                        name: rule.job_name,
                    });
                }
                rule.trigger.validate()?;
                let id = self.store.insert(rule).await?;
                info!(rule_id = id, "schedule rule added");
            }
            ScheduleEdit::UpdateTrigger { id, trigger } => {
                trigger.validate()?;
                self.store.update_trigger(id, trigger).await?;
                info!(rule_id = id, "schedule rule trigger updated");
            }
            ScheduleEdit::SetEnabled { id, enabled } => {
                self.store.set_enabled(id, enabled).await?;
                info!(rule_id = id, enabled, "schedule rule toggled");
            }
            ScheduleEdit::Delete { id } => {
                self.store.delete(id).await?;
                info!(rule_id = id, "schedule rule deleted");
            }
        }

        self.reloader.reload().await?;
        if let Err(e) = self.feed.publish(&self.instance_id).await {
            // The local reload already succeeded; other processes will
            // catch up on the next notification or restart.
            warn!(error = %e, "failed to publish schedule change notification");
        }
        Ok(())
    }

    /// Re-read all rules and rebuild the job set on demand.
    pub async fn reload(&self) -> Result<()> {
        self.reloader.reload().await
    }

    /// Human-friendly view of the registered jobs.
    pub async fn job_snapshot(&self) -> Vec<JobSnapshot> {
        self.engine.snapshot().await
    }

    /// Every persisted rule, enabled or not, for diagnostics views.
    pub async fn rules(&self) -> Result<Vec<ScheduleRule>> {
        Ok(self.store.fetch_all().await?)
    }

    pub async fn is_leader(&self) -> bool {
        self.elector.is_leader().await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Listener health for process-level health reporting.
    pub fn listener_health(&self) -> watch::Receiver<ListenerHealth> {
        self.health_rx.clone()
    }

    /// Stop background tasks, release every held lock, and step down.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.engine_task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.locks.release_all().await;
        self.elector.release().await;
        info!(instance = %self.instance_id, "coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use unison_core::error::Result as CoreResult;
    use unison_core::types::{NewRule, TriggerSpec};
    use unison_store::MemoryCoordination;

    /// Counts schedule loads so tests can see how many startup sequences
    /// actually ran.
    struct CountingStore {
        inner: Arc<MemoryCoordination>,
        loads: AtomicU32,
    }

    #[async_trait]
    impl ScheduleStore for CountingStore {
        async fn fetch_enabled(&self) -> CoreResult<Vec<ScheduleRule>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch_enabled().await
        }

        async fn fetch_all(&self) -> CoreResult<Vec<ScheduleRule>> {
            self.inner.fetch_all().await
        }

        async fn insert(&self, rule: NewRule) -> CoreResult<i64> {
            self.inner.insert(rule).await
        }

        async fn update_trigger(&self, id: i64, trigger: TriggerSpec) -> CoreResult<()> {
            self.inner.update_trigger(id, trigger).await
        }

        async fn set_enabled(&self, id: i64, enabled: bool) -> CoreResult<()> {
            self.inner.set_enabled(id, enabled).await
        }

        async fn delete(&self, id: i64) -> CoreResult<()> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn concurrent_starts_run_the_startup_sequence_once() {
        let backend = Arc::new(MemoryCoordination::new());
        let store = Arc::new(CountingStore {
            inner: Arc::clone(&backend),
            loads: AtomicU32::new(0),
        });
        let coordinator = Coordinator::new(
            backend.clone(),
            store.clone(),
            backend.clone(),
            Arc::new(JobRegistry::new()),
            1,
            None,
        );

        let (a, b) = tokio::join!(coordinator.start(), coordinator.start());
        a.unwrap();
        b.unwrap();

        // One initial reload; a second engine loop would have doubled it.
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);
        coordinator.shutdown().await;
    }
}
