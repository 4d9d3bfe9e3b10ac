use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use unison_core::store::ScheduleStore;
use unison_core::trigger::next_fire_after;

use crate::engine::{RegisteredJob, TriggerEngine};
use crate::joblock::JobLockManager;
use crate::registry::JobRegistry;
use crate::Result;

/// Rebuilds the trigger engine's job set from the store.
///
/// Listener-triggered and edit-triggered reloads serialize on one mutex,
/// so two reloads can never interleave and corrupt the registered set.
/// Each reload re-reads full state — notifications are a pure "something
/// changed" signal, never trusted for content.
pub struct Reloader {
    store: Arc<dyn ScheduleStore>,
    engine: Arc<TriggerEngine>,
    locks: Arc<JobLockManager>,
    registry: Arc<JobRegistry>,
    gate: Mutex<()>,
}

impl Reloader {
    pub fn new(
        store: Arc<dyn ScheduleStore>,
        engine: Arc<TriggerEngine>,
        locks: Arc<JobLockManager>,
        registry: Arc<JobRegistry>,
    ) -> Self {
        Self {
            store,
            engine,
            locks,
            registry,
            gate: Mutex::new(()),
        }
    }

    /// Read all enabled rules and swap the engine's job set. Idempotent:
    /// with no intervening store change, the registered set is identical
    /// after every call.
    pub async fn reload(&self) -> Result<()> {
        let _gate = self.gate.lock().await;

        let rules = self.store.fetch_enabled().await?;
        let now = Utc::now();
        let mut jobs: HashMap<String, RegisteredJob> = HashMap::new();

        for rule in rules {
            if !self.registry.contains(&rule.job_name) {
                warn!(
                    rule_id = rule.id,
                    job = %rule.job_name,
                    "no handler registered for rule; skipped"
                );
                continue;
            }
            let job_id = format!("rule_{}", rule.id);
            let Some(next_fire) = next_fire_after(&rule.trigger, now) else {
                warn!(rule_id = rule.id, "rule trigger has no next fire time; skipped");
                continue;
            };
            jobs.insert(
                job_id.clone(),
                RegisteredJob {
                    job_id,
                    name: rule.job_name,
                    trigger: rule.trigger,
                    params: rule.params,
                    next_fire,
                },
            );
        }

        let active: HashSet<String> = jobs.keys().cloned().collect();
        let count = jobs.len();
        self.engine.replace_jobs(jobs).await;
        self.locks.release_unused(&active).await;

        info!(jobs = count, "schedules reloaded");
        for row in self.engine.snapshot().await {
            info!(
                job_id = %row.job_id,
                name = %row.name,
                trigger = %row.trigger,
                next_fire = %row.next_fire,
                "job registered"
            );
        }
        Ok(())
    }
}
