use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

use unison_core::trigger::next_fire_after;
use unison_core::types::TriggerSpec;

use crate::dispatch::Dispatcher;

/// One job registered with the trigger engine.
#[derive(Debug, Clone)]
pub struct RegisteredJob {
    /// Stable id tied to the rule row, e.g. `rule_17`.
    pub job_id: String,
    /// Handler name from the rule.
    pub name: String,
    pub trigger: TriggerSpec,
    pub params: serde_json::Value,
    pub next_fire: DateTime<Utc>,
}

/// Diagnostics row for one registered job.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    pub job_id: String,
    pub name: String,
    pub trigger: String,
    pub next_fire: DateTime<Utc>,
}

/// Time-driven fire evaluation. Owns no distributed state — the two
/// advisory gates live in the dispatcher it invokes.
///
/// The registered set is only ever replaced wholesale (one assignment
/// under the mutex), so a tick either sees the old set or the new one,
/// never a partial mix. Missed fires are not retried.
pub struct TriggerEngine {
    jobs: Mutex<HashMap<String, RegisteredJob>>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically replace the whole registered set.
    pub async fn replace_jobs(&self, new_jobs: HashMap<String, RegisteredJob>) {
        let mut jobs = self.jobs.lock().await;
        *jobs = new_jobs;
    }

    /// Ids of all currently registered jobs.
    pub async fn job_ids(&self) -> HashSet<String> {
        self.jobs.lock().await.keys().cloned().collect()
    }

    /// Human-friendly view of the registered set, sorted by id.
    pub async fn snapshot(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut rows: Vec<JobSnapshot> = jobs
            .values()
            .map(|j| JobSnapshot {
                job_id: j.job_id.clone(),
                name: j.name.clone(),
                trigger: j.trigger.to_string(),
                next_fire: j.next_fire,
            })
            .collect();
        rows.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        rows
    }

    /// Collect jobs due at `now` and advance their next fire time.
    /// A job whose trigger can no longer produce a fire time is dropped.
    pub async fn due_jobs(&self, now: DateTime<Utc>) -> Vec<RegisteredJob> {
        let mut jobs = self.jobs.lock().await;
        let mut due = Vec::new();
        let mut exhausted = Vec::new();

        for job in jobs.values_mut() {
            if job.next_fire > now {
                continue;
            }
            due.push(job.clone());
            match next_fire_after(&job.trigger, now) {
                Some(next) => job.next_fire = next,
                None => exhausted.push(job.job_id.clone()),
            }
        }
        for job_id in exhausted {
            debug!(job_id = %job_id, "trigger exhausted; job dropped");
            jobs.remove(&job_id);
        }
        due
    }

    /// Main loop: evaluate fire times on a fixed tick until `shutdown`
    /// broadcasts `true`. Dispatches are spawned so a slow or blocked job
    /// never stalls the tick.
    pub async fn run(
        self: Arc<Self>,
        dispatcher: Arc<Dispatcher>,
        tick_secs: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(tick_secs, "trigger engine started");
        let mut interval = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Utc::now();
                    for job in self.due_jobs(now).await {
                        let dispatcher = Arc::clone(&dispatcher);
                        tokio::spawn(async move {
                            dispatcher
                                .dispatch(&job.job_id, &job.name, &job.params)
                                .await;
                        });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("trigger engine shutting down");
                        break;
                    }
                }
            }
        }
    }
}

impl Default for TriggerEngine {
    fn default() -> Self {
        Self::new()
    }
}
