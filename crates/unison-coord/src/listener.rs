use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use unison_core::store::ChangeFeed;

use crate::reload::Reloader;

/// Minimum delay between resubscribe attempts (seconds).
const BACKOFF_BASE_SECS: u64 = 5;
/// Maximum delay between resubscribe attempts (seconds).
const BACKOFF_MAX_SECS: u64 = 300; // 5 minutes
/// Consecutive failures before the health flag flips to `Failed`.
const MAX_ATTEMPTS: u32 = 10;
/// Jitter fraction applied to each delay (±10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Health of the change listener, exposed for process-level health
/// reporting. A dead listener means this process silently runs a stale
/// schedule — the one failure mode that must be loud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerHealth {
    /// Not yet subscribed.
    Starting,
    /// Subscribed and waiting for notifications.
    Subscribed,
    /// Subscription lost; reconnecting with backoff.
    Degraded,
    /// Retries exhausted. The loop keeps retrying at the capped interval,
    /// but the process should surface this on its health check.
    Failed,
}

/// Background subscriber on the schedule change channel.
///
/// Exactly one listener task per process: `start_once` is guarded by a
/// startup mutex, concurrent callers after the first are no-ops. The task
/// blocks on the subscription (its idle state), reloads on every
/// notification not published by this process, and reconnects with
/// exponential backoff when the subscription drops — it never exits
/// silently while the process runs.
pub struct ChangeListener {
    feed: Arc<dyn ChangeFeed>,
    reloader: Arc<Reloader>,
    /// This process's instance id; notifications carrying it are our own
    /// edits, already reloaded synchronously.
    instance_id: String,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    health_tx: watch::Sender<ListenerHealth>,
}

impl ChangeListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        reloader: Arc<Reloader>,
        instance_id: String,
    ) -> (Self, watch::Receiver<ListenerHealth>) {
        let (health_tx, health_rx) = watch::channel(ListenerHealth::Starting);
        (
            Self {
                feed,
                reloader,
                instance_id,
                handle: std::sync::Mutex::new(None),
                health_tx,
            },
            health_rx,
        )
    }

    /// Start the listener task. Idempotent — only the first call spawns.
    pub fn start_once(&self, shutdown: watch::Receiver<bool>) {
        let mut guard = self.handle.lock().unwrap();
        if guard.is_some() {
            return;
        }
        let feed = Arc::clone(&self.feed);
        let reloader = Arc::clone(&self.reloader);
        let instance_id = self.instance_id.clone();
        let health_tx = self.health_tx.clone();
        *guard = Some(tokio::spawn(listen_loop(
            feed,
            reloader,
            instance_id,
            health_tx,
            shutdown,
        )));
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().unwrap().is_some()
    }
}

async fn listen_loop(
    feed: Arc<dyn ChangeFeed>,
    reloader: Arc<Reloader>,
    instance_id: String,
    health_tx: watch::Sender<ListenerHealth>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    let mut delay_secs = BACKOFF_BASE_SECS;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let subscription = match feed.subscribe().await {
            Ok(sub) => {
                failures = 0;
                delay_secs = BACKOFF_BASE_SECS;
                let _ = health_tx.send(ListenerHealth::Subscribed);
                info!("subscribed to schedule change channel");
                sub
            }
            Err(e) => {
                report_failure(&health_tx, &mut failures, &e.to_string());
                if !backoff(&mut delay_secs, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        match pump(subscription, &reloader, &instance_id, &mut shutdown).await {
            PumpExit::Shutdown => break,
            PumpExit::Lost(reason) => {
                report_failure(&health_tx, &mut failures, &reason);
                if !backoff(&mut delay_secs, &mut shutdown).await {
                    break;
                }
            }
        }
    }

    info!("schedule change listener stopped");
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

/// Block on the subscription, reloading on each foreign notification,
/// until it drops or shutdown is requested.
async fn pump(
    mut subscription: Box<dyn unison_core::store::ChangeSubscription>,
    reloader: &Reloader,
    instance_id: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> PumpExit {
    loop {
        tokio::select! {
            notification = subscription.recv() => {
                let payload = match notification {
                    Ok(p) => p,
                    Err(e) => return PumpExit::Lost(e.to_string()),
                };
                if payload == instance_id {
                    continue;
                }
                info!("reloading schedules after change notification");
                if let Err(e) = reloader.reload().await {
                    // The store that just notified us may be briefly
                    // unreachable; the next notification or manual reload
                    // catches up.
                    warn!(error = %e, "notification-triggered reload failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return PumpExit::Shutdown;
                }
            }
        }
    }
}

fn report_failure(health_tx: &watch::Sender<ListenerHealth>, failures: &mut u32, reason: &str) {
    *failures += 1;
    if *failures >= MAX_ATTEMPTS {
        let _ = health_tx.send(ListenerHealth::Failed);
        error!(
            failures = *failures,
            reason, "schedule change listener failing persistently; schedule may be stale"
        );
    } else {
        let _ = health_tx.send(ListenerHealth::Degraded);
        warn!(
            failures = *failures,
            reason, "schedule change listener lost; retrying with backoff"
        );
    }
}

/// Sleep for the current delay (with jitter), doubling it up to the cap.
/// Returns false when shutdown was requested during the sleep.
async fn backoff(delay_secs: &mut u64, shutdown: &mut watch::Receiver<bool>) -> bool {
    let total = *delay_secs + jitter_secs(*delay_secs);
    *delay_secs = (*delay_secs * 2).min(BACKOFF_MAX_SECS);
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(total)) => true,
        _ = shutdown.changed() => !*shutdown.borrow(),
    }
}

/// Jitter offset (0 … `JITTER_FRACTION * base_secs`) as integer seconds,
/// derived from the monotonic clock to avoid a rand dependency.
fn jitter_secs(base_secs: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);

    let max_jitter = ((base_secs as f64) * JITTER_FRACTION) as u64;
    if max_jitter == 0 {
        return 0;
    }
    u64::from(nanos) % max_jitter
}
