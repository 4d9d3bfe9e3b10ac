//! Port traits the coordinator uses to talk to the shared store.
//!
//! Advisory locks are cooperative and session-scoped: ownership of a key
//! is tied to one [`LockSession`], and ending the session (close, drop,
//! process crash, network partition) is the only release path besides an
//! explicit [`LockSession::release`]. A dropped session is detected
//! lazily — the next [`LockSession::probe`] or operation fails — so no
//! heartbeat is required.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{NewRule, ScheduleRule, TriggerSpec};

/// One dedicated store session that can hold advisory locks.
///
/// All keys acquired through a session are released when the session ends,
/// however it ends.
#[async_trait]
pub trait LockSession: Send {
    /// Attempt to acquire the advisory lock for `key`. Non-blocking:
    /// returns `Ok(false)` immediately when another session holds it.
    async fn try_acquire(&mut self, key: i64) -> Result<bool>;

    /// Explicitly release the advisory lock for `key`, if held.
    async fn release(&mut self, key: i64) -> Result<()>;

    /// Cheap liveness check (`SELECT 1` or equivalent). `false` means the
    /// session is gone and every lock it held is already released.
    async fn probe(&mut self) -> bool;

    /// Close the session, releasing all of its locks. Idempotent.
    async fn close(&mut self);
}

/// Opens dedicated [`LockSession`]s.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn session(&self) -> Result<Box<dyn LockSession>>;
}

/// Reads and edits persisted schedule rules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// All rules with `enabled = true`, ordered by id.
    async fn fetch_enabled(&self) -> Result<Vec<ScheduleRule>>;

    /// Every rule regardless of enabled state, for diagnostics views.
    async fn fetch_all(&self) -> Result<Vec<ScheduleRule>>;

    /// Insert a new rule (enabled) and return its assigned id.
    async fn insert(&self, rule: NewRule) -> Result<i64>;

    async fn update_trigger(&self, id: i64, trigger: TriggerSpec) -> Result<()>;

    async fn set_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    async fn delete(&self, id: i64) -> Result<()>;
}

/// A blocking subscription on the schedule change channel.
#[async_trait]
pub trait ChangeSubscription: Send {
    /// Await the next notification and return its payload. The payload
    /// carries no schema beyond "something changed" — except that
    /// publishers stamp their own instance id so they can ignore their
    /// own edits.
    async fn recv(&mut self) -> Result<String>;
}

/// The store-native publish/subscribe channel for schedule changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open a dedicated subscription on the well-known channel.
    async fn subscribe(&self) -> Result<Box<dyn ChangeSubscription>>;

    /// Broadcast a change notification to every subscribed process.
    async fn publish(&self, payload: &str) -> Result<()>;
}
