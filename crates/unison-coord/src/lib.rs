//! `unison-coord` — the multi-process job scheduling coordinator.
//!
//! # Overview
//!
//! Every worker process runs one [`Coordinator`]. Two advisory-lock gates
//! guarantee each scheduled fire executes at most once across the fleet:
//!
//! 1. **Leader gate** — [`election::LeaderElector`] holds a dedicated
//!    store session on a single well-known lock key; only the process
//!    holding it attempts dispatch at all.
//! 2. **Job gate** — [`joblock::JobLockManager`] takes a per-job key on
//!    its own dedicated session for the duration of one fire, so even a
//!    momentary double-leader during failover cannot double-run a job.
//!
//! The [`engine::TriggerEngine`] evaluates fire times on a one-second
//! tick; [`listener::ChangeListener`] blocks on the store's change
//! channel and triggers [`reload::Reloader`] whenever any process edits
//! the schedule, so edits propagate fleet-wide within one notification
//! round-trip, with no polling.
//!
//! Losing a store connection is never fatal: the store releases the dead
//! session's locks itself, the next election or lock attempt recovers,
//! and a fire that was skipped is simply gone (best-effort triggering,
//! not a durable queue).

pub mod coordinator;
pub mod dispatch;
pub mod election;
pub mod engine;
pub mod error;
pub mod joblock;
pub mod listener;
pub mod registry;
pub mod reload;

pub use coordinator::Coordinator;
pub use dispatch::Dispatcher;
pub use election::LeaderElector;
pub use engine::{JobSnapshot, TriggerEngine};
pub use error::{CoordError, JobError, Result};
pub use joblock::JobLockManager;
pub use listener::{ChangeListener, ListenerHealth};
pub use registry::{JobHandler, JobRegistry};
pub use reload::Reloader;
