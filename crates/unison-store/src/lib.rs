//! `unison-store` — store backends for the unison coordinator.
//!
//! Two implementations of the `unison-core` port traits:
//!
//! * [`pg::PgCoordination`] — shared Postgres. Advisory locks ride on
//!   dedicated connections (`pg_try_advisory_lock`), the change feed is
//!   `LISTEN`/`NOTIFY`, and schedule rules live in a `schedule_rules`
//!   table. This is the backend that makes multi-process coordination
//!   real: a crashed process's connections are closed by the server,
//!   which releases every lock they held.
//! * [`memory::MemoryCoordination`] — in-process equivalent with the same
//!   session-scoped release semantics, used by tests and single-process
//!   deployments.

pub mod db;
pub mod memory;
pub mod pg;

pub use memory::MemoryCoordination;
pub use pg::PgCoordination;
