//! `unison-core` — shared types and store ports for the unison coordinator.
//!
//! # Overview
//!
//! Every worker process of a replicated deployment runs the same
//! coordinator, yet each scheduled job must fire at most once across the
//! whole fleet. This crate holds the pieces the other crates agree on:
//!
//! * [`types::ScheduleRule`] / [`types::TriggerSpec`] — persisted rule
//!   definitions and when they fire.
//! * [`types::JobOutcome`] — the structured record emitted once per fire
//!   event (`ran`, `skipped_not_leader`, `skipped_locked`, `failed`).
//! * [`store`] — the port traits the coordinator talks through: advisory
//!   lock sessions, schedule-rule reads/edits, and the change feed used
//!   for sub-second hot reload.
//! * [`trigger::next_fire_after`] — fire-time computation for a trigger.
//! * [`config::UnisonConfig`] — TOML + `UNISON_*` env configuration.

pub mod config;
pub mod error;
pub mod store;
pub mod trigger;
pub mod types;

pub use error::{CoreError, Result};
pub use types::{JobOutcome, NewRule, OutcomeKind, ScheduleEdit, ScheduleRule, TriggerSpec};
