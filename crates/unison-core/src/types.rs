use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Defines when a schedule rule fires.
///
/// Cron-expression parsing is deliberately out of scope — these two
/// variants cover fixed time-of-day (with an optional weekday mask) and
/// fixed-interval triggers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerSpec {
    /// Fire at HH:MM UTC on the listed weekdays (0 = Monday … 6 = Sunday).
    /// An empty list means every day.
    Daily {
        hour: u8,
        minute: u8,
        #[serde(default)]
        days: Vec<u8>,
    },

    /// Fire repeatedly with a fixed interval in seconds.
    Interval { every_secs: u64 },
}

impl TriggerSpec {
    /// Check the spec's fields are in range before it is persisted. An
    /// out-of-range trigger would otherwise sit in the store and never
    /// produce a fire time.
    pub fn validate(&self) -> crate::error::Result<()> {
        match self {
            TriggerSpec::Daily { hour, minute, days } => {
                if *hour > 23 || *minute > 59 {
                    return Err(CoreError::InvalidTrigger(format!(
                        "{hour:02}:{minute:02} is not a valid time of day"
                    )));
                }
                if let Some(day) = days.iter().find(|d| **d > 6) {
                    return Err(CoreError::InvalidTrigger(format!(
                        "weekday {day} is out of range 0..=6"
                    )));
                }
            }
            TriggerSpec::Interval { every_secs } => {
                if *every_secs == 0 {
                    return Err(CoreError::InvalidTrigger(
                        "interval must be at least one second".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for TriggerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSpec::Daily { hour, minute, days } => {
                if days.is_empty() {
                    write!(f, "daily at {hour:02}:{minute:02} UTC")
                } else {
                    write!(f, "at {hour:02}:{minute:02} UTC on days {days:?}")
                }
            }
            TriggerSpec::Interval { every_secs } => write!(f, "every {every_secs}s"),
        }
    }
}

/// A persisted schedule rule.
///
/// Rules are created and edited by collaborator code (or via
/// `ScheduleEdit`); the coordinator itself only observes them through
/// full reloads. Disabled rules are never registered with the trigger
/// engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRule {
    /// Store-assigned primary key.
    pub id: i64,
    /// Name of the job the rule targets — must match a registered handler.
    pub job_name: String,
    /// When the rule fires.
    pub trigger: TriggerSpec,
    pub enabled: bool,
    /// Opaque parameters forwarded to the job handler.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Free-form assignment metadata (team, tenant, host group).
    #[serde(default)]
    pub scope: Option<String>,
}

/// Fields for a rule that has not been persisted yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRule {
    pub job_name: String,
    pub trigger: TriggerSpec,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub scope: Option<String>,
}

/// An edit applied to the schedule store.
///
/// Edits take effect in the editing process immediately (synchronous
/// reload) and in every other process within one change notification.
#[derive(Debug, Clone)]
pub enum ScheduleEdit {
    Add(NewRule),
    UpdateTrigger { id: i64, trigger: TriggerSpec },
    SetEnabled { id: i64, enabled: bool },
    Delete { id: i64 },
}

/// How a single fire event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// The job body ran to completion in this process.
    Ran,
    /// This process does not hold the global leader lock.
    SkippedNotLeader,
    /// Another runner holds the per-job lock for this fire.
    SkippedLocked,
    /// The job body returned an error or panicked.
    Failed,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeKind::Ran => "ran",
            OutcomeKind::SkippedNotLeader => "skipped_not_leader",
            OutcomeKind::SkippedLocked => "skipped_locked",
            OutcomeKind::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ran" => Ok(OutcomeKind::Ran),
            "skipped_not_leader" => Ok(OutcomeKind::SkippedNotLeader),
            "skipped_locked" => Ok(OutcomeKind::SkippedLocked),
            "failed" => Ok(OutcomeKind::Failed),
            other => Err(format!("unknown outcome kind: {other}")),
        }
    }
}

/// Structured record of one fire event, consumed by the outcome sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub at: DateTime<Utc>,
    pub kind: OutcomeKind,
    /// Error detail for `failed` outcomes.
    pub detail: Option<String>,
}

impl JobOutcome {
    pub fn new(job_id: &str, kind: OutcomeKind) -> Self {
        Self {
            job_id: job_id.to_string(),
            at: Utc::now(),
            kind,
            detail: None,
        }
    }

    pub fn failed(job_id: &str, detail: impl Into<String>) -> Self {
        Self {
            job_id: job_id.to_string(),
            at: Utc::now(),
            kind: OutcomeKind::Failed,
            detail: Some(detail.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_spec_round_trips_through_json() {
        let spec = TriggerSpec::Daily {
            hour: 0,
            minute: 5,
            days: vec![0, 2, 4],
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"kind\":\"daily\""));
        let back: TriggerSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn daily_trigger_defaults_to_every_day() {
        let spec: TriggerSpec =
            serde_json::from_str(r#"{"kind":"daily","hour":2,"minute":10}"#).unwrap();
        assert_eq!(
            spec,
            TriggerSpec::Daily {
                hour: 2,
                minute: 10,
                days: vec![],
            }
        );
    }

    #[test]
    fn validate_rejects_out_of_range_triggers() {
        let bad = [
            TriggerSpec::Daily {
                hour: 24,
                minute: 0,
                days: vec![],
            },
            TriggerSpec::Daily {
                hour: 8,
                minute: 60,
                days: vec![],
            },
            TriggerSpec::Daily {
                hour: 8,
                minute: 30,
                days: vec![1, 7],
            },
            TriggerSpec::Interval { every_secs: 0 },
        ];
        for spec in bad {
            assert!(
                matches!(spec.validate(), Err(CoreError::InvalidTrigger(_))),
                "{spec} passed validation"
            );
        }

        let good = TriggerSpec::Daily {
            hour: 23,
            minute: 59,
            days: vec![0, 6],
        };
        assert!(good.validate().is_ok());
        assert!(TriggerSpec::Interval { every_secs: 1 }.validate().is_ok());
    }

    #[test]
    fn outcome_kind_parses_its_display_form() {
        for kind in [
            OutcomeKind::Ran,
            OutcomeKind::SkippedNotLeader,
            OutcomeKind::SkippedLocked,
            OutcomeKind::Failed,
        ] {
            assert_eq!(kind.to_string().parse::<OutcomeKind>().unwrap(), kind);
        }
        assert!("retrying".parse::<OutcomeKind>().is_err());
    }
}
