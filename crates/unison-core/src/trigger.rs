use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};

use crate::types::TriggerSpec;

/// Compute the next UTC fire time for `spec` strictly after `from`.
///
/// Returns `None` only for unrepresentable specs (hour/minute out of
/// range); both trigger variants otherwise always have a next fire.
pub fn next_fire_after(spec: &TriggerSpec, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match spec {
        TriggerSpec::Interval { every_secs } => {
            Some(from + Duration::seconds((*every_secs).max(1) as i64))
        }

        TriggerSpec::Daily { hour, minute, days } => {
            // Walk forward at most a week: the first day in the mask whose
            // HH:MM is still ahead of `from` wins. An empty mask means
            // every day, so offset 0 or 1 always matches.
            for offset in 0..=7 {
                let day = from + Duration::days(offset);
                let dow = day.weekday().num_days_from_monday() as u8;
                if !days.is_empty() && !days.contains(&dow) {
                    continue;
                }
                let candidate = Utc
                    .with_ymd_and_hms(
                        day.year(),
                        day.month(),
                        day.day(),
                        u32::from(*hour),
                        u32::from(*minute),
                        0,
                    )
                    .single()?;
                if candidate > from {
                    return Some(candidate);
                }
            }
            None
        }
    }
}
