// Schedule description to trigger spec translation

//! # Schedule Translator
//!
//! Tenants pick schedules by name (`"daily-9am"`, `"market-open"`) or type a
//! 24-hour time (`"13:45"`). [`translate`] turns either form into a
//! [`TriggerSpec`]. It is a pure function: no I/O, no shared state.
//!
//! | Preset               | Fires                               |
//! |----------------------|-------------------------------------|
//! | `daily-9am`          | 09:00 every day                     |
//! | `daily-5pm`          | 17:00 every day                     |
//! | `weekdays-9am`       | 09:00 Monday to Friday              |
//! | `weekdays-5pm`       | 17:00 Monday to Friday              |
//! | `hourly`             | minute 0 of every hour              |
//! | `every-30-minutes`   | minutes 0 and 30                    |
//! | `every-15-minutes`   | minutes 0, 15, 30, 45               |
//! | `weekly-monday-9am`  | 09:00 on Mondays                    |
//! | `monthly-first-9am`  | 09:00 on the 1st of the month       |
//! | `market-open`        | 09:30 Mon-Fri, America/New_York     |
//! | `market-close`       | 16:00 Mon-Fri, America/New_York     |

use std::collections::BTreeSet;

use crate::models::TriggerSpec;
use crate::{KainosError, Result};

/// Zone the exchange presets are expressed in
pub const MARKET_TIME_ZONE: &str = "America/New_York";

const WEEKDAYS: [u32; 5] = [1, 2, 3, 4, 5];

const PRESETS: &[&str] = &[
    "daily-9am",
    "daily-5pm",
    "weekdays-9am",
    "weekdays-5pm",
    "hourly",
    "every-30-minutes",
    "every-15-minutes",
    "weekly-monday-9am",
    "monthly-first-9am",
    "market-open",
    "market-close",
];

/// Names accepted by [`translate`] besides `HH:MM` literals
pub fn preset_names() -> &'static [&'static str] {
    PRESETS
}

fn every_hour_at(minutes: &[u32]) -> TriggerSpec {
    TriggerSpec {
        minute: minutes.iter().copied().collect::<BTreeSet<_>>(),
        ..Default::default()
    }
}

fn preset(name: &str) -> Option<TriggerSpec> {
    let spec = match name {
        "daily-9am" => TriggerSpec::at(9, 0).with_comment("Daily at 9:00 AM"),
        "daily-5pm" => TriggerSpec::at(17, 0).with_comment("Daily at 5:00 PM"),
        "weekdays-9am" => TriggerSpec::at(9, 0)
            .on_weekdays(WEEKDAYS)
            .with_comment("Weekdays at 9:00 AM"),
        "weekdays-5pm" => TriggerSpec::at(17, 0)
            .on_weekdays(WEEKDAYS)
            .with_comment("Weekdays at 5:00 PM"),
        "hourly" => every_hour_at(&[0]).with_comment("Every hour"),
        "every-30-minutes" => every_hour_at(&[0, 30]).with_comment("Every 30 minutes"),
        "every-15-minutes" => every_hour_at(&[0, 15, 30, 45]).with_comment("Every 15 minutes"),
        "weekly-monday-9am" => TriggerSpec::at(9, 0)
            .on_weekdays([1])
            .with_comment("Mondays at 9:00 AM"),
        "monthly-first-9am" => TriggerSpec::at(9, 0)
            .on_days_of_month([1])
            .with_comment("First of the month at 9:00 AM"),
        "market-open" => TriggerSpec::at(9, 30)
            .on_weekdays(WEEKDAYS)
            .in_zone(MARKET_TIME_ZONE)
            .with_comment("Market open, 9:30 AM ET on weekdays"),
        "market-close" => TriggerSpec::at(16, 0)
            .on_weekdays(WEEKDAYS)
            .in_zone(MARKET_TIME_ZONE)
            .with_comment("Market close, 4:00 PM ET on weekdays"),
        _ => return None,
    };
    Some(spec)
}

/// Parse `H:MM` or `HH:MM` on a 24-hour clock
fn parse_clock(raw: &str) -> Option<(u32, u32)> {
    let (hour, minute) = raw.split_once(':')?;
    if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
        return None;
    }
    if !hour.bytes().chain(minute.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

/// Translate a schedule description into a trigger spec
///
/// Unknown input yields [`KainosError::UnknownSchedule`] carrying the raw text.
pub fn translate(description: &str) -> Result<TriggerSpec> {
    if let Some(spec) = preset(description) {
        spec.zone()?;
        return Ok(spec);
    }
    match parse_clock(description) {
        Some((hour, minute)) => Ok(TriggerSpec::at(hour, minute)
            .with_comment(format!("Daily at {:02}:{:02}", hour, minute))),
        None => Err(KainosError::UnknownSchedule(description.to_string())),
    }
}
