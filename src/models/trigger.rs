// Calendar trigger specification

//! # Trigger Specs
//!
//! A [`TriggerSpec`] is a structured calendar: for each field it lists the
//! permitted values, and an empty set means "any". It is the same shape an
//! external durable execution engine accepts for schedule calendars, so the
//! engine adapters pass it through without reinterpretation.
//!
//! Specs are built by [`crate::engine::schedule::translate`] and are not
//! mutated afterwards.
//!
//! Calendar fields are read in the spec's `time_zone`, so `09:30` in
//! `America/New_York` fires at 14:30 UTC in winter and 13:30 UTC in summer.

use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{KainosError, Result};

/// Calendar-based recurrence
///
/// `day_of_week` uses 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerSpec {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub second: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub minute: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub hour: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub day_of_month: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub month: BTreeSet<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub year: BTreeSet<i32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub day_of_week: BTreeSet<u32>,
    /// IANA zone the calendar is expressed in; `None` means UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

fn allows<T: Ord>(set: &BTreeSet<T>, value: T) -> bool {
    set.is_empty() || set.contains(&value)
}

impl TriggerSpec {
    /// Fires at `hour:minute` on every day
    pub fn at(hour: u32, minute: u32) -> Self {
        Self {
            hour: BTreeSet::from([hour]),
            minute: BTreeSet::from([minute]),
            ..Default::default()
        }
    }

    pub fn on_weekdays(mut self, days: impl IntoIterator<Item = u32>) -> Self {
        self.day_of_week = days.into_iter().collect();
        self
    }

    pub fn on_days_of_month(mut self, days: impl IntoIterator<Item = u32>) -> Self {
        self.day_of_month = days.into_iter().collect();
        self
    }

    pub fn in_zone(mut self, zone: impl Into<String>) -> Self {
        self.time_zone = Some(zone.into());
        self
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// The parsed `time_zone`; `Ok(None)` means UTC
    pub fn zone(&self) -> Result<Option<Tz>> {
        match &self.time_zone {
            None => Ok(None),
            Some(name) => name
                .parse::<Tz>()
                .map(Some)
                .map_err(|_| KainosError::InvalidInput(format!("unknown time zone '{}'", name))),
        }
    }

    /// Whether the calendar permits the minute containing `instant`
    ///
    /// Seconds are ignored unless the spec restricts them. A spec whose zone
    /// does not parse never matches.
    pub fn matches(&self, instant: DateTime<Utc>) -> bool {
        match self.zone() {
            Ok(None) => self.matches_local(&instant),
            Ok(Some(tz)) => self.matches_local(&instant.with_timezone(&tz)),
            Err(_) => false,
        }
    }

    fn matches_local<T: Datelike + Timelike>(&self, local: &T) -> bool {
        allows(&self.minute, local.minute())
            && allows(&self.hour, local.hour())
            && allows(&self.day_of_month, local.day())
            && allows(&self.month, local.month())
            && allows(&self.year, local.year())
            && allows(&self.day_of_week, local.weekday().num_days_from_sunday())
            && (self.second.is_empty() || self.second.contains(&local.second()))
    }

    /// Same calendar and zone, ignoring the comment
    pub fn same_calendar(&self, other: &TriggerSpec) -> bool {
        self.second == other.second
            && self.minute == other.minute
            && self.hour == other.hour
            && self.day_of_month == other.day_of_month
            && self.month == other.month
            && self.year == other.year
            && self.day_of_week == other.day_of_week
            && self.time_zone == other.time_zone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_empty_spec_matches_everything() {
        let spec = TriggerSpec::default();
        let t = Utc.with_ymd_and_hms(2024, 2, 29, 23, 59, 0).unwrap();
        assert!(spec.matches(t));
    }

    #[test]
    fn test_weekday_matching() {
        // 2024-01-01 was a Monday
        let spec = TriggerSpec::at(9, 0).on_weekdays(1..=5);
        let monday = Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 30).unwrap();
        let sunday = Utc.with_ymd_and_hms(2023, 12, 31, 9, 0, 0).unwrap();
        assert!(spec.matches(monday));
        assert!(!spec.matches(sunday));
        assert!(!spec.matches(Utc.with_ymd_and_hms(2024, 1, 1, 9, 1, 0).unwrap()));
    }

    #[test]
    fn test_zoned_spec_matches_local_wall_clock() {
        // 2024-01-02 is a Tuesday; New York is UTC-5 in January
        let spec = TriggerSpec::at(9, 30)
            .on_weekdays(1..=5)
            .in_zone("America/New_York");
        assert!(spec.matches(Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap()));
        assert!(!spec.matches(Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap()));

        // Daylight saving moves the bell to 13:30 UTC
        assert!(spec.matches(Utc.with_ymd_and_hms(2024, 7, 2, 13, 30, 0).unwrap()));
        assert!(!spec.matches(Utc.with_ymd_and_hms(2024, 7, 2, 14, 30, 0).unwrap()));
    }

    #[test]
    fn test_weekday_is_read_in_zone() {
        // Monday 01:00 UTC is still Sunday evening in New York
        let spec = TriggerSpec::at(20, 0).on_weekdays([0]).in_zone("America/New_York");
        assert!(spec.matches(Utc.with_ymd_and_hms(2024, 1, 1, 1, 0, 0).unwrap()));
    }

    #[test]
    fn test_unknown_zone_never_matches() {
        let spec = TriggerSpec::default().in_zone("Mars/Olympus_Mons");
        assert!(spec.zone().is_err());
        assert!(!spec.matches(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn test_same_calendar_ignores_comment() {
        let a = TriggerSpec::at(9, 0).with_comment("morning");
        assert!(a.same_calendar(&TriggerSpec::at(9, 0)));
        assert!(!a.same_calendar(&TriggerSpec::at(17, 0)));
        assert!(!a.same_calendar(&TriggerSpec::at(9, 0).in_zone("Europe/London")));
    }

    #[test]
    fn test_serialization_skips_unrestricted_fields() {
        let spec = TriggerSpec::at(13, 45);
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json, serde_json::json!({"minute": [45], "hour": [13]}));
        let back: TriggerSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }
}
