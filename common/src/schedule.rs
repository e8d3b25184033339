use chrono::{
    DateTime, Datelike, Duration, FixedOffset, LocalResult, TimeZone, Timelike, Weekday,
};
use serde::{Deserialize, Serialize};

use crate::types::PumpCommand;

pub const MINUTES_PER_DAY: u16 = 24 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayOfWeek {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl DayOfWeek {
    pub fn index(self) -> usize {
        match self {
            Self::Mon => 0,
            Self::Tue => 1,
            Self::Wed => 2,
            Self::Thu => 3,
            Self::Fri => 4,
            Self::Sat => 5,
            Self::Sun => 6,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index % 7 {
            0 => Self::Mon,
            1 => Self::Tue,
            2 => Self::Wed,
            3 => Self::Thu,
            4 => Self::Fri,
            5 => Self::Sat,
            _ => Self::Sun,
        }
    }

    pub fn from_chrono(weekday: Weekday) -> Self {
        Self::from_index(weekday.num_days_from_monday() as usize)
    }
}

fn enabled_by_default() -> bool {
    true
}

/// One irrigation slot: run the pump for `duration_minutes` starting at
/// `start_minutes` past local midnight on each of `days`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub days: Vec<DayOfWeek>,
    #[serde(rename = "startMinutes")]
    pub start_minutes: u16,
    #[serde(rename = "durationMinutes")]
    pub duration_minutes: u32,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

impl ScheduleEntry {
    pub fn duration_ms(&self) -> u64 {
        u64::from(self.duration_minutes) * 60_000
    }

    pub fn validate(&self, max_duration_ms: u32) -> bool {
        !self.days.is_empty()
            && self.start_minutes < MINUTES_PER_DAY
            && self.duration_minutes > 0
            && self.duration_ms() <= u64::from(max_duration_ms)
    }

    fn runs_on(&self, day: DayOfWeek) -> bool {
        self.days.contains(&day)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Schedule {
    pub enabled: bool,
    pub entries: Vec<ScheduleEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledRun {
    pub start_minutes: u16,
    pub duration_ms: u32,
}

impl ScheduledRun {
    pub fn command(self) -> PumpCommand {
        PumpCommand::on_for(self.duration_ms)
    }
}

impl Schedule {
    pub fn normalize(&mut self, max_duration_ms: u32) {
        for entry in &mut self.entries {
            entry.days.sort();
            entry.days.dedup();
        }
        self.entries.retain(|entry| entry.validate(max_duration_ms));
        self.entries.sort_by_key(|entry| {
            (
                entry.days.first().map(|day| day.index()),
                entry.start_minutes,
            )
        });
    }

    /// The run that starts in the current minute, if any. When several
    /// entries start together the longest one wins.
    pub fn due_run(&self, now: DateTime<FixedOffset>) -> Option<ScheduledRun> {
        if !self.enabled {
            return None;
        }

        let day = DayOfWeek::from_chrono(now.weekday());
        let current_minutes = now.hour() as u16 * 60 + now.minute() as u16;

        self.entries
            .iter()
            .filter(|entry| {
                entry.enabled && entry.runs_on(day) && entry.start_minutes == current_minutes
            })
            .max_by_key(|entry| entry.duration_minutes)
            .and_then(|entry| {
                let duration_ms = u32::try_from(entry.duration_ms()).ok()?;
                Some(ScheduledRun {
                    start_minutes: entry.start_minutes,
                    duration_ms,
                })
            })
    }

    /// Epoch seconds of the next enabled start after `now`, resolved in the
    /// zone `now` carries so a daylight-saving change inside the week shifts
    /// the result. A start the zone skips never fires and is passed over. A
    /// start that occurs twice fires first at the earlier instant.
    pub fn next_event_epoch<Tz: TimeZone>(&self, now: DateTime<Tz>) -> Option<i64> {
        if !self.enabled || self.entries.is_empty() {
            return None;
        }

        let zone = now.timezone();
        let today = now.date_naive();
        let now_day = DayOfWeek::from_chrono(now.weekday());
        let now_minute = now.hour() as i64 * 60 + now.minute() as i64;

        let mut best: Option<i64> = None;

        // Two weeks, so a start skipped this week still finds next week's.
        for day_offset in 0..=14i64 {
            let day = DayOfWeek::from_index((now_day.index() + day_offset as usize) % 7);
            for entry in self
                .entries
                .iter()
                .filter(|entry| entry.enabled && entry.runs_on(day))
            {
                if day_offset == 0 && entry.start_minutes as i64 <= now_minute {
                    continue;
                }

                let hour = (entry.start_minutes / 60) as u32;
                let minute = (entry.start_minutes % 60) as u32;
                let Some(naive) = (today + Duration::days(day_offset)).and_hms_opt(hour, minute, 0)
                else {
                    continue;
                };

                let candidate = match zone.from_local_datetime(&naive) {
                    LocalResult::Single(at) => at.timestamp(),
                    LocalResult::Ambiguous(earlier, _) => earlier.timestamp(),
                    LocalResult::None => continue,
                };

                if best.map(|current| candidate < current).unwrap_or(true) {
                    best = Some(candidate);
                }
            }

            if best.is_some() && day_offset >= 7 {
                break;
            }
        }

        best
    }
}

/// Turns a [`Schedule`] into pump commands, firing each start minute once.
#[derive(Debug, Clone, Default)]
pub struct IrrigationTrigger {
    last_fired_minute: Option<i64>,
}

impl IrrigationTrigger {
    pub fn poll(&mut self, schedule: &Schedule, now: DateTime<FixedOffset>) -> Option<ScheduledRun> {
        let minute = now.timestamp().div_euclid(60);
        if self.last_fired_minute == Some(minute) {
            return None;
        }

        let run = schedule.due_run(now)?;
        self.last_fired_minute = Some(minute);
        Some(run)
    }

    /// Forget the last firing, e.g. after the schedule was replaced.
    pub fn reset(&mut self) {
        self.last_fired_minute = None;
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use chrono_tz::Europe::Rome;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::MAX_DEADLINE_SPAN_MS;

    fn fixed_time(day: u32, hour: u32, minute: u32, second: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(3600)
            .unwrap()
            .with_ymd_and_hms(2026, 1, day, hour, minute, second)
            .unwrap()
    }

    fn entry(days: &[DayOfWeek], start_minutes: u16, duration_minutes: u32) -> ScheduleEntry {
        ScheduleEntry {
            days: days.to_vec(),
            start_minutes,
            duration_minutes,
            enabled: true,
        }
    }

    #[test]
    fn normalize_drops_invalid_entries() {
        let mut schedule = Schedule {
            enabled: true,
            entries: vec![
                entry(&[DayOfWeek::Wed, DayOfWeek::Mon, DayOfWeek::Wed], 7 * 60, 10),
                entry(&[], 8 * 60, 10),
                entry(&[DayOfWeek::Tue], MINUTES_PER_DAY, 10),
                entry(&[DayOfWeek::Tue], 6 * 60, 0),
                entry(&[DayOfWeek::Tue], 6 * 60, 121),
                entry(&[DayOfWeek::Sun], 5 * 60, 5),
            ],
        };

        schedule.normalize(120 * 60_000);

        assert_eq!(
            schedule.entries,
            vec![
                entry(&[DayOfWeek::Mon, DayOfWeek::Wed], 7 * 60, 10),
                entry(&[DayOfWeek::Sun], 5 * 60, 5),
            ]
        );
    }

    #[test]
    fn due_run_matches_day_and_minute() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Mon, DayOfWeek::Thu], 6 * 60 + 30, 15)],
        };

        // Jan 5, 2026 is a Monday.
        let run = schedule.due_run(fixed_time(5, 6, 30, 45)).unwrap();
        assert_eq!(run.duration_ms, 15 * 60_000);
        assert_eq!(run.command(), PumpCommand::on_for(900_000));

        assert_eq!(schedule.due_run(fixed_time(5, 6, 31, 0)), None);
        assert_eq!(schedule.due_run(fixed_time(6, 6, 30, 0)), None);
        assert!(schedule.due_run(fixed_time(8, 6, 30, 0)).is_some());
    }

    #[test]
    fn disabled_schedule_or_entry_never_runs() {
        let mut schedule = Schedule {
            enabled: false,
            entries: vec![entry(&[DayOfWeek::Mon], 6 * 60, 15)],
        };
        assert_eq!(schedule.due_run(fixed_time(5, 6, 0, 0)), None);

        schedule.enabled = true;
        schedule.entries[0].enabled = false;
        assert_eq!(schedule.due_run(fixed_time(5, 6, 0, 0)), None);
        assert_eq!(schedule.next_event_epoch(fixed_time(5, 5, 0, 0)), None);
    }

    #[test]
    fn overlapping_entries_pick_longest() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![
                entry(&[DayOfWeek::Mon], 6 * 60, 5),
                entry(&[DayOfWeek::Mon], 6 * 60, 20),
            ],
        };

        let run = schedule.due_run(fixed_time(5, 6, 0, 0)).unwrap();
        assert_eq!(run.duration_ms, 20 * 60_000);
    }

    #[test]
    fn trigger_fires_once_per_minute() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Mon], 6 * 60, 5)],
        };
        let mut trigger = IrrigationTrigger::default();

        assert!(trigger.poll(&schedule, fixed_time(5, 5, 59, 59)).is_none());
        assert!(trigger.poll(&schedule, fixed_time(5, 6, 0, 0)).is_some());
        assert!(trigger.poll(&schedule, fixed_time(5, 6, 0, 30)).is_none());
        assert!(trigger.poll(&schedule, fixed_time(5, 6, 0, 59)).is_none());
        assert!(trigger.poll(&schedule, fixed_time(5, 6, 1, 0)).is_none());

        trigger.reset();
        assert!(trigger.poll(&schedule, fixed_time(5, 6, 0, 59)).is_some());
    }

    #[test]
    fn next_event_wraps_to_next_week() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Mon], 6 * 60, 5)],
        };

        let next = schedule.next_event_epoch(fixed_time(5, 6, 0, 10)).unwrap();
        assert_eq!(next, fixed_time(12, 6, 0, 0).timestamp());
    }

    #[test]
    fn next_event_later_today() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![
                entry(&[DayOfWeek::Mon], 6 * 60, 5),
                entry(&[DayOfWeek::Mon, DayOfWeek::Tue], 19 * 60, 5),
            ],
        };

        let next = schedule.next_event_epoch(fixed_time(5, 7, 0, 0)).unwrap();
        assert_eq!(next, fixed_time(5, 19, 0, 0).timestamp());
    }

    #[test]
    fn next_event_follows_daylight_saving_start() {
        // DST starts in Rome on Sunday 2026-03-29.
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Sun], 10 * 60, 5)],
        };
        let now = Rome.with_ymd_and_hms(2026, 3, 27, 12, 0, 0).unwrap();

        let next = schedule.next_event_epoch(now).unwrap();

        assert_eq!(next, 1_774_771_200);
        assert_eq!(next, Rome.with_ymd_and_hms(2026, 3, 29, 10, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn next_event_skips_start_lost_to_daylight_saving() {
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Sun], 2 * 60 + 30, 5)],
        };
        let now = Rome.with_ymd_and_hms(2026, 3, 27, 12, 0, 0).unwrap();

        let next = schedule.next_event_epoch(now).unwrap();

        assert_eq!(next, Rome.with_ymd_and_hms(2026, 4, 5, 2, 30, 0).unwrap().timestamp());
    }

    #[test]
    fn next_event_takes_earlier_of_repeated_start() {
        // 02:30 occurs twice in Rome on Sunday 2026-10-25.
        let schedule = Schedule {
            enabled: true,
            entries: vec![entry(&[DayOfWeek::Sun], 2 * 60 + 30, 5)],
        };
        let now = Rome.with_ymd_and_hms(2026, 10, 23, 12, 0, 0).unwrap();

        let next = schedule.next_event_epoch(now).unwrap();

        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 10, 25, 0, 30, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn parses_dashboard_payload() {
        let mut schedule: Schedule = serde_json::from_str(
            r#"{"enabled":true,"entries":[{"days":["SAT","SUN"],"startMinutes":420,"durationMinutes":10}]}"#,
        )
        .unwrap();
        schedule.normalize(MAX_DEADLINE_SPAN_MS);

        assert_eq!(
            schedule.entries,
            vec![entry(&[DayOfWeek::Sat, DayOfWeek::Sun], 420, 10)]
        );
    }
}
