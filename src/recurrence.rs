//! Expansion of weekly work schedules and schedule overrides into concrete
//! UTC intervals.
//!
//! All wall-clock inputs are interpreted in the business's timezone and
//! converted to UTC before any comparison. Intervals are half-open
//! `[start, end)`.

use chrono::{
    DateTime, Datelike, Duration, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use chrono_tz::Tz;

use crate::models::{OverrideKind, OverrideRow, RepeatFrequency, WorkScheduleRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Interval { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains(&self, other: &Interval) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn clipped_to(&self, window: &Interval) -> Interval {
        Interval {
            start: self.start.max(window.start),
            end: self.end.min(window.end),
        }
    }
}

/// Resolve a wall-clock datetime in `tz` to UTC. Ambiguous local times (DST
/// fall-back) take the earlier instant; nonexistent local times (DST gap)
/// resolve to `None` and the caller skips that occurrence.
fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earlier, _) => Some(earlier.with_timezone(&Utc)),
        LocalResult::None => None,
    }
}

/// Expand a weekly work-schedule entry into concrete working intervals inside
/// `window`. Lunch breaks split the day into two intervals; shifts whose end
/// time precedes their start time roll over midnight.
pub fn expand_schedule(entry: &WorkScheduleRow, tz: Tz, window: Interval) -> Vec<Interval> {
    let mut out = Vec::new();
    if !entry.is_working {
        return out;
    }
    let (start_time, end_time) = match (entry.start_time, entry.end_time) {
        (Some(s), Some(e)) => (s, e),
        _ => return out,
    };

    // Start one day early so an overnight shift beginning the previous
    // evening still lands in the window.
    let mut date = window.start.with_timezone(&tz).date_naive() - Duration::days(1);
    let last = window.end.with_timezone(&tz).date_naive();

    while date <= last {
        if i64::from(date.weekday().num_days_from_sunday()) == entry.day_of_week {
            let day_start = date.and_time(start_time);
            let day_end = if end_time <= start_time {
                (date + Duration::days(1)).and_time(end_time)
            } else {
                date.and_time(end_time)
            };

            let segments = match (entry.lunch_start, entry.lunch_end) {
                (Some(ls), Some(le)) if start_time < ls && ls < le && le < end_time => {
                    vec![
                        (day_start, date.and_time(ls)),
                        (date.and_time(le), day_end),
                    ]
                }
                _ => vec![(day_start, day_end)],
            };

            for (s, e) in segments {
                if let (Some(start), Some(end)) = (localize(tz, s), localize(tz, e)) {
                    let interval = Interval::new(start, end);
                    if interval.overlaps(&window) {
                        out.push(interval.clipped_to(&window));
                    }
                }
            }
        }
        date += Duration::days(1);
    }
    out
}

/// Expand a schedule override into its instances inside `window`, clipped to
/// the window. Every instance keeps the original duration. Monthly and
/// yearly cycles whose target month lacks the anchor's day-of-month are
/// skipped, never shifted to a neighboring day.
pub fn expand_override(ov: &OverrideRow, window: Interval) -> Vec<Interval> {
    let mut out = Vec::new();
    let duration = ov.ends_at - ov.starts_at;
    if duration <= Duration::zero() || window.is_empty() {
        return out;
    }

    let mut push = |start: DateTime<Utc>| {
        let instance = Interval::new(start, start + duration);
        if instance.overlaps(&window) {
            out.push(instance.clipped_to(&window));
        }
    };

    match ov.repeat {
        RepeatFrequency::None => push(ov.starts_at),
        RepeatFrequency::Daily | RepeatFrequency::Weekly => {
            let step = if ov.repeat == RepeatFrequency::Daily {
                Duration::days(1)
            } else {
                Duration::weeks(1)
            };
            let mut current = ov.starts_at;
            while current < window.end {
                push(current);
                current += step;
            }
        }
        RepeatFrequency::Monthly => {
            let anchor = ov.starts_at.naive_utc();
            let (mut year, mut month) = (anchor.year(), anchor.month());
            loop {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, anchor.day()) {
                    let start = Utc.from_utc_datetime(&date.and_time(anchor.time()));
                    if start >= window.end {
                        break;
                    }
                    push(start);
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
                // Terminates even across skipped cycles: stop once the month
                // itself is past the window.
                let Some(month_start) = NaiveDate::from_ymd_opt(year, month, 1) else {
                    break;
                };
                if Utc.from_utc_datetime(&month_start.and_time(NaiveTime::MIN)) >= window.end {
                    break;
                }
            }
        }
        RepeatFrequency::Yearly => {
            let anchor = ov.starts_at.naive_utc();
            let mut year = anchor.year();
            loop {
                if let Some(date) = NaiveDate::from_ymd_opt(year, anchor.month(), anchor.day()) {
                    let start = Utc.from_utc_datetime(&date.and_time(anchor.time()));
                    if start >= window.end {
                        break;
                    }
                    push(start);
                }
                year += 1;
                let Some(year_start) = NaiveDate::from_ymd_opt(year, 1, 1) else {
                    break;
                };
                if Utc.from_utc_datetime(&year_start.and_time(NaiveTime::MIN)) >= window.end {
                    break;
                }
            }
        }
    }
    out
}

/// Merge overlapping or touching intervals into a sorted, disjoint set.
pub fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|iv| !iv.is_empty());
    intervals.sort_by_key(|iv| iv.start);
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end => last.end = last.end.max(iv.end),
            _ => merged.push(iv),
        }
    }
    merged
}

/// Remove `cuts` from `intervals`. Both sides may be unsorted; the result is
/// merged and sorted.
pub fn subtract(intervals: Vec<Interval>, cuts: &[Interval]) -> Vec<Interval> {
    let mut remaining = merge(intervals);
    for cut in merge(cuts.to_vec()) {
        let mut next = Vec::with_capacity(remaining.len() + 1);
        for iv in remaining {
            if !iv.overlaps(&cut) {
                next.push(iv);
                continue;
            }
            if iv.start < cut.start {
                next.push(Interval::new(iv.start, cut.start));
            }
            if cut.end < iv.end {
                next.push(Interval::new(cut.end, iv.end));
            }
        }
        remaining = next;
    }
    remaining
}

/// The employee's effective working intervals inside `window`: the weekly
/// template plus extra-hours overrides, minus closures.
pub fn working_intervals(
    schedules: &[WorkScheduleRow],
    overrides: &[OverrideRow],
    tz: Tz,
    window: Interval,
) -> Vec<Interval> {
    let mut base: Vec<Interval> = schedules
        .iter()
        .flat_map(|entry| expand_schedule(entry, tz, window))
        .collect();

    let mut closures = Vec::new();
    for ov in overrides {
        let instances = expand_override(ov, window);
        match ov.kind {
            OverrideKind::ExtraHours => base.extend(instances),
            OverrideKind::Closure => closures.extend(instances),
        }
    }

    subtract(base, &closures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule(day_of_week: i64, start: NaiveTime, end: NaiveTime) -> WorkScheduleRow {
        WorkScheduleRow {
            id: "s1".into(),
            employee_id: "e1".into(),
            day_of_week,
            start_time: Some(start),
            end_time: Some(end),
            lunch_start: None,
            lunch_end: None,
            is_working: true,
        }
    }

    fn override_row(
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        repeat: RepeatFrequency,
        kind: OverrideKind,
    ) -> OverrideRow {
        OverrideRow {
            id: "o1".into(),
            business_id: "b1".into(),
            employee_id: Some("e1".into()),
            starts_at,
            ends_at,
            repeat,
            kind,
            reason: None,
        }
    }

    #[test]
    fn weekly_schedule_expands_one_interval_per_matching_day() {
        // 2026-01-05 is a Monday (day_of_week 1).
        let entry = schedule(1, t(9, 0), t(17, 0));
        let window = Interval::new(utc(2026, 1, 4, 0, 0), utc(2026, 1, 19, 0, 0));
        let out = expand_schedule(&entry, chrono_tz::UTC, window);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].start, utc(2026, 1, 5, 9, 0));
        assert_eq!(out[0].end, utc(2026, 1, 5, 17, 0));
        assert_eq!(out[1].start, utc(2026, 1, 12, 9, 0));
    }

    #[test]
    fn lunch_break_splits_the_day() {
        let mut entry = schedule(1, t(9, 0), t(17, 0));
        entry.lunch_start = Some(t(12, 0));
        entry.lunch_end = Some(t(13, 0));
        let window = Interval::new(utc(2026, 1, 5, 0, 0), utc(2026, 1, 6, 0, 0));
        let out = expand_schedule(&entry, chrono_tz::UTC, window);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].end, utc(2026, 1, 5, 12, 0));
        assert_eq!(out[1].start, utc(2026, 1, 5, 13, 0));
    }

    #[test]
    fn overnight_shift_rolls_into_the_next_day() {
        // Saturday 22:00 -> Sunday 02:00.
        let entry = schedule(6, t(22, 0), t(2, 0));
        let window = Interval::new(utc(2026, 1, 10, 0, 0), utc(2026, 1, 12, 0, 0));
        let out = expand_schedule(&entry, chrono_tz::UTC, window);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, utc(2026, 1, 10, 22, 0));
        assert_eq!(out[0].end, utc(2026, 1, 11, 2, 0));
    }

    #[test]
    fn schedule_times_are_localized_to_the_business_timezone() {
        // Monday 09:00 Pacific is 17:00 UTC in January (PST, UTC-8).
        let entry = schedule(1, t(9, 0), t(17, 0));
        let window = Interval::new(utc(2026, 1, 5, 0, 0), utc(2026, 1, 7, 0, 0));
        let out = expand_schedule(&entry, chrono_tz::America::Los_Angeles, window);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start, utc(2026, 1, 5, 17, 0));
    }

    #[test]
    fn none_frequency_round_trip() {
        let ov = override_row(
            utc(2026, 3, 10, 9, 0),
            utc(2026, 3, 10, 12, 0),
            RepeatFrequency::None,
            OverrideKind::Closure,
        );
        let inside = Interval::new(utc(2026, 3, 1, 0, 0), utc(2026, 4, 1, 0, 0));
        assert_eq!(expand_override(&ov, inside).len(), 1);

        let outside = Interval::new(utc(2026, 4, 1, 0, 0), utc(2026, 5, 1, 0, 0));
        assert!(expand_override(&ov, outside).is_empty());
    }

    #[test]
    fn daily_and_weekly_keep_the_original_duration() {
        let ov = override_row(
            utc(2026, 3, 1, 9, 0),
            utc(2026, 3, 1, 10, 30),
            RepeatFrequency::Daily,
            OverrideKind::Closure,
        );
        let window = Interval::new(utc(2026, 3, 1, 0, 0), utc(2026, 3, 4, 0, 0));
        let out = expand_override(&ov, window);
        assert_eq!(out.len(), 3);
        for iv in &out {
            assert_eq!(iv.end - iv.start, Duration::minutes(90));
        }

        let weekly = override_row(
            utc(2026, 3, 1, 9, 0),
            utc(2026, 3, 1, 10, 0),
            RepeatFrequency::Weekly,
            OverrideKind::Closure,
        );
        let month = Interval::new(utc(2026, 3, 1, 0, 0), utc(2026, 3, 29, 0, 0));
        assert_eq!(expand_override(&weekly, month).len(), 4);
    }

    #[test]
    fn monthly_skips_months_without_the_anchor_day() {
        let ov = override_row(
            utc(2026, 1, 31, 9, 0),
            utc(2026, 1, 31, 10, 0),
            RepeatFrequency::Monthly,
            OverrideKind::Closure,
        );
        let window = Interval::new(utc(2026, 1, 1, 0, 0), utc(2026, 6, 1, 0, 0));
        let out = expand_override(&ov, window);
        // Jan, Mar, May have a 31st; Feb and Apr are skipped.
        assert_eq!(out.len(), 3);
        assert_eq!(out[1].start, utc(2026, 3, 31, 9, 0));
        assert_eq!(out[2].start, utc(2026, 5, 31, 9, 0));
    }

    #[test]
    fn yearly_skips_feb_29_outside_leap_years() {
        let ov = override_row(
            utc(2024, 2, 29, 9, 0),
            utc(2024, 2, 29, 17, 0),
            RepeatFrequency::Yearly,
            OverrideKind::Closure,
        );
        let window = Interval::new(utc(2024, 1, 1, 0, 0), utc(2029, 1, 1, 0, 0));
        let out = expand_override(&ov, window);
        // Only 2024 and 2028 are leap years in the window.
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].start, utc(2028, 2, 29, 9, 0));
    }

    #[test]
    fn instances_are_clipped_to_the_window() {
        let ov = override_row(
            utc(2026, 3, 10, 9, 0),
            utc(2026, 3, 10, 17, 0),
            RepeatFrequency::None,
            OverrideKind::Closure,
        );
        let window = Interval::new(utc(2026, 3, 10, 12, 0), utc(2026, 3, 10, 14, 0));
        let out = expand_override(&ov, window);
        assert_eq!(out, vec![window]);
    }

    #[test]
    fn closures_subtract_and_extra_hours_add() {
        let entry = schedule(1, t(9, 0), t(17, 0));
        let closure = override_row(
            utc(2026, 1, 5, 12, 0),
            utc(2026, 1, 5, 13, 0),
            RepeatFrequency::None,
            OverrideKind::Closure,
        );
        let extra = override_row(
            utc(2026, 1, 5, 18, 0),
            utc(2026, 1, 5, 20, 0),
            RepeatFrequency::None,
            OverrideKind::ExtraHours,
        );
        let window = Interval::new(utc(2026, 1, 5, 0, 0), utc(2026, 1, 6, 0, 0));
        let out = working_intervals(
            &[entry],
            &[closure, extra],
            chrono_tz::UTC,
            window,
        );
        assert_eq!(
            out,
            vec![
                Interval::new(utc(2026, 1, 5, 9, 0), utc(2026, 1, 5, 12, 0)),
                Interval::new(utc(2026, 1, 5, 13, 0), utc(2026, 1, 5, 17, 0)),
                Interval::new(utc(2026, 1, 5, 18, 0), utc(2026, 1, 5, 20, 0)),
            ]
        );
    }

    #[test]
    fn merge_coalesces_touching_intervals() {
        let merged = merge(vec![
            Interval::new(utc(2026, 1, 5, 13, 0), utc(2026, 1, 5, 17, 0)),
            Interval::new(utc(2026, 1, 5, 9, 0), utc(2026, 1, 5, 13, 0)),
        ]);
        assert_eq!(
            merged,
            vec![Interval::new(utc(2026, 1, 5, 9, 0), utc(2026, 1, 5, 17, 0))]
        );
    }
}
