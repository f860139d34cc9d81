//! Time-slot reservation resolver
//!
//! Quota needed by upcoming daily slots is withheld ahead of time. Every
//! occurrence of an enabled slot that intersects `[now, now + window]`
//! contributes `required_load × overlap / window`.

use crate::config::TimeSlotReservation;
use crate::engine::clamp_percent;
use crate::window::to_chrono;
use chrono::{Days, NaiveDate, NaiveDateTime};
use std::time::Duration;
use tracing::debug;

/// Percentage withheld for upcoming reservations over the horizon
/// `[now, now + window_length]`
pub fn resolve(
    now: NaiveDateTime,
    reservations: &[TimeSlotReservation],
    window_length: Duration,
) -> f64 {
    let window_secs = window_length.as_secs_f64();
    if window_secs <= 0.0 {
        return 0.0;
    }
    let Some(horizon_end) = now.checked_add_signed(to_chrono(window_length)) else {
        return 0.0;
    };

    // One day back catches an occurrence that started yesterday and is still running
    let days_ahead = window_length.as_secs().div_ceil(86_400) + 1;

    let mut reserved = 0.0;
    for slot in reservations.iter().filter(|s| s.enabled) {
        let mut slot_reserved = 0.0;
        for offset in -1..=days_ahead as i64 {
            let Some((start, end)) = occurrence(slot, now.date(), offset) else {
                continue;
            };
            let overlap_start = start.max(now);
            let overlap_end = end.min(horizon_end);
            if overlap_end <= overlap_start {
                continue;
            }
            let overlap_secs = (overlap_end - overlap_start).num_milliseconds() as f64 / 1000.0;
            slot_reserved += slot.required_load_percent * overlap_secs / window_secs;
        }

        if slot_reserved > 0.0 {
            debug!(
                slot = %slot.name,
                start = %slot.start.format("%H:%M"),
                end = %slot.end.format("%H:%M"),
                reserved_percent = slot_reserved,
                "Reserving quota for time slot"
            );
        }
        reserved += slot_reserved;
    }

    reserved
}

/// Subtract the reservation from a recommendation, keeping it within bounds
pub fn apply_reservation(recommended: f64, reserved: f64, min_load: f64, max_load: f64) -> f64 {
    clamp_percent(recommended - reserved.max(0.0), min_load, max_load)
}

/// The slot's occurrence starting on `base + offset` days. `end <= start`
/// rolls the end over to the following day.
fn occurrence(
    slot: &TimeSlotReservation,
    base: NaiveDate,
    offset: i64,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let day = if offset >= 0 {
        base.checked_add_days(Days::new(offset as u64))?
    } else {
        base.checked_sub_days(Days::new(offset.unsigned_abs()))?
    };

    let start = day.and_time(slot.start);
    let end_day = if slot.end <= slot.start {
        day.checked_add_days(Days::new(1))?
    } else {
        day
    };
    Some((start, end_day.and_time(slot.end)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn slot(start: (u32, u32), end: (u32, u32), load: f64) -> TimeSlotReservation {
        TimeSlotReservation::new(
            format!("{:02}:{:02}", start.0, start.1),
            NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap(),
            NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap(),
            load,
        )
    }

    const DAY: Duration = Duration::from_secs(24 * 3600);

    #[test]
    fn test_no_slots_reserve_nothing() {
        assert_eq!(resolve(at(12, 0), &[], DAY), 0.0);
    }

    #[test]
    fn test_future_slot_weighted_by_duration() {
        // 2h at 60% over a 24h horizon
        let reserved = resolve(at(8, 0), &[slot((14, 0), (16, 0), 60.0)], DAY);
        assert!((reserved - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_slots_add_up() {
        let slots = [slot((14, 0), (16, 0), 60.0), slot((15, 0), (18, 0), 48.0)];

        let reserved = resolve(at(8, 0), &slots, DAY);

        // 60 * 2/24 + 48 * 3/24
        assert!((reserved - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_slot_in_progress_counts_only_unelapsed_part() {
        let reserved = resolve(at(15, 0), &[slot((14, 0), (16, 0), 48.0)], DAY);

        // the 1h left today, plus tomorrow's 14:00-15:00 inside the horizon
        assert!((reserved - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_slot_crossing_midnight() {
        let reserved = resolve(at(20, 0), &[slot((22, 0), (2, 0), 24.0)], DAY);

        // 22:00-02:00 is four hours
        assert!((reserved - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_midnight_slot_started_yesterday_is_still_counted() {
        let reserved = resolve(at(1, 0), &[slot((22, 0), (2, 0), 24.0)], DAY);

        // 01:00-02:00 left from last night, then 22:00-01:00 tonight
        assert!((reserved - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_slot_beyond_short_horizon_is_ignored() {
        let reserved = resolve(
            at(8, 0),
            &[slot((14, 0), (16, 0), 60.0)],
            Duration::from_secs(3600),
        );
        assert_eq!(reserved, 0.0);
    }

    #[test]
    fn test_disabled_slot_is_ignored() {
        let mut disabled = slot((14, 0), (16, 0), 60.0);
        disabled.enabled = false;

        assert_eq!(resolve(at(8, 0), &[disabled], DAY), 0.0);
    }

    #[test]
    fn test_reservation_never_drops_below_floor() {
        assert_eq!(apply_reservation(25.0, 40.0, 10.0, 90.0), 10.0);
        assert_eq!(apply_reservation(25.0, 5.0, 10.0, 90.0), 20.0);
        assert_eq!(apply_reservation(25.0, -5.0, 10.0, 90.0), 25.0);
    }
}
