use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::model::*;

use super::calendar::CalendarView;
use super::conflict::booking_span;

// ── Availability Algorithm ────────────────────────────────────────

/// Full read path for one staff member, one date and one service.
///
/// `appointments` are that staff member's resolved appointment intervals on
/// `date`. `now` drives the same-day buffer cutoff and elapsed-slot removal.
pub fn slots_for_service(
    calendar: &CalendarView<'_>,
    date: NaiveDate,
    service_duration: TimeDelta,
    appointments: &[Span],
    now: NaiveDateTime,
) -> Vec<NaiveDateTime> {
    let base = generate_base_slots(calendar, date);
    if base.is_empty() {
        return Vec::new();
    }
    // generate_base_slots only yields slots when working hours exist.
    let Some((_, end_time)) = calendar.working_hours_for(weekday_of(date)) else {
        return Vec::new();
    };
    let slot = calendar.slot_width();

    let occupied = occupied_slots(&base, slot, appointments);
    let blocked = blocked_slots(&base, calendar.is_day_off(date), calendar.buffer(), date, now);

    let mut valid = filter_for_service(
        &base,
        slot,
        service_duration,
        date.and_time(end_time),
        &occupied,
        &blocked,
    );
    drop_elapsed(&mut valid, date, now);
    // The last sub-slot may run up to one slot width past closing; never offer
    // a start the booking transaction would refuse for crossing midnight.
    valid.retain(|s| booking_span(date, s.time(), service_duration).is_ok());
    valid
}

/// Equally spaced candidate start times for a day, ascending.
///
/// Empty when the staff member has no working hours that weekday, the date is
/// a day off, or no slot duration is configured. The last slot may run past
/// closing time; containment is checked in `filter_for_service`.
pub fn generate_base_slots(calendar: &CalendarView<'_>, date: NaiveDate) -> Vec<NaiveDateTime> {
    let Some((start_time, end_time)) = calendar.working_hours_for(weekday_of(date)) else {
        return Vec::new();
    };
    if calendar.is_day_off(date) {
        return Vec::new();
    }
    let step = calendar.slot_width();
    if step <= TimeDelta::zero() {
        return Vec::new();
    }

    let end = date.and_time(end_time);
    let mut slots = Vec::new();
    let mut cur = date.and_time(start_time);
    while cur < end {
        slots.push(cur);
        cur += step;
    }
    slots
}

/// Slots that intersect any existing appointment, using the slot width (not
/// the requested service's duration) as each slot's extent.
pub fn occupied_slots(
    base: &[NaiveDateTime],
    slot: TimeDelta,
    appointments: &[Span],
) -> HashSet<NaiveDateTime> {
    let mut occupied = HashSet::new();
    for appt in appointments {
        for &s in base {
            if s < appt.end && s + slot > appt.start {
                occupied.insert(s);
            }
        }
    }
    occupied
}

/// Slots closed by a day off (all of them) or, on the current date only, by
/// the booking buffer: everything strictly before `now + buffer`.
pub fn blocked_slots(
    base: &[NaiveDateTime],
    day_off: bool,
    buffer: TimeDelta,
    date: NaiveDate,
    now: NaiveDateTime,
) -> HashSet<NaiveDateTime> {
    if day_off {
        return base.iter().copied().collect();
    }
    if buffer <= TimeDelta::zero() || date != now.date() {
        return HashSet::new();
    }
    let cutoff = now + buffer;
    base.iter().copied().filter(|s| *s < cutoff).collect()
}

/// Number of consecutive slots a service consumes: `ceil(service / slot)`.
pub fn slots_needed(service_duration: TimeDelta, slot: TimeDelta) -> i64 {
    let service = service_duration.num_seconds();
    let slot = slot.num_seconds();
    if slot <= 0 {
        return 0;
    }
    (service + slot - 1).div_euclid(slot)
}

/// Keep start times whose whole run of sub-slots stays before `working_end`
/// and avoids every occupied and blocked slot. Input order is preserved.
pub fn filter_for_service(
    base: &[NaiveDateTime],
    slot: TimeDelta,
    service_duration: TimeDelta,
    working_end: NaiveDateTime,
    occupied: &HashSet<NaiveDateTime>,
    blocked: &HashSet<NaiveDateTime>,
) -> Vec<NaiveDateTime> {
    let needed = slots_needed(service_duration, slot);
    if needed <= 0 {
        return Vec::new();
    }
    base.iter()
        .copied()
        .filter(|&s| {
            (0..needed).all(|j| {
                let sub = s + slot * j as i32;
                sub < working_end && !occupied.contains(&sub) && !blocked.contains(&sub)
            })
        })
        .collect()
}

/// On the current date, drop every start that is not strictly in the future.
pub fn drop_elapsed(slots: &mut Vec<NaiveDateTime>, date: NaiveDate, now: NaiveDateTime) {
    if date == now.date() {
        slots.retain(|s| *s > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    fn mins(n: i64) -> TimeDelta {
        TimeDelta::minutes(n)
    }

    /// 2025-10-28, a Tuesday (weekday 1).
    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 28).unwrap()
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        day().and_hms_opt(h, m, 0).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn make_staff(open: (u32, u32), close: (u32, u32), slot: u32, buffer: Option<f64>) -> StaffMember {
        let mut s = StaffMember::new(
            Ulid::new(),
            StaffProfile {
                slot_duration_minutes: Some(slot),
                buffer_minutes: buffer,
                ..Default::default()
            },
        );
        s.working_hours.push(WorkingHours {
            day_of_week: 1,
            start_time: t(open.0, open.1),
            end_time: t(close.0, close.1),
        });
        s
    }

    /// A "now" on an earlier day, so no same-day rules apply.
    fn yesterday() -> NaiveDateTime {
        at(12, 0) - TimeDelta::days(1)
    }

    // ── generate_base_slots ───────────────────────────────

    #[test]
    fn base_slots_step_by_slot_duration() {
        let s = make_staff((9, 0), (12, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let slots = generate_base_slots(&cal, day());
        assert_eq!(
            slots,
            vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30), at(11, 0), at(11, 30)]
        );
    }

    #[test]
    fn base_slot_may_cross_closing() {
        // 09:00–10:00 with 45-minute slots: 09:45 starts before closing and is kept.
        let s = make_staff((9, 0), (10, 0), 45, None);
        let cal = CalendarView::new(&s, None);
        assert_eq!(generate_base_slots(&cal, day()), vec![at(9, 0), at(9, 45)]);
    }

    #[test]
    fn base_slots_empty_without_working_hours() {
        let s = make_staff((9, 0), (12, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let wednesday = day().succ_opt().unwrap();
        assert!(generate_base_slots(&cal, wednesday).is_empty());
    }

    #[test]
    fn base_slots_empty_on_day_off() {
        let mut s = make_staff((9, 0), (12, 0), 30, None);
        s.days_off.push(DayOff {
            id: Ulid::new(),
            start_date: day(),
            end_date: day(),
            description: None,
        });
        let cal = CalendarView::new(&s, None);
        assert!(generate_base_slots(&cal, day()).is_empty());
    }

    #[test]
    fn base_slots_empty_without_slot_duration() {
        let mut s = make_staff((9, 0), (12, 0), 30, None);
        s.profile.slot_duration_minutes = None;
        let cal = CalendarView::new(&s, None);
        assert!(generate_base_slots(&cal, day()).is_empty());
    }

    // ── occupied_slots / blocked_slots ────────────────────

    #[test]
    fn occupied_uses_slot_width() {
        let base = vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30)];
        // 09:45–10:05 touches the 09:30 and 10:00 slots.
        let appts = [Span::new(at(9, 45), at(10, 5))];
        let occ = occupied_slots(&base, mins(30), &appts);
        assert_eq!(occ, HashSet::from([at(9, 30), at(10, 0)]));
    }

    #[test]
    fn occupied_adjacent_not_counted() {
        let base = vec![at(9, 0), at(9, 30), at(10, 0)];
        let appts = [Span::new(at(9, 30), at(10, 0))];
        let occ = occupied_slots(&base, mins(30), &appts);
        assert_eq!(occ, HashSet::from([at(9, 30)]));
    }

    #[test]
    fn day_off_blocks_everything() {
        let base = vec![at(9, 0), at(9, 30)];
        let blocked = blocked_slots(&base, true, TimeDelta::zero(), day(), yesterday());
        assert_eq!(blocked.len(), 2);
    }

    #[test]
    fn buffer_blocks_only_today() {
        let base = vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30)];
        let now = at(8, 45);

        let blocked = blocked_slots(&base, false, mins(60), day(), now);
        // cutoff 09:45: 09:00 and 09:30 blocked.
        assert_eq!(blocked, HashSet::from([at(9, 0), at(9, 30)]));

        let tomorrow = blocked_slots(&base, false, mins(60), day(), now - TimeDelta::days(1));
        assert!(tomorrow.is_empty());
    }

    #[test]
    fn zero_buffer_blocks_nothing() {
        let base = vec![at(9, 0)];
        assert!(blocked_slots(&base, false, TimeDelta::zero(), day(), at(8, 0)).is_empty());
    }

    // ── slots_needed / filter_for_service ─────────────────

    #[test]
    fn slots_needed_rounds_up() {
        assert_eq!(slots_needed(mins(30), mins(30)), 1);
        assert_eq!(slots_needed(mins(10), mins(30)), 1);
        assert_eq!(slots_needed(mins(31), mins(30)), 2);
        assert_eq!(slots_needed(mins(90), mins(30)), 3);
        assert_eq!(slots_needed(mins(90), TimeDelta::zero()), 0);
    }

    #[test]
    fn service_must_fit_before_closing() {
        // 09:00–11:00, 30-minute slots, 90-minute service.
        let base = vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30)];
        let valid = filter_for_service(
            &base,
            mins(30),
            mins(90),
            at(11, 0),
            &HashSet::new(),
            &HashSet::new(),
        );
        // 09:30 needs 09:30, 10:00, 10:30, all strictly before 11:00.
        assert_eq!(valid, vec![at(9, 0), at(9, 30)]);
    }

    #[test]
    fn any_sub_slot_collision_rejects_start() {
        let base = vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30), at(11, 0)];
        let occupied = HashSet::from([at(10, 0)]);
        let blocked = HashSet::from([at(11, 0)]);
        let valid = filter_for_service(&base, mins(30), mins(60), at(12, 0), &occupied, &blocked);
        assert_eq!(valid, vec![at(9, 0)]);
    }

    // ── slots_for_service ─────────────────────────────────

    #[test]
    fn open_morning_thirty_minute_service() {
        let s = make_staff((9, 0), (12, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let slots = slots_for_service(&cal, day(), mins(30), &[], yesterday());
        assert_eq!(
            slots,
            vec![at(9, 0), at(9, 30), at(10, 0), at(10, 30), at(11, 0), at(11, 30)]
        );
    }

    #[test]
    fn existing_appointment_removes_its_slot() {
        let s = make_staff((9, 0), (12, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let appts = [Span::new(at(10, 0), at(10, 30))];
        let slots = slots_for_service(&cal, day(), mins(30), &appts, yesterday());
        assert!(!slots.contains(&at(10, 0)));
        assert!(slots.contains(&at(9, 30)));
        assert!(slots.contains(&at(11, 0)));
    }

    #[test]
    fn ninety_minute_service_in_two_hour_window() {
        let s = make_staff((9, 0), (11, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let slots = slots_for_service(&cal, day(), mins(90), &[], yesterday());
        assert_eq!(slots, vec![at(9, 0), at(9, 30)]);
    }

    #[test]
    fn today_drops_elapsed_and_buffered_slots() {
        let s = make_staff((9, 0), (12, 0), 30, Some(30.0));
        let cal = CalendarView::new(&s, None);
        // now 09:40: buffer cutoff 10:10 blocks 09:00–10:00; elapsed drops the rest before now.
        let slots = slots_for_service(&cal, day(), mins(30), &[], at(9, 40));
        assert_eq!(slots, vec![at(10, 30), at(11, 0), at(11, 30)]);
    }

    #[test]
    fn today_without_buffer_keeps_strictly_future_starts() {
        let s = make_staff((9, 0), (12, 0), 30, None);
        let cal = CalendarView::new(&s, None);
        let slots = slots_for_service(&cal, day(), mins(30), &[], at(10, 0));
        // 10:00 is not strictly after now.
        assert_eq!(slots, vec![at(10, 30), at(11, 0), at(11, 30)]);
    }

    #[test]
    fn past_date_is_not_filtered_by_now() {
        let s = make_staff((9, 0), (10, 0), 30, Some(120.0));
        let cal = CalendarView::new(&s, None);
        let now = at(23, 0) + TimeDelta::days(7);
        assert_eq!(slots_for_service(&cal, day(), mins(30), &[], now), vec![at(9, 0), at(9, 30)]);
    }

    #[test]
    fn same_inputs_same_output() {
        let s = make_staff((8, 0), (18, 0), 15, None);
        let cal = CalendarView::new(&s, None);
        let appts = [
            Span::new(at(9, 10), at(9, 50)),
            Span::new(at(13, 0), at(14, 0)),
        ];
        let a = slots_for_service(&cal, day(), mins(45), &appts, yesterday());
        let b = slots_for_service(&cal, day(), mins(45), &appts, yesterday());
        assert_eq!(a, b);
        assert!(a.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn no_returned_run_touches_an_appointment_or_closing() {
        let s = make_staff((8, 0), (17, 0), 20, None);
        let cal = CalendarView::new(&s, None);
        let appts = [
            Span::new(at(8, 30), at(9, 15)),
            Span::new(at(12, 0), at(12, 40)),
            Span::new(at(16, 10), at(16, 20)),
        ];
        let service = mins(50);
        let slots = slots_for_service(&cal, day(), service, &appts, yesterday());
        assert!(!slots.is_empty());
        for s in slots {
            let run = Span::new(s, s + mins(20) * slots_needed(service, mins(20)) as i32);
            assert!(run.end <= at(17, 0));
            for a in &appts {
                assert!(!Span::new(s, s + service).overlaps(a), "{s} overlaps {a:?}");
            }
        }
    }
}
