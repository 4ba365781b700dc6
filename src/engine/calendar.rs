use chrono::{NaiveDate, NaiveTime, TimeDelta};

use crate::model::*;

/// Read-only view of one staff member's calendar constraints, with unset
/// fields resolved against the process-wide `Config`.
///
/// A missing `Config` means every fallback is zero: no slot duration (and
/// therefore no slots) and no buffer.
#[derive(Debug, Clone, Copy)]
pub struct CalendarView<'a> {
    staff: &'a StaffMember,
    config: Option<&'a Config>,
}

impl<'a> CalendarView<'a> {
    pub fn new(staff: &'a StaffMember, config: Option<&'a Config>) -> Self {
        Self { staff, config }
    }

    pub fn staff(&self) -> &'a StaffMember {
        self.staff
    }

    /// `None` means the staff member does not work that weekday.
    pub fn working_hours_for(&self, day_of_week: Weekday) -> Option<(NaiveTime, NaiveTime)> {
        self.staff
            .working_hours
            .iter()
            .find(|wh| wh.day_of_week == day_of_week)
            .map(|wh| (wh.start_time, wh.end_time))
    }

    /// Slot width in minutes; 0 when neither staff nor config sets one.
    pub fn slot_duration(&self) -> u32 {
        self.staff
            .profile
            .slot_duration_minutes
            .filter(|m| *m > 0)
            .or_else(|| self.config.and_then(|c| c.slot_duration_minutes))
            .unwrap_or(0)
    }

    pub fn slot_width(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.slot_duration()))
    }

    pub fn buffer_minutes(&self) -> f64 {
        self.staff
            .profile
            .buffer_minutes
            .filter(|m| *m > 0.0)
            .or_else(|| self.config.and_then(|c| c.buffer_minutes))
            .unwrap_or(0.0)
    }

    pub fn buffer(&self) -> TimeDelta {
        TimeDelta::milliseconds((self.buffer_minutes() * 60_000.0).round() as i64)
    }

    pub fn is_day_off(&self, date: NaiveDate) -> bool {
        self.staff.days_off.iter().any(|d| d.covers(date))
    }

    /// Day-off takes precedence over a missing schedule.
    pub fn day_status(&self, date: NaiveDate) -> DayStatus {
        if self.is_day_off(date) {
            DayStatus::DayOff
        } else if self.working_hours_for(weekday_of(date)).is_none() {
            DayStatus::NoWorkingHours
        } else {
            DayStatus::Open
        }
    }
}
