use std::collections::BTreeSet;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Day of week, Monday = 0 … Sunday = 6.
pub type Weekday = u8;

pub fn weekday_of(date: NaiveDate) -> Weekday {
    date.weekday().num_days_from_monday() as Weekday
}

/// Half-open wall-clock interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start <= end, "Span start must not be after end");
        Self { start, end }
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }
}

/// One row of a weekly schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

/// Closed date range `[start_date, end_date]` during which a staff member takes no bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayOff {
    pub id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub description: Option<String>,
}

impl DayOff {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.start_date <= date && date <= self.end_date
    }
}

/// The editable part of a staff member. Schedule and days off are managed separately.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaffProfile {
    pub name: Option<String>,
    /// Falls back to `Config::slot_duration_minutes` when unset.
    pub slot_duration_minutes: Option<u32>,
    /// Falls back to `Config::buffer_minutes` when unset.
    pub buffer_minutes: Option<f64>,
    pub lead_time: Option<NaiveTime>,
    pub finish_time: Option<NaiveTime>,
    pub services_offered: BTreeSet<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaffMember {
    pub id: Ulid,
    pub profile: StaffProfile,
    /// At most one row per weekday, sorted by `day_of_week`.
    pub working_hours: Vec<WorkingHours>,
    pub days_off: Vec<DayOff>,
}

impl StaffMember {
    pub fn new(id: Ulid, profile: StaffProfile) -> Self {
        Self {
            id,
            profile,
            working_hours: Vec::new(),
            days_off: Vec::new(),
        }
    }

    pub fn offers(&self, service_id: &Ulid) -> bool {
        self.profile.services_offered.contains(service_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    /// Always > 0; enforced when the service is defined.
    pub duration_secs: i64,
    /// Price in minor currency units (cents).
    pub price_minor: u64,
    /// ISO 4217 code, e.g. "EUR".
    pub currency: String,
}

impl Service {
    pub fn duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.duration_secs)
    }
}

/// A booked appointment. References are weak: deleting the client, service or
/// staff member nulls the field and the appointment survives as history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub client_id: Option<Ulid>,
    pub service_id: Option<Ulid>,
    pub staff_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    /// Recorded at booking time. Service edits do not rewrite it.
    pub end_time: Option<NaiveTime>,
}

impl Appointment {
    pub fn start(&self) -> NaiveDateTime {
        self.date.and_time(self.start_time)
    }

    pub fn day_key(&self) -> Option<DayKey> {
        self.staff_id.map(|staff_id| DayKey {
            staff_id,
            date: self.date,
        })
    }
}

/// The unit of booking serialization: one staff member's appointments on one date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DayKey {
    pub staff_id: Ulid,
    pub date: NaiveDate,
}

/// Process-wide fallbacks for staff members that leave a field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub slot_duration_minutes: Option<u32>,
    pub lead_time: Option<NaiveTime>,
    pub finish_time: Option<NaiveTime>,
    pub buffer_minutes: Option<f64>,
    pub allow_staff_change_on_reschedule: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            slot_duration_minutes: None,
            lead_time: None,
            finish_time: None,
            buffer_minutes: None,
            allow_staff_change_on_reschedule: true,
        }
    }
}

/// Why a staff member has (or lacks) bookable time on a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DayStatus {
    Open,
    NoWorkingHours,
    DayOff,
}

/// Who should serve an appointment after an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaffChange {
    /// Stay with the currently assigned staff member.
    Keep,
    /// Move to this staff member.
    To(Ulid),
    /// Pick the first staff member offering the service who has the requested slot free.
    AnyAvailable,
}

/// Every state change, in WAL record form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ConfigUpdated {
        config: Config,
    },
    ServiceCreated {
        service: Service,
    },
    ServiceUpdated {
        service: Service,
    },
    ServiceDeleted {
        id: Ulid,
    },
    StaffCreated {
        staff: StaffMember,
    },
    StaffUpdated {
        id: Ulid,
        profile: StaffProfile,
    },
    StaffDeleted {
        id: Ulid,
    },
    WorkingHoursReplaced {
        staff_id: Ulid,
        hours: Vec<WorkingHours>,
    },
    DayOffAdded {
        staff_id: Ulid,
        day_off: DayOff,
    },
    DayOffRemoved {
        id: Ulid,
        staff_id: Ulid,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentUpdated {
        appointment: Appointment,
    },
    AppointmentDeleted {
        id: Ulid,
    },
    ClientDetached {
        client_id: Ulid,
    },
}
