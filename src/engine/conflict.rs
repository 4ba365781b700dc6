use chrono::{NaiveDate, NaiveTime, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Interval an appointment would occupy if it started at `start_time` and ran
/// for `duration`. Appointments must end before midnight.
pub(crate) fn booking_span(
    date: NaiveDate,
    start_time: NaiveTime,
    duration: TimeDelta,
) -> Result<Span, EngineError> {
    if duration <= TimeDelta::zero() {
        return Err(EngineError::InvalidDuration(duration.num_seconds()));
    }
    let start = date.and_time(start_time);
    let end = start + duration;
    if end.date() != date {
        return Err(EngineError::InvalidInput(format!(
            "appointment starting {start} runs past midnight"
        )));
    }
    Ok(Span::new(start, end))
}

/// Exact `(staff, date, start_time)` uniqueness.
pub(crate) fn check_slot_free(
    key: &DayKey,
    existing: &[Appointment],
    start_time: NaiveTime,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let taken = existing
        .iter()
        .filter(|a| Some(a.id) != exclude)
        .any(|a| a.start_time == start_time);
    if taken {
        return Err(EngineError::SlotTaken {
            staff_id: key.staff_id,
            date: key.date,
            start_time,
        });
    }
    Ok(())
}

/// Half-open overlap scan against resolved appointment intervals.
pub(crate) fn check_no_overlap(
    existing: &[(Ulid, Span)],
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for (id, other) in existing {
        if Some(*id) == exclude {
            continue;
        }
        if other.overlaps(span) {
            return Err(EngineError::OverlapsExisting(*id));
        }
    }
    Ok(())
}

pub(crate) fn check_day_capacity(existing: &[Appointment]) -> Result<(), EngineError> {
    if existing.len() >= MAX_APPOINTMENTS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many appointments on this day"));
    }
    Ok(())
}

pub(crate) fn validate_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

pub(crate) fn validate_service(service: &Service) -> Result<(), EngineError> {
    validate_name(&service.name, "service name")?;
    if service.duration_secs <= 0 {
        return Err(EngineError::InvalidDuration(service.duration_secs));
    }
    if service.duration_secs > MAX_SERVICE_DURATION_SECS {
        return Err(EngineError::LimitExceeded("service longer than a day"));
    }
    if service.currency.len() != 3 || !service.currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(EngineError::InvalidInput(format!(
            "currency must be a 3-letter ISO code, got {:?}",
            service.currency
        )));
    }
    Ok(())
}

fn validate_slot_and_buffer(slot: Option<u32>, buffer: Option<f64>) -> Result<(), EngineError> {
    if let Some(slot) = slot {
        if slot == 0 {
            return Err(EngineError::InvalidInput("slot duration must be > 0".into()));
        }
        if slot > MAX_SLOT_DURATION_MINUTES {
            return Err(EngineError::LimitExceeded("slot duration longer than a day"));
        }
    }
    if let Some(buffer) = buffer {
        if !buffer.is_finite() || buffer < 0.0 {
            return Err(EngineError::InvalidInput("buffer minutes must be >= 0".into()));
        }
        if buffer > MAX_BUFFER_MINUTES {
            return Err(EngineError::LimitExceeded("buffer too long"));
        }
    }
    Ok(())
}

fn validate_lead_finish(lead: Option<NaiveTime>, finish: Option<NaiveTime>) -> Result<(), EngineError> {
    if let (Some(lead), Some(finish)) = (lead, finish)
        && lead >= finish {
            return Err(EngineError::InvalidInput("lead time must be before finish time".into()));
        }
    Ok(())
}

pub(crate) fn validate_config(config: &Config) -> Result<(), EngineError> {
    validate_slot_and_buffer(config.slot_duration_minutes, config.buffer_minutes)?;
    validate_lead_finish(config.lead_time, config.finish_time)
}

pub(crate) fn validate_profile(profile: &StaffProfile) -> Result<(), EngineError> {
    if let Some(name) = &profile.name {
        validate_name(name, "staff name")?;
    }
    if profile.services_offered.len() > MAX_SERVICES_PER_STAFF {
        return Err(EngineError::LimitExceeded("too many services for one staff member"));
    }
    validate_slot_and_buffer(profile.slot_duration_minutes, profile.buffer_minutes)?;
    validate_lead_finish(profile.lead_time, profile.finish_time)
}

/// Sorts the schedule by weekday; rejects duplicates, bad weekdays and empty ranges.
pub(crate) fn normalize_working_hours(mut hours: Vec<WorkingHours>) -> Result<Vec<WorkingHours>, EngineError> {
    for wh in &hours {
        if wh.day_of_week > 6 {
            return Err(EngineError::InvalidInput(format!(
                "day of week {} out of range 0..=6",
                wh.day_of_week
            )));
        }
        if wh.start_time >= wh.end_time {
            return Err(EngineError::InvalidInput(format!(
                "working hours on day {} start at or after they end",
                wh.day_of_week
            )));
        }
    }
    hours.sort_by_key(|wh| wh.day_of_week);
    if let Some(dup) = hours.windows(2).find(|w| w[0].day_of_week == w[1].day_of_week) {
        return Err(EngineError::InvalidInput(format!(
            "more than one working-hours row for day {}",
            dup[0].day_of_week
        )));
    }
    Ok(hours)
}

pub(crate) fn validate_day_off(day_off: &DayOff) -> Result<(), EngineError> {
    if day_off.start_date > day_off.end_date {
        return Err(EngineError::InvalidInput("day off starts after it ends".into()));
    }
    if (day_off.end_date - day_off.start_date).num_days() > MAX_DAY_OFF_SPAN_DAYS {
        return Err(EngineError::LimitExceeded("day off range too long"));
    }
    if let Some(d) = &day_off.description
        && d.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::LimitExceeded("description too long"));
        }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 10, 28).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn span(h0: u32, m0: u32, h1: u32, m1: u32) -> Span {
        Span::new(day().and_time(t(h0, m0)), day().and_time(t(h1, m1)))
    }

    #[test]
    fn booking_span_rejects_midnight_crossing() {
        assert!(booking_span(day(), t(22, 30), TimeDelta::minutes(60)).is_ok());
        assert!(matches!(
            booking_span(day(), t(23, 0), TimeDelta::minutes(60)),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            booking_span(day(), t(9, 0), TimeDelta::zero()),
            Err(EngineError::InvalidDuration(0))
        ));
    }

    #[test]
    fn overlap_scan_skips_excluded() {
        let a = Ulid::new();
        let existing = vec![(a, span(10, 0, 10, 30))];
        let candidate = span(10, 15, 10, 45);
        assert!(matches!(
            check_no_overlap(&existing, &candidate, None),
            Err(EngineError::OverlapsExisting(id)) if id == a
        ));
        assert!(check_no_overlap(&existing, &candidate, Some(a)).is_ok());
        assert!(check_no_overlap(&existing, &span(10, 30, 11, 0), None).is_ok());
    }

    #[test]
    fn exact_start_is_taken() {
        let key = DayKey {
            staff_id: Ulid::new(),
            date: day(),
        };
        let appt = Appointment {
            id: Ulid::new(),
            client_id: None,
            service_id: None,
            staff_id: Some(key.staff_id),
            date: day(),
            start_time: t(9, 0),
            end_time: Some(t(9, 30)),
        };
        let existing = vec![appt.clone()];
        assert!(matches!(
            check_slot_free(&key, &existing, t(9, 0), None),
            Err(EngineError::SlotTaken { .. })
        ));
        assert!(check_slot_free(&key, &existing, t(9, 0), Some(appt.id)).is_ok());
        assert!(check_slot_free(&key, &existing, t(9, 15), None).is_ok());
    }

    #[test]
    fn working_hours_normalized_and_deduplicated() {
        let row = |d, a, b| WorkingHours {
            day_of_week: d,
            start_time: a,
            end_time: b,
        };
        let sorted = normalize_working_hours(vec![
            row(4, t(9, 0), t(17, 0)),
            row(0, t(10, 0), t(14, 0)),
        ])
        .unwrap();
        assert_eq!(sorted[0].day_of_week, 0);
        assert_eq!(sorted[1].day_of_week, 4);

        assert!(normalize_working_hours(vec![row(2, t(9, 0), t(12, 0)), row(2, t(13, 0), t(17, 0))]).is_err());
        assert!(normalize_working_hours(vec![row(7, t(9, 0), t(12, 0))]).is_err());
        assert!(normalize_working_hours(vec![row(1, t(12, 0), t(12, 0))]).is_err());
    }

    #[test]
    fn service_validation() {
        let mut s = Service {
            id: Ulid::new(),
            name: "Cut".into(),
            duration_secs: 1800,
            price_minor: 2500,
            currency: "EUR".into(),
        };
        assert!(validate_service(&s).is_ok());
        s.duration_secs = 0;
        assert!(matches!(validate_service(&s), Err(EngineError::InvalidDuration(0))));
        s.duration_secs = 1800;
        s.currency = "euro".into();
        assert!(validate_service(&s).is_err());
    }

    #[test]
    fn config_validation() {
        let mut c = Config::default();
        assert!(validate_config(&c).is_ok());
        c.slot_duration_minutes = Some(0);
        assert!(validate_config(&c).is_err());
        c.slot_duration_minutes = Some(30);
        c.buffer_minutes = Some(-1.0);
        assert!(validate_config(&c).is_err());
        c.buffer_minutes = None;
        c.lead_time = Some(t(18, 0));
        c.finish_time = Some(t(9, 0));
        assert!(validate_config(&c).is_err());
    }
}
