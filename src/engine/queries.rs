use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{AVAILABILITY_DURATION_SECONDS, AVAILABILITY_QUERIES_TOTAL};

use super::availability::slots_for_service;
use super::calendar::CalendarView;
use super::{Engine, EngineError};

impl Engine {
    /// The process-wide defaults. Never written lazily: an unset config reads
    /// as the default with every field unset.
    pub fn get_config(&self) -> Config {
        self.config_snapshot().unwrap_or_default()
    }

    pub(super) fn config_snapshot(&self) -> Option<Config> {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get_service(&self, id: &Ulid) -> Option<Service> {
        self.services.get(id).map(|s| s.value().clone())
    }

    pub fn get_staff(&self, id: &Ulid) -> Option<StaffMember> {
        self.staff.get(id).map(|s| s.value().clone())
    }

    pub fn list_services(&self) -> Vec<Service> {
        let mut services: Vec<Service> = self.services.iter().map(|e| e.value().clone()).collect();
        services.sort_by_key(|s| s.id);
        services
    }

    pub fn list_staff(&self) -> Vec<StaffMember> {
        let mut staff: Vec<StaffMember> = self.staff.iter().map(|e| e.value().clone()).collect();
        staff.sort_by_key(|s| s.id);
        staff
    }

    /// Staff members offering `service_id`, ordered by id.
    pub fn staff_for_service(&self, service_id: &Ulid) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self
            .staff
            .iter()
            .filter(|e| e.value().offers(service_id))
            .map(|e| *e.key())
            .collect();
        ids.sort();
        ids
    }

    /// One staff member's appointments on `date`, ordered by start time.
    pub fn appointments_for(&self, staff_id: &Ulid, date: NaiveDate) -> Vec<Appointment> {
        let key = DayKey {
            staff_id: *staff_id,
            date,
        };
        self.days.get(&key).map(|d| d.value().clone()).unwrap_or_default()
    }

    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        if let Some(key) = self.appointment_index.get(id).map(|k| *k.value()) {
            return self
                .days
                .get(&key)
                .and_then(|day| day.iter().find(|a| a.id == *id).cloned());
        }
        self.detached.get(id).map(|a| a.value().clone())
    }

    /// Why a staff member has (or lacks) bookable time on `date`.
    pub fn day_status(&self, staff_id: &Ulid, date: NaiveDate) -> Result<DayStatus, EngineError> {
        let staff = self.get_staff(staff_id).ok_or(EngineError::NotFound(*staff_id))?;
        let config = self.config_snapshot();
        Ok(CalendarView::new(&staff, config.as_ref()).day_status(date))
    }

    /// Bookable start times for one staff member, date and service.
    pub fn available_slots(
        &self,
        staff_id: &Ulid,
        date: NaiveDate,
        service_id: &Ulid,
    ) -> Result<Vec<NaiveDateTime>, EngineError> {
        let start = std::time::Instant::now();
        let service = self.get_service(service_id).ok_or(EngineError::NotFound(*service_id))?;
        let staff = self.get_staff(staff_id).ok_or(EngineError::NotFound(*staff_id))?;
        let config = self.config_snapshot();

        let slots = self.slots_for_staff(&staff, config.as_ref(), date, service.duration(), None);

        metrics::counter!(AVAILABILITY_QUERIES_TOTAL, "scope" => "staff").increment(1);
        metrics::histogram!(AVAILABILITY_DURATION_SECONDS, "scope" => "staff")
            .record(start.elapsed().as_secs_f64());
        Ok(slots)
    }

    /// Availability for every staff member offering the service. Staff with no
    /// free slot map to an empty list; staff deleted while the query runs are
    /// left out.
    pub fn availability_across_staff(
        &self,
        service_id: &Ulid,
        date: NaiveDate,
    ) -> Result<BTreeMap<Ulid, Vec<NaiveDateTime>>, EngineError> {
        let candidates = self.staff_for_service(service_id);
        self.collect_availability(service_id, &candidates, date, true)
    }

    /// Availability for an explicit staff list. Members who do not offer the
    /// service are left out of the result; unknown ids are an error.
    pub fn availability_across(
        &self,
        service_id: &Ulid,
        staff_ids: &[Ulid],
        date: NaiveDate,
    ) -> Result<BTreeMap<Ulid, Vec<NaiveDateTime>>, EngineError> {
        self.collect_availability(service_id, staff_ids, date, false)
    }

    pub(super) fn collect_availability(
        &self,
        service_id: &Ulid,
        staff_ids: &[Ulid],
        date: NaiveDate,
        skip_missing: bool,
    ) -> Result<BTreeMap<Ulid, Vec<NaiveDateTime>>, EngineError> {
        let start = std::time::Instant::now();
        let service = self.get_service(service_id).ok_or(EngineError::NotFound(*service_id))?;
        let config = self.config_snapshot();

        let mut result = BTreeMap::new();
        for staff_id in staff_ids {
            let staff = match self.get_staff(staff_id) {
                Some(staff) => staff,
                None if skip_missing => continue,
                None => return Err(EngineError::NotFound(*staff_id)),
            };
            if !staff.offers(service_id) {
                continue;
            }
            let slots = self.slots_for_staff(&staff, config.as_ref(), date, service.duration(), None);
            result.insert(*staff_id, slots);
        }

        metrics::counter!(AVAILABILITY_QUERIES_TOTAL, "scope" => "across").increment(1);
        metrics::histogram!(AVAILABILITY_DURATION_SECONDS, "scope" => "across")
            .record(start.elapsed().as_secs_f64());
        Ok(result)
    }

    /// Run the slot pipeline for one staff member against their current
    /// appointments, optionally ignoring one appointment (the one being moved).
    pub(super) fn slots_for_staff(
        &self,
        staff: &StaffMember,
        config: Option<&Config>,
        date: NaiveDate,
        service_duration: TimeDelta,
        exclude: Option<Ulid>,
    ) -> Vec<NaiveDateTime> {
        let appointments = self.appointments_for(&staff.id, date);
        let spans: Vec<Span> = self
            .resolve_spans(&appointments)
            .into_iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(_, span)| span)
            .collect();
        let calendar = CalendarView::new(staff, config);
        slots_for_service(&calendar, date, service_duration, &spans, self.clock.now())
    }
}
