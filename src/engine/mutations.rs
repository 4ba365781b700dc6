use chrono::{NaiveDate, NaiveTime, TimeDelta};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{AppointmentNotice, NoticeKind};
use crate::observability::{self, APPOINTMENTS_ACTIVE, BOOKINGS_TOTAL, BOOKING_DURATION_SECONDS};

use super::conflict::*;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    // ── Reference data ────────────────────────────────────────

    pub async fn update_config(&self, config: Config) -> Result<(), EngineError> {
        validate_config(&config)?;
        let _catalog = self.catalog.write().await;
        self.persist_and_apply(&Event::ConfigUpdated { config }).await?;
        tracing::info!("config updated");
        Ok(())
    }

    pub async fn create_service(&self, service: Service) -> Result<(), EngineError> {
        validate_service(&service)?;
        let _catalog = self.catalog.write().await;
        if self.services.len() >= MAX_SERVICES {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        if self.services.contains_key(&service.id) {
            return Err(EngineError::AlreadyExists(service.id));
        }
        let id = service.id;
        self.persist_and_apply(&Event::ServiceCreated { service }).await?;
        tracing::info!(service = %id, "service created");
        Ok(())
    }

    /// Existing appointments keep their recorded end time.
    pub async fn update_service(&self, service: Service) -> Result<(), EngineError> {
        validate_service(&service)?;
        let _catalog = self.catalog.write().await;
        if !self.services.contains_key(&service.id) {
            return Err(EngineError::NotFound(service.id));
        }
        self.persist_and_apply(&Event::ServiceUpdated { service }).await
    }

    /// Removes the service from every staff member and clears it on appointments.
    pub async fn delete_service(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.services.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&Event::ServiceDeleted { id }).await?;
        tracing::info!(service = %id, "service deleted");
        Ok(())
    }

    pub async fn create_staff(&self, id: Ulid, profile: StaffProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _catalog = self.catalog.write().await;
        if self.staff.len() >= MAX_STAFF {
            return Err(EngineError::LimitExceeded("too many staff members"));
        }
        if self.staff.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.check_services_exist(&profile)?;
        let staff = StaffMember::new(id, profile);
        self.persist_and_apply(&Event::StaffCreated { staff }).await?;
        tracing::info!(staff = %id, "staff member created");
        Ok(())
    }

    pub async fn update_staff(&self, id: Ulid, profile: StaffProfile) -> Result<(), EngineError> {
        validate_profile(&profile)?;
        let _catalog = self.catalog.write().await;
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.check_services_exist(&profile)?;
        self.persist_and_apply(&Event::StaffUpdated { id, profile }).await
    }

    /// Drops the schedule and days off. Appointments survive with no staff member.
    pub async fn delete_staff(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;
        if !self.staff.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.persist_and_apply(&Event::StaffDeleted { id }).await?;
        self.notify.remove(&id);
        tracing::info!(staff = %id, "staff member deleted");
        Ok(())
    }

    /// Replace the whole weekly schedule.
    pub async fn set_working_hours(&self, staff_id: Ulid, hours: Vec<WorkingHours>) -> Result<(), EngineError> {
        let hours = normalize_working_hours(hours)?;
        let _catalog = self.catalog.write().await;
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        self.persist_and_apply(&Event::WorkingHoursReplaced { staff_id, hours }).await
    }

    pub async fn add_day_off(
        &self,
        id: Ulid,
        staff_id: Ulid,
        start_date: NaiveDate,
        end_date: NaiveDate,
        description: Option<String>,
    ) -> Result<DayOff, EngineError> {
        let day_off = DayOff {
            id,
            start_date,
            end_date,
            description,
        };
        validate_day_off(&day_off)?;
        let _catalog = self.catalog.write().await;
        let count = self
            .staff
            .get(&staff_id)
            .map(|s| s.days_off.len())
            .ok_or(EngineError::NotFound(staff_id))?;
        if count >= MAX_DAYS_OFF_PER_STAFF {
            return Err(EngineError::LimitExceeded("too many days off"));
        }
        if self.day_off_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        self.persist_and_apply(&Event::DayOffAdded {
            staff_id,
            day_off: day_off.clone(),
        })
        .await?;
        Ok(day_off)
    }

    /// Returns the staff member the day off belonged to.
    pub async fn remove_day_off(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _catalog = self.catalog.write().await;
        let staff_id = self
            .day_off_index
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        self.persist_and_apply(&Event::DayOffRemoved { id, staff_id }).await?;
        Ok(staff_id)
    }

    /// Forget a client that was deleted upstream. Returns how many
    /// appointments referenced it.
    pub async fn detach_client(&self, client_id: Ulid) -> Result<usize, EngineError> {
        let _catalog = self.catalog.write().await;
        let count = self
            .days
            .iter()
            .map(|d| d.iter().filter(|a| a.client_id == Some(client_id)).count())
            .sum::<usize>()
            + self
                .detached
                .iter()
                .filter(|a| a.client_id == Some(client_id))
                .count();
        if count > 0 {
            self.persist_and_apply(&Event::ClientDetached { client_id }).await?;
        }
        Ok(count)
    }

    fn check_services_exist(&self, profile: &StaffProfile) -> Result<(), EngineError> {
        match profile
            .services_offered
            .iter()
            .find(|s| !self.services.contains_key(*s))
        {
            Some(missing) => Err(EngineError::NotFound(*missing)),
            None => Ok(()),
        }
    }

    // ── Booking transaction ───────────────────────────────────

    /// Book `service_id` with `staff_id` at `date` + `start_time`.
    ///
    /// Rejects an exact (staff, date, start) duplicate before locking, then
    /// re-validates uniqueness and overlap under the (staff, date) gate.
    pub async fn book_appointment(
        &self,
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Appointment, EngineError> {
        let start = std::time::Instant::now();
        let result = self
            .book_inner(id, client_id, service_id, staff_id, date, start_time)
            .await;
        record_outcome("book", start, &result);
        if let Err(e) = &result {
            tracing::debug!(staff = %staff_id, %date, %start_time, "booking rejected: {e}");
        }
        result
    }

    async fn book_inner(
        &self,
        id: Ulid,
        client_id: Ulid,
        service_id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
    ) -> Result<Appointment, EngineError> {
        if self.get_appointment(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        let duration = self
            .services
            .get(&service_id)
            .map(|s| s.duration())
            .ok_or(EngineError::NotFound(service_id))?;
        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        let span = booking_span(date, start_time, duration)?;
        let key = DayKey { staff_id, date };

        // Fast reject on the exact triple without taking the gate.
        check_slot_free(&key, &self.appointments_for(&staff_id, date), start_time, None)?;

        let _catalog = self.catalog.read().await;
        let _gate = self.lock_days(&[key]).await;

        if !self.staff.contains_key(&staff_id) {
            return Err(EngineError::NotFound(staff_id));
        }
        if !self.services.contains_key(&service_id) {
            return Err(EngineError::NotFound(service_id));
        }
        let existing = self.appointments_for(&staff_id, date);
        check_slot_free(&key, &existing, start_time, None)?;
        check_day_capacity(&existing)?;
        check_no_overlap(&self.resolve_spans(&existing), &span, None)?;

        let appointment = Appointment {
            id,
            client_id: Some(client_id),
            service_id: Some(service_id),
            staff_id: Some(staff_id),
            date,
            start_time,
            end_time: Some(span.end.time()),
        };
        self.commit_appointment(
            Event::AppointmentBooked {
                appointment: appointment.clone(),
            },
            Event::AppointmentDeleted { id },
        )
        .await?;

        metrics::gauge!(APPOINTMENTS_ACTIVE).increment(1.0);
        self.notify
            .send(&AppointmentNotice::new(NoticeKind::Created, &appointment));
        tracing::info!(appointment = %id, staff = %staff_id, %date, %start_time, "appointment booked");
        Ok(appointment)
    }

    /// Reschedule and/or reassign an appointment. Unset date or time keep the
    /// current value. The appointment itself is excluded from every conflict
    /// check, and the gates of both the old and the new (staff, date) are held
    /// for the whole transaction.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        new_date: Option<NaiveDate>,
        new_start: Option<NaiveTime>,
        staff_change: StaffChange,
    ) -> Result<Appointment, EngineError> {
        let start = std::time::Instant::now();
        let result = self.update_inner(id, new_date, new_start, staff_change).await;
        record_outcome("update", start, &result);
        if let Err(e) = &result {
            tracing::debug!(appointment = %id, "update rejected: {e}");
        }
        result
    }

    async fn update_inner(
        &self,
        id: Ulid,
        new_date: Option<NaiveDate>,
        new_start: Option<NaiveTime>,
        staff_change: StaffChange,
    ) -> Result<Appointment, EngineError> {
        let _catalog = self.catalog.read().await;
        let config = self.get_config();

        let current = self.get_appointment(&id).ok_or(EngineError::NotFound(id))?;
        let date = new_date.unwrap_or(current.date);
        let start_time = new_start.unwrap_or(current.start_time);
        let duration = self.appointment_duration(&current)?;
        let span = booking_span(date, start_time, duration)?;
        let candidates = self.update_candidates(&current, staff_change, &config)?;
        let any_available = staff_change == StaffChange::AnyAvailable;

        // Fast reject when the target staff member is fixed.
        if !any_available
            && let [staff_id] = candidates.as_slice()
        {
            let key = DayKey { staff_id: *staff_id, date };
            check_slot_free(&key, &self.appointments_for(staff_id, date), start_time, Some(id))?;
        }

        for staff_id in &candidates {
            let key = DayKey { staff_id: *staff_id, date };
            let mut keys = vec![key];
            keys.extend(current.day_key());
            let _gates = self.lock_days(&keys).await;

            // Another transaction may have moved or removed it before we got the gate.
            let locked = self.get_appointment(&id).ok_or(EngineError::NotFound(id))?;
            if locked.day_key() != current.day_key() {
                return Err(EngineError::InvalidInput(format!(
                    "appointment {id} was modified concurrently"
                )));
            }

            let Some(staff) = self.get_staff(staff_id) else {
                if any_available {
                    continue;
                }
                return Err(EngineError::NotFound(*staff_id));
            };
            let reassigned = Some(*staff_id) != current.staff_id;
            match self.check_target(&staff, &locked, &key, &span, duration, any_available || reassigned) {
                Ok(()) => {}
                Err(e) if any_available => {
                    tracing::debug!(staff = %staff_id, "candidate rejected: {e}");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let updated = Appointment {
                staff_id: Some(*staff_id),
                date,
                start_time,
                end_time: Some(span.end.time()),
                ..locked.clone()
            };
            self.commit_appointment(
                Event::AppointmentUpdated {
                    appointment: updated.clone(),
                },
                Event::AppointmentUpdated { appointment: locked },
            )
            .await?;

            self.notify
                .send(&AppointmentNotice::new(NoticeKind::Updated, &updated));
            tracing::info!(appointment = %id, staff = %staff_id, %date, %start_time, "appointment updated");
            return Ok(updated);
        }

        Err(EngineError::StaffUnavailableForService(
            current.service_id.unwrap_or(id),
        ))
    }

    /// Validation for one candidate target under its gate. With
    /// `require_open_slot`, the target must also offer the service and list
    /// the requested start among its own available slots.
    fn check_target(
        &self,
        staff: &StaffMember,
        appt: &Appointment,
        key: &DayKey,
        span: &Span,
        duration: TimeDelta,
        require_open_slot: bool,
    ) -> Result<(), EngineError> {
        let id = appt.id;
        let existing = self.appointments_for(&key.staff_id, key.date);
        check_slot_free(key, &existing, span.start.time(), Some(id))?;
        if !existing.iter().any(|a| a.id == id) {
            check_day_capacity(&existing)?;
        }
        check_no_overlap(&self.resolve_spans(&existing), span, Some(id))?;
        if require_open_slot {
            let unavailable = || EngineError::StaffUnavailableForService(appt.service_id.unwrap_or(id));
            let reassigned = appt.staff_id != Some(staff.id);
            if reassigned && !appt.service_id.is_some_and(|s| staff.offers(&s)) {
                return Err(unavailable());
            }
            let config = self.config_snapshot();
            let slots = self.slots_for_staff(staff, config.as_ref(), key.date, duration, Some(id));
            if !slots.contains(&span.start) {
                return Err(unavailable());
            }
        }
        Ok(())
    }

    /// Staff members to try, in order.
    fn update_candidates(
        &self,
        current: &Appointment,
        staff_change: StaffChange,
        config: &Config,
    ) -> Result<Vec<Ulid>, EngineError> {
        let unavailable = || EngineError::StaffUnavailableForService(current.service_id.unwrap_or(current.id));
        match staff_change {
            StaffChange::Keep => current
                .staff_id
                .map(|s| vec![s])
                .ok_or_else(|| EngineError::InvalidInput(format!("appointment {} has no staff member", current.id))),
            StaffChange::To(staff_id) => {
                if Some(staff_id) != current.staff_id && !config.allow_staff_change_on_reschedule {
                    return Err(unavailable());
                }
                Ok(vec![staff_id])
            }
            StaffChange::AnyAvailable => {
                let mut candidates: Vec<Ulid> = current.staff_id.into_iter().collect();
                if config.allow_staff_change_on_reschedule
                    && let Some(service_id) = current.service_id
                {
                    candidates.extend(
                        self.staff_for_service(&service_id)
                            .into_iter()
                            .filter(|s| Some(*s) != current.staff_id),
                    );
                }
                if candidates.is_empty() {
                    return Err(unavailable());
                }
                Ok(candidates)
            }
        }
    }

    /// Length of an appointment when moved: the service duration, or the
    /// recorded length once the service is gone.
    fn appointment_duration(&self, appt: &Appointment) -> Result<TimeDelta, EngineError> {
        if let Some(duration) = appt
            .service_id
            .and_then(|s| self.services.get(&s).map(|s| s.duration()))
        {
            return Ok(duration);
        }
        match appt.end_time {
            Some(end_time) => Ok(end_time - appt.start_time),
            None => Err(EngineError::InvalidInput(format!(
                "appointment {} has neither a service nor an end time",
                appt.id
            ))),
        }
    }

    pub async fn delete_appointment(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let start = std::time::Instant::now();
        let result = self.delete_inner(id).await;
        record_outcome("delete", start, &result);
        result
    }

    async fn delete_inner(&self, id: Ulid) -> Result<Appointment, EngineError> {
        let _catalog = self.catalog.read().await;
        let current = self.get_appointment(&id).ok_or(EngineError::NotFound(id))?;
        let keys: Vec<DayKey> = current.day_key().into_iter().collect();
        let _gates = self.lock_days(&keys).await;

        let locked = self.get_appointment(&id).ok_or(EngineError::NotFound(id))?;
        if locked.day_key() != current.day_key() {
            return Err(EngineError::InvalidInput(format!(
                "appointment {id} was modified concurrently"
            )));
        }
        self.commit_appointment(
            Event::AppointmentDeleted { id },
            Event::AppointmentBooked {
                appointment: locked.clone(),
            },
        )
        .await?;

        metrics::gauge!(APPOINTMENTS_ACTIVE).decrement(1.0);
        self.notify
            .send(&AppointmentNotice::new(NoticeKind::Deleted, &locked));
        tracing::info!(appointment = %id, "appointment deleted");
        Ok(locked)
    }

    // ── WAL maintenance ───────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.write().await;

        let mut events = Vec::new();
        if let Some(config) = self.config_snapshot() {
            events.push(Event::ConfigUpdated { config });
        }
        for service in self.list_services() {
            events.push(Event::ServiceCreated { service });
        }
        for staff in self.list_staff() {
            events.push(Event::StaffCreated { staff });
        }
        let mut appointments: Vec<Appointment> = self
            .days
            .iter()
            .flat_map(|d| d.value().clone())
            .chain(self.detached.iter().map(|a| a.value().clone()))
            .collect();
        appointments.sort_by_key(|a| a.id);
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentBooked { appointment }),
        );

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL, "status" => status).increment(1);
        if result.is_ok() {
            tracing::info!(events = count, "WAL compacted");
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

fn record_outcome<T>(op: &'static str, start: std::time::Instant, result: &Result<T, EngineError>) {
    let status = observability::status_label(result);
    metrics::counter!(BOOKINGS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(BOOKING_DURATION_SECONDS, "op" => op).record(start.elapsed().as_secs_f64());
}
