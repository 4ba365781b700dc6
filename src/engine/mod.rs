mod availability;
mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{
    blocked_slots, drop_elapsed, filter_for_service, generate_base_slots, occupied_slots,
    slots_for_service, slots_needed,
};
pub use calendar::CalendarView;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Every append already queued when the first one is picked up
/// joins its batch, and the batch is made durable with a single fsync. A
/// non-append command ends the batch and runs after it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut trailing = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    trailing = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = trailing {
            handle_non_append(&mut wal, cmd);
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch cannot leak
    // into the next one; its callers are told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(events = batch.len(), "WAL batch commit failed: {e}");
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

pub struct Engine {
    pub(super) config: RwLock<Option<Config>>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) staff: DashMap<Ulid, StaffMember>,
    /// Appointments per (staff, date), sorted by start time.
    pub(super) days: DashMap<DayKey, Vec<Appointment>>,
    /// Appointments whose staff member was deleted.
    pub(super) detached: DashMap<Ulid, Appointment>,
    /// Reverse lookup: appointment id → (staff, date) bucket.
    pub(super) appointment_index: DashMap<Ulid, DayKey>,
    /// Reverse lookup: day-off id → staff id.
    pub(super) day_off_index: DashMap<Ulid, Ulid>,
    /// One booking gate per (staff, date); created on demand, pruned when idle.
    pub(super) gates: DashMap<DayKey, Arc<Mutex<()>>>,
    /// Appointment mutations hold this shared; reference-data writes and
    /// compaction hold it exclusively.
    pub(super) catalog: tokio::sync::RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) clock: Arc<dyn Clock>,
}

/// Exclusive hold on one or more (staff, date) booking gates. Idle gates are
/// removed from the map on drop.
pub(super) struct DayGuard<'a> {
    engine: &'a Engine,
    held: Vec<(DayKey, OwnedMutexGuard<()>)>,
}

impl Drop for DayGuard<'_> {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            self.engine
                .gates
                .remove_if(&key, |_, gate| Arc::strong_count(gate) == 1);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            config: RwLock::new(None),
            services: DashMap::new(),
            staff: DashMap::new(),
            days: DashMap::new(),
            detached: DashMap::new(),
            appointment_index: DashMap::new(),
            day_off_index: DashMap::new(),
            gates: DashMap::new(),
            catalog: tokio::sync::RwLock::new(()),
            wal_tx,
            notify,
            clock,
        };

        for event in &events {
            engine.apply(event);
        }
        tracing::info!(
            events = events.len(),
            staff = engine.staff.len(),
            services = engine.services.len(),
            "replayed WAL {}",
            wal_path.display()
        );
        metrics::gauge!(crate::observability::APPOINTMENTS_ACTIVE).set(engine.appointment_count() as f64);

        Ok(engine)
    }

    /// Apply an event to the in-memory state. Used for replay and live commits;
    /// callers have already validated it.
    pub(super) fn apply(&self, event: &Event) {
        match event {
            Event::ConfigUpdated { config } => {
                *self.config.write().unwrap_or_else(|e| e.into_inner()) = Some(config.clone());
            }
            Event::ServiceCreated { service } | Event::ServiceUpdated { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::ServiceDeleted { id } => {
                self.services.remove(id);
                for mut staff in self.staff.iter_mut() {
                    staff.profile.services_offered.remove(id);
                }
                self.for_each_appointment_mut(|a| {
                    if a.service_id == Some(*id) {
                        a.service_id = None;
                    }
                });
            }
            Event::StaffCreated { staff } => {
                for day_off in &staff.days_off {
                    self.day_off_index.insert(day_off.id, staff.id);
                }
                self.staff.insert(staff.id, staff.clone());
            }
            Event::StaffUpdated { id, profile } => {
                if let Some(mut staff) = self.staff.get_mut(id) {
                    staff.profile = profile.clone();
                }
            }
            Event::StaffDeleted { id } => {
                if let Some((_, staff)) = self.staff.remove(id) {
                    for day_off in &staff.days_off {
                        self.day_off_index.remove(&day_off.id);
                    }
                }
                let keys: Vec<DayKey> = self
                    .days
                    .iter()
                    .filter(|e| e.key().staff_id == *id)
                    .map(|e| *e.key())
                    .collect();
                for key in keys {
                    if let Some((_, appointments)) = self.days.remove(&key) {
                        for mut appt in appointments {
                            self.appointment_index.remove(&appt.id);
                            appt.staff_id = None;
                            self.detached.insert(appt.id, appt);
                        }
                    }
                }
            }
            Event::WorkingHoursReplaced { staff_id, hours } => {
                if let Some(mut staff) = self.staff.get_mut(staff_id) {
                    staff.working_hours = hours.clone();
                }
            }
            Event::DayOffAdded { staff_id, day_off } => {
                if let Some(mut staff) = self.staff.get_mut(staff_id) {
                    staff.days_off.push(day_off.clone());
                    self.day_off_index.insert(day_off.id, *staff_id);
                }
            }
            Event::DayOffRemoved { id, staff_id } => {
                if let Some(mut staff) = self.staff.get_mut(staff_id) {
                    staff.days_off.retain(|d| d.id != *id);
                }
                self.day_off_index.remove(id);
            }
            Event::AppointmentBooked { appointment } => {
                self.insert_appointment(appointment.clone());
            }
            Event::AppointmentUpdated { appointment } => {
                self.remove_appointment(&appointment.id);
                self.insert_appointment(appointment.clone());
            }
            Event::AppointmentDeleted { id } => {
                self.remove_appointment(id);
            }
            Event::ClientDetached { client_id } => {
                self.for_each_appointment_mut(|a| {
                    if a.client_id == Some(*client_id) {
                        a.client_id = None;
                    }
                });
            }
        }
    }

    fn insert_appointment(&self, appt: Appointment) {
        match appt.day_key() {
            Some(key) => {
                self.appointment_index.insert(appt.id, key);
                let mut day = self.days.entry(key).or_default();
                let pos = day.partition_point(|a| a.start_time <= appt.start_time);
                day.insert(pos, appt);
            }
            None => {
                self.detached.insert(appt.id, appt);
            }
        }
    }

    fn remove_appointment(&self, id: &Ulid) -> Option<Appointment> {
        let Some((_, key)) = self.appointment_index.remove(id) else {
            return self.detached.remove(id).map(|(_, a)| a);
        };
        let removed = {
            let mut day = self.days.get_mut(&key)?;
            let pos = day.iter().position(|a| a.id == *id)?;
            day.remove(pos)
        };
        self.days.remove_if(&key, |_, day| day.is_empty());
        Some(removed)
    }

    fn for_each_appointment_mut(&self, mut f: impl FnMut(&mut Appointment)) {
        for mut day in self.days.iter_mut() {
            day.iter_mut().for_each(&mut f);
        }
        for mut appt in self.detached.iter_mut() {
            f(appt.value_mut());
        }
    }

    pub(super) fn appointment_count(&self) -> usize {
        self.appointment_index.len() + self.detached.len()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Reference-data writes call this while holding
    /// the catalog exclusively.
    pub(super) async fn persist_and_apply(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(event);
        Ok(())
    }

    /// Commit an appointment event: apply in memory, hand it to the WAL writer,
    /// and apply `undo` if the write fails. Once the channel permit is taken
    /// the event reaches the writer even if the caller goes away, so a
    /// cancelled caller never leaves memory and log disagreeing.
    pub(super) async fn commit_appointment(&self, event: Event, undo: Event) -> Result<(), EngineError> {
        let permit = self
            .wal_tx
            .reserve()
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        self.apply(&event);
        let (tx, rx) = oneshot::channel();
        permit.send(WalCommand::Append { event, response: tx });

        let result = match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(EngineError::WalError(e.to_string())),
            Err(_) => Err(EngineError::WalError("WAL writer dropped response".into())),
        };
        if let Err(e) = &result {
            tracing::warn!("WAL append failed, reverting appointment change: {e}");
            self.apply(&undo);
        }
        result
    }

    /// Acquire the booking gates for `keys` in sorted order.
    pub(super) async fn lock_days(&self, keys: &[DayKey]) -> DayGuard<'_> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let wait_start = std::time::Instant::now();
        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let gate = self.gates.entry(key).or_default().clone();
            held.push((key, gate.lock_owned().await));
        }
        metrics::histogram!(crate::observability::BOOKING_LOCK_WAIT_SECONDS)
            .record(wait_start.elapsed().as_secs_f64());
        DayGuard { engine: self, held }
    }

    /// Resolve each appointment's occupied interval. The stored end time wins;
    /// otherwise the current service duration is used. Appointments with
    /// neither are skipped.
    pub(super) fn resolve_spans(&self, appointments: &[Appointment]) -> Vec<(Ulid, Span)> {
        let mut spans = Vec::with_capacity(appointments.len());
        for appt in appointments {
            let start = appt.start();
            let end = match appt.end_time {
                Some(end_time) => appt.date.and_time(end_time),
                None => match appt.service_id.and_then(|s| self.services.get(&s).map(|s| s.duration())) {
                    Some(duration) => start + duration,
                    None => {
                        tracing::warn!(appointment = %appt.id, "appointment has no end time and no service; ignored for occupancy");
                        continue;
                    }
                },
            };
            if end < start {
                tracing::warn!(appointment = %appt.id, "appointment ends before it starts; ignored for occupancy");
                continue;
            }
            spans.push((appt.id, Span::new(start, end)));
        }
        spans
    }
}
