use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Appointment;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeKind {
    #[serde(rename = "appointments.created")]
    Created,
    #[serde(rename = "appointments.updated")]
    Updated,
    #[serde(rename = "appointments.deleted")]
    Deleted,
}

/// Outbound appointment event, relayed by the notification subsystem.
/// Dates and times serialize as `YYYY-MM-DD` and `HH:MM:SS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppointmentNotice {
    #[serde(rename = "type")]
    pub kind: NoticeKind,
    pub appointment_id: Ulid,
    pub client: Option<Ulid>,
    pub service: Option<Ulid>,
    pub date: NaiveDate,
    pub start_time: NaiveTime,
    pub staff: Option<Ulid>,
}

impl AppointmentNotice {
    pub fn new(kind: NoticeKind, appt: &Appointment) -> Self {
        Self {
            kind,
            appointment_id: appt.id,
            client: appt.client_id,
            service: appt.service_id,
            date: appt.date,
            start_time: appt.start_time,
            staff: appt.staff_id,
        }
    }
}

/// Broadcast hub for appointment notices: one channel per staff member plus
/// one carrying every notice.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<AppointmentNotice>>,
    all: broadcast::Sender<AppointmentNotice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one staff member's notices. Creates the channel if needed.
    pub fn subscribe(&self, staff_id: Ulid) -> broadcast::Receiver<AppointmentNotice> {
        let sender = self
            .channels
            .entry(staff_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<AppointmentNotice> {
        self.all.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, notice: &AppointmentNotice) {
        if let Some(staff_id) = notice.staff
            && let Some(sender) = self.channels.get(&staff_id) {
                let _ = sender.send(notice.clone());
            }
        let _ = self.all.send(notice.clone());
    }

    /// Remove a channel (e.g. when the staff member is deleted).
    pub fn remove(&self, staff_id: &Ulid) {
        self.channels.remove(staff_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn appt(staff: Option<Ulid>) -> Appointment {
        Appointment {
            id: Ulid::new(),
            client_id: Some(Ulid::new()),
            service_id: Some(Ulid::new()),
            staff_id: staff,
            date: NaiveDate::from_ymd_opt(2025, 10, 28).unwrap(),
            start_time: NaiveTime::from_hms_opt(9, 30, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(10, 0, 0),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let staff = Ulid::new();
        let mut rx = hub.subscribe(staff);
        let mut all = hub.subscribe_all();

        let notice = AppointmentNotice::new(NoticeKind::Created, &appt(Some(staff)));
        hub.send(&notice);

        assert_eq!(rx.recv().await.unwrap(), notice);
        assert_eq!(all.recv().await.unwrap(), notice);
    }

    #[tokio::test]
    async fn other_staff_channel_stays_quiet() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe(Ulid::new());
        hub.send(&AppointmentNotice::new(NoticeKind::Deleted, &appt(Some(Ulid::new()))));
        assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(&AppointmentNotice::new(NoticeKind::Updated, &appt(None)));
    }

    #[test]
    fn notice_json_shape() {
        let a = appt(Some(Ulid::new()));
        let json = serde_json::to_value(AppointmentNotice::new(NoticeKind::Created, &a)).unwrap();
        assert_eq!(json["type"], "appointments.created");
        assert_eq!(json["date"], "2025-10-28");
        assert_eq!(json["start_time"], "09:30:00");
        assert_eq!(json["appointment_id"], a.id.to_string());
    }
}
