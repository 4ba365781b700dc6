use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotbook::clock::FixedClock;
use slotbook::engine::{Engine, EngineError};
use slotbook::model::{Service, StaffChange, StaffProfile, WorkingHours};
use slotbook::notify::{AppointmentNotice, NoticeKind, NotifyHub};
use slotbook::timefmt::{format_timestamp, parse_timestamp};

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn ts(s: &str) -> NaiveDateTime {
    parse_timestamp(s).unwrap()
}

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(ts("2025-11-02 18:00")))
}

fn start(dir: &Path, clock: Arc<FixedClock>) -> Arc<Engine> {
    Arc::new(Engine::new(dir.join("slotbook.wal"), Arc::new(NotifyHub::new()), clock).unwrap())
}

async fn recv(rx: &mut broadcast::Receiver<AppointmentNotice>) -> AppointmentNotice {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for notice")
        .unwrap()
}

struct Salon {
    cut: Ulid,
    colour: Ulid,
    alice: Ulid,
    bob: Ulid,
}

/// Two stylists working Mondays 10:00–14:00 on a 30-minute grid.
async fn open_salon(engine: &Engine) -> Salon {
    let cut = Ulid::new();
    let colour = Ulid::new();
    for (id, name, minutes) in [(cut, "Cut", 30), (colour, "Colour", 75)] {
        assert_ok!(
            engine
                .create_service(Service {
                    id,
                    name: name.into(),
                    duration_secs: minutes * 60,
                    price_minor: 4500,
                    currency: "EUR".into(),
                })
                .await
        );
    }

    let mut staff = Vec::new();
    for name in ["Alice", "Bob"] {
        let id = Ulid::new();
        assert_ok!(
            engine
                .create_staff(
                    id,
                    StaffProfile {
                        name: Some(name.into()),
                        slot_duration_minutes: Some(30),
                        services_offered: [cut, colour].into_iter().collect(),
                        ..Default::default()
                    },
                )
                .await
        );
        assert_ok!(
            engine
                .set_working_hours(
                    id,
                    vec![WorkingHours {
                        day_of_week: 0,
                        start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                        end_time: NaiveTime::from_hms_opt(14, 0, 0).unwrap(),
                    }],
                )
                .await
        );
        staff.push(id);
    }
    Salon {
        cut,
        colour,
        alice: staff[0],
        bob: staff[1],
    }
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
}

fn formatted(slots: &[NaiveDateTime]) -> Vec<String> {
    slots.iter().copied().map(format_timestamp).collect()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn multi_sub_slot_service_fits_before_closing() {
    let dir = data_dir();
    let engine = start(&dir, clock());
    let salon = open_salon(&engine).await;

    // 75 minutes needs three 30-minute sub-slots.
    let slots = engine.available_slots(&salon.alice, monday(), &salon.colour).unwrap();
    assert_eq!(
        formatted(&slots),
        vec![
            "2025-11-03 10:00:00",
            "2025-11-03 10:30:00",
            "2025-11-03 11:00:00",
            "2025-11-03 11:30:00",
            "2025-11-03 12:00:00",
            "2025-11-03 12:30:00",
        ]
    );
}

#[tokio::test]
async fn booking_flow_with_notices() {
    let dir = data_dir();
    let engine = start(&dir, clock());
    let salon = open_salon(&engine).await;
    let mut alice_rx = engine.notify.subscribe(salon.alice);
    let mut all_rx = engine.notify.subscribe_all();

    let when = ts("2025-11-03 11:00");
    let client = Ulid::new();
    let appt = assert_ok!(
        engine
            .book_appointment(Ulid::new(), client, salon.colour, salon.alice, when.date(), when.time())
            .await
    );
    assert_eq!(appt.end_time, NaiveTime::from_hms_opt(12, 15, 0));

    let notice = recv(&mut alice_rx).await;
    assert_eq!(notice.kind, NoticeKind::Created);
    assert_eq!(notice.appointment_id, appt.id);
    assert_eq!(notice.client, Some(client));
    assert_eq!(recv(&mut all_rx).await, notice);

    // The colour occupies 11:00–12:15, so a cut can start at 10:30 or 12:30 but
    // nothing between.
    let cuts = formatted(&engine.available_slots(&salon.alice, monday(), &salon.cut).unwrap());
    assert!(cuts.contains(&"2025-11-03 10:30:00".to_string()));
    assert!(cuts.contains(&"2025-11-03 12:30:00".to_string()));
    for blocked in ["11:00:00", "11:30:00", "12:00:00"] {
        assert!(!cuts.contains(&format!("2025-11-03 {blocked}")));
    }

    // Bob is unaffected.
    let across = engine.availability_across_staff(&salon.cut, monday()).unwrap();
    assert_eq!(across[&salon.bob].len(), 8);
    assert_eq!(across[&salon.alice].len(), 5);

    let overlap = engine
        .book_appointment(Ulid::new(), Ulid::new(), salon.cut, salon.alice, monday(), ts("2025-11-03 12:00").time())
        .await;
    assert!(matches!(overlap, Err(EngineError::OverlapsExisting(id)) if id == appt.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_clients_get_one_booking() {
    let dir = data_dir();
    let engine = start(&dir, clock());
    let salon = open_salon(&engine).await;

    let mut handles = Vec::new();
    for i in 0..12 {
        let engine = engine.clone();
        // Alternate overlapping starts: 10:00 colour vs 10:30 cut.
        let (service, time) = if i % 2 == 0 {
            (salon.colour, "10:00")
        } else {
            (salon.cut, "10:30")
        };
        let when = ts(&format!("2025-11-03 {time}"));
        let alice = salon.alice;
        handles.push(tokio::spawn(async move {
            engine
                .book_appointment(Ulid::new(), Ulid::new(), service, alice, when.date(), when.time())
                .await
        }));
    }

    let mut winners = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::SlotTaken { .. }) | Err(EngineError::OverlapsExisting(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.appointments_for(&salon.alice, monday()).len(), 1);
}

#[tokio::test]
async fn reschedule_survives_restart() {
    let dir = data_dir();
    let clock = clock();

    let (salon, id) = {
        let engine = start(&dir, clock.clone());
        let salon = open_salon(&engine).await;
        let when = ts("2025-11-03 10:00");
        let first = assert_ok!(
            engine
                .book_appointment(Ulid::new(), Ulid::new(), salon.cut, salon.alice, when.date(), when.time())
                .await
        );
        let blocker = ts("2025-11-03 13:00");
        assert_ok!(
            engine
                .book_appointment(Ulid::new(), Ulid::new(), salon.cut, salon.alice, blocker.date(), blocker.time())
                .await
        );

        // Alice is busy at 13:00, so AnyAvailable hands it to Bob.
        let moved = assert_ok!(
            engine
                .update_appointment(first.id, None, Some(blocker.time()), StaffChange::AnyAvailable)
                .await
        );
        assert_eq!(moved.staff_id, Some(salon.bob));
        (salon, first.id)
    };

    let engine = start(&dir, clock);
    let appt = engine.get_appointment(&id).unwrap();
    assert_eq!(appt.staff_id, Some(salon.bob));
    assert_eq!(appt.start_time, NaiveTime::from_hms_opt(13, 0, 0).unwrap());
    assert_err!(
        engine
            .book_appointment(Ulid::new(), Ulid::new(), salon.cut, salon.bob, monday(), appt.start_time)
            .await
    );
    assert_eq!(engine.appointments_for(&salon.alice, monday()).len(), 1);
}

#[tokio::test]
async fn malformed_timestamps_are_rejected_up_front() {
    assert!(matches!(
        parse_timestamp("2025-11-03T10:00"),
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        parse_timestamp("2025-13-03 10:00"),
        Err(EngineError::InvalidInput(_))
    ));
}
