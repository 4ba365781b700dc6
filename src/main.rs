use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use ulid::Ulid;

use slotbook::clock::SystemClock;
use slotbook::compactor;
use slotbook::engine::{Engine, EngineError};
use slotbook::notify::NotifyHub;
use slotbook::timefmt::{format_date, format_time, format_timestamp, parse_date, parse_timestamp};

const USAGE: &str = "usage:
  slotbook slots <staff> <YYYY-MM-DD> <service>
  slotbook across <service> <YYYY-MM-DD>
  slotbook book <client> <service> <staff> <YYYY-MM-DD HH:MM>";

fn parse_id(s: &str) -> Result<Ulid, EngineError> {
    Ulid::from_string(s).map_err(|e| EngineError::InvalidInput(format!("bad id {s:?}: {e}")))
}

async fn run(engine: &Engine, args: &[String]) -> Result<serde_json::Value, EngineError> {
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    match args.as_slice() {
        ["slots", staff, date, service] => {
            let (staff, date, service) = (parse_id(staff)?, parse_date(date)?, parse_id(service)?);
            let slots = engine.available_slots(&staff, date, &service)?;
            Ok(json!({
                "staff": staff,
                "date": format_date(date),
                "status": engine.day_status(&staff, date)?,
                "slots": slots.into_iter().map(format_timestamp).collect::<Vec<_>>(),
            }))
        }
        ["across", service, date] => {
            let (service, date) = (parse_id(service)?, parse_date(date)?);
            let across = engine.availability_across_staff(&service, date)?;
            let staff: serde_json::Map<String, serde_json::Value> = across
                .into_iter()
                .map(|(id, slots)| {
                    let slots: Vec<String> = slots.into_iter().map(format_timestamp).collect();
                    (id.to_string(), json!(slots))
                })
                .collect();
            Ok(json!({ "service": service, "date": format_date(date), "staff": staff }))
        }
        ["book", client, service, staff, when] => {
            let (client, service, staff) = (parse_id(client)?, parse_id(service)?, parse_id(staff)?);
            let when = parse_timestamp(when)?;
            let appt = engine
                .book_appointment(Ulid::new(), client, service, staff, when.date(), when.time())
                .await?;
            Ok(json!({
                "id": appt.id,
                "client": appt.client_id,
                "service": appt.service_id,
                "staff": appt.staff_id,
                "date": format_date(appt.date),
                "start_time": format_time(appt.start_time),
                "end_time": appt.end_time.map(format_time),
            }))
        }
        _ => Err(EngineError::InvalidInput(USAGE.into())),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let metrics_port: Option<u16> = std::env::var("SLOTBOOK_METRICS_PORT")
        .ok()
        .and_then(|s| s.parse().ok());
    slotbook::observability::init(metrics_port)?;

    let data_dir = std::env::var("SLOTBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into());
    let compact_threshold: u64 = std::env::var("SLOTBOOK_COMPACT_THRESHOLD")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1000);

    std::fs::create_dir_all(&data_dir)?;
    let wal_path = PathBuf::from(&data_dir).join("slotbook.wal");
    let engine = Arc::new(Engine::new(wal_path, Arc::new(NotifyHub::new()), Arc::new(SystemClock))?);
    info!("data_dir: {data_dir}");

    let compactor = tokio::spawn(compactor::run_compactor(
        engine.clone(),
        compact_threshold,
        compactor::CHECK_INTERVAL,
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let outcome = run(&engine, &args).await;

    compactor.abort();
    compactor::compact_if_needed(&engine, compact_threshold).await;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(match e {
                EngineError::InvalidInput(_) => 2,
                _ => 1,
            });
        }
    }
}
