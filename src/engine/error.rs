use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Another appointment already starts at exactly this time for this staff member.
    SlotTaken {
        staff_id: Ulid,
        date: NaiveDate,
        start_time: NaiveTime,
    },
    /// The requested interval intersects this existing appointment.
    OverlapsExisting(Ulid),
    /// Service duration must be > 0 seconds.
    InvalidDuration(i64),
    /// No staff member offering the service has the requested slot free.
    StaffUnavailableForService(Ulid),
    InvalidInput(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotTaken {
                staff_id,
                date,
                start_time,
            } => write!(
                f,
                "slot already taken: staff {staff_id} on {date} at {}",
                start_time.format("%H:%M")
            ),
            EngineError::OverlapsExisting(id) => {
                write!(f, "overlaps existing appointment: {id}")
            }
            EngineError::InvalidDuration(secs) => {
                write!(f, "invalid service duration: {secs}s (must be > 0)")
            }
            EngineError::StaffUnavailableForService(id) => {
                write!(f, "no staff member available for service {id} at the requested time")
            }
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl EngineError {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotTaken { .. } => "slot_taken",
            EngineError::OverlapsExisting(_) => "overlaps_existing",
            EngineError::InvalidDuration(_) => "invalid_duration",
            EngineError::StaffUnavailableForService(_) => "staff_unavailable",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
