// Hard limits on engine inputs. Anything beyond these is rejected before a WAL write.

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 1024;
pub const MAX_STAFF: usize = 10_000;
pub const MAX_SERVICES: usize = 10_000;
pub const MAX_SERVICES_PER_STAFF: usize = 1_000;
pub const MAX_DAYS_OFF_PER_STAFF: usize = 1_000;
/// One booking per minute of the day.
pub const MAX_APPOINTMENTS_PER_DAY: usize = 1_440;
pub const MAX_SERVICE_DURATION_SECS: i64 = 24 * 3_600;
pub const MAX_SLOT_DURATION_MINUTES: u32 = 24 * 60;
pub const MAX_BUFFER_MINUTES: f64 = 7.0 * 24.0 * 60.0;
/// Longest accepted day-off range, in days.
pub const MAX_DAY_OFF_SPAN_DAYS: i64 = 366;
