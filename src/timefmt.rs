//! Text forms exchanged with callers: dates as `YYYY-MM-DD`, times as
//! `HH:MM[:SS]`, timestamps as `YYYY-MM-DD HH:MM[:SS]`.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::engine::EngineError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .map_err(|e| EngineError::InvalidInput(format!("bad date {s:?}: {e}")))
}

pub fn parse_time(s: &str) -> Result<NaiveTime, EngineError> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|e| EngineError::InvalidInput(format!("bad time {s:?}: {e}")))
}

pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, EngineError> {
    let s = s.trim();
    let (date, time) = s
        .split_once(' ')
        .ok_or_else(|| EngineError::InvalidInput(format!("bad timestamp {s:?}: expected \"YYYY-MM-DD HH:MM\"")))?;
    Ok(parse_date(date)?.and_time(parse_time(time)?))
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn format_time(time: NaiveTime) -> String {
    time.format(TIME_FORMAT).to_string()
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}
