//! Core domain model for hotspot activity trawling.

use chrono::{DateTime, Duration, NaiveTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

pub const CRATE_NAME: &str = "trawl-core";

/// Raw JSON object as delivered by the activity source.
pub type JsonObject = Map<String, JsonValue>;

/// Identity of the hotspot being mirrored, resolved once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotspotIdentity {
    pub address: String,
    pub name: String,
    pub birthday: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    PocReceiptsV1,
    RewardsV2,
    Other(String),
}

impl ActivityKind {
    pub fn from_type(value: &str) -> Self {
        match value {
            "poc_receipts_v1" => Self::PocReceiptsV1,
            "rewards_v2" => Self::RewardsV2,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::PocReceiptsV1 => "poc_receipts_v1",
            Self::RewardsV2 => "rewards_v2",
            Self::Other(other) => other,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("activity record is not a JSON object")]
    NotAnObject,
    #[error("activity record is missing field `{0}`")]
    MissingField(&'static str),
}

/// One activity transaction. `document` keeps the full raw payload, including
/// the fields lifted into `hash`, `kind` and `time`.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivityRecord {
    pub hash: String,
    pub kind: ActivityKind,
    pub time: i64,
    pub document: JsonObject,
}

impl ActivityRecord {
    /// Lift the dedup key, type and timestamp out of a raw record. Only field
    /// presence is checked; the rest of the payload stays opaque.
    pub fn from_json(value: JsonValue) -> Result<Self, RecordError> {
        let JsonValue::Object(document) = value else {
            return Err(RecordError::NotAnObject);
        };
        let hash = document
            .get("hash")
            .and_then(JsonValue::as_str)
            .ok_or(RecordError::MissingField("hash"))?
            .to_string();
        let kind = document
            .get("type")
            .and_then(JsonValue::as_str)
            .map(ActivityKind::from_type)
            .ok_or(RecordError::MissingField("type"))?;
        let time = document
            .get("time")
            .and_then(JsonValue::as_i64)
            .ok_or(RecordError::MissingField("time"))?;
        Ok(Self {
            hash,
            kind,
            time,
            document,
        })
    }
}

/// "Last fully synced day" marker, persisted once per hotspot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "lastRun")]
    pub last_run_epoch_millis: i64,
    #[serde(rename = "lastRunHumanReadable", default)]
    pub last_run_human_readable: String,
}

impl Checkpoint {
    pub fn for_day(day: DateTime<Utc>) -> Self {
        Self {
            last_run_epoch_millis: day.timestamp_millis(),
            last_run_human_readable: day.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn day(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_run_epoch_millis).single()
    }
}

/// Midnight (UTC) of the day containing `ts`.
pub fn start_of_day(ts: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&ts.date_naive().and_time(NaiveTime::MIN))
}

/// Bounds of one day's first-page fetch: from 23:59:59 on the previous day to
/// 23:59:59 on `day`. A window reaching past `now` ends one minute before it,
/// but never before `min_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DayWindow {
    pub min_time: DateTime<Utc>,
    pub max_time: DateTime<Utc>,
}

impl DayWindow {
    pub fn for_day(day: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let midnight = start_of_day(day);
        let min_time = midnight - Duration::seconds(1);
        let mut max_time = midnight + Duration::days(1) - Duration::seconds(1);
        if max_time > now {
            // In the first minute after midnight the clamp would invert the range.
            max_time = (now - Duration::minutes(1)).max(min_time);
        }
        Self { min_time, max_time }
    }
}

/// One page of activity. A page without a cursor ends the day's window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Page {
    pub records: Vec<ActivityRecord>,
    pub cursor: Option<String>,
}

/// Per-day diagnostic counters; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DayStats {
    pub fetched: usize,
    pub new_docs: usize,
    pub duplicate_docs: usize,
}

impl DayStats {
    pub fn record_new(&mut self) {
        self.fetched += 1;
        self.new_docs += 1;
    }

    pub fn record_duplicate(&mut self) {
        self.fetched += 1;
        self.duplicate_docs += 1;
    }
}
