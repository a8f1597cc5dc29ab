//! Schedule entry parsing and trigger arithmetic.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::str::FromStr;

/// Default `once` timestamp format.
pub const DEFAULT_ONCE_FMT: &str = "%Y-%m-%dT%H:%M:%S";

fn default_true() -> bool {
    true
}

/// Typed view over one raw schedule entry. The raw map stays the
/// source of truth (it is what gets persisted); this view is parsed
/// fresh each evaluation.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    #[serde(skip)]
    pub name: String,

    #[serde(alias = "func", alias = "fun")]
    pub function: Option<String>,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub seconds: Option<i64>,
    pub minutes: Option<i64>,
    pub hours: Option<i64>,
    pub days: Option<i64>,

    /// One date-time, or a list of them, or names resolved through the
    /// `whens` tables in the configuration- or attribute-tree.
    pub when: Option<Value>,
    pub cron: Option<String>,
    pub once: Option<String>,
    pub once_fmt: Option<String>,

    pub after: Option<String>,
    pub until: Option<String>,
    pub range: Option<Value>,
    pub splay: Option<Value>,

    pub maxrunning: Option<u64>,
    #[serde(default = "default_true")]
    pub jid_include: bool,
    #[serde(default = "default_true")]
    pub run_on_start: bool,

    pub returner: Option<Value>,
    #[serde(default = "default_true")]
    pub return_job: bool,
    pub metadata: Option<Value>,
}

impl ScheduleEntry {
    pub fn parse(name: &str, raw: &Value) -> Option<Self> {
        let mut entry: ScheduleEntry = serde_json::from_value(raw.clone()).ok()?;
        entry.name = name.to_string();
        Some(entry)
    }

    /// Sum of the interval fields, in seconds.
    pub fn interval_seconds(&self) -> i64 {
        self.seconds.unwrap_or(0)
            + self.minutes.unwrap_or(0) * 60
            + self.hours.unwrap_or(0) * 3600
            + self.days.unwrap_or(0) * 86400
    }

    pub fn has_interval(&self) -> bool {
        self.seconds.is_some() || self.minutes.is_some() || self.hours.is_some() || self.days.is_some()
    }

    /// The trigger keys `when`, `cron` and `once` are mutually
    /// exclusive, and each is mutually exclusive with the interval
    /// fields.
    pub fn validate_trigger(raw: &Value) -> Result<(), String> {
        let keys: HashSet<&str> = raw
            .as_object()
            .map(|map| map.keys().map(String::as_str).collect())
            .unwrap_or_default();

        let scheduling = ["when", "cron", "once"];
        let time_elements = ["seconds", "minutes", "hours", "days"];

        let present: Vec<&str> = scheduling
            .iter()
            .copied()
            .filter(|key| keys.contains(key))
            .collect();
        if present.len() > 1 {
            return Err(format!(
                "unable to use {:?} options together",
                present.join("\", \"")
            ));
        }
        if let Some(sched_key) = present.first() {
            for time_key in time_elements {
                if keys.contains(time_key) {
                    return Err(format!(
                        "unable to use \"{sched_key}\" with \"{time_key}\""
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A `range` gate: run only inside (or, inverted, only outside) the
/// start..end window.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeSpec {
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub invert: bool,
}

impl RangeSpec {
    pub fn parse(raw: &Value) -> Option<Self> {
        serde_json::from_value(raw.clone()).ok()
    }

    /// Whether `now` passes the gate.
    pub fn permits(&self, now: i64) -> Result<bool, String> {
        let start = parse_datetime(&self.start, now)
            .ok_or_else(|| format!("invalid date string for start: {:?}", self.start))?;
        let end = parse_datetime(&self.end, now)
            .ok_or_else(|| format!("invalid date string for end: {:?}", self.end))?;
        if end <= start {
            return Err("invalid range, end must be larger than start".to_string());
        }
        Ok(if self.invert {
            now <= start || now >= end
        } else {
            now >= start && now <= end
        })
    }
}

/// A `splay` window: a flat cap `[0, n]` or an explicit
/// `{start, end}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplaySpec {
    pub start: i64,
    pub end: i64,
}

impl SplaySpec {
    pub fn parse(raw: &Value) -> Result<Self, String> {
        match raw {
            Value::Number(n) => {
                let cap = n.as_i64().ok_or("splay must be an integer")?;
                Ok(SplaySpec { start: 0, end: cap })
            }
            Value::Object(map) => {
                let start = map.get("start").and_then(Value::as_i64).unwrap_or(0);
                let end = map
                    .get("end")
                    .and_then(Value::as_i64)
                    .ok_or("splay window requires an end")?;
                if end < start {
                    return Err("invalid splay, end must be larger than start".to_string());
                }
                Ok(SplaySpec { start, end })
            }
            _ => Err("splay must be an integer or a {start, end} map".to_string()),
        }
    }
}

/// Parse a date-time string into unix seconds, local time. Date-only
/// and time-only forms are accepted; a bare time is anchored to the
/// date `now` falls on.
pub fn parse_datetime(raw: &str, now: i64) -> Option<i64> {
    let raw = raw.trim();

    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ];
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return local_to_unix(naive);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return local_to_unix(date.and_hms_opt(0, 0, 0)?);
    }

    const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M", "%I:%M%p", "%I:%M %p", "%I%p"];
    for fmt in TIME_FORMATS {
        if let Ok(time) = NaiveTime::parse_from_str(raw, fmt) {
            let today = Local
                .timestamp_opt(now, 0)
                .single()
                .map(|dt| dt.date_naive())?;
            return local_to_unix(today.and_time(time));
        }
    }

    None
}

fn local_to_unix(naive: NaiveDateTime) -> Option<i64> {
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp())
}

/// Parse a timestamp with an explicit format (the `once` trigger).
pub fn parse_with_format(raw: &str, fmt: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
    local_to_unix(naive)
}

/// Seconds until the next cron fire after `now`. A five-field
/// expression gets a seconds column prepended.
pub fn cron_next(expr: &str, now: i64) -> Option<i64> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = cron::Schedule::from_str(&normalized).ok()?;
    let now_utc = chrono::Utc.timestamp_opt(now, 0).single()?;
    schedule
        .after(&now_utc)
        .next()
        .map(|next| next.timestamp() - now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_applies_defaults_and_aliases() {
        let raw = json!({"function": "test.ping", "seconds": 2});
        let entry = ScheduleEntry::parse("ping", &raw).unwrap();
        assert_eq!(entry.function.as_deref(), Some("test.ping"));
        assert_eq!(entry.interval_seconds(), 2);
        assert!(entry.enabled && entry.jid_include && entry.run_on_start && entry.return_job);

        let raw = json!({"func": "test.ping", "minutes": 1, "hours": 1, "days": 1});
        let entry = ScheduleEntry::parse("x", &raw).unwrap();
        assert_eq!(entry.interval_seconds(), 60 + 3600 + 86400);

        let raw = json!({"fun": "test.ping"});
        assert_eq!(
            ScheduleEntry::parse("x", &raw).unwrap().function.as_deref(),
            Some("test.ping")
        );
    }

    #[test]
    fn trigger_combinations_rejected() {
        assert!(ScheduleEntry::validate_trigger(&json!({"when": "x", "cron": "y"})).is_err());
        assert!(ScheduleEntry::validate_trigger(&json!({"once": "x", "seconds": 5})).is_err());
        assert!(ScheduleEntry::validate_trigger(&json!({"when": "x", "minutes": 5})).is_err());
        assert!(ScheduleEntry::validate_trigger(&json!({"seconds": 5, "minutes": 2})).is_ok());
        assert!(ScheduleEntry::validate_trigger(&json!({"cron": "* * * * *"})).is_ok());
    }

    #[test]
    fn range_gates() {
        let now = parse_datetime("2025-06-01 12:00:00", 0).unwrap();
        let spec = RangeSpec::parse(&json!({
            "start": "2025-06-01 08:00:00",
            "end": "2025-06-01 17:00:00",
        }))
        .unwrap();
        assert!(spec.permits(now).unwrap());

        let inverted = RangeSpec::parse(&json!({
            "start": "2025-06-01 08:00:00",
            "end": "2025-06-01 17:00:00",
            "invert": true,
        }))
        .unwrap();
        assert!(!inverted.permits(now).unwrap());

        let backwards = RangeSpec::parse(&json!({
            "start": "2025-06-01 17:00:00",
            "end": "2025-06-01 08:00:00",
        }))
        .unwrap();
        assert!(backwards.permits(now).is_err());
    }

    #[test]
    fn splay_forms() {
        assert_eq!(
            SplaySpec::parse(&json!(15)).unwrap(),
            SplaySpec { start: 0, end: 15 }
        );
        assert_eq!(
            SplaySpec::parse(&json!({"start": 10, "end": 15})).unwrap(),
            SplaySpec { start: 10, end: 15 }
        );
        assert!(SplaySpec::parse(&json!({"start": 15, "end": 10})).is_err());
        assert!(SplaySpec::parse(&json!("soon")).is_err());
    }

    #[test]
    fn datetime_forms() {
        let now = 0;
        assert!(parse_datetime("2025-06-01T08:00:00", now).is_some());
        assert!(parse_datetime("2025-06-01 08:00", now).is_some());
        assert!(parse_datetime("2025-06-01", now).is_some());
        assert!(parse_datetime("not a date", now).is_none());

        let a = parse_datetime("2025-06-01 08:00:00", now).unwrap();
        let b = parse_datetime("2025-06-01 09:00:00", now).unwrap();
        assert_eq!(b - a, 3600);
    }

    #[test]
    fn once_format() {
        assert!(parse_with_format("2025-04-22T20:21:00", DEFAULT_ONCE_FMT).is_some());
        assert!(parse_with_format("22/04/2025 20:21", "%d/%m/%Y %H:%M").is_some());
        assert!(parse_with_format("nope", DEFAULT_ONCE_FMT).is_none());
    }

    #[test]
    fn cron_five_field() {
        // every minute: next fire is within the next 60 seconds
        let now = parse_datetime("2025-06-01 12:00:30", 0).unwrap();
        let next = cron_next("* * * * *", now).unwrap();
        assert!(next > 0 && next <= 60, "next={next}");
        assert!(cron_next("not a cron", now).is_none());
    }
}
