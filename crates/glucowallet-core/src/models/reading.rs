use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::connection::GlucoseItem;

/// Format of LinkUp timestamps, e.g. `1/15/2024 10:30:00 AM`.
const LINKUP_TIMESTAMP_FORMAT: &str = "%m/%d/%Y %I:%M:%S %p";

/// Direction of the glucose trend as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    FallingFast,
    Falling,
    Stable,
    Rising,
    RisingFast,
    Unknown,
}

impl TrendDirection {
    /// Map the LinkUp `TrendArrow` code (1 = falling quickly .. 5 = rising quickly).
    pub fn from_arrow(arrow: Option<i64>) -> Self {
        match arrow {
            Some(1) => TrendDirection::FallingFast,
            Some(2) => TrendDirection::Falling,
            Some(3) => TrendDirection::Stable,
            Some(4) => TrendDirection::Rising,
            Some(5) => TrendDirection::RisingFast,
            _ => TrendDirection::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::FallingFast => "falling_fast",
            TrendDirection::Falling => "falling",
            TrendDirection::Stable => "stable",
            TrendDirection::Rising => "rising",
            TrendDirection::RisingFast => "rising_fast",
            TrendDirection::Unknown => "unknown",
        }
    }
}

/// One glucose measurement, immutable once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub value_mg_dl: f64,
    pub trend: TrendDirection,
    /// Raw `TrendArrow` code, absent on history entries.
    pub trend_arrow: Option<i64>,
    pub is_high: Option<bool>,
    pub is_low: Option<bool>,
    pub measurement_color: Option<i64>,
    pub sensor_serial: Option<String>,
}

impl Reading {
    /// Minimal reading with no vendor extras.
    pub fn new(timestamp: DateTime<Utc>, value_mg_dl: f64, trend: TrendDirection) -> Self {
        Self {
            timestamp,
            value_mg_dl,
            trend,
            trend_arrow: None,
            is_high: None,
            is_low: None,
            measurement_color: None,
            sensor_serial: None,
        }
    }

    /// Convert a LinkUp glucose item. `FactoryTimestamp` is UTC; `Timestamp`
    /// is the patient's local clock and only used when the former is missing.
    pub fn from_item(item: &GlucoseItem, sensor_serial: Option<&str>) -> Result<Self, String> {
        let raw = item
            .factory_timestamp
            .as_deref()
            .or(item.timestamp.as_deref())
            .ok_or_else(|| "glucose item has no timestamp".to_string())?;
        let timestamp = parse_linkup_timestamp(raw)?;

        let value_mg_dl = item
            .value_in_mg_per_dl
            .or(item.value)
            .ok_or_else(|| "glucose item has no value".to_string())?;
        if !value_mg_dl.is_finite() {
            return Err(format!("glucose value is not a number: {}", value_mg_dl));
        }

        Ok(Self {
            timestamp,
            value_mg_dl,
            trend: TrendDirection::from_arrow(item.trend_arrow),
            trend_arrow: item.trend_arrow,
            is_high: item.is_high,
            is_low: item.is_low,
            measurement_color: item.measurement_color,
            sensor_serial: sensor_serial.map(str::to_string),
        })
    }
}

/// Parse a LinkUp timestamp as UTC.
pub fn parse_linkup_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    NaiveDateTime::parse_from_str(raw.trim(), LINKUP_TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("unrecognized timestamp {:?}: {}", raw, e))
}

/// Pick the most recent reading. On an exact timestamp tie the entry that
/// appears first wins.
pub fn select_latest(readings: Vec<Reading>) -> Option<Reading> {
    let mut latest: Option<Reading> = None;
    for reading in readings {
        let newer = match &latest {
            Some(current) => reading.timestamp > current.timestamp,
            None => true,
        };
        if newer {
            latest = Some(reading);
        }
    }
    latest
}
