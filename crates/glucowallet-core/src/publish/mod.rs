//! Turning readings into time-series points and writing them out.
//!
//! - `PointPublisher`: builds one point per reading and hands it to a sink
//! - `PointSink`: the write seam, implemented by `InfluxSink`
//! - `line_protocol`: InfluxDB line protocol encoding

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::Reading;

pub mod influx;
pub mod line_protocol;

pub use influx::{InfluxSink, InfluxTarget};
pub use line_protocol::{FieldValue, PublishPoint};

/// Measurement name used by earlier glucowallet releases.
pub const DEFAULT_MEASUREMENT: &str = "libreview_data";

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink rejected write (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("sink write gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("point has no fields")]
    EmptyPoint,

    #[error("sink client error: {0}")]
    Client(#[from] reqwest::Error),
}

/// A time-series store accepting one point per call.
#[async_trait]
pub trait PointSink: Send + Sync {
    /// Durably write the point or fail; retries are the sink's own business.
    async fn write(&self, point: &PublishPoint) -> Result<(), SinkError>;
}

/// Confirmation that a reading reached the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub timestamp: DateTime<Utc>,
}

pub struct PointPublisher<S> {
    sink: S,
    measurement: String,
}

impl<S: PointSink> PointPublisher<S> {
    pub fn new(sink: S, measurement: impl Into<String>) -> Self {
        Self {
            sink,
            measurement: measurement.into(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Build the point for a reading: patient and sensor as tags, the value
    /// plus whatever vendor flags came with it as fields.
    pub fn point_for(&self, reading: &Reading, patient_id: &str) -> PublishPoint {
        let mut point = PublishPoint::new(self.measurement.as_str(), reading.timestamp)
            .tag("patientId", patient_id)
            .field("value", FieldValue::Float(reading.value_mg_dl));

        if let Some(ref serial) = reading.sensor_serial {
            point = point.tag("sensor_serial_number", serial);
        }
        if let Some(arrow) = reading.trend_arrow {
            point = point.field("trend_arrow", FieldValue::Integer(arrow));
        }
        if let Some(high) = reading.is_high {
            point = point.field("is_high", FieldValue::Boolean(high));
        }
        if let Some(low) = reading.is_low {
            point = point.field("is_low", FieldValue::Boolean(low));
        }
        if let Some(color) = reading.measurement_color {
            point = point.field("measurement_color", FieldValue::Integer(color));
        }
        point
    }

    pub async fn publish(&self, reading: &Reading, patient_id: &str) -> Result<Ack, SinkError> {
        let point = self.point_for(reading, patient_id);
        self.sink.write(&point).await?;
        Ok(Ack {
            timestamp: reading.timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TrendDirection;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PointSink for RecordingSink {
        async fn write(&self, point: &PublishPoint) -> Result<(), SinkError> {
            let line = point.to_line().ok_or(SinkError::EmptyPoint)?;
            self.lines.lock().expect("lock").push(line);
            Ok(())
        }
    }

    fn reading() -> Reading {
        let mut r = Reading::new(
            Utc.timestamp_opt(1_700_000_100, 0).single().expect("valid timestamp"),
            130.0,
            TrendDirection::Rising,
        );
        r.trend_arrow = Some(4);
        r.is_high = Some(false);
        r.sensor_serial = Some("SN9".to_string());
        r
    }

    #[test]
    fn test_point_for_reading() {
        let publisher = PointPublisher::new(RecordingSink::default(), DEFAULT_MEASUREMENT);
        let point = publisher.point_for(&reading(), "p-1");

        assert_eq!(point.measurement, "libreview_data");
        assert_eq!(
            point.tags,
            vec![
                ("patientId".to_string(), "p-1".to_string()),
                ("sensor_serial_number".to_string(), "SN9".to_string()),
            ]
        );
        assert_eq!(point.fields[0], ("value".to_string(), FieldValue::Float(130.0)));
        assert!(point
            .fields
            .contains(&("trend_arrow".to_string(), FieldValue::Integer(4))));
        assert!(!point.fields.iter().any(|(k, _)| k == "is_low"));
    }

    #[tokio::test]
    async fn test_publish_writes_one_line_and_acks() {
        let publisher = PointPublisher::new(RecordingSink::default(), "glucose");
        let ack = publisher.publish(&reading(), "p-1").await.expect("publish succeeds");

        assert_eq!(ack.timestamp, reading().timestamp);
        let lines = publisher.sink().lines.lock().expect("lock");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("glucose,patientId=p-1,sensor_serial_number=SN9 value=130"));
        assert!(lines[0].ends_with(" 1700000100"));
    }
}
