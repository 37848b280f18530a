use serde::{Deserialize, Serialize};

/// A patient the LinkUp account follows, as returned by `/llu/connections`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "patientId")]
    pub patient_id: String,
    #[serde(rename = "firstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "lastName", default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub sensor: Option<SensorInfo>,
    #[serde(rename = "glucoseMeasurement", default)]
    pub glucose_measurement: Option<GlucoseItem>,
}

impl Connection {
    pub fn sensor_serial(&self) -> Option<&str> {
        self.sensor.as_ref().and_then(|s| s.serial_number.as_deref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorInfo {
    #[serde(rename = "sn", default)]
    pub serial_number: Option<String>,
}

/// A glucose entry, either the current measurement or a history point.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlucoseItem {
    #[serde(rename = "FactoryTimestamp", default)]
    pub factory_timestamp: Option<String>,
    #[serde(rename = "Timestamp", default)]
    pub timestamp: Option<String>,
    #[serde(rename = "ValueInMgPerDl", default)]
    pub value_in_mg_per_dl: Option<f64>,
    #[serde(rename = "Value", default)]
    pub value: Option<f64>,
    #[serde(rename = "TrendArrow", default)]
    pub trend_arrow: Option<i64>,
    #[serde(rename = "MeasurementColor", default)]
    pub measurement_color: Option<i64>,
    #[serde(rename = "isHigh", default)]
    pub is_high: Option<bool>,
    #[serde(rename = "isLow", default)]
    pub is_low: Option<bool>,
}
