//! Data models for LinkUp entities.
//!
//! - `Reading`, `TrendDirection`: one glucose measurement in domain form
//! - `Connection`, `GlucoseItem`: the vendor's wire shapes

pub mod connection;
pub mod reading;

pub use connection::{Connection, GlucoseItem, SensorInfo};
pub use reading::{parse_linkup_timestamp, select_latest, Reading, TrendDirection};
