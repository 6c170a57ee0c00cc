/// Protobuf schema shared with the LightPet sensor firmware
///
/// The message is declared with prost's derive attributes directly rather than
/// generated from a `.proto` file at build time. Field tags and scalar types must
/// stay in sync with the firmware:
///
/// ```text
/// message SensorData {
///   uint64 timestamp             = 1;
///   uint32 temperatureSampleRate = 2;
///   uint32 humiditySampleRate    = 3;
///   uint32 audioSampleRate       = 4;
///   uint32 lightSampleRate       = 5;
///   repeated sint32 temperatureData = 6;
///   repeated uint32 humidityData    = 7;
///   repeated uint32 audioData       = 8;
///   repeated uint32 lightData       = 9;
///   uint64 chipID                = 10;
/// }
/// ```
use std::fmt;
use std::str::FromStr;

use time::error::ComponentRange;
use time::OffsetDateTime;

/// Raw sensor message exactly as it travels on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SensorDataMessage {
    #[prost(uint64, tag = "1")]
    pub timestamp: u64,
    #[prost(uint32, tag = "2")]
    pub temperature_sample_rate: u32,
    #[prost(uint32, tag = "3")]
    pub humidity_sample_rate: u32,
    #[prost(uint32, tag = "4")]
    pub audio_sample_rate: u32,
    #[prost(uint32, tag = "5")]
    pub light_sample_rate: u32,
    /// Centi-degrees Celsius
    #[prost(sint32, repeated, tag = "6")]
    pub temperature_data: Vec<i32>,
    /// Centi-percent relative humidity
    #[prost(uint32, repeated, tag = "7")]
    pub humidity_data: Vec<u32>,
    #[prost(uint32, repeated, tag = "8")]
    pub audio_data: Vec<u32>,
    #[prost(uint32, repeated, tag = "9")]
    pub light_data: Vec<u32>,
    #[prost(uint64, tag = "10")]
    pub chip_id: u64,
}

/// Unit of the integer `timestamp` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochUnit {
    Seconds,
    Milliseconds,
}

impl EpochUnit {
    /// Convert a raw epoch value to a UTC instant
    pub fn to_datetime(self, raw: u64) -> Result<OffsetDateTime, ComponentRange> {
        let nanos_per_unit: i128 = match self {
            EpochUnit::Seconds => 1_000_000_000,
            EpochUnit::Milliseconds => 1_000_000,
        };
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(raw) * nanos_per_unit)
    }
}

/// Firmware revisions of the sensor schema
///
/// Legacy firmware stamped readings in whole seconds; current firmware sends
/// milliseconds since the Unix epoch. Field layout is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaRevision {
    Legacy,
    #[default]
    Current,
}

impl SchemaRevision {
    pub fn epoch_unit(self) -> EpochUnit {
        match self {
            SchemaRevision::Legacy => EpochUnit::Seconds,
            SchemaRevision::Current => EpochUnit::Milliseconds,
        }
    }
}

impl fmt::Display for SchemaRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaRevision::Legacy => write!(f, "legacy"),
            SchemaRevision::Current => write!(f, "current"),
        }
    }
}

impl FromStr for SchemaRevision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" | "seconds" | "s" => Ok(SchemaRevision::Legacy),
            "current" | "milliseconds" | "ms" => Ok(SchemaRevision::Current),
            other => Err(format!(
                "unknown schema revision '{}', expected 'current' or 'legacy'",
                other
            )),
        }
    }
}
