use std::fmt;

use serde_json::{json, Map, Value};
use time::OffsetDateTime;

use crate::utils::{format_datetime, unix_seconds};

/// One decoded sensor snapshot from a LightPet device
///
/// Series lengths are independent per channel and values are not range-checked.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub captured_at: OffsetDateTime,
    pub temperature_sample_rate_hz: u32,
    pub humidity_sample_rate_hz: u32,
    pub audio_sample_rate_hz: u32,
    pub light_sample_rate_hz: u32,
    /// Degrees Celsius
    pub temperature_series: Vec<f64>,
    /// Percent relative humidity
    pub humidity_series: Vec<f64>,
    pub audio_series: Vec<u32>,
    pub light_series: Vec<u32>,
    pub chip_id: u64,
}

impl Reading {
    /// Flatten the reading into a key/value record suitable for JSON output
    ///
    /// The timestamp is expressed as fractional Unix seconds.
    pub fn to_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("time".into(), json!(unix_seconds(&self.captured_at)));
        record.insert(
            "temperatureSampleRate".into(),
            json!(self.temperature_sample_rate_hz),
        );
        record.insert(
            "humiditySampleRate".into(),
            json!(self.humidity_sample_rate_hz),
        );
        record.insert("audioSampleRate".into(), json!(self.audio_sample_rate_hz));
        record.insert("lightSampleRate".into(), json!(self.light_sample_rate_hz));
        record.insert("temperatureData".into(), json!(self.temperature_series));
        record.insert("humidityData".into(), json!(self.humidity_series));
        record.insert("audioData".into(), json!(self.audio_series));
        record.insert("lightData".into(), json!(self.light_series));
        record.insert("chipID".into(), json!(self.chip_id));
        record
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Time: {}", format_datetime(&self.captured_at))?;
        writeln!(f, "Chip ID: {}", self.chip_id)?;
        writeln!(
            f,
            "Sample rates: {}Hz (temperature), {}Hz (humidity), {}Hz (audio), {}Hz (light)",
            self.temperature_sample_rate_hz,
            self.humidity_sample_rate_hz,
            self.audio_sample_rate_hz,
            self.light_sample_rate_hz
        )?;
        writeln!(f, "Temperature data (degrees C): {:?}", self.temperature_series)?;
        writeln!(f, "Humidity data (%): {:?}", self.humidity_series)?;
        writeln!(f, "Audio data: {:?}", self.audio_series)?;
        writeln!(f, "Light data: {:?}", self.light_series)
    }
}
