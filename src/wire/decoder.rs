/// Decoding of raw sensor datagrams into readings
use log::Level;
use prost::Message;
use thiserror::Error;

use crate::models::Reading;
use crate::wire::schema::{SchemaRevision, SensorDataMessage};

/// Why a datagram did not produce a reading
#[derive(Error, Debug)]
pub enum DecodeFailure {
    /// Bytes are not a well-formed sensor message. Routine for advertisements
    /// looping back to the intake socket.
    #[error("not a sensor data message: {0}")]
    NotOurFormat(#[from] prost::DecodeError),

    #[error("sensor data message could not be converted: {0}")]
    Other(String),
}

impl DecodeFailure {
    /// Severity at which the failure should be reported
    pub fn level(&self) -> Level {
        match self {
            DecodeFailure::NotOurFormat(_) => Level::Debug,
            DecodeFailure::Other(_) => Level::Warn,
        }
    }
}

/// Stateless decoder for one schema revision
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder {
    revision: SchemaRevision,
}

impl Decoder {
    pub fn new(revision: SchemaRevision) -> Self {
        Self { revision }
    }

    pub fn revision(&self) -> SchemaRevision {
        self.revision
    }

    /// Decode one datagram
    ///
    /// Temperature and humidity samples arrive as hundredths and are scaled
    /// back to real units; audio and light samples are passed through as-is.
    pub fn decode(&self, bytes: &[u8]) -> Result<Reading, DecodeFailure> {
        let message = SensorDataMessage::decode(bytes)?;

        let captured_at = self
            .revision
            .epoch_unit()
            .to_datetime(message.timestamp)
            .map_err(|e| {
                DecodeFailure::Other(format!("timestamp {} out of range: {}", message.timestamp, e))
            })?;

        Ok(Reading {
            captured_at,
            temperature_sample_rate_hz: message.temperature_sample_rate,
            humidity_sample_rate_hz: message.humidity_sample_rate,
            audio_sample_rate_hz: message.audio_sample_rate,
            light_sample_rate_hz: message.light_sample_rate,
            temperature_series: message
                .temperature_data
                .iter()
                .map(|&raw| f64::from(raw) / 100.0)
                .collect(),
            humidity_series: message
                .humidity_data
                .iter()
                .map(|&raw| f64::from(raw) / 100.0)
                .collect(),
            audio_series: message.audio_data,
            light_series: message.light_data,
            chip_id: message.chip_id,
        })
    }
}
