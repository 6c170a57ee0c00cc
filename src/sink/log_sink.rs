use log::{debug, info, log, Level};
use serde_json::Value;

use crate::models::Reading;
use crate::sink::ReadingSink;

/// Sink that writes everything through the `log` facade
///
/// Readings are emitted as a single-line JSON record at info level, with the
/// multi-line summary following at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReadingSink for LogSink {
    async fn record_structured(&self, reading: Reading) {
        info!(
            "Reading from chip {}: {}",
            reading.chip_id,
            Value::Object(reading.to_record())
        );
        debug!("Reading summary:\n{}", reading);
    }

    async fn record_note(&self, text: &str, level: Level) {
        log!(level, "{}", text);
    }
}
