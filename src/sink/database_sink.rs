use log::{debug, error, Level};

use crate::database::{store_reading, DatabaseError, SharedConnection};
use crate::models::Reading;
use crate::sink::{LogSink, ReadingSink};

/// Sink that persists readings to PostgreSQL in addition to logging them
///
/// All handler tasks write through one shared connection. Storage failures are
/// logged and otherwise swallowed.
pub struct DatabaseSink {
    connection: SharedConnection,
    log: LogSink,
}

impl DatabaseSink {
    /// Fails on an unusable URL or CA file; the connection itself opens lazily
    pub fn new(database_url: &str) -> Result<Self, DatabaseError> {
        Ok(Self {
            connection: SharedConnection::new(database_url)?,
            log: LogSink,
        })
    }
}

impl ReadingSink for DatabaseSink {
    async fn record_structured(&self, reading: Reading) {
        match store_reading(&self.connection, &reading).await {
            Ok(()) => debug!("Stored reading from chip {}", reading.chip_id),
            Err(e) => error!(
                "Failed to store reading from chip {}: {}",
                reading.chip_id, e
            ),
        }
        self.log.record_structured(reading).await;
    }

    async fn record_note(&self, text: &str, level: Level) {
        self.log.record_note(text, level).await;
    }
}
