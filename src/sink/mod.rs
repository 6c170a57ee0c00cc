pub mod database_sink;
pub mod log_sink;

use std::future::Future;

use log::Level;

use crate::models::Reading;

pub use database_sink::DatabaseSink;
pub use log_sink::LogSink;

/// Destination for decoded readings and diagnostic notes
///
/// Implementations may suspend on I/O; each call happens inside its own
/// handler task, so a slow sink never holds up datagram reception.
pub trait ReadingSink: Send + Sync + 'static {
    /// Record a successfully decoded reading
    fn record_structured(&self, reading: Reading) -> impl Future<Output = ()> + Send;

    /// Record a free-text diagnostic at the given severity
    fn record_note(&self, text: &str, level: Level) -> impl Future<Output = ()> + Send;
}
