/// Utility functions for timestamp formatting
use time::format_description::FormatItem;
use time::macros::format_description;
use time::OffsetDateTime;

const DATETIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[day].[month].[year] - [hour]:[minute]:[second].[subsecond digits:3] UTC"
);

/// Format a timestamp for human-readable logging
///
/// Converts to UTC and renders as DD.MM.YYYY - HH:MM:SS.mmm UTC.
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    let utc = dt.to_offset(time::UtcOffset::UTC);
    utc.format(DATETIME_FORMAT)
        .unwrap_or_else(|_| utc.to_string())
}

/// Unix time as fractional seconds, the portable form used in structured records
pub fn unix_seconds(dt: &OffsetDateTime) -> f64 {
    dt.unix_timestamp() as f64 + f64::from(dt.nanosecond()) / 1_000_000_000.0
}
