/// Database operations for storing decoded readings
use crate::database::connection::{DatabaseError, SharedConnection};
use crate::models::Reading;

/// Store one reading in the sensor_readings table
///
/// Sample series are stored as PostgreSQL arrays. Unsigned wire values are widened
/// to BIGINT, and the chip ID is stored bit-for-bit as a signed BIGINT.
///
/// # Arguments
/// * `connection` - Shared connection the insert runs on
/// * `reading` - Decoded reading to store
///
/// # Returns
/// Result indicating success or failure
pub async fn store_reading(
    connection: &SharedConnection,
    reading: &Reading,
) -> Result<(), DatabaseError> {
    let chip_id = reading.chip_id as i64;
    let temperature_rate = i64::from(reading.temperature_sample_rate_hz);
    let humidity_rate = i64::from(reading.humidity_sample_rate_hz);
    let audio_rate = i64::from(reading.audio_sample_rate_hz);
    let light_rate = i64::from(reading.light_sample_rate_hz);
    let audio: Vec<i64> = reading.audio_series.iter().map(|&v| i64::from(v)).collect();
    let light: Vec<i64> = reading.light_series.iter().map(|&v| i64::from(v)).collect();

    connection
        .execute(
            "INSERT INTO sensor_readings(chip_id, time, temperature_sample_rate, humidity_sample_rate,
             audio_sample_rate, light_sample_rate, temperature_data, humidity_data, audio_data, light_data)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            &[
                &chip_id,
                &reading.captured_at,
                &temperature_rate,
                &humidity_rate,
                &audio_rate,
                &light_rate,
                &reading.temperature_series,
                &reading.humidity_series,
                &audio,
                &light,
            ],
        )
        .await?;

    Ok(())
}
