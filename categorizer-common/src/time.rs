pub trait TimeSource {
    /// Seconds since the unix epoch, with sub-second precision.
    fn epoch_seconds(&self) -> f64;
}

#[derive(Clone, Default)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn epoch_seconds(&self) -> f64 {
        let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();

        nanos as f64 / 1_000_000_000f64
    }
}
