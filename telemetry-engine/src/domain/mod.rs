mod bucket;
mod meter;
mod reading;
mod window;

pub use bucket::{Bucket, BucketKey};
pub use meter::{Category, Meter, MeterStatus};
pub use reading::{
    clamp_to_valid, full_range, to_utc, validate_reading, MAX_TS, MIN_TS, MeterReading, Reading, ReadingFilter, ReadingKey,
};
pub use window::WindowSize;
