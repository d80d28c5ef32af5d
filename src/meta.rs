//! Metadata records describing a source file or one of its datasets, and a
//! bounded cache for them.
mod cache;
mod record;

pub use cache::{CacheKey, MetadataCache, DEFAULT_CACHE_CAPACITY};
pub use record::{
    normalize_unit, MetadataRecord, PhysicalCalibration, FILE_NAME, PHYSICAL_SIZE_X,
    PHYSICAL_SIZE_X_ORIGIN, PHYSICAL_SIZE_X_UNIT, PHYSICAL_SIZE_Y, PHYSICAL_SIZE_Y_ORIGIN,
    PHYSICAL_SIZE_Y_UNIT,
};
