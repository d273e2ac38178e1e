pub mod chunker;

pub use chunker::{split, DeliverySegment, LimitTooSmall, DEFAULT_SAFE_LIMIT};
