//! Bridges between wire dialects: inbound→outbound request transforms,
//! outbound→inbound response shaping, and streaming aggregation.
//!
//! The tables in `table` are the single registry of which pairs are
//! supported; everything else is a pure function per pair.

pub mod body;
pub mod generate;
pub mod shape;
pub mod stream;
pub mod table;
pub mod usage;

pub use body::{RequestBody, ResponseBody};
pub use stream::{AggregatedStream, StreamAggregator};
pub use table::{TransformError, shape_response, transform_request};
pub use usage::{UsageSummary, usage_from_response};
