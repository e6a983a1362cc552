//! Chunked persistent storage for sampler output.

pub mod store;

pub use store::{read_components, read_records, write_components, SampleRecord, SampleStore};
