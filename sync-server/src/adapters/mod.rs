//! Bundled resource adapters

pub mod json_file;

pub use json_file::{JsonFileAdapter, discover_sources};
