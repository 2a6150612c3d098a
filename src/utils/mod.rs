// file: src/utils/mod.rs
// version: 1.0.0
// guid: d5a82f60-13c9-4e74-9b08-76e4c1f5a3d2

//! Shared utility functions

pub mod checksum;
pub mod size;

pub use checksum::{calculate_sha256, verify_checksum};
pub use size::parse_size;
