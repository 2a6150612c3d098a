// file: src/logging/mod.rs
// version: 1.0.0
// guid: 5b9e3d17-8f20-4a6c-bd54-0c72e1a98f36

//! Logging system for the fledge build engine

pub mod logger;

pub use logger::init_logger;
