// file: src/network/mod.rs
// version: 1.0.0
// guid: 2e91c7d4-6b08-4f53-a8e1-0d74b5f29c63

//! Network download utilities

pub mod download;

pub use download::Downloader;
