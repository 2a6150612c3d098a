// file: src/lib.rs
// version: 1.0.0
// guid: c1f7e9a4-52d8-4b36-9e02-b8a4d617f520

//! # Fledge
//!
//! Declarative build engine for microVM boot artifacts. Fledge turns a TOML
//! recipe into either a compressed CPIO initramfs archive or a block
//! filesystem image (squashfs, ext4, xfs, btrfs) derived from an OCI image
//! or Dockerfile, embedding the kestrel agent, an FHS skeleton, and
//! user-supplied payload files. Every artifact ships with a JSON manifest
//! sidecar carrying runtime defaults and the artifact's SHA-256.

pub mod agent;
pub mod builder;
pub mod config;
pub mod error;
pub mod logging;
pub mod network;
pub mod preflight;
pub mod process;
pub mod utils;

pub use error::{FledgeError, Result};
