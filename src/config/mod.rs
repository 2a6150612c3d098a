// file: src/config/mod.rs
// version: 1.0.0
// guid: 94e2d7b3-0c18-4f6a-85d9-1e37a6c04b82

//! Recipe parsing, defaulting, and validation

pub mod loader;
pub mod manifest;
pub mod schema;
pub mod validator;

pub use loader::{load, load_manifest_template};
pub use manifest::{
    ActionConfig, CloudInitConfig, DevicesConfig, ManifestTemplate, NetworkConfig, PortConfig,
    ResourcesConfig, UserDataConfig, WorkloadConfig,
};
pub use schema::{
    AgentSource, BuildRecipe, BusyboxSource, FilesystemSpec, InitSpec, LegacyFsKind, RootfsSource,
    SourceSpec, Strategy,
};
