// file: src/config/schema.rs
// version: 1.1.0
// guid: e63a90f7-48bd-4c25-b1e8-d05c7f29a461

//! Build recipe data model
//!
//! The TOML surface expresses the agent, init, and source sections as tables
//! with a discriminating field; once parsed they are held as sum types so the
//! "which fields are meaningful for this mode" question cannot arise.

use std::collections::BTreeMap;
use std::path::PathBuf;

/// Supported recipe schema version.
pub const RECIPE_SCHEMA_VERSION: &str = "1";

/// Name of the agent binary installed at `/bin/<agent>` in every artifact.
pub const AGENT_BINARY_NAME: &str = "kestrel";

/// Release repository queried by the `release` agent source strategy.
pub const AGENT_RELEASE_REPO: &str = "volantvm/volant";

/// Pinned musl-static busybox used when the recipe omits one.
pub const DEFAULT_BUSYBOX_URL: &str =
    "https://busybox.net/downloads/binaries/1.35.0-x86_64-linux-musl/busybox";
pub const DEFAULT_BUSYBOX_SHA256: &str =
    "6e123e7f3202a8c1e9b1f94d8941580a25135382b99e8d3e34fb858bba311348";

/// Default squashfs compression level.
pub const DEFAULT_SQUASHFS_LEVEL: u32 = 15;

/// Default squashfs overlay size.
pub const DEFAULT_OVERLAY_SIZE: &str = "1G";

/// Build strategy selected by the recipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Filesystem image derived from an OCI image or Dockerfile
    OciRootfs,
    /// Compressed CPIO initramfs archive
    Initramfs,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::OciRootfs => "oci_rootfs",
            Strategy::Initramfs => "initramfs",
        }
    }
}

/// How the kestrel agent binary is obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentSource {
    /// Fetch from the release registry; "latest" resolves to the newest release
    Release { version: String },
    /// Copy an existing local binary
    Local { path: PathBuf },
    /// Download from an arbitrary URL, optionally verified
    Http { url: String, checksum: Option<String> },
}

impl AgentSource {
    /// Default agent configuration: latest published release.
    pub fn default_release() -> Self {
        AgentSource::Release {
            version: "latest".to_string(),
        }
    }
}

/// What runs as PID 1 in an initramfs.
///
/// Default compiles the embedded C init which execs the agent; Custom installs
/// a user binary at /init with no agent; None installs nothing, leaving the
/// user to map their own /init.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InitSpec {
    #[default]
    Default,
    Custom {
        path: PathBuf,
    },
    None,
}

/// The rootfs content source, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RootfsSource {
    /// Skeleton-only build (initramfs without an image overlay)
    #[default]
    None,
    /// Prebuilt image reference fetched through the OCI adapter
    Image { reference: String },
    /// Dockerfile materialized through the registered builder
    Dockerfile {
        path: PathBuf,
        context: Option<PathBuf>,
        target: Option<String>,
        build_args: BTreeMap<String, String>,
    },
}

/// Busybox binary source for initramfs builds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyboxSource {
    pub url: String,
    pub sha256: String,
}

impl Default for BusyboxSource {
    fn default() -> Self {
        Self {
            url: DEFAULT_BUSYBOX_URL.to_string(),
            sha256: DEFAULT_BUSYBOX_SHA256.to_string(),
        }
    }
}

/// The `[source]` section after defaulting.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceSpec {
    pub rootfs: RootfsSource,
    pub busybox: Option<BusyboxSource>,
}

/// Legacy block filesystem kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFsKind {
    Ext4,
    Xfs,
    Btrfs,
}

impl LegacyFsKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LegacyFsKind::Ext4 => "ext4",
            LegacyFsKind::Xfs => "xfs",
            LegacyFsKind::Btrfs => "btrfs",
        }
    }

    /// The mkfs "force" flag for this filesystem.
    pub fn force_flag(&self) -> &'static str {
        match self {
            LegacyFsKind::Ext4 => "-F",
            LegacyFsKind::Xfs => "-f",
            LegacyFsKind::Btrfs => "-f",
        }
    }
}

/// Filesystem options for the oci_rootfs strategy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilesystemSpec {
    Squashfs {
        compression_level: u32,
        overlay_size: String,
    },
    Legacy {
        kind: LegacyFsKind,
        size_buffer_mb: u64,
        preallocate: bool,
    },
}

impl FilesystemSpec {
    /// Default filesystem: squashfs at the default level with a 1G overlay.
    pub fn default_squashfs() -> Self {
        FilesystemSpec::Squashfs {
            compression_level: DEFAULT_SQUASHFS_LEVEL,
            overlay_size: DEFAULT_OVERLAY_SIZE.to_string(),
        }
    }

    /// The format tag recorded in the manifest sidecar.
    pub fn format(&self) -> &'static str {
        match self {
            FilesystemSpec::Squashfs { .. } => "squashfs",
            FilesystemSpec::Legacy { kind, .. } => kind.as_str(),
        }
    }
}

/// The complete parsed, defaulted, and validated recipe.
///
/// Constructed once by [`super::load`] and read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRecipe {
    pub version: String,
    pub strategy: Strategy,
    pub agent: Option<AgentSource>,
    pub init: InitSpec,
    pub source: SourceSpec,
    pub filesystem: Option<FilesystemSpec>,
    /// Source path -> absolute destination path; applied sorted by destination
    pub mappings: BTreeMap<String, String>,
}
