// src/config.rs
//! Runtime configuration for the material registry and its compile worker.

use std::path::{Path, PathBuf};

use bitflags::bitflags;

/// Number of independent GPU snapshots per constant buffer.
pub const RING_DEPTH: usize = 4;

/// Constant buffers are allocated in multiples of this many bytes.
pub const CONSTANT_BUFFER_ALIGNMENT: usize = 16;

/// File name appended to the include path to form each task's debug filename.
pub const SHADER_DEBUG_FILENAME: &str = "shader.wgsl";

bitflags! {
    /// Process-wide render flags set by the host.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RenderFlags: u32 {
        /// Log authoring warnings (unknown texture names, property type conflicts).
        const SHOW_WARNINGS = 1 << 0;
    }
}

impl Default for RenderFlags {
    fn default() -> Self {
        Self::empty()
    }
}

impl RenderFlags {
    /// Host bitmask; unknown bits are kept but have no effect.
    pub fn from_host(bits: u32) -> Self {
        Self::from_bits_retain(bits)
    }
}

// ---------- Config ----------
#[derive(Debug, Clone)]
pub struct LiveMaterialConfig {
    /// Entries kept in the content-addressed compile cache.
    pub compile_cache_capacity: usize,
    /// Directory used to build task debug filenames.
    pub shader_include_path: PathBuf,
    pub compiler_thread_name: String,
    pub flags: RenderFlags,
    /// Level for the logger installed by `debug_log::install`.
    pub log_level: log::LevelFilter,
}

impl Default for LiveMaterialConfig {
    fn default() -> Self {
        Self {
            compile_cache_capacity: 20,
            shader_include_path: PathBuf::new(),
            compiler_thread_name: "live-material-compiler".to_string(),
            flags: RenderFlags::default(),
            log_level: log::LevelFilter::Info,
        }
    }
}

/// Debug filename for tasks compiled under `include_path`.
pub fn debug_filename(include_path: &Path) -> String {
    include_path
        .join(SHADER_DEBUG_FILENAME)
        .to_string_lossy()
        .into_owned()
}
