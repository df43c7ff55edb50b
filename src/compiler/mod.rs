// src/compiler/mod.rs
//! Shader compilation with a content-addressed cache.
//!
//! - `CompileTask` / `CompileOutput`: immutable request/response values that
//!   cross the compile thread
//! - `NativeCompiler`: the backend compiler seam (naga in production)
//! - `ShaderCompiler`: LRU cache in front of the native compiler
//!
//! Cache keys are xxh3 hashes of (source, filename, entry point). The stage is
//! not part of the key; an entry point name is only valid for one stage.

pub mod naga_compiler;
pub mod reflection;

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use lru::LruCache;
use parking_lot::Mutex;
use xxhash_rust::xxh3::Xxh3;

use crate::error::Result;

pub use naga_compiler::NagaCompiler;
pub use reflection::{ShaderReflection, UniformVariable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Vertex => "vertex",
            Self::Fragment => "fragment",
            Self::Compute => "compute",
        }
    }

    /// Stages whose constant buffer feeds the material's uniforms.
    pub fn is_reflected(self) -> bool {
        matches!(self, Self::Fragment | Self::Compute)
    }
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Owner id used by the shutdown sentinel.
pub const NO_OWNER: u16 = 0;

/// One compile request. Cheap to clone; the source is shared.
#[derive(Debug, Clone)]
pub struct CompileTask {
    pub stage: ShaderStage,
    pub source: Arc<str>,
    pub entry_point: String,
    pub debug_filename: String,
    pub owner: u16,
    pub task_id: u32,
    pub is_shutdown_sentinel: bool,
}

impl CompileTask {
    pub fn new(
        stage: ShaderStage,
        source: impl Into<Arc<str>>,
        entry_point: impl Into<String>,
        debug_filename: impl Into<String>,
        owner: u16,
        task_id: u32,
    ) -> Self {
        Self {
            stage,
            source: source.into(),
            entry_point: entry_point.into(),
            debug_filename: debug_filename.into(),
            owner,
            task_id,
            is_shutdown_sentinel: false,
        }
    }

    /// The only sanctioned way to stop the compile worker.
    pub fn shutdown() -> Self {
        Self {
            stage: ShaderStage::Vertex,
            source: Arc::from(""),
            entry_point: String::new(),
            debug_filename: String::new(),
            owner: NO_OWNER,
            task_id: 0,
            is_shutdown_sentinel: true,
        }
    }

    /// Cache identity over (source, filename, entry point).
    pub fn content_hash(&self) -> u64 {
        let mut hasher = Xxh3::new();
        for part in [
            self.source.as_bytes(),
            self.debug_filename.as_bytes(),
            self.entry_point.as_bytes(),
        ] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.digest()
    }
}

/// Successful native compile result.
#[derive(Debug, Clone)]
pub struct CompiledShader {
    pub stage: ShaderStage,
    pub entry_point: String,
    /// Backend blob (SPIR-V words as bytes for naga).
    pub blob: Arc<[u8]>,
    pub reflection: Arc<ShaderReflection>,
}

#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub stage: ShaderStage,
    pub task_id: u32,
    /// `None` when compilation failed.
    pub shader: Option<CompiledShader>,
    pub compile_time_ms: u64,
}

impl CompileOutput {
    pub fn success(&self) -> bool {
        self.shader.is_some()
    }

    /// Compiled blob; empty on failure.
    pub fn blob(&self) -> &[u8] {
        match &self.shader {
            Some(shader) => &shader.blob[..],
            None => &[],
        }
    }
}

/// Backend compiler seam. Implementations must be deterministic for a given task.
pub trait NativeCompiler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compile and reflect. Errors carry the compiler's diagnostic text.
    fn compile(&self, task: &CompileTask) -> Result<CompiledShader>;
}

/// Native compiler behind a process-wide LRU cache.
pub struct ShaderCompiler {
    native: Box<dyn NativeCompiler>,
    cache: Mutex<LruCache<u64, CompiledShader>>,
    native_invocations: AtomicU64,
    cache_hits: AtomicU64,
}

impl ShaderCompiler {
    pub fn new(native: Box<dyn NativeCompiler>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            native,
            cache: Mutex::new(LruCache::new(capacity)),
            native_invocations: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }

    /// WGSL compiler backed by naga.
    pub fn with_naga(capacity: usize) -> Self {
        Self::new(Box::new(NagaCompiler::new()), capacity)
    }

    pub fn native_name(&self) -> &'static str {
        self.native.name()
    }

    /// Compile `task`, consulting the cache first. Failures are logged, never returned.
    pub fn compile(&self, task: &CompileTask) -> CompileOutput {
        let started = Instant::now();
        let key = task.content_hash();

        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "compile cache hit for {} '{}' (task {})",
                task.stage,
                task.entry_point,
                task.task_id
            );
            return CompileOutput {
                stage: task.stage,
                task_id: task.task_id,
                shader: Some(hit),
                compile_time_ms: started.elapsed().as_millis() as u64,
            };
        }

        self.native_invocations.fetch_add(1, Ordering::Relaxed);
        let shader = match self.native.compile(task) {
            Ok(shader) => {
                self.cache.lock().put(key, shader.clone());
                Some(shader)
            }
            Err(err) => {
                log::error!("{} ({}): {}", task.debug_filename, self.native.name(), err);
                None
            }
        };

        CompileOutput {
            stage: task.stage,
            task_id: task.task_id,
            shader,
            compile_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
        log::info!("compile cache cleared");
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    /// Times the native compiler actually ran.
    pub fn native_invocations(&self) -> u64 {
        self.native_invocations.load(Ordering::Relaxed)
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }
}
