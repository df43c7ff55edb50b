// src/lib.rs
//! Hot-reloadable shader materials.
//!
//! A host hands WGSL source to a [`LiveMaterial`]; a background thread
//! compiles it through a content-addressed cache, and the render thread swaps
//! the new shader in on its next draw. Uniform values written by the host
//! survive every edit whose layout keeps the property's name and shape.
//!
//! Threads:
//!  - control thread: [`MaterialRegistry::create`], uniform setters, shader source
//!  - compile thread: owned by the registry, never touches GPU objects
//!  - render thread: [`MaterialRegistry::draw`], the only place native objects
//!    are created or released
//!
//! Hosts written in other languages go through the C ABI in [`ffi`].

pub mod backend;
pub mod compile_queue;
pub mod compiler;
pub mod config;
pub mod constant_buffer;
pub mod context;
pub mod debug_log;
pub mod error;
pub mod ffi;
pub mod live_material;
pub mod registry;
pub mod shader_prop;
pub mod uniform_dump;

pub use backend::{GraphicsBackend, HeadlessBackend, NativeTexture, RawTextureHandle};
#[cfg(feature = "backend_wgpu")]
pub use backend::WgpuBackend;
pub use compiler::{CompileOutput, CompileTask, ShaderCompiler, ShaderReflection, ShaderStage};
pub use config::{LiveMaterialConfig, RenderFlags, RING_DEPTH};
pub use constant_buffer::SetOutcome;
pub use debug_log::DebugSink;
pub use error::{Error, Result};
pub use live_material::{CompileState, CompileStats, LiveMaterial, MaterialId};
pub use registry::{pack_event, unpack_event, DebugInfo, MaterialRegistry};
pub use shader_prop::{PropType, ShaderProp};
