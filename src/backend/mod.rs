// src/backend/mod.rs
//! Graphics backend seam.
//!
//! The compile, uniform and material logic is backend-agnostic; only the
//! creation of native objects and the final draw go through
//! [`GraphicsBackend`]. Native objects are owned by RAII wrappers: dropping a
//! wrapper releases the object. Only textures handed in by the host are
//! shared (`NativeTexture` is reference counted).

pub mod headless;
#[cfg(feature = "backend_wgpu")]
pub mod wgpu_backend;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::compiler::{CompiledShader, ShaderStage};
use crate::error::Result;

pub use headless::HeadlessBackend;
#[cfg(feature = "backend_wgpu")]
pub use wgpu_backend::WgpuBackend;

macro_rules! native_object {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name(Box<dyn Any + Send + Sync>);

        impl $name {
            pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
                Self(Box::new(inner))
            }

            pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
                self.0.downcast_ref::<T>()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(stringify!($name))
            }
        }
    };
}

native_object!(
    /// Compiled shader object for one stage.
    NativeShader
);
native_object!(
    /// GPU constant buffer sized for one ring slot.
    NativeBuffer
);
native_object!(
    /// Shader resource view over a host texture.
    NativeView
);
native_object!(NativeSampler);

/// Host texture handle. Shared between the id cache and every binding using it.
#[derive(Clone)]
pub struct NativeTexture(Arc<dyn Any + Send + Sync>);

impl NativeTexture {
    pub fn new<T: Any + Send + Sync>(inner: T) -> Self {
        Self(Arc::new(inner))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    /// Same underlying handle. Raw host handles compare by value.
    pub fn same_handle(&self, other: &NativeTexture) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (
            self.downcast_ref::<RawTextureHandle>(),
            other.downcast_ref::<RawTextureHandle>(),
        ) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for NativeTexture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeTexture({:p})", Arc::as_ptr(&self.0))
    }
}

/// Raw pointer-sized handle as passed by a host over FFI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawTextureHandle(pub usize);

/// Everything a backend needs to issue one material draw.
pub struct DrawCall<'a> {
    pub material: u16,
    pub vertex: &'a NativeShader,
    /// Fragment shader, or compute shader when the material is compute-driven.
    pub pixel: &'a NativeShader,
    pub pixel_stage: ShaderStage,
    /// Constant buffer already holding the slot snapshot, with its binding.
    pub constants: Option<(&'a NativeBuffer, u32)>,
    /// Texture slots the pixel shader reflects.
    pub texture_slots: &'a [u32],
    /// Views indexed by texture slot; `None` where nothing is bound.
    pub views: &'a [Option<NativeView>],
    pub sampler: Option<&'a NativeSampler>,
    pub sampler_bindings: &'a [u32],
    pub vertex_count: u32,
    pub depth_writes: bool,
}

/// Backend capability interface, selected at startup.
///
/// Every method is called from the render thread only.
pub trait GraphicsBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_shader(&self, shader: &CompiledShader) -> Result<NativeShader>;

    fn create_constant_buffer(&self, size: usize) -> Result<NativeBuffer>;

    /// Wrap a raw pointer-sized handle from a host. Backends that can only
    /// view their own texture type reject it.
    fn import_texture(&self, handle: RawTextureHandle) -> Result<NativeTexture> {
        Ok(NativeTexture::new(handle))
    }

    fn create_texture_view(&self, texture: &NativeTexture) -> Result<NativeView>;

    /// Linear filtering, wrap addressing.
    fn create_sampler(&self) -> Result<NativeSampler>;

    fn upload_constants(&self, buffer: &NativeBuffer, bytes: &[u8]) -> Result<()>;

    fn draw(&self, call: &DrawCall<'_>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_texture_identity() {
        let a = NativeTexture::new(RawTextureHandle(0x1000));
        let b = a.clone();
        let c = NativeTexture::new(RawTextureHandle(0x1000));
        let d = NativeTexture::new(RawTextureHandle(0x2000));
        assert!(a.same_handle(&b));
        assert!(a.same_handle(&c));
        assert!(!a.same_handle(&d));
        assert!(!a.same_handle(&NativeTexture::new(7u32)));
        assert_eq!(b.downcast_ref::<RawTextureHandle>(), Some(&RawTextureHandle(0x1000)));
    }

    #[test]
    fn test_native_object_downcast() {
        let shader = NativeShader::new(42u64);
        assert_eq!(shader.downcast_ref::<u64>(), Some(&42));
        assert!(shader.downcast_ref::<u32>().is_none());
    }
}
