// src/backend/headless.rs
//! Backend without a GPU.
//!
//! Records recent draws and counts constant uploads and live native objects.
//! Used by hosts that only need compilation and uniform state, and as the
//! test double for the render path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    DrawCall, GraphicsBackend, NativeBuffer, NativeSampler, NativeShader, NativeTexture, NativeView,
    RawTextureHandle,
};
use crate::compiler::{CompiledShader, ShaderStage};
use crate::error::{Error, Result};

/// Draws kept for inspection; older records are discarded.
pub const MAX_RECORDED_DRAWS: usize = 256;

/// Decrements the live counter when the owning object is released.
struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    fn new(live: &Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self(live.clone())
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct HeadlessShader {
    pub serial: u64,
    pub stage: ShaderStage,
    pub blob_len: usize,
    _live: LiveToken,
}

pub struct HeadlessBuffer {
    pub serial: u64,
    pub size: usize,
    contents: Mutex<Vec<u8>>,
    _live: LiveToken,
}

pub struct HeadlessView {
    pub serial: u64,
    pub texture: NativeTexture,
    _live: LiveToken,
}

pub struct HeadlessSampler {
    _live: LiveToken,
}

/// One recorded draw.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub material: u16,
    pub vertex_serial: u64,
    pub pixel_serial: u64,
    pub pixel_stage: ShaderStage,
    /// Constant buffer contents at draw time.
    pub constants: Vec<u8>,
    /// Texture slots that had a view.
    pub bound_slots: Vec<u32>,
    pub has_sampler: bool,
    pub vertex_count: u32,
    pub depth_writes: bool,
}

#[derive(Default)]
pub struct HeadlessBackend {
    next_serial: AtomicU64,
    live: Arc<AtomicUsize>,
    draws: Mutex<VecDeque<DrawRecord>>,
    draw_count: AtomicUsize,
    uploads: AtomicUsize,
    fail_shader_creation: AtomicBool,
    reject_raw_textures: AtomicBool,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Native objects created and not yet released.
    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Every draw issued, including those no longer recorded.
    pub fn draw_count(&self) -> usize {
        self.draw_count.load(Ordering::Relaxed)
    }

    /// The last [`MAX_RECORDED_DRAWS`] draws, oldest first.
    pub fn draws(&self) -> Vec<DrawRecord> {
        self.draws.lock().iter().cloned().collect()
    }

    pub fn last_draw(&self) -> Option<DrawRecord> {
        self.draws.lock().back().cloned()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    /// Make `create_shader` fail, as a driver out of memory would.
    pub fn set_fail_shader_creation(&self, fail: bool) {
        self.fail_shader_creation.store(fail, Ordering::Relaxed);
    }

    /// Make `import_texture` fail, as a backend that needs its own texture type does.
    pub fn set_reject_raw_textures(&self, reject: bool) {
        self.reject_raw_textures.store(reject, Ordering::Relaxed);
    }
}

fn shader_serial(shader: &NativeShader) -> Result<u64> {
    shader
        .downcast_ref::<HeadlessShader>()
        .map(|s| s.serial)
        .ok_or_else(|| Error::backend("shader was not created by the headless backend"))
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn create_shader(&self, shader: &CompiledShader) -> Result<NativeShader> {
        if self.fail_shader_creation.load(Ordering::Relaxed) {
            return Err(Error::backend(format!(
                "cannot create {} shader: out of memory",
                shader.stage
            )));
        }
        if shader.blob.is_empty() {
            return Err(Error::backend("empty shader blob"));
        }
        Ok(NativeShader::new(HeadlessShader {
            serial: self.serial(),
            stage: shader.stage,
            blob_len: shader.blob.len(),
            _live: LiveToken::new(&self.live),
        }))
    }

    fn create_constant_buffer(&self, size: usize) -> Result<NativeBuffer> {
        Ok(NativeBuffer::new(HeadlessBuffer {
            serial: self.serial(),
            size,
            contents: Mutex::new(vec![0; size]),
            _live: LiveToken::new(&self.live),
        }))
    }

    fn import_texture(&self, handle: RawTextureHandle) -> Result<NativeTexture> {
        if self.reject_raw_textures.load(Ordering::Relaxed) {
            return Err(Error::backend(format!("raw texture handle {:#x} rejected", handle.0)));
        }
        Ok(NativeTexture::new(handle))
    }

    fn create_texture_view(&self, texture: &NativeTexture) -> Result<NativeView> {
        Ok(NativeView::new(HeadlessView {
            serial: self.serial(),
            texture: texture.clone(),
            _live: LiveToken::new(&self.live),
        }))
    }

    fn create_sampler(&self) -> Result<NativeSampler> {
        Ok(NativeSampler::new(HeadlessSampler {
            _live: LiveToken::new(&self.live),
        }))
    }

    fn upload_constants(&self, buffer: &NativeBuffer, bytes: &[u8]) -> Result<()> {
        let buffer = buffer
            .downcast_ref::<HeadlessBuffer>()
            .ok_or_else(|| Error::backend("buffer was not created by the headless backend"))?;
        let mut contents = buffer.contents.lock();
        if bytes.len() != contents.len() {
            return Err(Error::backend(format!(
                "constant upload of {} bytes into a {} byte buffer",
                bytes.len(),
                contents.len()
            )));
        }
        contents.copy_from_slice(bytes);
        self.uploads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn draw(&self, call: &DrawCall<'_>) -> Result<()> {
        let constants = match call.constants {
            Some((buffer, _)) => buffer
                .downcast_ref::<HeadlessBuffer>()
                .map(|b| b.contents.lock().clone())
                .unwrap_or_default(),
            None => Vec::new(),
        };
        let bound_slots = call
            .views
            .iter()
            .enumerate()
            .filter(|(_, view)| view.is_some())
            .map(|(slot, _)| slot as u32)
            .collect();
        let record = DrawRecord {
            material: call.material,
            vertex_serial: shader_serial(call.vertex)?,
            pixel_serial: shader_serial(call.pixel)?,
            pixel_stage: call.pixel_stage,
            constants,
            bound_slots,
            has_sampler: call.sampler.is_some(),
            vertex_count: call.vertex_count,
            depth_writes: call.depth_writes,
        };
        self.draw_count.fetch_add(1, Ordering::Relaxed);
        let mut draws = self.draws.lock();
        if draws.len() == MAX_RECORDED_DRAWS {
            draws.pop_front();
        }
        draws.push_back(record);
        Ok(())
    }
}
