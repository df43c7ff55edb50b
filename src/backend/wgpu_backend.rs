// src/backend/wgpu_backend.rs
//! wgpu backend.
//!
//! - SPIR-V shader modules from the naga compiler
//! - Automatic pipeline layout; the most recent pipelines are cached per
//!   (vertex, pixel, format), so pipelines of replaced shaders age out
//! - 4-vertex triangle strip into a host-provided target view
//! - Compute-driven materials dispatch one workgroup instead of drawing
//! - Missing texture slots fall back to a 1x1 white texture
//!
//! Host textures are passed as `NativeTexture::new(texture: wgpu::Texture)`;
//! raw FFI handles are rejected by `import_texture`.
//! There is no depth attachment, so depth writes are ignored.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use super::{
    DrawCall, GraphicsBackend, NativeBuffer, NativeSampler, NativeShader, NativeTexture, NativeView,
    RawTextureHandle,
};
use crate::compiler::{CompiledShader, ShaderStage};
use crate::error::{Error, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Pipelines kept alive; each one holds its shader modules.
pub const PIPELINE_CACHE_CAPACITY: usize = 64;

struct WgpuShader {
    serial: u64,
    stage: ShaderStage,
    entry_point: String,
    module: wgpu::ShaderModule,
}

struct WgpuBuffer(wgpu::Buffer);
struct WgpuView(wgpu::TextureView);
struct WgpuSampler(wgpu::Sampler);

/// Where draws land. Set by the host each frame.
pub struct RenderTarget {
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

enum CachedPipeline {
    Render(wgpu::RenderPipeline),
    Compute(wgpu::ComputePipeline),
}

impl CachedPipeline {
    fn bind_group_layout(&self) -> wgpu::BindGroupLayout {
        match self {
            Self::Render(p) => p.get_bind_group_layout(0),
            Self::Compute(p) => p.get_bind_group_layout(0),
        }
    }
}

type PipelineKey = (u64, u64, Option<wgpu::TextureFormat>);

fn pipeline_cache() -> LruCache<PipelineKey, Arc<CachedPipeline>> {
    LruCache::new(NonZeroUsize::new(PIPELINE_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN))
}

pub struct WgpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    target: RwLock<Option<RenderTarget>>,
    pipelines: Mutex<LruCache<PipelineKey, Arc<CachedPipeline>>>,
    fallback_view: wgpu::TextureView,
    next_serial: AtomicU64,
}

impl WgpuBackend {
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let fallback = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("live_material_fallback"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &fallback,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &[255, 255, 255, 255],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4),
                rows_per_image: Some(1),
            },
            wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
        );
        let fallback_view = fallback.create_view(&wgpu::TextureViewDescriptor::default());

        Self {
            device,
            queue,
            target: RwLock::new(None),
            pipelines: Mutex::new(pipeline_cache()),
            fallback_view,
            next_serial: AtomicU64::new(0),
        }
    }

    pub fn set_target(&self, target: RenderTarget) {
        *self.target.write() = Some(target);
    }

    pub fn clear_target(&self) {
        *self.target.write() = None;
    }

    /// Run `f` inside a validation error scope and surface the error synchronously.
    fn validated<T>(&self, what: &str, f: impl FnOnce() -> T) -> Result<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            None => Ok(value),
            Some(err) => Err(Error::backend(format!("{what}: {err}"))),
        }
    }

    fn pipeline(
        &self,
        vertex: &WgpuShader,
        pixel: &WgpuShader,
        format: Option<wgpu::TextureFormat>,
    ) -> Result<Arc<CachedPipeline>> {
        let key = (vertex.serial, pixel.serial, format);
        if let Some(p) = self.pipelines.lock().get(&key) {
            return Ok(p.clone());
        }

        let pipeline = match (pixel.stage, format) {
            (ShaderStage::Compute, _) => self.validated("creating compute pipeline", || {
                CachedPipeline::Compute(self.device.create_compute_pipeline(
                    &wgpu::ComputePipelineDescriptor {
                        label: Some("live_material_compute"),
                        layout: None,
                        module: &pixel.module,
                        entry_point: Some(pixel.entry_point.as_str()),
                        compilation_options: Default::default(),
                        cache: None,
                    },
                ))
            })?,
            (_, Some(format)) => self.validated("creating render pipeline", || {
                CachedPipeline::Render(self.device.create_render_pipeline(
                    &wgpu::RenderPipelineDescriptor {
                        label: Some("live_material"),
                        layout: None,
                        vertex: wgpu::VertexState {
                            module: &vertex.module,
                            entry_point: Some(vertex.entry_point.as_str()),
                            compilation_options: Default::default(),
                            buffers: &[],
                        },
                        fragment: Some(wgpu::FragmentState {
                            module: &pixel.module,
                            entry_point: Some(pixel.entry_point.as_str()),
                            compilation_options: Default::default(),
                            targets: &[Some(wgpu::ColorTargetState {
                                format,
                                blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                                write_mask: wgpu::ColorWrites::ALL,
                            })],
                        }),
                        primitive: wgpu::PrimitiveState {
                            topology: wgpu::PrimitiveTopology::TriangleStrip,
                            strip_index_format: None,
                            front_face: wgpu::FrontFace::Ccw,
                            cull_mode: None,
                            unclipped_depth: false,
                            polygon_mode: wgpu::PolygonMode::Fill,
                            conservative: false,
                        },
                        depth_stencil: None,
                        multisample: wgpu::MultisampleState::default(),
                        multiview: None,
                        cache: None,
                    },
                ))
            })?,
            (_, None) => return Err(Error::backend("no render target set")),
        };

        let pipeline = Arc::new(pipeline);
        self.pipelines.lock().put(key, pipeline.clone());
        Ok(pipeline)
    }
}

fn wgpu_shader(shader: &NativeShader) -> Result<&WgpuShader> {
    shader
        .downcast_ref::<WgpuShader>()
        .ok_or_else(|| Error::backend("shader was not created by the wgpu backend"))
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn create_shader(&self, shader: &CompiledShader) -> Result<NativeShader> {
        let blob = &shader.blob[..];
        if blob.len() < 4 || blob.len() % 4 != 0 || blob[..4] != SPIRV_MAGIC.to_ne_bytes() {
            return Err(Error::backend(format!(
                "{} shader blob is not SPIR-V ({} bytes)",
                shader.stage,
                blob.len()
            )));
        }
        let module = self.validated("creating shader module", || {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(shader.entry_point.as_str()),
                source: wgpu::util::make_spirv(blob),
            })
        })?;
        Ok(NativeShader::new(WgpuShader {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed) + 1,
            stage: shader.stage,
            entry_point: shader.entry_point.clone(),
            module,
        }))
    }

    fn create_constant_buffer(&self, size: usize) -> Result<NativeBuffer> {
        let buffer = self.validated("creating constant buffer", || {
            self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("live_material_constants"),
                size: size as u64,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
        })?;
        Ok(NativeBuffer::new(WgpuBuffer(buffer)))
    }

    fn import_texture(&self, handle: RawTextureHandle) -> Result<NativeTexture> {
        Err(Error::backend(format!(
            "raw texture handle {:#x} cannot be viewed; register a wgpu::Texture instead",
            handle.0
        )))
    }

    fn create_texture_view(&self, texture: &NativeTexture) -> Result<NativeView> {
        let texture = texture
            .downcast_ref::<wgpu::Texture>()
            .ok_or_else(|| Error::backend("texture handle is not a wgpu::Texture"))?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Ok(NativeView::new(WgpuView(view)))
    }

    fn create_sampler(&self) -> Result<NativeSampler> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("live_material_sampler"),
            address_mode_u: wgpu::AddressMode::Repeat,
            address_mode_v: wgpu::AddressMode::Repeat,
            address_mode_w: wgpu::AddressMode::Repeat,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });
        Ok(NativeSampler::new(WgpuSampler(sampler)))
    }

    fn upload_constants(&self, buffer: &NativeBuffer, bytes: &[u8]) -> Result<()> {
        let buffer = buffer
            .downcast_ref::<WgpuBuffer>()
            .ok_or_else(|| Error::backend("buffer was not created by the wgpu backend"))?;
        self.queue.write_buffer(&buffer.0, 0, bytes);
        Ok(())
    }

    fn draw(&self, call: &DrawCall<'_>) -> Result<()> {
        let vertex = wgpu_shader(call.vertex)?;
        let pixel = wgpu_shader(call.pixel)?;
        let target = self.target.read();
        let format = target.as_ref().map(|t| t.format);
        let pipeline = self.pipeline(vertex, pixel, format)?;

        let sampler = call.sampler.and_then(|s| s.downcast_ref::<WgpuSampler>());
        let mut entries = Vec::new();
        if let Some((buffer, binding)) = call.constants {
            if let Some(buffer) = buffer.downcast_ref::<WgpuBuffer>() {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: buffer.0.as_entire_binding(),
                });
            }
        }
        for &slot in call.texture_slots {
            let view = call
                .views
                .get(slot as usize)
                .and_then(Option::as_ref)
                .and_then(|v| v.downcast_ref::<WgpuView>())
                .map_or(&self.fallback_view, |v| &v.0);
            entries.push(wgpu::BindGroupEntry {
                binding: slot,
                resource: wgpu::BindingResource::TextureView(view),
            });
        }
        if let Some(sampler) = sampler {
            for &binding in call.sampler_bindings {
                entries.push(wgpu::BindGroupEntry {
                    binding,
                    resource: wgpu::BindingResource::Sampler(&sampler.0),
                });
            }
        }

        let layout = pipeline.bind_group_layout();
        let bind_group = self.validated("creating bind group", || {
            self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("live_material_bindings"),
                layout: &layout,
                entries: &entries,
            })
        })?;

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("live_material_draw"),
            });
        match pipeline.as_ref() {
            CachedPipeline::Compute(compute) => {
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some("live_material_compute"),
                    timestamp_writes: None,
                });
                pass.set_pipeline(compute);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.dispatch_workgroups(1, 1, 1);
            }
            CachedPipeline::Render(render) => {
                let target = target
                    .as_ref()
                    .ok_or_else(|| Error::backend("no render target set"))?;
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("live_material_pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Load,
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(render);
                pass.set_bind_group(0, &bind_group, &[]);
                pass.draw(0..call.vertex_count, 0..1);
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("cached_pipelines", &self.pipelines.lock().len())
            .finish()
    }
}
