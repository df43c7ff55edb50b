// src/live_material.rs
//! LiveMaterial: one hot-reloadable shader plus its uniform state.
//!
//! Threads:
//!  - control thread: uniform setters, shader source, texture registration
//!  - compile thread: only `queue_compile_output`
//!  - render thread: `draw` / `drain_and_apply_compile_outputs`, the only
//!    callers allowed to create or release native objects
//!
//! Locks (never held across materials):
//!  - uniform + gpu locks inside `ConstantBufferStore`
//!  - `textures`: id cache, bindings, resolved views
//!  - `compile_outputs`: outputs waiting for the render thread
//!  - `objects`: native shader objects (render thread)
//! Render-thread order is objects -> textures -> gpu.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::backend::{DrawCall, GraphicsBackend, NativeBuffer, NativeSampler, NativeShader, NativeTexture, NativeView};
use crate::compile_queue::CompileSender;
use crate::compiler::{CompileOutput, CompileTask, ShaderReflection, ShaderStage};
use crate::config::{self, LiveMaterialConfig, RenderFlags, RING_DEPTH};
use crate::constant_buffer::{ConstantBufferStore, SetOutcome};
use crate::error::{Error, Result};
use crate::shader_prop::{PropType, ShaderProp};
use crate::uniform_dump;

pub type MaterialId = u16;

/// Vertices in the full-screen triangle strip.
pub const QUAD_VERTEX_COUNT: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub enum CompileState {
    #[default]
    NeverCompiled = 0,
    Compiling = 1,
    Success = 2,
    Error = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CompileStats {
    pub state: CompileState,
    pub compile_time_ms: u64,
    pub instruction_count: u32,
}

// ---------- Shared services ----------

/// Services every material of one registry shares.
pub struct MaterialContext {
    backend: Arc<dyn GraphicsBackend>,
    compile_tx: CompileSender,
    flags: AtomicU32,
    include_path: RwLock<PathBuf>,
}

impl MaterialContext {
    pub fn new(
        backend: Arc<dyn GraphicsBackend>,
        compile_tx: CompileSender,
        config: &LiveMaterialConfig,
    ) -> Self {
        Self {
            backend,
            compile_tx,
            flags: AtomicU32::new(config.flags.bits()),
            include_path: RwLock::new(config.shader_include_path.clone()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphicsBackend> {
        &self.backend
    }

    pub fn compile_sender(&self) -> &CompileSender {
        &self.compile_tx
    }

    pub fn flags(&self) -> RenderFlags {
        RenderFlags::from_bits_retain(self.flags.load(Ordering::Relaxed))
    }

    pub fn set_flags(&self, flags: RenderFlags) {
        self.flags.store(flags.bits(), Ordering::Relaxed);
    }

    pub fn show_warnings(&self) -> bool {
        self.flags().contains(RenderFlags::SHOW_WARNINGS)
    }

    pub fn set_include_path(&self, path: &Path) {
        *self.include_path.write() = path.to_path_buf();
    }

    pub fn debug_filename(&self) -> String {
        config::debug_filename(&self.include_path.read())
    }
}

// ---------- Per-material state ----------

#[derive(Default)]
struct TextureTable {
    /// Host texture id -> native handle.
    by_id: HashMap<i32, NativeTexture>,
    /// Uniform name -> bound handle.
    bound: BTreeMap<String, NativeTexture>,
    /// Names whose view must be (re)created on the render thread.
    pending: Vec<String>,
    /// Name -> slot from the last reflection.
    slots: BTreeMap<String, u32>,
    /// Distinct reflected slots, ascending.
    slot_list: Vec<u32>,
    views: Vec<Option<NativeView>>,
}

impl TextureTable {
    fn bind(&mut self, name: &str, texture: NativeTexture) {
        self.bound.insert(name.to_string(), texture);
        if !self.pending.iter().any(|p| p == name) {
            self.pending.push(name.to_string());
        }
    }

    /// New shader layout: drop every view and requeue every binding.
    fn relayout(&mut self, reflection: &ShaderReflection) {
        self.slots = reflection.textures.clone();
        self.slot_list = self.slots.values().copied().collect();
        self.slot_list.sort_unstable();
        self.slot_list.dedup();
        self.views = (0..reflection.texture_slot_count()).map(|_| None).collect();
        self.pending = self.bound.keys().cloned().collect();
    }

}

#[derive(Default)]
struct ShaderObjects {
    vertex: Option<NativeShader>,
    fragment: Option<NativeShader>,
    compute: Option<NativeShader>,
    constant_buffer: Option<NativeBuffer>,
    constant_binding: u32,
    sampler: Option<NativeSampler>,
    sampler_bindings: Vec<u32>,
}

impl ShaderObjects {
    /// Fragment shader, or the compute shader when there is none.
    fn pixel(&self) -> Option<(ShaderStage, &NativeShader)> {
        self.fragment
            .as_ref()
            .map(|s| (ShaderStage::Fragment, s))
            .or_else(|| self.compute.as_ref().map(|s| (ShaderStage::Compute, s)))
    }

    fn can_draw(&self) -> bool {
        self.vertex.is_some() && self.pixel().is_some()
    }

    fn slot_mut(&mut self, stage: ShaderStage) -> &mut Option<NativeShader> {
        match stage {
            ShaderStage::Vertex => &mut self.vertex,
            ShaderStage::Fragment => &mut self.fragment,
            ShaderStage::Compute => &mut self.compute,
        }
    }
}

pub struct LiveMaterial {
    id: MaterialId,
    context: Arc<MaterialContext>,
    constants: ConstantBufferStore,
    compile_outputs: Mutex<Vec<CompileOutput>>,
    textures: Mutex<TextureTable>,
    objects: Mutex<ShaderObjects>,
    stats: Mutex<CompileStats>,
    drawing_enabled: AtomicBool,
    depth_writes: AtomicBool,
    /// Set once native objects were released; the material never draws again.
    released: AtomicBool,
}

impl LiveMaterial {
    pub fn new(id: MaterialId, context: Arc<MaterialContext>) -> Self {
        Self {
            id,
            context,
            constants: ConstantBufferStore::new(),
            compile_outputs: Mutex::new(Vec::new()),
            textures: Mutex::new(TextureTable::default()),
            objects: Mutex::new(ShaderObjects::default()),
            stats: Mutex::new(CompileStats::default()),
            drawing_enabled: AtomicBool::new(true),
            depth_writes: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> MaterialId {
        self.id
    }

    pub fn constants(&self) -> &ConstantBufferStore {
        &self.constants
    }

    // ---------- Shader source ----------

    fn submit(&self, stage: ShaderStage, source: &str, entry_point: &str) -> bool {
        let tx = self.context.compile_sender();
        let task = CompileTask::new(
            stage,
            source,
            entry_point,
            self.context.debug_filename(),
            self.id,
            tx.next_task_id(),
        );
        tx.submit(task)
    }

    fn mark_compiling(&self, submitted: usize) -> usize {
        if submitted > 0 {
            self.stats.lock().state = CompileState::Compiling;
        }
        submitted
    }

    /// Queue fragment and vertex compiles, skipping empty sources. Returns tasks submitted.
    pub fn set_shader_source(
        &self,
        fragment: &str,
        fragment_entry: &str,
        vertex: &str,
        vertex_entry: &str,
    ) -> usize {
        let mut submitted = 0;
        for (stage, source, entry) in [
            (ShaderStage::Fragment, fragment, fragment_entry),
            (ShaderStage::Vertex, vertex, vertex_entry),
        ] {
            if !source.is_empty() && self.submit(stage, source, entry) {
                submitted += 1;
            }
        }
        self.mark_compiling(submitted)
    }

    pub fn set_compute_source(&self, source: &str, entry_point: &str) -> usize {
        let submitted = usize::from(!source.is_empty() && self.submit(ShaderStage::Compute, source, entry_point));
        self.mark_compiling(submitted)
    }

    /// Called by the compile thread.
    pub fn queue_compile_output(&self, output: CompileOutput) {
        if self.is_released() {
            return;
        }
        self.compile_outputs.lock().push(output);
    }

    pub fn pending_compile_outputs(&self) -> usize {
        self.compile_outputs.lock().len()
    }

    /// True if a successful compile is waiting to be applied.
    pub fn needs_render(&self) -> bool {
        self.compile_outputs.lock().iter().any(CompileOutput::success)
    }

    /// Render thread only. Applies queued outputs in arrival order; returns how
    /// many replaced a shader.
    pub fn drain_and_apply_compile_outputs(&self) -> usize {
        let outputs = std::mem::take(&mut *self.compile_outputs.lock());
        if outputs.is_empty() || self.is_released() {
            return 0;
        }
        let mut objects = self.objects.lock();
        let mut applied = 0;
        for output in &outputs {
            if self.apply_output(&mut objects, output) {
                applied += 1;
            }
        }
        applied
    }

    fn fail(&self, compile_time_ms: u64) {
        let mut stats = self.stats.lock();
        stats.state = CompileState::Error;
        stats.compile_time_ms = compile_time_ms;
    }

    fn apply_output(&self, objects: &mut ShaderObjects, output: &CompileOutput) -> bool {
        let Some(compiled) = output.shader.as_ref() else {
            log::debug!(
                "material {}: {} compile (task {}) failed; keeping previous shader",
                self.id,
                output.stage,
                output.task_id
            );
            self.fail(output.compile_time_ms);
            return false;
        };

        let backend = self.context.backend();
        let native = match backend.create_shader(compiled) {
            Ok(native) => native,
            Err(err) => {
                log::error!("material {}: creating {} shader: {}", self.id, compiled.stage, err);
                self.fail(output.compile_time_ms);
                return false;
            }
        };
        if compiled.stage.is_reflected() {
            if let Err(err) = self.apply_reflection(objects, &compiled.reflection) {
                log::error!("material {}: applying {} layout: {}", self.id, compiled.stage, err);
                self.fail(output.compile_time_ms);
                return false;
            }
        }
        // Replacing releases the previous object of this stage
        *objects.slot_mut(compiled.stage) = Some(native);

        let mut stats = self.stats.lock();
        stats.state = CompileState::Success;
        stats.compile_time_ms = output.compile_time_ms;
        if compiled.stage.is_reflected() {
            stats.instruction_count = compiled.reflection.instruction_count;
        }
        log::info!(
            "material {}: {} shader '{}' applied ({} ms)",
            self.id,
            compiled.stage,
            compiled.entry_point,
            output.compile_time_ms
        );
        true
    }

    fn apply_reflection(&self, objects: &mut ShaderObjects, reflection: &ShaderReflection) -> Result<()> {
        let size = reflection.constant_buffer_size();
        let buffer = match size {
            0 => None,
            _ => Some(self.context.backend().create_constant_buffer(size)?),
        };
        self.constants.reflect(reflection.prop_map(), size);
        objects.constant_buffer = buffer;
        objects.constant_binding = reflection.constant_buffer_binding.unwrap_or(0);
        objects.sampler_bindings = reflection.samplers.clone();
        self.textures.lock().relayout(reflection);
        Ok(())
    }

    // ---------- Uniforms ----------

    fn set_property(&self, name: &str, prop_type: PropType, values: &[f32]) -> SetOutcome {
        let outcome = self.constants.set_property(name, prop_type, values);
        if let Some(warning) = self.conflict_warning(name, prop_type, outcome) {
            log::warn!("{warning}");
        }
        outcome
    }

    /// Type conflicts are reported only with `SHOW_WARNINGS`.
    fn conflict_warning(&self, name: &str, prop_type: PropType, outcome: SetOutcome) -> Option<String> {
        let SetOutcome::Conflict { reflected } = outcome else {
            return None;
        };
        if !self.context.show_warnings() {
            return None;
        }
        Some(format!(
            "material {}: uniform '{}' set as {} but reflected as {}; ignored until the next compile",
            self.id, name, prop_type, reflected
        ))
    }

    pub fn set_float(&self, name: &str, value: f32) -> SetOutcome {
        self.set_property(name, PropType::Float, &[value])
    }

    pub fn set_vector4(&self, name: &str, value: [f32; 4]) -> SetOutcome {
        self.set_property(name, PropType::Vector4, &value)
    }

    /// Column-major 4x4.
    pub fn set_matrix(&self, name: &str, value: &[f32; 16]) -> SetOutcome {
        self.set_property(name, PropType::Matrix, value)
    }

    pub fn set_float_array(&self, name: &str, values: &[f32]) -> SetOutcome {
        self.set_property(name, PropType::Float, values)
    }

    pub fn set_vector_array(&self, name: &str, values: &[[f32; 4]]) -> SetOutcome {
        self.set_property(name, PropType::Vector4, bytemuck::cast_slice(values))
    }

    pub fn set_matrix_array(&self, name: &str, values: &[[f32; 16]]) -> SetOutcome {
        self.set_property(name, PropType::Matrix, bytemuck::cast_slice(values))
    }

    /// 0.0 for unknown names.
    pub fn get_float(&self, name: &str) -> f32 {
        let mut out = [0.0];
        self.constants.get_property(name, &mut out);
        out[0]
    }

    pub fn get_vector4(&self, name: &str) -> [f32; 4] {
        let mut out = [0.0; 4];
        self.constants.get_property(name, &mut out);
        out
    }

    pub fn get_matrix(&self, name: &str) -> [f32; 16] {
        let mut out = [0.0; 16];
        self.constants.get_property(name, &mut out);
        out
    }

    /// Fills at most `out.len()` floats; returns how many were read.
    pub fn get_float_array(&self, name: &str, out: &mut [f32]) -> usize {
        self.constants.get_property(name, out) / 4
    }

    pub fn get_vector_array(&self, name: &str, out: &mut [[f32; 4]]) -> usize {
        self.constants.get_property(name, bytemuck::cast_slice_mut(out)) / 16
    }

    pub fn get_matrix_array(&self, name: &str, out: &mut [[f32; 16]]) -> usize {
        self.constants.get_property(name, bytemuck::cast_slice_mut(out)) / 64
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.constants.has_property(name)
    }

    pub fn property(&self, name: &str) -> Option<ShaderProp> {
        self.constants.property(name)
    }

    /// Snapshot the CPU values into ring slot `slot`.
    pub fn submit_uniforms(&self, slot: usize) -> Result<()> {
        self.constants.submit_uniforms(slot)
    }

    // ---------- Textures ----------

    /// Bind a known texture id to `name`. Returns true when the id is unseen
    /// and the caller must register it with `set_texture_ptr`.
    pub fn set_texture_id(&self, name: &str, texture_id: i32) -> bool {
        let mut table = self.textures.lock();
        match table.by_id.get(&texture_id).cloned() {
            Some(texture) => {
                table.bind(name, texture);
                false
            }
            None => true,
        }
    }

    /// Register `texture` under `texture_id` and bind it to `name`.
    pub fn set_texture_ptr(&self, name: &str, texture_id: i32, texture: NativeTexture) -> Result<()> {
        let mut table = self.textures.lock();
        let texture = match table.by_id.get(&texture_id) {
            Some(existing) if !existing.same_handle(&texture) => {
                log::error!(
                    "material {}: texture id {} registered twice with different handles",
                    self.id,
                    texture_id
                );
                return Err(Error::DuplicateTexture { id: texture_id });
            }
            Some(existing) => existing.clone(),
            None => {
                table.by_id.insert(texture_id, texture.clone());
                texture
            }
        };
        table.bind(name, texture);
        Ok(())
    }

    pub fn bound_texture(&self, name: &str) -> Option<NativeTexture> {
        self.textures.lock().bound.get(name).cloned()
    }

    /// Create views for pending bindings. Render thread only.
    fn resolve_textures(&self, table: &mut TextureTable) {
        let backend = self.context.backend();
        for name in std::mem::take(&mut table.pending) {
            let Some(&slot) = table.slots.get(&name) else {
                if self.context.show_warnings() {
                    log::warn!("material {}: shader has no texture named '{}'", self.id, name);
                }
                continue;
            };
            let Some(texture) = table.bound.get(&name).cloned() else {
                continue;
            };
            let view = match backend.create_texture_view(&texture) {
                Ok(view) => Some(view),
                Err(err) => {
                    log::error!("material {}: view for texture '{}': {}", self.id, name, err);
                    None
                }
            };
            if let Some(entry) = table.views.get_mut(slot as usize) {
                *entry = view;
            }
        }
    }

    // ---------- Drawing ----------

    pub fn set_drawing_enabled(&self, enabled: bool) {
        self.drawing_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn drawing_enabled(&self) -> bool {
        self.drawing_enabled.load(Ordering::Relaxed)
    }

    pub fn set_depth_writes_enabled(&self, enabled: bool) {
        self.depth_writes.store(enabled, Ordering::Relaxed);
    }

    /// Both halves of the pipeline exist.
    pub fn can_draw(&self) -> bool {
        self.objects.lock().can_draw()
    }

    /// Render thread only. Applies pending compiles, then draws with the
    /// snapshot in `slot`. `Ok(false)` when there is nothing to draw.
    pub fn draw(&self, slot: usize) -> Result<bool> {
        crate::ensure!(
            slot < RING_DEPTH,
            Error::SlotOutOfRange {
                slot,
                depth: RING_DEPTH
            }
        );
        self.drain_and_apply_compile_outputs();
        if !self.drawing_enabled() || self.is_released() {
            return Ok(false);
        }

        let backend = self.context.backend().clone();
        let mut objects = self.objects.lock();
        if !objects.can_draw() {
            return Ok(false);
        }

        let mut textures = self.textures.lock();
        self.resolve_textures(&mut textures);
        // Unbound slots still sample the backend's fallback texture
        if objects.sampler.is_none() && !objects.sampler_bindings.is_empty() {
            match backend.create_sampler() {
                Ok(sampler) => objects.sampler = Some(sampler),
                Err(err) => log::error!("material {}: creating sampler: {}", self.id, err),
            }
        }

        if let Some(buffer) = objects.constant_buffer.as_ref() {
            let uploaded = self
                .constants
                .with_slot(slot, |bytes| backend.upload_constants(buffer, bytes))?;
            if let Some(Err(err)) = uploaded {
                log::error!("material {}: uploading slot {}: {}", self.id, slot, err);
                return Err(err);
            }
        }

        let objects = &*objects;
        let (Some(vertex), Some((pixel_stage, pixel))) = (objects.vertex.as_ref(), objects.pixel()) else {
            return Ok(false);
        };
        let call = DrawCall {
            material: self.id,
            vertex,
            pixel,
            pixel_stage,
            constants: objects
                .constant_buffer
                .as_ref()
                .map(|b| (b, objects.constant_binding)),
            texture_slots: &textures.slot_list,
            views: &textures.views,
            sampler: objects.sampler.as_ref(),
            sampler_bindings: &objects.sampler_bindings,
            vertex_count: QUAD_VERTEX_COUNT,
            depth_writes: self.depth_writes.load(Ordering::Relaxed),
        };
        backend.draw(&call)?;
        Ok(true)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Render thread only. Drops every native object this material owns, so
    /// whichever thread holds the last `Arc` frees CPU state only.
    pub fn release_native_objects(&self) {
        self.released.store(true, Ordering::Release);
        self.compile_outputs.lock().clear();
        let objects = std::mem::take(&mut *self.objects.lock());
        let views = {
            let mut textures = self.textures.lock();
            textures.pending.clear();
            std::mem::take(&mut textures.views)
        };
        drop((objects, views));
    }

    // ---------- Introspection ----------

    pub fn stats(&self) -> CompileStats {
        *self.stats.lock()
    }

    /// Log every property with its offset, size and current values.
    pub fn print_uniforms(&self) {
        let values = self.constants.values();
        log::info!(
            "material {}: {} uniforms, {} bytes",
            self.id,
            values.len(),
            self.constants.size()
        );
        for line in uniform_dump::summary_lines(&values) {
            log::info!("  {line}");
        }
    }

    pub fn dump_uniforms_to_file(&self, path: &Path, flatten: bool) -> Result<()> {
        uniform_dump::write_file(path, &self.constants.values(), flatten)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HeadlessBackend, RawTextureHandle};
    use crate::compile_queue::CompileQueue;
    use crate::compiler::{CompiledShader, UniformVariable};

    struct Harness {
        backend: Arc<HeadlessBackend>,
        queue: CompileQueue,
        material: LiveMaterial,
    }

    fn harness() -> Harness {
        let backend = Arc::new(HeadlessBackend::new());
        let queue = CompileQueue::new();
        let context = Arc::new(MaterialContext::new(
            backend.clone(),
            queue.sender(),
            &LiveMaterialConfig::default(),
        ));
        Harness {
            backend,
            queue,
            material: LiveMaterial::new(1, context),
        }
    }

    fn output(stage: ShaderStage, reflection: ShaderReflection) -> CompileOutput {
        CompileOutput {
            stage,
            task_id: 1,
            shader: Some(CompiledShader {
                stage,
                entry_point: "main".into(),
                blob: Arc::from(&[3u8, 2, 35, 7][..]),
                reflection: Arc::new(reflection),
            }),
            compile_time_ms: 3,
        }
    }

    fn failed(stage: ShaderStage) -> CompileOutput {
        CompileOutput {
            stage,
            task_id: 2,
            shader: None,
            compile_time_ms: 1,
        }
    }

    fn color_layout() -> ShaderReflection {
        ShaderReflection {
            uniforms: vec![UniformVariable {
                name: "color".into(),
                element_size: 16,
                array_count: 1,
                offset: 0,
            }],
            constant_buffer_binding: Some(0),
            constant_buffer_count: 1,
            instruction_count: 12,
            ..Default::default()
        }
    }

    #[test]
    fn test_shader_source_skips_empty_and_marks_compiling() {
        let h = harness();
        assert_eq!(h.material.stats().state, CompileState::NeverCompiled);
        assert_eq!(h.material.set_shader_source("", "fs", "", "vs"), 0);
        assert_eq!(h.material.stats().state, CompileState::NeverCompiled);

        assert_eq!(h.material.set_shader_source("frag", "fs", "", "vs"), 1);
        assert_eq!(h.material.stats().state, CompileState::Compiling);
        assert_eq!(h.material.set_shader_source("frag", "fs", "vert", "vs"), 2);
        assert_eq!(h.queue.sender().pending(), 3);
    }

    #[test]
    fn test_no_shader_no_draw() {
        let h = harness();
        assert_eq!(h.material.draw(0).ok(), Some(false));

        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        assert_eq!(h.material.draw(0).ok(), Some(false));
        assert!(!h.material.can_draw());
        assert_eq!(h.backend.draw_count(), 0);
    }

    #[test]
    fn test_draw_uploads_slot_snapshot() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        assert!(h.material.needs_render());
        assert_eq!(h.material.drain_and_apply_compile_outputs(), 2);
        assert!(!h.material.needs_render());

        h.material.set_vector4("color", [1.0, 0.0, 0.0, 1.0]);
        h.material.submit_uniforms(1).unwrap();
        assert_eq!(h.material.draw(1).ok(), Some(true));

        let draw = h.backend.last_draw().unwrap();
        assert_eq!(draw.constants, bytemuck::cast_slice::<f32, u8>(&[1.0, 0.0, 0.0, 1.0]));
        assert_eq!(draw.vertex_count, 4);

        // Slot 0 was never submitted
        h.material.draw(0).unwrap();
        assert_eq!(h.backend.last_draw().unwrap().constants, vec![0u8; 16]);

        let stats = h.material.stats();
        assert_eq!(stats.state, CompileState::Success);
        assert_eq!(stats.instruction_count, 12);
    }

    #[test]
    fn test_failed_compile_keeps_previous_shader() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.drain_and_apply_compile_outputs();
        h.material.set_vector4("color", [0.5; 4]);

        h.material.queue_compile_output(failed(ShaderStage::Fragment));
        assert!(!h.material.needs_render());
        assert_eq!(h.material.drain_and_apply_compile_outputs(), 0);
        assert_eq!(h.material.stats().state, CompileState::Error);
        assert!(h.material.can_draw());
        assert_eq!(h.material.get_vector4("color"), [0.5; 4]);
    }

    #[test]
    fn test_backend_failure_retains_state() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.drain_and_apply_compile_outputs();
        let live = h.backend.live_objects();

        h.backend.set_fail_shader_creation(true);
        h.material.queue_compile_output(output(ShaderStage::Fragment, ShaderReflection::default()));
        assert_eq!(h.material.drain_and_apply_compile_outputs(), 0);
        assert!(h.material.has_property("color"));
        assert_eq!(h.backend.live_objects(), live);
        assert_eq!(h.material.stats().state, CompileState::Error);
    }

    #[test]
    fn test_shader_swap_releases_previous_object() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.drain_and_apply_compile_outputs();
        assert_eq!(h.backend.live_objects(), 1);
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.drain_and_apply_compile_outputs();
        assert_eq!(h.backend.live_objects(), 1);
    }

    #[test]
    fn test_texture_handshake() {
        let h = harness();
        assert!(h.material.set_texture_id("albedo", 42));
        assert!(h.material.bound_texture("albedo").is_none());

        let handle = NativeTexture::new(RawTextureHandle(0xbeef));
        h.material.set_texture_ptr("albedo", 42, handle.clone()).unwrap();
        assert!(!h.material.set_texture_id("albedo", 42));
        assert!(h.material.bound_texture("albedo").unwrap().same_handle(&handle));

        // Same id reused for another name is a cache hit
        assert!(!h.material.set_texture_id("detail", 42));

        let other = NativeTexture::new(RawTextureHandle(0xf00d));
        assert!(matches!(
            h.material.set_texture_ptr("albedo", 42, other),
            Err(Error::DuplicateTexture { id: 42 })
        ));
        assert!(h.material.bound_texture("albedo").unwrap().same_handle(&handle));
    }

    #[test]
    fn test_textures_resolve_on_draw_after_relayout() {
        let h = harness();
        h.material
            .set_texture_ptr("albedo", 7, NativeTexture::new(RawTextureHandle(1)))
            .unwrap();

        let mut layout = color_layout();
        layout.textures.insert("albedo".into(), 2);
        layout.samplers = vec![3];
        h.material.queue_compile_output(output(ShaderStage::Fragment, layout));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.draw(0).unwrap();
        assert_eq!(h.backend.last_draw().unwrap().bound_slots, vec![2]);

        // New shader moves the texture to slot 0
        let mut moved = color_layout();
        moved.textures.insert("albedo".into(), 0);
        moved.samplers = vec![1];
        h.material.queue_compile_output(output(ShaderStage::Fragment, moved));
        h.material.draw(0).unwrap();
        assert_eq!(h.backend.last_draw().unwrap().bound_slots, vec![0]);
    }

    #[test]
    fn test_disabled_material_does_not_draw() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.set_drawing_enabled(false);
        assert_eq!(h.material.draw(0).ok(), Some(false));
        // Outputs were still applied
        assert!(h.material.can_draw());
        h.material.set_drawing_enabled(true);
        h.material.set_depth_writes_enabled(true);
        assert_eq!(h.material.draw(0).ok(), Some(true));
        assert!(h.backend.last_draw().unwrap().depth_writes);
    }

    #[test]
    fn test_draw_slot_out_of_range() {
        let h = harness();
        assert!(matches!(
            h.material.draw(RING_DEPTH),
            Err(Error::SlotOutOfRange { .. })
        ));
    }

    #[test]
    fn test_compute_counts_as_pixel_stage() {
        let h = harness();
        assert_eq!(h.material.set_compute_source("", "main"), 0);
        assert_eq!(h.material.set_compute_source("compute", "main"), 1);
        h.material.queue_compile_output(output(ShaderStage::Compute, color_layout()));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        assert_eq!(h.material.draw(0).ok(), Some(true));
        assert_eq!(h.backend.last_draw().unwrap().pixel_stage, ShaderStage::Compute);
    }

    #[test]
    fn test_array_setters_and_getters() {
        let h = harness();
        let layout = ShaderReflection {
            uniforms: vec![
                UniformVariable {
                    name: "lights".into(),
                    element_size: 16,
                    array_count: 2,
                    offset: 0,
                },
                UniformVariable {
                    name: "bones".into(),
                    element_size: 64,
                    array_count: 1,
                    offset: 32,
                },
            ],
            ..Default::default()
        };
        h.material.queue_compile_output(output(ShaderStage::Fragment, layout));
        h.material.drain_and_apply_compile_outputs();

        h.material
            .set_vector_array("lights", &[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0], [9.0; 4]]);
        let mut lights = [[0.0f32; 4]; 3];
        assert_eq!(h.material.get_vector_array("lights", &mut lights), 2);
        assert_eq!(lights[1], [5.0, 6.0, 7.0, 8.0]);
        assert_eq!(lights[2], [0.0; 4]);

        let identity: [f32; 16] = std::array::from_fn(|i| if i % 5 == 0 { 1.0 } else { 0.0 });
        h.material.set_matrix_array("bones", &[identity]);
        assert_eq!(h.material.get_matrix("bones"), identity);
        assert_eq!(h.material.get_float("missing"), 0.0);
    }

    #[test]
    fn test_dump_uses_current_values() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.drain_and_apply_compile_outputs();
        h.material.set_vector4("color", [0.0, 1.0, 0.0, 1.0]);
        h.material.print_uniforms();

        let path = std::env::temp_dir().join(format!("live_material_{}_color.json", std::process::id()));
        h.material.dump_uniforms_to_file(&path, true).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(text, "{\n    \"color\": [0, 1, 0, 1]\n}\n");
    }

    #[test]
    fn test_sampler_created_without_bound_textures() {
        let h = harness();
        let mut layout = color_layout();
        layout.textures.insert("albedo".into(), 1);
        layout.samplers = vec![2];
        h.material.queue_compile_output(output(ShaderStage::Fragment, layout));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        assert_eq!(h.material.draw(0).ok(), Some(true));

        let draw = h.backend.last_draw().unwrap();
        assert!(draw.bound_slots.is_empty());
        assert!(draw.has_sampler);
        // vertex + fragment + constant buffer + sampler
        assert_eq!(h.backend.live_objects(), 4);
    }

    #[test]
    fn test_type_conflict_warns_only_with_flag() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.drain_and_apply_compile_outputs();

        let conflict = h.material.set_float("color", 1.0);
        assert_eq!(
            conflict,
            SetOutcome::Conflict {
                reflected: PropType::Vector4
            }
        );
        assert!(!h.material.has_property("color"));
        assert!(h.material.conflict_warning("color", PropType::Float, conflict).is_none());

        h.material.context.set_flags(RenderFlags::SHOW_WARNINGS);
        let warning = h.material.conflict_warning("color", PropType::Float, conflict).unwrap();
        assert!(warning.contains("'color'"));
        assert!(h
            .material
            .conflict_warning("color", PropType::Float, SetOutcome::Written(4))
            .is_none());
    }

    #[test]
    fn test_released_material_frees_objects_and_stops_drawing() {
        let h = harness();
        h.material.queue_compile_output(output(ShaderStage::Fragment, color_layout()));
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        h.material.draw(0).unwrap();
        assert!(h.backend.live_objects() > 0);

        h.material.release_native_objects();
        assert_eq!(h.backend.live_objects(), 0);
        assert!(!h.material.can_draw());
        h.material.queue_compile_output(output(ShaderStage::Vertex, ShaderReflection::default()));
        assert!(!h.material.needs_render());
        assert_eq!(h.material.draw(0).ok(), Some(false));
        assert_eq!(h.backend.live_objects(), 0);
    }
}
