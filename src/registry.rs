// src/registry.rs
//! Material registry: the id -> material map plus the compile worker.
//!
//! One registry is one isolated service. Hosts normally install exactly one
//! (see `ffi`), tests create as many as they like.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::backend::GraphicsBackend;
use crate::compile_queue::{CompileOutputSink, CompileQueue, CompileWorker};
use crate::compiler::{CompileOutput, ShaderCompiler};
use crate::config::{LiveMaterialConfig, RenderFlags};
use crate::error::{Error, Result};
use crate::live_material::{LiveMaterial, MaterialContext, MaterialId};

/// Every id except 0.
pub const MAX_LIVE_MATERIALS: usize = u16::MAX as usize;

/// Pack a material id and ring slot into one host event value.
pub fn pack_event(id: MaterialId, slot: u16) -> i32 {
    (((id as u32) << 16) | slot as u32) as i32
}

/// Inverse of [`pack_event`]. Unsigned, so ids above 0x7fff survive.
pub fn unpack_event(packed: i32) -> (MaterialId, usize) {
    let bits = packed as u32;
    ((bits >> 16) as MaterialId, (bits & 0xffff) as usize)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugInfo {
    pub pending_compile_tasks: u32,
    pub live_materials: u32,
}

#[derive(Default)]
struct MaterialMap {
    materials: HashMap<MaterialId, Arc<LiveMaterial>>,
    last_id: MaterialId,
}

impl MaterialMap {
    /// Next id after `last_id`, wrapping to 1 and skipping live ids.
    fn next_free_id(&self) -> Result<MaterialId> {
        crate::ensure!(
            self.materials.len() < MAX_LIVE_MATERIALS,
            Error::IdSpaceExhausted
        );
        let mut id = self.last_id;
        loop {
            id = id.wrapping_add(1);
            if id == 0 {
                log::debug!("material id counter wrapped");
                id = 1;
            }
            if !self.materials.contains_key(&id) {
                return Ok(id);
            }
        }
    }
}

/// The locked map. Also the compile worker's delivery target.
#[derive(Default)]
pub struct MaterialTable {
    inner: Mutex<MaterialMap>,
}

impl MaterialTable {
    pub fn get(&self, id: MaterialId) -> Option<Arc<LiveMaterial>> {
        self.inner.lock().materials.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().materials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CompileOutputSink for MaterialTable {
    fn deliver(&self, owner: u16, output: CompileOutput) -> bool {
        // Queue outside the map lock
        match self.get(owner) {
            Some(material) => {
                material.queue_compile_output(output);
                true
            }
            None => false,
        }
    }
}

pub struct MaterialRegistry {
    context: Arc<MaterialContext>,
    table: Arc<MaterialTable>,
    compiler: Arc<ShaderCompiler>,
    worker: Mutex<Option<CompileWorker>>,
    /// Destroyed materials awaiting release on the render thread.
    retired: Mutex<Vec<Arc<LiveMaterial>>>,
}

impl MaterialRegistry {
    /// Registry compiling WGSL with naga.
    pub fn new(backend: Arc<dyn GraphicsBackend>, config: LiveMaterialConfig) -> Result<Self> {
        let compiler = ShaderCompiler::with_naga(config.compile_cache_capacity);
        Self::with_compiler(backend, compiler, config)
    }

    pub fn with_compiler(
        backend: Arc<dyn GraphicsBackend>,
        compiler: ShaderCompiler,
        config: LiveMaterialConfig,
    ) -> Result<Self> {
        let queue = CompileQueue::new();
        let backend_name = backend.name();
        let context = Arc::new(MaterialContext::new(backend, queue.sender(), &config));
        let table = Arc::new(MaterialTable::default());
        let compiler = Arc::new(compiler);
        let worker = queue.spawn_worker(compiler.clone(), table.clone(), &config.compiler_thread_name)?;

        log::info!(
            "material registry ready (backend: {}, compiler: {}, cache: {} entries)",
            backend_name,
            compiler.native_name(),
            config.compile_cache_capacity
        );
        Ok(Self {
            context,
            table,
            compiler,
            worker: Mutex::new(Some(worker)),
            retired: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<MaterialContext> {
        &self.context
    }

    pub fn compiler(&self) -> &Arc<ShaderCompiler> {
        &self.compiler
    }

    // ---------- Lifecycle ----------

    pub fn create(&self) -> Result<Arc<LiveMaterial>> {
        let mut map = self.table.inner.lock();
        let id = map.next_free_id()?;
        let material = Arc::new(LiveMaterial::new(id, self.context.clone()));
        map.materials.insert(id, material.clone());
        map.last_id = id;
        log::debug!("created material {}", id);
        Ok(material)
    }

    /// Remove `id` from the map. Its native objects are released on the render
    /// thread by the next registry draw or `release_retired`.
    pub fn destroy(&self, id: MaterialId) -> bool {
        let removed = self.table.inner.lock().materials.remove(&id);
        match removed {
            Some(material) => {
                self.retired.lock().push(material);
                log::debug!("destroyed material {}", id);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, id: MaterialId) -> Option<Arc<LiveMaterial>> {
        self.table.get(id)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Render thread only. Releases the native objects of destroyed materials,
    /// even those another thread still holds an `Arc` to. Returns how many.
    pub fn release_retired(&self) -> usize {
        let retired = std::mem::take(&mut *self.retired.lock());
        for material in &retired {
            material.release_native_objects();
        }
        retired.len()
    }

    // ---------- Drawing ----------

    /// Render thread only.
    pub fn draw(&self, id: MaterialId, slot: usize) -> Result<bool> {
        self.release_retired();
        let material = self.lookup(id).ok_or(Error::UnknownMaterial(id))?;
        material.draw(slot)
    }

    /// Single-argument render event: `packed = (id << 16) | slot`.
    pub fn draw_packed(&self, packed: i32) -> Result<bool> {
        let (id, slot) = unpack_event(packed);
        self.draw(id, slot)
    }

    /// Draw every live material in id order. Returns how many drew.
    pub fn draw_all(&self, slot: usize) -> usize {
        self.release_retired();
        let mut materials: Vec<_> = self.table.inner.lock().materials.values().cloned().collect();
        materials.sort_by_key(|m| m.id());

        let mut drawn = 0;
        for material in materials {
            match material.draw(slot) {
                Ok(true) => drawn += 1,
                Ok(false) => {}
                Err(err) => log::error!("material {}: draw failed: {}", material.id(), err),
            }
        }
        drawn
    }

    // ---------- Process-wide settings ----------

    pub fn set_flags(&self, flags: RenderFlags) {
        self.context.set_flags(flags);
    }

    pub fn flags(&self) -> RenderFlags {
        self.context.flags()
    }

    pub fn clear_compile_cache(&self) {
        self.compiler.clear_cache();
    }

    pub fn set_shader_include_path(&self, path: &Path) {
        self.context.set_include_path(path);
        log::info!("shader include path set to {}", path.display());
    }

    pub fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            pending_compile_tasks: self.context.compile_sender().pending() as u32,
            live_materials: self.len() as u32,
        }
    }

    /// Block until every submitted compile has been delivered, or `timeout`.
    pub fn wait_for_compiles(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while self.context.compile_sender().pending() > 0 {
            if started.elapsed() >= timeout {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stop the compile worker and release every material. Idempotent.
    pub fn shutdown(&self) {
        let worker = self.worker.lock().take();
        let Some(mut worker) = worker else {
            return;
        };
        worker.shutdown();
        let materials = std::mem::take(&mut self.table.inner.lock().materials);
        for material in materials.values() {
            material.release_native_objects();
        }
        let released = materials.len() + self.release_retired();
        log::info!("material registry shut down ({} materials released)", released);
    }
}

impl Drop for MaterialRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
