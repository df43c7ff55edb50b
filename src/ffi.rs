// src/ffi.rs
//! C ABI for host engines.
//!
//! The host installs one [`MaterialRegistry`] (and optionally one
//! [`DebugSink`]); every `live_material_*` function then routes through it.
//! Material ids are passed as `i32`; anything that does not name a live
//! material is a miss.
//!
//! Pointer contract for every function below: string arguments are null or
//! NUL-terminated; float pointers are null or valid for the stated number of
//! floats; output pointers are null or writable. Null pointers, invalid UTF-8
//! and unknown ids produce the documented sentinel (`false`, `0`, `0.0`).
#![allow(clippy::missing_safety_doc)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::sync::Arc;

use parking_lot::{const_rwlock, RwLock};

use crate::backend::{HeadlessBackend, RawTextureHandle};
use crate::config::{LiveMaterialConfig, RenderFlags};
use crate::debug_log::{self, DebugSink};
use crate::error::{Error, Result};
use crate::live_material::{CompileStats, LiveMaterial, MaterialId};
use crate::registry::{DebugInfo, MaterialRegistry};

static REGISTRY: RwLock<Option<Arc<MaterialRegistry>>> = const_rwlock(None);
static SINK: RwLock<Option<Arc<DebugSink>>> = const_rwlock(None);

/// Make `registry` the one the C ABI uses. Returns the previous one.
pub fn install(registry: Arc<MaterialRegistry>) -> Option<Arc<MaterialRegistry>> {
    REGISTRY.write().replace(registry)
}

/// Remove and shut down the installed registry.
pub fn uninstall() -> bool {
    let previous = REGISTRY.write().take();
    match previous {
        Some(registry) => {
            registry.shutdown();
            true
        }
        None => false,
    }
}

pub fn installed() -> Option<Arc<MaterialRegistry>> {
    REGISTRY.read().clone()
}

/// Like [`installed`], for paths that report why they failed.
pub fn current_registry() -> Result<Arc<MaterialRegistry>> {
    installed().ok_or(Error::NotInitialized)
}

/// The process-wide debug sink, created on first use.
pub fn debug_sink() -> Arc<DebugSink> {
    if let Some(sink) = SINK.read().as_ref() {
        return sink.clone();
    }
    SINK.write().get_or_insert_with(|| Arc::new(DebugSink::new())).clone()
}

fn material_id(id: i32) -> Option<MaterialId> {
    MaterialId::try_from(id).ok().filter(|&id| id != 0)
}

fn with_material<R>(id: i32, miss: R, f: impl FnOnce(&LiveMaterial) -> R) -> R {
    let material = installed().and_then(|r| material_id(id).and_then(|id| r.lookup(id)));
    match material {
        Some(material) => f(&material),
        None => miss,
    }
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

unsafe fn floats<'a>(ptr: *const f32, count: usize) -> Option<&'a [f32]> {
    if ptr.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts(ptr, count))
}

unsafe fn floats_mut<'a>(ptr: *mut f32, count: usize) -> Option<&'a mut [f32]> {
    if ptr.is_null() {
        return None;
    }
    Some(std::slice::from_raw_parts_mut(ptr, count))
}

fn count_arg(count: i32) -> usize {
    usize::try_from(count).unwrap_or(0)
}

// ---------- Process ----------

/// Install the debug sink logger and a headless registry if none is installed.
#[no_mangle]
pub extern "C" fn live_material_startup() -> bool {
    let config = LiveMaterialConfig::default();
    if let Err(err) = debug_log::install(debug_sink(), config.log_level) {
        log::debug!("{}", err);
    }
    if installed().is_some() {
        return true;
    }
    match MaterialRegistry::new(Arc::new(HeadlessBackend::new()), config) {
        Ok(registry) => {
            install(Arc::new(registry));
            true
        }
        Err(err) => {
            log::error!("starting material registry: {}", err);
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn live_material_shutdown() {
    uninstall();
    if let Some(sink) = SINK.read().as_ref() {
        sink.clear_callback();
    }
}

/// Route log lines to `callback`; null restores the console.
#[no_mangle]
pub extern "C" fn live_material_set_debug_callback(callback: Option<extern "C" fn(*const c_char)>) {
    let sink = debug_sink();
    match callback {
        Some(callback) => sink.set_callback(Arc::new(move |line: &str| {
            let line = CString::new(line.replace('\0', " ")).unwrap_or_default();
            callback(line.as_ptr());
        })),
        None => sink.clear_callback(),
    }
}

#[no_mangle]
pub extern "C" fn live_material_set_flags(flags: u32) {
    if let Some(registry) = installed() {
        registry.set_flags(RenderFlags::from_host(flags));
    }
}

#[no_mangle]
pub extern "C" fn live_material_clear_compile_cache() {
    if let Some(registry) = installed() {
        registry.clear_compile_cache();
    }
}

#[no_mangle]
pub unsafe extern "C" fn live_material_get_debug_info(out: *mut DebugInfo) -> bool {
    match (installed(), out.as_mut()) {
        (Some(registry), Some(out)) => {
            *out = registry.debug_info();
            true
        }
        _ => false,
    }
}

#[no_mangle]
pub unsafe extern "C" fn live_material_set_shader_include_path(path: *const c_char) -> bool {
    match (installed(), str_arg(path)) {
        (Some(registry), Some(path)) => {
            registry.set_shader_include_path(Path::new(path));
            true
        }
        _ => false,
    }
}

// ---------- Lifecycle ----------

/// New material id, or 0 on failure.
#[no_mangle]
pub extern "C" fn live_material_create() -> i32 {
    match current_registry().and_then(|registry| registry.create()) {
        Ok(material) => i32::from(material.id()),
        Err(err) => {
            log::error!("creating material: {}", err);
            0
        }
    }
}

#[no_mangle]
pub extern "C" fn live_material_destroy(id: i32) -> bool {
    match (installed(), material_id(id)) {
        (Some(registry), Some(id)) => registry.destroy(id),
        _ => false,
    }
}

// ---------- Shader source ----------

/// Null sources count as empty. Returns tasks submitted.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_shader_source(
    id: i32,
    fragment: *const c_char,
    fragment_entry: *const c_char,
    vertex: *const c_char,
    vertex_entry: *const c_char,
) -> i32 {
    let fragment = str_arg(fragment).unwrap_or("");
    let fragment_entry = str_arg(fragment_entry).unwrap_or("");
    let vertex = str_arg(vertex).unwrap_or("");
    let vertex_entry = str_arg(vertex_entry).unwrap_or("");
    with_material(id, 0, |m| {
        m.set_shader_source(fragment, fragment_entry, vertex, vertex_entry) as i32
    })
}

#[no_mangle]
pub unsafe extern "C" fn live_material_set_compute_source(
    id: i32,
    source: *const c_char,
    entry: *const c_char,
) -> i32 {
    let source = str_arg(source).unwrap_or("");
    let entry = str_arg(entry).unwrap_or("");
    with_material(id, 0, |m| m.set_compute_source(source, entry) as i32)
}

#[no_mangle]
pub extern "C" fn live_material_needs_render(id: i32) -> bool {
    with_material(id, false, LiveMaterial::needs_render)
}

#[no_mangle]
pub unsafe extern "C" fn live_material_get_stats(id: i32, out: *mut CompileStats) -> bool {
    let Some(out) = out.as_mut() else {
        return false;
    };
    with_material(id, false, |m| {
        *out = m.stats();
        true
    })
}

// ---------- Uniform setters ----------

#[no_mangle]
pub unsafe extern "C" fn live_material_set_float(id: i32, name: *const c_char, value: f32) {
    let Some(name) = str_arg(name) else { return };
    with_material(id, (), |m| {
        m.set_float(name, value);
    });
}

#[no_mangle]
pub unsafe extern "C" fn live_material_set_vector4(
    id: i32,
    name: *const c_char,
    x: f32,
    y: f32,
    z: f32,
    w: f32,
) {
    let Some(name) = str_arg(name) else { return };
    with_material(id, (), |m| {
        m.set_vector4(name, [x, y, z, w]);
    });
}

/// `values` holds 16 column-major floats.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_matrix(id: i32, name: *const c_char, values: *const f32) {
    let (Some(name), Some(values)) = (str_arg(name), floats(values, 16)) else {
        return;
    };
    let Ok(matrix) = <&[f32; 16]>::try_from(values) else {
        return;
    };
    with_material(id, (), |m| {
        m.set_matrix(name, matrix);
    });
}

#[no_mangle]
pub unsafe extern "C" fn live_material_set_float_array(
    id: i32,
    name: *const c_char,
    values: *const f32,
    count: i32,
) {
    let (Some(name), Some(values)) = (str_arg(name), floats(values, count_arg(count))) else {
        return;
    };
    with_material(id, (), |m| {
        m.set_float_array(name, values);
    });
}

/// `count` is the number of 4-float vectors.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_vector_array(
    id: i32,
    name: *const c_char,
    values: *const f32,
    count: i32,
) {
    let (Some(name), Some(values)) = (str_arg(name), floats(values, count_arg(count) * 4)) else {
        return;
    };
    with_material(id, (), |m| {
        m.set_vector_array(name, bytemuck::cast_slice(values));
    });
}

/// `count` is the number of 16-float matrices.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_matrix_array(
    id: i32,
    name: *const c_char,
    values: *const f32,
    count: i32,
) {
    let (Some(name), Some(values)) = (str_arg(name), floats(values, count_arg(count) * 16)) else {
        return;
    };
    with_material(id, (), |m| {
        m.set_matrix_array(name, bytemuck::cast_slice(values));
    });
}

// ---------- Uniform getters ----------

#[no_mangle]
pub unsafe extern "C" fn live_material_get_float(id: i32, name: *const c_char) -> f32 {
    let Some(name) = str_arg(name) else { return 0.0 };
    with_material(id, 0.0, |m| m.get_float(name))
}

/// Writes 4 floats to `out`.
#[no_mangle]
pub unsafe extern "C" fn live_material_get_vector4(id: i32, name: *const c_char, out: *mut f32) -> bool {
    let (Some(name), Some(out)) = (str_arg(name), floats_mut(out, 4)) else {
        return false;
    };
    with_material(id, false, |m| {
        out.copy_from_slice(&m.get_vector4(name));
        m.has_property(name)
    })
}

/// Writes 16 floats to `out`.
#[no_mangle]
pub unsafe extern "C" fn live_material_get_matrix(id: i32, name: *const c_char, out: *mut f32) -> bool {
    let (Some(name), Some(out)) = (str_arg(name), floats_mut(out, 16)) else {
        return false;
    };
    with_material(id, false, |m| {
        out.copy_from_slice(&m.get_matrix(name));
        m.has_property(name)
    })
}

/// Returns floats read, at most `count`.
#[no_mangle]
pub unsafe extern "C" fn live_material_get_float_array(
    id: i32,
    name: *const c_char,
    out: *mut f32,
    count: i32,
) -> i32 {
    let (Some(name), Some(out)) = (str_arg(name), floats_mut(out, count_arg(count))) else {
        return 0;
    };
    with_material(id, 0, |m| m.get_float_array(name, out) as i32)
}

/// Returns vectors read, at most `count`.
#[no_mangle]
pub unsafe extern "C" fn live_material_get_vector_array(
    id: i32,
    name: *const c_char,
    out: *mut f32,
    count: i32,
) -> i32 {
    let (Some(name), Some(out)) = (str_arg(name), floats_mut(out, count_arg(count) * 4)) else {
        return 0;
    };
    with_material(id, 0, |m| {
        m.get_vector_array(name, bytemuck::cast_slice_mut(out)) as i32
    })
}

/// Returns matrices read, at most `count`.
#[no_mangle]
pub unsafe extern "C" fn live_material_get_matrix_array(
    id: i32,
    name: *const c_char,
    out: *mut f32,
    count: i32,
) -> i32 {
    let (Some(name), Some(out)) = (str_arg(name), floats_mut(out, count_arg(count) * 16)) else {
        return 0;
    };
    with_material(id, 0, |m| {
        m.get_matrix_array(name, bytemuck::cast_slice_mut(out)) as i32
    })
}

#[no_mangle]
pub unsafe extern "C" fn live_material_has_property(id: i32, name: *const c_char) -> bool {
    let Some(name) = str_arg(name) else { return false };
    with_material(id, false, |m| m.has_property(name))
}

// ---------- Textures ----------

/// True when `texture_id` is unseen and the host must call `set_texture_ptr`.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_texture_id(id: i32, name: *const c_char, texture_id: i32) -> bool {
    let Some(name) = str_arg(name) else { return false };
    with_material(id, false, |m| m.set_texture_id(name, texture_id))
}

/// `handle` is an opaque host pointer. The installed backend decides whether
/// it can view it: the headless backend accepts any handle, the wgpu backend
/// needs a `wgpu::Texture` registered through `LiveMaterial::set_texture_ptr`.
#[no_mangle]
pub unsafe extern "C" fn live_material_set_texture_ptr(
    id: i32,
    name: *const c_char,
    texture_id: i32,
    handle: *mut c_void,
) -> bool {
    let Some(name) = str_arg(name) else { return false };
    if handle.is_null() {
        return false;
    }
    let handle = RawTextureHandle(handle as usize);
    let imported = current_registry()
        .and_then(|registry| registry.context().backend().import_texture(handle));
    let texture = match imported {
        Ok(texture) => texture,
        Err(err) => {
            log::error!("texture {}: {}", texture_id, err);
            return false;
        }
    };
    with_material(id, false, |m| match m.set_texture_ptr(name, texture_id, texture) {
        Ok(()) => true,
        Err(err) => {
            log::error!("material {}: {}", m.id(), err);
            false
        }
    })
}

// ---------- Rendering ----------

#[no_mangle]
pub extern "C" fn live_material_submit_uniforms(id: i32, slot: i32) -> bool {
    let Ok(slot) = usize::try_from(slot) else {
        return false;
    };
    with_material(id, false, |m| match m.submit_uniforms(slot) {
        Ok(()) => true,
        Err(err) => {
            log::error!("material {}: {}", m.id(), err);
            false
        }
    })
}

/// Render thread only.
#[no_mangle]
pub extern "C" fn live_material_draw(id: i32, slot: i32) -> bool {
    let (Some(id), Ok(slot)) = (material_id(id), usize::try_from(slot)) else {
        return false;
    };
    match current_registry().and_then(|registry| registry.draw(id, slot)) {
        Ok(drawn) => drawn,
        Err(err) => {
            log::debug!("draw {}: {}", id, err);
            false
        }
    }
}

/// Render event callback; `packed = (id << 16) | slot`.
pub extern "C" fn live_material_render_event(packed: i32) {
    let Some(registry) = installed() else {
        return;
    };
    if let Err(err) = registry.draw_packed(packed) {
        log::debug!("render event {:#x}: {}", packed as u32, err);
    }
}

#[no_mangle]
pub extern "C" fn live_material_get_render_event_func() -> extern "C" fn(i32) {
    live_material_render_event
}

#[no_mangle]
pub extern "C" fn live_material_can_draw(id: i32) -> bool {
    with_material(id, false, LiveMaterial::can_draw)
}

#[no_mangle]
pub extern "C" fn live_material_set_drawing_enabled(id: i32, enabled: bool) {
    with_material(id, (), |m| m.set_drawing_enabled(enabled));
}

#[no_mangle]
pub extern "C" fn live_material_set_depth_writes_enabled(id: i32, enabled: bool) {
    with_material(id, (), |m| m.set_depth_writes_enabled(enabled));
}

// ---------- Introspection ----------

#[no_mangle]
pub extern "C" fn live_material_print_uniforms(id: i32) {
    with_material(id, (), LiveMaterial::print_uniforms);
}

#[no_mangle]
pub unsafe extern "C" fn live_material_dump_uniforms(id: i32, path: *const c_char, flatten: bool) -> bool {
    let Some(path) = str_arg(path) else { return false };
    with_material(id, false, |m| match m.dump_uniforms_to_file(Path::new(path), flatten) {
        Ok(()) => true,
        Err(err) => {
            log::error!("material {}: {}", m.id(), err);
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live_material::CompileState;
    use parking_lot::Mutex;
    use std::time::Duration;

    const COLOR_FS: &CStr = c"
struct Params {
    color: vec4<f32>,
    weights: array<vec4<f32>, 2>,
    view: mat4x4<f32>,
}
@group(0) @binding(0) var<uniform> params: Params;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return params.color + params.weights[1] + params.view[0];
}
";

    const QUAD_VS: &CStr = c"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(index & 1u) * 2.0 - 1.0;
    let y = f32((index >> 1u) & 1u) * 2.0 - 1.0;
    return vec4<f32>(x, y, 0.0, 1.0);
}
";

    static LINES: Mutex<Vec<String>> = parking_lot::const_mutex(Vec::new());

    extern "C" fn capture(line: *const c_char) {
        let line = unsafe { CStr::from_ptr(line) }.to_string_lossy().into_owned();
        LINES.lock().push(line);
    }

    #[test]
    fn test_string_arguments() {
        unsafe {
            assert_eq!(str_arg(std::ptr::null()), None);
            assert_eq!(str_arg(c"color".as_ptr()), Some("color"));
            let invalid = [0xffu8, 0xfe, 0];
            assert_eq!(str_arg(invalid.as_ptr() as *const c_char), None);
        }
        assert_eq!(material_id(0), None);
        assert_eq!(material_id(-1), None);
        assert_eq!(material_id(70000), None);
        assert_eq!(material_id(65535), Some(65535));
    }

    #[test]
    fn test_debug_callback() {
        live_material_set_debug_callback(Some(capture));
        assert!(debug_sink().forward("hello\0world"));
        assert!(LINES.lock().iter().any(|l| l == "hello world"));
        live_material_set_debug_callback(None);
        assert!(!debug_sink().has_callback());
    }

    // Single test: the installed registry is process-wide.
    #[test]
    fn test_host_session() {
        let backend = Arc::new(HeadlessBackend::new());
        let registry =
            Arc::new(MaterialRegistry::new(backend.clone(), LiveMaterialConfig::default()).unwrap());
        install(registry.clone());

        unsafe {
            let id = live_material_create();
            assert!(id > 0);
            assert_eq!(
                live_material_set_shader_source(
                    id,
                    COLOR_FS.as_ptr(),
                    c"fs_main".as_ptr(),
                    QUAD_VS.as_ptr(),
                    c"vs_main".as_ptr(),
                ),
                2
            );
            assert!(registry.wait_for_compiles(Duration::from_secs(10)));
            assert!(live_material_needs_render(id));

            // Drawing applies the compiled shaders
            let event = live_material_get_render_event_func();
            event((id << 16) | 3);
            assert!(live_material_can_draw(id));
            assert!(live_material_has_property(id, c"color".as_ptr()));
            assert!(!live_material_has_property(id, std::ptr::null()));

            live_material_set_vector4(id, c"color".as_ptr(), 1.0, 0.0, 0.0, 1.0);
            let weights = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0];
            live_material_set_vector_array(id, c"weights".as_ptr(), weights.as_ptr(), 2);

            let mut color = [0.0f32; 4];
            assert!(live_material_get_vector4(id, c"color".as_ptr(), color.as_mut_ptr()));
            assert_eq!(color, [1.0, 0.0, 0.0, 1.0]);
            let mut read = [0.0f32; 8];
            assert_eq!(
                live_material_get_vector_array(id, c"weights".as_ptr(), read.as_mut_ptr(), 2),
                2
            );
            assert_eq!(read, weights);

            let identity: [f32; 16] = std::array::from_fn(|i| if i % 5 == 0 { 1.0 } else { 0.0 });
            live_material_set_matrix(id, c"view".as_ptr(), identity.as_ptr());
            assert!(live_material_has_property(id, c"view".as_ptr()));
            let mut view = [0.0f32; 16];
            assert!(live_material_get_matrix(id, c"view".as_ptr(), view.as_mut_ptr()));
            assert_eq!(view, identity);

            assert!(live_material_submit_uniforms(id, 0));
            assert!(!live_material_submit_uniforms(id, 4));
            assert!(live_material_draw(id, 0));
            let draw = backend.last_draw().unwrap();
            assert_eq!(&draw.constants[..16], bytemuck::cast_slice::<f32, u8>(&[1.0, 0.0, 0.0, 1.0]));

            let mut stats = CompileStats::default();
            assert!(live_material_get_stats(id, &mut stats));
            assert_eq!(stats.state, CompileState::Success);

            assert!(live_material_set_texture_id(id, c"albedo".as_ptr(), 5));
            let mut texture = 0u8;
            let handle = &mut texture as *mut u8 as *mut c_void;
            assert!(live_material_set_texture_ptr(id, c"albedo".as_ptr(), 5, handle));
            assert!(!live_material_set_texture_id(id, c"albedo".as_ptr(), 5));
            assert!(!live_material_set_texture_ptr(id, c"albedo".as_ptr(), 5, std::ptr::null_mut()));

            backend.set_reject_raw_textures(true);
            assert!(live_material_set_texture_id(id, c"detail".as_ptr(), 6));
            assert!(!live_material_set_texture_ptr(id, c"detail".as_ptr(), 6, handle));
            assert!(live_material_set_texture_id(id, c"detail".as_ptr(), 6));
            backend.set_reject_raw_textures(false);

            let mut info = DebugInfo::default();
            assert!(live_material_get_debug_info(&mut info));
            assert_eq!(info.live_materials, 1);

            live_material_set_drawing_enabled(id, false);
            assert!(!live_material_draw(id, 0));

            assert!(live_material_destroy(id));
            assert!(!live_material_destroy(id));
            assert!(!live_material_draw(id, 0));
            assert_eq!(live_material_get_float(id, c"color".as_ptr()), 0.0);
        }

        assert!(uninstall());
        assert!(!uninstall());
        assert!(matches!(current_registry(), Err(Error::NotInitialized)));
        assert_eq!(live_material_create(), 0);
        assert!(!live_material_draw(1, 0));
    }
}
