// src/compiler/naga_compiler.rs
//! WGSL compiler built on naga.
//!
//! Parse -> validate -> SPIR-V for a single entry point, then reflect the
//! resources that entry point actually uses. Everything is assumed to live in
//! bind group 0.

use std::sync::Arc;

use naga::back::spv;
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{AddressSpace, Module, TypeInner};

use super::reflection::{ShaderReflection, UniformVariable};
use super::{CompileTask, CompiledShader, NativeCompiler, ShaderStage};
use crate::error::{Error, Result};

/// SPIR-V writer flags used for every compile.
const WRITER_FLAGS: spv::WriterFlags = spv::WriterFlags::DEBUG.union(spv::WriterFlags::LABEL_VARYINGS);

#[derive(Debug, Default)]
pub struct NagaCompiler;

impl NagaCompiler {
    pub fn new() -> Self {
        Self
    }
}

fn naga_stage(stage: ShaderStage) -> naga::ShaderStage {
    match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    }
}

impl NativeCompiler for NagaCompiler {
    fn name(&self) -> &'static str {
        "naga"
    }

    fn compile(&self, task: &CompileTask) -> Result<CompiledShader> {
        let fail = |diagnostics: String| Error::Compile {
            stage: task.stage,
            diagnostics,
        };
        let source: &str = &task.source;

        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| fail(e.emit_to_string_with_path(source, &task.debug_filename)))?;

        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        let info = validator
            .validate(&module)
            .map_err(|e| fail(e.emit_to_string_with_path(source, &task.debug_filename)))?;

        let stage = naga_stage(task.stage);
        let ep_index = module
            .entry_points
            .iter()
            .position(|ep| ep.name == task.entry_point && ep.stage == stage)
            .ok_or_else(|| {
                fail(format!(
                    "{}: entry point '{}' not found for {} stage",
                    task.debug_filename, task.entry_point, task.stage
                ))
            })?;

        let options = spv::Options {
            lang_version: (1, 0),
            flags: WRITER_FLAGS,
            ..Default::default()
        };
        let pipeline_options = spv::PipelineOptions {
            shader_stage: stage,
            entry_point: task.entry_point.clone(),
        };
        let words = spv::write_vec(&module, &info, &options, Some(&pipeline_options))
            .map_err(|e| fail(format!("SPIR-V generation error: {e}")))?;

        let mut reflection = if task.stage.is_reflected() {
            reflect_entry_point(&module, &info, ep_index)
        } else {
            ShaderReflection::default()
        };
        reflection.instruction_count = module.entry_points[ep_index].function.expressions.len() as u32;

        if reflection.constant_buffer_count > 1 {
            log::warn!(
                "{}: '{}' uses {} constant buffers; only binding {:?} is supported",
                task.debug_filename,
                task.entry_point,
                reflection.constant_buffer_count,
                reflection.constant_buffer_binding
            );
        }

        Ok(CompiledShader {
            stage: task.stage,
            entry_point: task.entry_point.clone(),
            blob: Arc::from(bytemuck::cast_slice::<u32, u8>(&words)),
            reflection: Arc::new(reflection),
        })
    }
}

/// Constant buffer members, textures and samplers used by one entry point.
pub fn reflect_entry_point(module: &Module, info: &ModuleInfo, ep_index: usize) -> ShaderReflection {
    let ep_info = info.get_entry_point(ep_index);
    let mut reflection = ShaderReflection::default();
    let mut uniform_globals = Vec::new();

    for (handle, var) in module.global_variables.iter() {
        if ep_info[handle].is_empty() {
            continue;
        }
        let Some(binding) = var.binding.as_ref() else {
            continue;
        };
        match var.space {
            AddressSpace::Uniform => uniform_globals.push((binding.group, binding.binding, var)),
            AddressSpace::Handle => match module.types[var.ty].inner {
                TypeInner::Image { .. } => {
                    let name = var
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("texture{}", binding.binding));
                    reflection.textures.insert(name, binding.binding);
                }
                TypeInner::Sampler { .. } => reflection.samplers.push(binding.binding),
                _ => {}
            },
            _ => {}
        }
    }

    uniform_globals.sort_by_key(|&(group, binding, _)| (group, binding));
    reflection.samplers.sort_unstable();
    reflection.constant_buffer_count = uniform_globals.len() as u32;

    if let Some(&(_, binding, var)) = uniform_globals.first() {
        reflection.constant_buffer_binding = Some(binding);
        match &module.types[var.ty].inner {
            TypeInner::Struct { members, .. } => {
                for (i, member) in members.iter().enumerate() {
                    let name = member.name.clone().unwrap_or_else(|| format!("member{i}"));
                    if let Some(var) = uniform_variable(module, name, member.ty, member.offset) {
                        reflection.uniforms.push(var);
                    }
                }
            }
            _ => {
                let name = var.name.clone().unwrap_or_else(|| format!("uniform{binding}"));
                if let Some(var) = uniform_variable(module, name, var.ty, 0) {
                    reflection.uniforms.push(var);
                }
            }
        }
    }

    reflection
}

fn uniform_variable(
    module: &Module,
    name: String,
    ty: naga::Handle<naga::Type>,
    offset: u32,
) -> Option<UniformVariable> {
    let inner = &module.types[ty].inner;
    let (element_size, count) = match *inner {
        TypeInner::Array {
            size: naga::ArraySize::Constant(count),
            stride,
            ..
        } => (stride, count.get()),
        _ => (inner.size(module.to_ctx()), 1),
    };
    match (
        u16::try_from(element_size),
        u16::try_from(count),
        u16::try_from(offset),
    ) {
        (Ok(element_size), Ok(array_count), Ok(offset)) => Some(UniformVariable {
            name,
            element_size,
            array_count,
            offset,
        }),
        _ => {
            log::warn!("uniform '{name}' does not fit a 16-bit layout and is ignored");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLOR_FS: &str = r#"
struct Params {
    color: vec4<f32>,
}
@group(0) @binding(0) var<uniform> params: Params;

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return params.color;
}
"#;

    const LIT_FS: &str = r#"
struct Params {
    tint: vec4<f32>,
    view: mat4x4<f32>,
    lights: array<vec4<f32>, 4>,
    time: f32,
}
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;
@group(0) @binding(3) var unused_tex: texture_2d<f32>;

@fragment
fn fs_main(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
    let uv = pos.xy / 512.0;
    let base = textureSample(albedo, albedo_sampler, uv);
    return base * params.tint + params.lights[0] * params.time + params.view[0];
}
"#;

    const QUAD_VS: &str = r#"
@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let x = f32(index & 1u) * 2.0 - 1.0;
    let y = f32((index >> 1u) & 1u) * 2.0 - 1.0;
    return vec4<f32>(x, y, 0.0, 1.0);
}
"#;

    fn compile(stage: ShaderStage, source: &str, entry: &str) -> Result<CompiledShader> {
        NagaCompiler::new().compile(&CompileTask::new(stage, source, entry, "shader.wgsl", 1, 1))
    }

    #[test]
    fn test_color_uniform_at_offset_zero() {
        let shader = compile(ShaderStage::Fragment, COLOR_FS, "fs_main").unwrap();
        let refl = &shader.reflection;
        assert_eq!(
            refl.uniforms,
            vec![UniformVariable {
                name: "color".into(),
                element_size: 16,
                array_count: 1,
                offset: 0
            }]
        );
        assert_eq!(refl.constant_buffer_size(), 16);
        assert_eq!(refl.constant_buffer_binding, Some(0));
        assert!(refl.instruction_count > 0);

        // SPIR-V magic number
        assert_eq!(&shader.blob[..4], &0x0723_0203u32.to_ne_bytes());
    }

    #[test]
    fn test_struct_members_arrays_and_resources() {
        let shader = compile(ShaderStage::Fragment, LIT_FS, "fs_main").unwrap();
        let refl = &shader.reflection;
        let names: Vec<_> = refl.uniforms.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, ["tint", "view", "lights", "time"]);

        let view = &refl.uniforms[1];
        assert_eq!((view.element_size, view.offset), (64, 16));
        let lights = &refl.uniforms[2];
        assert_eq!((lights.element_size, lights.array_count, lights.offset), (16, 4, 80));
        let time = &refl.uniforms[3];
        assert_eq!(time.offset, 144);
        assert_eq!(refl.constant_buffer_size(), 160);

        // Only resources the entry point touches are reflected
        assert_eq!(refl.textures.len(), 1);
        assert_eq!(refl.textures["albedo"], 1);
        assert_eq!(refl.samplers, vec![2]);
    }

    #[test]
    fn test_vertex_stage_is_not_reflected() {
        let shader = compile(ShaderStage::Vertex, QUAD_VS, "vs_main").unwrap();
        assert!(shader.reflection.uniforms.is_empty());
        assert_eq!(shader.reflection.constant_buffer_size(), 0);
    }

    #[test]
    fn test_syntax_error_carries_diagnostics() {
        let err = compile(ShaderStage::Fragment, "fn broken( {", "fs_main").unwrap_err();
        assert!(err.is_compile());
        assert!(err.to_string().contains("shader.wgsl"));
    }

    #[test]
    fn test_entry_point_must_match_stage() {
        let err = compile(ShaderStage::Fragment, QUAD_VS, "vs_main").unwrap_err();
        assert!(err.to_string().contains("entry point 'vs_main' not found"));
    }

    #[test]
    fn test_second_constant_buffer_is_counted() {
        let src = r#"
@group(0) @binding(0) var<uniform> a: vec4<f32>;
@group(0) @binding(1) var<uniform> b: vec4<f32>;
@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return a + b;
}
"#;
        let shader = compile(ShaderStage::Fragment, src, "fs_main").unwrap();
        let refl = &shader.reflection;
        assert_eq!(refl.constant_buffer_count, 2);
        assert_eq!(refl.constant_buffer_binding, Some(0));
        assert_eq!(refl.uniforms.len(), 1);
        assert_eq!(refl.uniforms[0].name, "a");
    }
}
