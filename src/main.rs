//! Shader inspector: compile one WGSL entry point and print its reflected layout.
//!
//! Usage: live_material <file.wgsl> <entry_point> [vertex|fragment|compute]

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use log::{info, LevelFilter};

use live_material::{CompileTask, ShaderCompiler, ShaderStage};

fn parse_stage(arg: Option<&str>) -> Result<ShaderStage> {
    Ok(match arg.unwrap_or("fragment") {
        "vertex" | "vs" => ShaderStage::Vertex,
        "fragment" | "fs" => ShaderStage::Fragment,
        "compute" | "cs" => ShaderStage::Compute,
        other => bail!("unknown stage '{other}' (expected vertex, fragment or compute)"),
    })
}

fn setup_logging() {
    env_logger::Builder::new()
        .filter_level(if cfg!(debug_assertions) {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .format_timestamp_millis()
        .format_target(false)
        .parse_default_env()
        .init();
}

fn main() -> Result<()> {
    setup_logging();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (Some(path), Some(entry)) = (args.first(), args.get(1)) else {
        bail!("usage: live_material <file.wgsl> <entry_point> [vertex|fragment|compute]");
    };
    let stage = parse_stage(args.get(2).map(String::as_str))?;
    let path = PathBuf::from(path);
    let source = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;

    let compiler = ShaderCompiler::with_naga(1);
    let task = CompileTask::new(stage, source, entry.as_str(), path.display().to_string(), 1, 1);
    let output = compiler.compile(&task);
    let Some(shader) = output.shader else {
        bail!("{} '{}' failed to compile", stage, entry);
    };

    info!(
        "{} '{}': {} bytes of SPIR-V in {} ms",
        stage,
        entry,
        shader.blob.len(),
        output.compile_time_ms
    );

    let reflection = &shader.reflection;
    if !stage.is_reflected() {
        println!("{stage} stage: no uniform layout");
        return Ok(());
    }
    println!(
        "constant buffer: {} bytes at binding {}",
        reflection.constant_buffer_size(),
        reflection
            .constant_buffer_binding
            .map_or_else(|| "-".to_string(), |b| b.to_string())
    );
    for prop in reflection.prop_map().values() {
        println!(
            "  {:<24} {:<9} x{:<4} offset {:>5} size {:>5}",
            prop.name,
            prop.prop_type.name(),
            prop.array_size,
            prop.offset,
            prop.byte_len()
        );
    }
    for (name, slot) in &reflection.textures {
        println!("  texture {name} -> slot {slot}");
    }
    for binding in &reflection.samplers {
        println!("  sampler at binding {binding}");
    }
    println!("instructions: {}", reflection.instruction_count);
    Ok(())
}
