// src/compiler/reflection.rs
//! Reflected resource layout of one compiled entry point.

use std::collections::BTreeMap;

use crate::config::CONSTANT_BUFFER_ALIGNMENT;
use crate::shader_prop::{PropMap, ShaderProp};

/// One member of the constant buffer as the compiler reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformVariable {
    pub name: String,
    /// Bytes per element (the stride for arrays).
    pub element_size: u16,
    /// 1 for non-arrays.
    pub array_count: u16,
    pub offset: u16,
}

impl UniformVariable {
    pub fn end(&self) -> usize {
        self.offset as usize + self.element_size as usize * self.array_count.max(1) as usize
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    /// Members of the first constant buffer.
    pub uniforms: Vec<UniformVariable>,
    /// Binding index of that buffer.
    pub constant_buffer_binding: Option<u32>,
    /// Constant buffers the entry point uses; only the first is honored.
    pub constant_buffer_count: u32,
    /// Texture name -> slot (binding index).
    pub textures: BTreeMap<String, u32>,
    /// Sampler binding indices.
    pub samplers: Vec<u32>,
    pub instruction_count: u32,
}

impl ShaderReflection {
    /// Total constant buffer size, rounded up to the hardware alignment.
    pub fn constant_buffer_size(&self) -> usize {
        let end = self.uniforms.iter().map(UniformVariable::end).max().unwrap_or(0);
        round_up(end, CONSTANT_BUFFER_ALIGNMENT)
    }

    pub fn prop_map(&self) -> PropMap {
        self.uniforms
            .iter()
            .map(|u| {
                (
                    u.name.clone(),
                    ShaderProp::from_reflection(&u.name, u.element_size, u.array_count, u.offset),
                )
            })
            .collect()
    }

    /// Slots needed to hold every reflected texture.
    pub fn texture_slot_count(&self) -> usize {
        self.textures
            .values()
            .map(|&slot| slot as usize + 1)
            .max()
            .unwrap_or(0)
    }
}

pub fn round_up(value: usize, multiple: usize) -> usize {
    if multiple == 0 {
        return value;
    }
    value.div_ceil(multiple) * multiple
}
