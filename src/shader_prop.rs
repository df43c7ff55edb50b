// src/shader_prop.rs
//! Uniform property descriptors.
//!
//! A [`ShaderProp`] names one uniform and locates it inside the flat constant
//! buffer. A material's full layout is a [`PropMap`] keyed by name.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

/// Shape of one uniform element as seen by the setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropType {
    Float,
    Vector2,
    Vector3,
    Vector4,
    Matrix,
    /// Raw byte range that matches no other shape. Reflection stores these as
    /// `Float` arrays.
    FloatBlock,
}

impl PropType {
    /// Shape implied by an element's byte size.
    pub fn for_size(size: u16) -> Self {
        match size {
            4 => Self::Float,
            8 => Self::Vector2,
            12 => Self::Vector3,
            16 => Self::Vector4,
            64 => Self::Matrix,
            _ => Self::FloatBlock,
        }
    }

    /// Bytes per element, `None` for `FloatBlock`.
    pub fn element_size(self) -> Option<u16> {
        match self {
            Self::Float => Some(4),
            Self::Vector2 => Some(8),
            Self::Vector3 => Some(12),
            Self::Vector4 => Some(16),
            Self::Matrix => Some(64),
            Self::FloatBlock => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Vector2 => "float2",
            Self::Vector3 => "float3",
            Self::Vector4 => "float4",
            Self::Matrix => "float4x4",
            Self::FloatBlock => "float[]",
        }
    }
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One named uniform. Replaced, never edited, when its layout changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderProp {
    pub name: String,
    pub prop_type: PropType,
    /// Bytes per element.
    pub size: u16,
    pub array_size: u16,
    /// Byte offset into the constant buffer.
    pub offset: u16,
}

impl ShaderProp {
    /// Placeholder created by a setter before any shader declared `name`.
    /// It owns no storage until reflection replaces it.
    pub fn placeholder(name: &str, prop_type: PropType) -> Self {
        Self {
            name: name.to_string(),
            prop_type,
            size: 0,
            array_size: 0,
            offset: 0,
        }
    }

    /// Build from reflected element size, array count (0 or 1 for scalars) and offset.
    pub fn from_reflection(name: &str, element_size: u16, array_count: u16, offset: u16) -> Self {
        let count = array_count.max(1);
        match PropType::for_size(element_size) {
            PropType::FloatBlock => Self {
                name: name.to_string(),
                prop_type: PropType::Float,
                size: 4,
                array_size: (element_size / 4).saturating_mul(count),
                offset,
            },
            prop_type => Self {
                name: name.to_string(),
                prop_type,
                size: element_size,
                array_size: count,
                offset,
            },
        }
    }

    /// Total bytes covered: `size * array_size`.
    pub fn byte_len(&self) -> usize {
        self.size as usize * self.array_size as usize
    }

    pub fn byte_range(&self) -> Range<usize> {
        let start = self.offset as usize;
        start..start + self.byte_len()
    }

    pub fn has_storage(&self) -> bool {
        self.byte_len() > 0
    }

    /// Same shape, so bytes can move between the two regardless of offset.
    pub fn same_shape(&self, other: &ShaderProp) -> bool {
        self.prop_type == other.prop_type
            && self.array_size == other.array_size
            && self.size == other.size
    }

    /// Whether a setter of type `requested` must discard this entry.
    pub fn conflicts_with(&self, requested: PropType) -> bool {
        self.prop_type != requested
            && self.prop_type != PropType::FloatBlock
            && requested != PropType::FloatBlock
    }
}

/// Layout of one constant buffer, keyed by uniform name.
pub type PropMap = BTreeMap<String, ShaderProp>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_for_size() {
        assert_eq!(PropType::for_size(4), PropType::Float);
        assert_eq!(PropType::for_size(12), PropType::Vector3);
        assert_eq!(PropType::for_size(64), PropType::Matrix);
        assert_eq!(PropType::for_size(48), PropType::FloatBlock);
    }

    #[test]
    fn test_float_block_becomes_float_array() {
        // mat3x3<f32> has 48 bytes (3 padded columns)
        let prop = ShaderProp::from_reflection("basis", 48, 1, 32);
        assert_eq!(prop.prop_type, PropType::Float);
        assert_eq!(prop.size, 4);
        assert_eq!(prop.array_size, 12);
        assert_eq!(prop.byte_range(), 32..80);
    }

    #[test]
    fn test_vector_array_keeps_shape() {
        let prop = ShaderProp::from_reflection("lights", 16, 8, 64);
        assert_eq!(prop.prop_type, PropType::Vector4);
        assert_eq!(prop.array_size, 8);
        assert_eq!(prop.byte_len(), 128);
    }

    #[test]
    fn test_placeholder_has_no_storage() {
        let prop = ShaderProp::placeholder("tint", PropType::Vector4);
        assert!(!prop.has_storage());
        assert_eq!(prop.byte_range(), 0..0);
    }

    #[test]
    fn test_conflicts() {
        let prop = ShaderProp::from_reflection("color", 16, 1, 0);
        assert!(!prop.conflicts_with(PropType::Vector4));
        assert!(prop.conflicts_with(PropType::Float));
        assert!(!prop.conflicts_with(PropType::FloatBlock));
    }
}
