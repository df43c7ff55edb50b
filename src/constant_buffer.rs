// src/constant_buffer.rs
//! Per-material uniform storage.
//!
//! - CPU buffer holding the latest values written by the control thread
//! - GPU ring of [`RING_DEPTH`] snapshots, one per uniform slot
//! - Resize with migration: values survive a shader edit when a property of
//!   the same name and shape exists in both layouts
//!
//! Lock order is always `uniforms` then `gpu`.

use parking_lot::Mutex;

use crate::config::RING_DEPTH;
use crate::error::{Error, Result};
use crate::shader_prop::{PropMap, PropType, ShaderProp};

struct UniformState {
    props: PropMap,
    cpu: Vec<u8>,
}

struct GpuRing {
    /// Bytes per slot; 0 until the first reflection.
    stride: usize,
    slots: Vec<u8>,
}

impl GpuRing {
    fn slot(&self, index: usize) -> &[u8] {
        &self.slots[index * self.stride..(index + 1) * self.stride]
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.slots[index * self.stride..(index + 1) * self.stride]
    }
}

/// What [`ConstantBufferStore::set_property`] did with the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// Bytes copied into the CPU buffer.
    Written(usize),
    /// Name not in the layout; a placeholder was recorded.
    Placeholder,
    /// The layout entry had another type and was replaced by a placeholder.
    Conflict { reflected: PropType },
}

impl SetOutcome {
    pub fn written(self) -> usize {
        match self {
            SetOutcome::Written(len) => len,
            _ => 0,
        }
    }
}

pub struct ConstantBufferStore {
    uniforms: Mutex<UniformState>,
    gpu: Mutex<GpuRing>,
}

impl Default for ConstantBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstantBufferStore {
    pub fn new() -> Self {
        Self {
            uniforms: Mutex::new(UniformState {
                props: PropMap::new(),
                cpu: Vec::new(),
            }),
            gpu: Mutex::new(GpuRing {
                stride: 0,
                slots: Vec::new(),
            }),
        }
    }

    /// Current constant buffer size in bytes.
    pub fn size(&self) -> usize {
        self.uniforms.lock().cpu.len()
    }

    /// Write `values` into property `name`.
    ///
    /// Unknown names get a placeholder entry with no storage. A type conflict
    /// discards the reflected entry for a placeholder until the next reflection.
    pub fn set_property(&self, name: &str, prop_type: PropType, values: &[f32]) -> SetOutcome {
        let mut state = self.uniforms.lock();
        let UniformState { props, cpu } = &mut *state;

        let outcome = match props.get(name) {
            None => SetOutcome::Placeholder,
            Some(existing) if existing.conflicts_with(prop_type) => SetOutcome::Conflict {
                reflected: existing.prop_type,
            },
            Some(prop) => {
                let src: &[u8] = bytemuck::cast_slice(values);
                let range = clamp_range(prop, cpu.len(), src.len());
                let len = range.len();
                cpu[range].copy_from_slice(&src[..len]);
                return SetOutcome::Written(len);
            }
        };
        props.insert(name.to_string(), ShaderProp::placeholder(name, prop_type));
        outcome
    }

    /// Read property `name` into `out`. Returns bytes read; never writes past `out`.
    /// Reads never create or replace entries.
    pub fn get_property(&self, name: &str, out: &mut [f32]) -> usize {
        let state = self.uniforms.lock();
        let Some(prop) = state.props.get(name) else {
            return 0;
        };
        let dst: &mut [u8] = bytemuck::cast_slice_mut(out);
        let range = clamp_range(prop, state.cpu.len(), dst.len());
        let len = range.len();
        dst[..len].copy_from_slice(&state.cpu[range]);
        len
    }

    /// True when `name` has real storage in the current layout.
    pub fn has_property(&self, name: &str) -> bool {
        self.uniforms
            .lock()
            .props
            .get(name)
            .is_some_and(ShaderProp::has_storage)
    }

    pub fn property(&self, name: &str) -> Option<ShaderProp> {
        self.uniforms.lock().props.get(name).cloned()
    }

    /// Every sized property with its current values, in name order.
    pub fn values(&self) -> Vec<(ShaderProp, Vec<f32>)> {
        let state = self.uniforms.lock();
        state
            .props
            .values()
            .filter(|p| p.has_storage())
            .map(|p| {
                let range = clamp_range(p, state.cpu.len(), usize::MAX);
                (p.clone(), bytes_to_floats(&state.cpu[range]))
            })
            .collect()
    }

    /// Install a new layout of `size` bytes, migrating every property whose
    /// name and shape match in both layouts. Applies to the CPU buffer and to
    /// every ring slot.
    pub fn reflect(&self, layout: PropMap, size: usize) {
        let mut state = self.uniforms.lock();
        let mut ring = self.gpu.lock();

        let mut cpu = vec![0u8; size];
        let mut slots = vec![0u8; size * RING_DEPTH];
        let mut migrated = 0usize;

        for new_prop in layout.values() {
            let Some(old_prop) = state.props.get(&new_prop.name) else {
                continue;
            };
            if !old_prop.has_storage() || !old_prop.same_shape(new_prop) {
                continue;
            }
            let (from, to) = (old_prop.byte_range(), new_prop.byte_range());
            if from.end > state.cpu.len() || to.end > size {
                continue;
            }
            cpu[to.clone()].copy_from_slice(&state.cpu[from.clone()]);
            for slot in 0..RING_DEPTH {
                let old = &ring.slot(slot)[from.clone()];
                let base = slot * size;
                slots[base + to.start..base + to.end].copy_from_slice(old);
            }
            migrated += 1;
        }

        log::debug!(
            "constant buffer resized {} -> {} bytes, {} of {} properties migrated",
            state.cpu.len(),
            size,
            migrated,
            layout.len()
        );

        state.props = layout;
        state.cpu = cpu;
        ring.stride = size;
        ring.slots = slots;
    }

    /// Copy the CPU buffer into ring slot `slot`. No-op before the first reflection.
    pub fn submit_uniforms(&self, slot: usize) -> Result<()> {
        check_slot(slot)?;
        let state = self.uniforms.lock();
        let mut ring = self.gpu.lock();
        if ring.stride == 0 || ring.stride != state.cpu.len() {
            return Ok(());
        }
        ring.slot_mut(slot).copy_from_slice(&state.cpu);
        Ok(())
    }

    /// Run `f` over the stable snapshot in `slot`. `None` before the first reflection.
    pub fn with_slot<R>(&self, slot: usize, f: impl FnOnce(&[u8]) -> R) -> Result<Option<R>> {
        check_slot(slot)?;
        let ring = self.gpu.lock();
        if ring.stride == 0 {
            return Ok(None);
        }
        Ok(Some(f(ring.slot(slot))))
    }

    pub fn slot_snapshot(&self, slot: usize) -> Result<Vec<u8>> {
        Ok(self.with_slot(slot, <[u8]>::to_vec)?.unwrap_or_default())
    }
}

fn check_slot(slot: usize) -> Result<()> {
    crate::ensure!(
        slot < RING_DEPTH,
        Error::SlotOutOfRange {
            slot,
            depth: RING_DEPTH
        }
    );
    Ok(())
}

/// Native-endian floats in `bytes`; a trailing partial float is ignored.
pub fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Buffer range for `prop`, clamped to the buffer and to `limit` bytes.
fn clamp_range(prop: &ShaderProp, buffer_len: usize, limit: usize) -> std::ops::Range<usize> {
    let range = prop.byte_range();
    let start = range.start.min(buffer_len);
    let end = range.end.min(buffer_len);
    start..end.min(start.saturating_add(limit))
}
