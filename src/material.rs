// src/material.rs
//! GPU-side material plumbing for the fake-shadow passes.
//!
//! The coordinator stays GPU-free; this module turns its published state
//! (per-slot parameters, shared globals) into wgpu buffers and bind groups.

use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use wgpu::util::DeviceExt;

use crate::atlas::MatParam;
use crate::caster::{CasterTarget, CasterUniforms};
use crate::coordinator::ShadowGlobals;

/// Opaque, slot-stable id of a dedicated atlas material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(u32);

impl MaterialHandle {
    pub(crate) fn for_slot(slot: usize) -> Self {
        Self(slot as u32)
    }

    pub fn slot(&self) -> usize {
        self.0 as usize
    }
}

/// Per-slot uniform block (cell placement and sampling window).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct SlotUniform {
    pub offset: [f32; 4],
    pub clip_rect: [f32; 4],
}

impl From<&MatParam> for SlotUniform {
    fn from(param: &MatParam) -> Self {
        Self {
            offset: param.offset.to_array(),
            clip_rect: param.clip_rect.to_array(),
        }
    }
}

/// Shared uniform block consumed by every fake-shadow shader.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct GlobalShadowUniform {
    pub color: [f32; 4],
    pub line: f32,
    pub _padding: [f32; 3],
}

impl From<ShadowGlobals> for GlobalShadowUniform {
    fn from(globals: ShadowGlobals) -> Self {
        Self {
            color: globals.color.to_array(),
            line: globals.line,
            _padding: [0.0; 3],
        }
    }
}

/// Per-caster uniform block (matches the shader layout).
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct CasterUniform {
    pub view: [[f32; 4]; 4],
    pub proj: [[f32; 4]; 4],
    pub offset: [f32; 4],
    pub clip_rect: [f32; 4],
    pub clip_enabled: u32,
    pub _padding: [u32; 3],
}

impl From<&CasterUniforms> for CasterUniform {
    fn from(u: &CasterUniforms) -> Self {
        Self {
            view: u.view.to_cols_array_2d(),
            proj: u.proj.to_cols_array_2d(),
            offset: u.offset.to_array(),
            clip_rect: u.clip_rect.to_array(),
            clip_enabled: u.clip_enabled as u32,
            _padding: [0; 3],
        }
    }
}

impl Default for CasterUniform {
    fn default() -> Self {
        Self::from(&CasterUniforms {
            view: Mat4::IDENTITY,
            proj: Mat4::IDENTITY,
            offset: glam::Vec4::ZERO,
            clip_rect: glam::Vec4::ZERO,
            clip_enabled: false,
        })
    }
}

/// Bind group layout for a single uniform buffer visible to both stages.
fn uniform_layout(device: &wgpu::Device, label: &str) -> wgpu::BindGroupLayout {
    device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some(label),
        entries: &[wgpu::BindGroupLayoutEntry {
            binding: 0,
            visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }],
    })
}

/// Bind group layout for per-caster shadow uniforms. Shared by the atlas
/// pass pipeline and every `MeshCaster`.
pub fn caster_bind_group_layout(device: &wgpu::Device) -> wgpu::BindGroupLayout {
    uniform_layout(device, "fake_shadow_caster_layout")
}

struct SlotMaterial {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

/// Arena of dedicated atlas materials, one per slot, plus the shared global
/// uniform. Rebuilt in place whenever the coordinator publishes a new layout.
pub struct AtlasMaterials {
    slot_layout: wgpu::BindGroupLayout,
    slots: Vec<SlotMaterial>,
    global_layout: wgpu::BindGroupLayout,
    global_buffer: wgpu::Buffer,
    global_bind_group: wgpu::BindGroup,
}

impl AtlasMaterials {
    pub fn new(device: &wgpu::Device) -> Self {
        let slot_layout = uniform_layout(device, "fake_shadow_slot_layout");
        let global_layout = uniform_layout(device, "fake_shadow_global_layout");
        let global_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("fake_shadow_global_buffer"),
            contents: bytemuck::bytes_of(&GlobalShadowUniform::from(ShadowGlobals::default())),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let global_bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fake_shadow_global_bind_group"),
            layout: &global_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: global_buffer.as_entire_binding(),
            }],
        });
        Self {
            slot_layout,
            slots: Vec::new(),
            global_layout,
            global_buffer,
            global_bind_group,
        }
    }

    /// Rebuild the slot arena for a new parameter set. When the slot count
    /// is unchanged the existing buffers are rewritten in place.
    pub fn rebuild(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, params: &[MatParam]) {
        if self.slots.len() == params.len() {
            for (slot, param) in self.slots.iter().zip(params) {
                queue.write_buffer(&slot.buffer, 0, bytemuck::bytes_of(&SlotUniform::from(param)));
            }
            return;
        }
        self.slots.clear();
        self.slots.reserve(params.len());
        for param in params {
            let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("fake_shadow_slot_buffer"),
                contents: bytemuck::bytes_of(&SlotUniform::from(param)),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("fake_shadow_slot_bind_group"),
                layout: &self.slot_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: buffer.as_entire_binding(),
                }],
            });
            self.slots.push(SlotMaterial { buffer, bind_group });
        }
    }

    /// Upload the shared globals.
    pub fn write_globals(&self, queue: &wgpu::Queue, globals: ShadowGlobals) {
        queue.write_buffer(
            &self.global_buffer,
            0,
            bytemuck::bytes_of(&GlobalShadowUniform::from(globals)),
        );
    }

    pub fn slot_bind_group(&self, handle: MaterialHandle) -> Option<&wgpu::BindGroup> {
        self.slots.get(handle.slot()).map(|s| &s.bind_group)
    }

    pub fn global_bind_group(&self) -> &wgpu::BindGroup {
        &self.global_bind_group
    }

    pub fn global_layout(&self) -> &wgpu::BindGroupLayout {
        &self.global_layout
    }

    pub fn slot_layout(&self) -> &wgpu::BindGroupLayout {
        &self.slot_layout
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

/// `CasterTarget` implementation for a mesh renderer.
///
/// Caches the latest uniform block on the CPU and uploads it once per frame
/// during pass preparation, so the adapter's per-frame writes never touch the
/// queue directly.
pub struct MeshCaster {
    skinned: bool,
    bounding_radius: f32,
    material: Option<MaterialHandle>,
    uniform: CasterUniform,
    dirty: bool,
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
}

impl MeshCaster {
    pub fn new(
        device: &wgpu::Device,
        layout: &wgpu::BindGroupLayout,
        skinned: bool,
        bounding_radius: f32,
    ) -> Self {
        let uniform = CasterUniform::default();
        let buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("fake_shadow_caster_buffer"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("fake_shadow_caster_bind_group"),
            layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });
        Self {
            skinned,
            bounding_radius,
            material: None,
            uniform,
            dirty: false,
            buffer,
            bind_group,
        }
    }

    /// Update the cached bounds (skinned meshes animate theirs).
    pub fn set_bounding_radius(&mut self, radius: f32) {
        self.bounding_radius = radius;
    }

    /// Flush the cached uniform block if it changed since the last upload.
    pub fn upload(&mut self, queue: &wgpu::Queue) {
        if self.dirty {
            queue.write_buffer(&self.buffer, 0, bytemuck::bytes_of(&self.uniform));
            self.dirty = false;
        }
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn material(&self) -> Option<MaterialHandle> {
        self.material
    }
}

impl CasterTarget for MeshCaster {
    fn bounding_radius(&self) -> f32 {
        self.bounding_radius
    }

    fn is_skinned(&self) -> bool {
        self.skinned
    }

    fn apply_material(&mut self, material: MaterialHandle) {
        // The swap happens at most once per grant; repeated setup with the
        // same handle is a no-op.
        if self.material != Some(material) {
            self.material = Some(material);
        }
    }

    fn write_uniforms(&mut self, uniforms: &CasterUniforms) {
        self.uniform = CasterUniform::from(uniforms);
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn uniform_blocks_are_16_byte_aligned() {
        assert_eq!(std::mem::size_of::<SlotUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<GlobalShadowUniform>() % 16, 0);
        assert_eq!(std::mem::size_of::<CasterUniform>() % 16, 0);
    }

    #[test]
    fn caster_uniform_conversion_preserves_values() {
        let src = CasterUniforms {
            view: Mat4::from_translation(glam::Vec3::new(1.0, 2.0, 3.0)),
            proj: Mat4::IDENTITY,
            offset: Vec4::new(0.25, -0.25, 0.0, 0.0),
            clip_rect: Vec4::new(0.1, 0.1, 0.3, 0.3),
            clip_enabled: true,
        };
        let gpu = CasterUniform::from(&src);
        assert_eq!(gpu.view, src.view.to_cols_array_2d());
        assert_eq!(gpu.offset, src.offset.to_array());
        assert_eq!(gpu.clip_enabled, 1);
    }

    #[test]
    fn slot_uniform_tracks_param() {
        let layout = crate::atlas::AtlasLayout::new(4, 512);
        let param = layout.cell_param(2, Some(MaterialHandle::for_slot(2)));
        let uniform = SlotUniform::from(&param);
        assert_eq!(uniform.offset, param.offset.to_array());
        assert_eq!(uniform.clip_rect, param.clip_rect.to_array());
    }

    #[test]
    fn material_handle_round_trips_its_slot() {
        assert_eq!(MaterialHandle::for_slot(7).slot(), 7);
    }
}
