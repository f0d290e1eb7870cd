// src/passes.rs
//! The three render passes behind the fake-shadow technique and their
//! ordering relative to the host pipeline.
//!
//! Frame order: caster depth pre-pass -> shadow atlas composite -> caster
//! opaque pass. The depth pass placement depends on the host's depth-priming
//! decision; the other two are fixed.

use serde::{Deserialize, Serialize};

/// Depth format shared with the host pipeline's camera depth target.
pub const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

/// Color format of the host's camera target.
pub const COLOR_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Bgra8UnormSrgb;

/// Format of the shared decal atlas.
pub const ATLAS_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

/// Fragment source for the host's decal-projector material. The host owns
/// the projector geometry and vertex stage; this stage samples the atlas
/// through the clip rectangle and applies the global tint.
pub const DECAL_RECEIVER_WGSL: &str = include_str!("shaders/decal_receiver.wgsl");

/// Injection points inside the host frame, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RenderPassEvent {
    AfterPrepasses,
    AfterSkybox,
    AfterOpaques,
}

/// Where the caster depth pre-pass belongs for a given host depth mode.
///
/// Under depth priming the host already runs its pre-pass block early, so the
/// casters join it. Without priming the depth only exists after the opaques
/// (it is produced for the depth copy), so the caster depth joins there.
pub fn depth_pass_event(use_depth_priming: bool) -> RenderPassEvent {
    if use_depth_priming {
        RenderPassEvent::AfterPrepasses
    } else {
        RenderPassEvent::AfterOpaques
    }
}

/// Bitmask of renderer layers. Casters live on their own layer so the three
/// passes can filter them out of the host draw list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerMask(pub u32);

impl LayerMask {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(u32::MAX);

    pub fn from_layer(layer: u32) -> Self {
        Self(1 << layer)
    }

    pub fn contains(&self, layer: u32) -> bool {
        self.0 & (1 << layer) != 0
    }
}

impl std::ops::BitOr for LayerMask {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// One caster draw submitted by the host for this frame.
pub struct CasterDraw<'a> {
    pub layer: u32,
    pub vertex_buffer: &'a wgpu::Buffer,
    pub index_buffer: &'a wgpu::Buffer,
    pub index_count: u32,
    /// Host-side object uniforms (model matrix, base color).
    pub object_bind_group: &'a wgpu::BindGroup,
    /// Per-caster shadow uniforms; `None` for casters without an active
    /// fake-shadow lease (they are skipped by the atlas pass).
    pub shadow_bind_group: Option<&'a wgpu::BindGroup>,
}

const VERTEX_ATTRIBUTES: [wgpu::VertexAttribute; 1] =
    wgpu::vertex_attr_array![0 => Float32x3];

fn caster_vertex_layout() -> wgpu::VertexBufferLayout<'static> {
    wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<[f32; 3]>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &VERTEX_ATTRIBUTES,
    }
}

/// The decal atlas render target. Recreated whenever the configured
/// resolution changes.
pub struct DecalMap {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    size: u32,
}

impl DecalMap {
    fn new(device: &wgpu::Device, size: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("fake_shadow_decal_map"),
            size: wgpu::Extent3d {
                width: size,
                height: size,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: ATLAS_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("fake_shadow_decal_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        Self {
            texture,
            view,
            sampler,
            size,
        }
    }

    pub fn texture(&self) -> &wgpu::Texture {
        &self.texture
    }

    pub fn view(&self) -> &wgpu::TextureView {
        &self.view
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

/// Depth-only pre-pass of the caster layer into the camera depth target.
pub struct CasterDepthPass {
    pub event: RenderPassEvent,
    pub layer_mask: LayerMask,
    pipeline: Option<wgpu::RenderPipeline>,
}

impl CasterDepthPass {
    pub fn new(layer_mask: LayerMask) -> Self {
        Self {
            event: RenderPassEvent::AfterPrepasses,
            layer_mask,
            pipeline: None,
        }
    }

    pub fn prepare(
        &mut self,
        device: &wgpu::Device,
        camera_layout: &wgpu::BindGroupLayout,
        object_layout: &wgpu::BindGroupLayout,
    ) {
        if self.pipeline.is_some() {
            return;
        }
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fake_shadow_caster_depth_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/caster_depth.wgsl").into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fake_shadow_caster_depth_layout"),
            bind_group_layouts: &[camera_layout, object_layout],
            push_constant_ranges: &[],
        });
        self.pipeline = Some(device.create_render_pipeline(
            &wgpu::RenderPipelineDescriptor {
                label: Some("fake_shadow_caster_depth_pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[caster_vertex_layout()],
                },
                fragment: None,
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: true,
                    depth_compare: wgpu::CompareFunction::LessEqual,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            },
        ));
    }

    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        depth_view: &wgpu::TextureView,
        camera_bind_group: &wgpu::BindGroup,
        draws: &[CasterDraw<'_>],
    ) {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("fake_shadow_caster_depth_pass"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, camera_bind_group, &[]);
        for draw in draws.iter().filter(|d| self.layer_mask.contains(d.layer)) {
            pass.set_bind_group(1, draw.object_bind_group, &[]);
            pass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
            pass.set_index_buffer(draw.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..draw.index_count, 0, 0..1);
        }
    }
}

/// Composites every active caster silhouette into the decal atlas in one
/// pass. The per-caster offset uniform places each silhouette in its grid
/// cell, so no per-slot viewport juggling is needed.
pub struct ShadowAtlasPass {
    pub event: RenderPassEvent,
    pub layer_mask: LayerMask,
    decal_map: Option<DecalMap>,
    pipeline: Option<wgpu::RenderPipeline>,
}

impl ShadowAtlasPass {
    pub fn new(layer_mask: LayerMask) -> Self {
        Self {
            event: RenderPassEvent::AfterPrepasses,
            layer_mask,
            decal_map: None,
            pipeline: None,
        }
    }

    pub fn prepare(
        &mut self,
        device: &wgpu::Device,
        global_layout: &wgpu::BindGroupLayout,
        caster_layout: &wgpu::BindGroupLayout,
        object_layout: &wgpu::BindGroupLayout,
        resolution: u32,
    ) {
        if self
            .decal_map
            .as_ref()
            .map(|m| m.size() != resolution)
            .unwrap_or(true)
        {
            self.decal_map = Some(DecalMap::new(device, resolution.max(1)));
        }
        if self.pipeline.is_some() {
            return;
        }
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fake_shadow_atlas_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/fake_shadow.wgsl").into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fake_shadow_atlas_layout"),
            bind_group_layouts: &[global_layout, caster_layout, object_layout],
            push_constant_ranges: &[],
        });
        self.pipeline = Some(device.create_render_pipeline(
            &wgpu::RenderPipelineDescriptor {
                label: Some("fake_shadow_atlas_pipeline"),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[caster_vertex_layout()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: ATLAS_FORMAT,
                        blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            },
        ));
    }

    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        global_bind_group: &wgpu::BindGroup,
        draws: &[CasterDraw<'_>],
    ) {
        let (Some(pipeline), Some(decal_map)) = (self.pipeline.as_ref(), self.decal_map.as_ref())
        else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("fake_shadow_atlas_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: decal_map.view(),
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, global_bind_group, &[]);
        for draw in draws.iter().filter(|d| self.layer_mask.contains(d.layer)) {
            let Some(shadow_bind_group) = draw.shadow_bind_group else {
                continue;
            };
            pass.set_bind_group(1, shadow_bind_group, &[]);
            pass.set_bind_group(2, draw.object_bind_group, &[]);
            pass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
            pass.set_index_buffer(draw.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..draw.index_count, 0, 0..1);
        }
    }

    pub fn decal_map(&self) -> Option<&DecalMap> {
        self.decal_map.as_ref()
    }
}

/// Forward pass of the caster layer, after the host decal pass.
///
/// With depth priming the depth buffer is final, so depth testing switches to
/// Equal with writes off; otherwise the usual LessEqual write-on state runs.
pub struct CasterOpaquePass {
    pub event: RenderPassEvent,
    pub layer_mask: LayerMask,
    pub use_depth_priming: bool,
    pipeline_primed: Option<wgpu::RenderPipeline>,
    pipeline_plain: Option<wgpu::RenderPipeline>,
}

impl CasterOpaquePass {
    pub fn new(layer_mask: LayerMask) -> Self {
        Self {
            event: RenderPassEvent::AfterSkybox,
            layer_mask,
            use_depth_priming: false,
            pipeline_primed: None,
            pipeline_plain: None,
        }
    }

    pub fn prepare(
        &mut self,
        device: &wgpu::Device,
        camera_layout: &wgpu::BindGroupLayout,
        object_layout: &wgpu::BindGroupLayout,
    ) {
        if self.pipeline_primed.is_some() {
            return;
        }
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("fake_shadow_caster_opaque_shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/caster_opaque.wgsl").into()),
        });
        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("fake_shadow_caster_opaque_layout"),
            bind_group_layouts: &[camera_layout, object_layout],
            push_constant_ranges: &[],
        });
        let build = |depth_write: bool, compare: wgpu::CompareFunction, label: &str| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: "vs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    buffers: &[caster_vertex_layout()],
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: "fs_main",
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: COLOR_FORMAT,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Some(wgpu::Face::Back),
                    ..Default::default()
                },
                depth_stencil: Some(wgpu::DepthStencilState {
                    format: DEPTH_FORMAT,
                    depth_write_enabled: depth_write,
                    depth_compare: compare,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };
        self.pipeline_primed = Some(build(
            false,
            wgpu::CompareFunction::Equal,
            "fake_shadow_caster_opaque_primed",
        ));
        self.pipeline_plain = Some(build(
            true,
            wgpu::CompareFunction::LessEqual,
            "fake_shadow_caster_opaque_plain",
        ));
    }

    pub fn execute(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        color_view: &wgpu::TextureView,
        depth_view: &wgpu::TextureView,
        camera_bind_group: &wgpu::BindGroup,
        draws: &[CasterDraw<'_>],
    ) {
        let pipeline = if self.use_depth_priming {
            self.pipeline_primed.as_ref()
        } else {
            self.pipeline_plain.as_ref()
        };
        let Some(pipeline) = pipeline else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("fake_shadow_caster_opaque_pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: depth_view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, camera_bind_group, &[]);
        for draw in draws.iter().filter(|d| self.layer_mask.contains(d.layer)) {
            pass.set_bind_group(1, draw.object_bind_group, &[]);
            pass.set_vertex_buffer(0, draw.vertex_buffer.slice(..));
            pass.set_index_buffer(draw.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            pass.draw_indexed(0..draw.index_count, 0, 0..1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_pass_moves_with_priming_mode() {
        assert_eq!(depth_pass_event(true), RenderPassEvent::AfterPrepasses);
        assert_eq!(depth_pass_event(false), RenderPassEvent::AfterOpaques);
    }

    #[test]
    fn pass_events_are_ordered() {
        assert!(RenderPassEvent::AfterPrepasses < RenderPassEvent::AfterSkybox);
        assert!(RenderPassEvent::AfterSkybox < RenderPassEvent::AfterOpaques);
    }

    #[test]
    fn layer_mask_filters_layers() {
        let mask = LayerMask::from_layer(3) | LayerMask::from_layer(7);
        assert!(mask.contains(3));
        assert!(mask.contains(7));
        assert!(!mask.contains(0));
        assert!(LayerMask::ALL.contains(31));
        assert!(!LayerMask::NONE.contains(0));
    }

    #[test]
    fn vertex_layout_is_position_only() {
        let layout = caster_vertex_layout();
        assert_eq!(layout.array_stride, 12);
        assert_eq!(layout.attributes.len(), 1);
    }
}
