// src/feature.rs
//! Render-feature glue for the fake-shadow technique.
//!
//! Owns the coordinator, the atlas materials, and the three passes. The host
//! pipeline calls [`FakeShadowFeature::prepare_frame`] once per frame before
//! recording passes, and drops (or disposes) the feature at teardown.

use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::coordinator::{ShadowCoordinator, SHADOW_LIMIT};
use crate::error::{Error, Result};
use crate::material::{caster_bind_group_layout, AtlasMaterials};
use crate::passes::{
    depth_pass_event, CasterDepthPass, CasterOpaquePass, LayerMask, RenderPassEvent,
    ShadowAtlasPass,
};

/// Feature configuration. All fields may change at runtime; the next
/// `prepare_frame` applies them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakeShadowSettings {
    /// Renderer layer(s) holding the shadow casters.
    pub caster_layer: LayerMask,
    /// Configured slot count, clamped to `1..=SHADOW_LIMIT`.
    pub max_shadow_count: usize,
    /// Edge length of the decal atlas texture in pixels.
    pub decal_map_size: u32,
    /// Register the dedicated fake-shadow shader, enabling the shadow-mesh
    /// caster path.
    pub shadow_mesh_shader: bool,
}

impl Default for FakeShadowSettings {
    fn default() -> Self {
        Self {
            caster_layer: LayerMask::ALL,
            max_shadow_count: 9,
            decal_map_size: 512,
            shadow_mesh_shader: true,
        }
    }
}

/// One of the feature's passes, named for scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeaturePass {
    CasterDepth,
    ShadowAtlas,
    CasterOpaque,
}

/// The render feature. Construction claims the coordinator's process guard;
/// dropping the feature releases it.
pub struct FakeShadowFeature {
    settings: FakeShadowSettings,
    coordinator: ShadowCoordinator,
    materials: Option<AtlasMaterials>,
    caster_layout: Option<wgpu::BindGroupLayout>,
    depth_pass: CasterDepthPass,
    shadow_pass: ShadowAtlasPass,
    opaque_pass: CasterOpaquePass,
    /// Last `(count, resolution)` the materials were rebuilt for.
    applied: Option<(usize, u32)>,
}

impl FakeShadowFeature {
    pub fn new(settings: FakeShadowSettings) -> Result<Self> {
        if settings.decal_map_size == 0 {
            return Err(Error::custom("decal map size must be non-zero"));
        }
        let coordinator = ShadowCoordinator::new(settings.shadow_mesh_shader)?;
        let mask = settings.caster_layer;
        Ok(Self {
            settings,
            coordinator,
            materials: None,
            caster_layout: None,
            depth_pass: CasterDepthPass::new(mask),
            shadow_pass: ShadowAtlasPass::new(mask),
            opaque_pass: CasterOpaquePass::new(mask),
            applied: None,
        })
    }

    /// Owned coordinator handle for wiring into caster adapters.
    pub fn coordinator(&self) -> ShadowCoordinator {
        self.coordinator.clone()
    }

    pub fn settings(&self) -> &FakeShadowSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut FakeShadowSettings {
        &mut self.settings
    }

    /// Update the global shadow tint.
    pub fn set_shadow_color(&self, color: Vec4) {
        self.coordinator.set_color(color);
    }

    /// Per-frame driver. Must run before the passes are recorded:
    /// capacity update, then request resolution, then GPU state sync.
    /// Returns the three passes with their injection points, in the order
    /// the host should record them.
    ///
    /// `camera_layout` and `object_layout` are the host pipeline's bind group
    /// layouts for camera and per-object uniforms.
    pub fn prepare_frame(
        &mut self,
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        camera_layout: &wgpu::BindGroupLayout,
        object_layout: &wgpu::BindGroupLayout,
        use_depth_priming: bool,
    ) -> [(RenderPassEvent, FeaturePass); 3] {
        let count = self.settings.max_shadow_count.clamp(1, SHADOW_LIMIT);
        let resolution = self.settings.decal_map_size;
        self.coordinator.set_capacity(count, resolution);
        self.coordinator.resolve();

        let materials = self
            .materials
            .get_or_insert_with(|| AtlasMaterials::new(device));
        let caster_layout = self
            .caster_layout
            .get_or_insert_with(|| caster_bind_group_layout(device));

        if self.applied != Some((count, resolution)) {
            materials.rebuild(device, queue, &self.coordinator.params());
            self.applied = Some((count, resolution));
        }
        if self.coordinator.take_globals_dirty() {
            materials.write_globals(queue, self.coordinator.globals());
        }

        self.depth_pass
            .prepare(device, camera_layout, object_layout);
        self.shadow_pass.prepare(
            device,
            materials.global_layout(),
            caster_layout,
            object_layout,
            resolution,
        );
        self.opaque_pass.prepare(device, camera_layout, object_layout);

        // Settings may change at runtime; resync the passes every frame.
        self.depth_pass.layer_mask = self.settings.caster_layer;
        self.shadow_pass.layer_mask = self.settings.caster_layer;
        self.opaque_pass.layer_mask = self.settings.caster_layer;
        self.depth_pass.event = depth_pass_event(use_depth_priming);
        self.opaque_pass.use_depth_priming = use_depth_priming;

        self.pass_schedule()
    }

    /// The three passes with their current injection points, in recording
    /// order. Ties keep declaration order (depth before atlas).
    pub fn pass_schedule(&self) -> [(RenderPassEvent, FeaturePass); 3] {
        let mut schedule = [
            (self.depth_pass.event, FeaturePass::CasterDepth),
            (self.shadow_pass.event, FeaturePass::ShadowAtlas),
            (self.opaque_pass.event, FeaturePass::CasterOpaque),
        ];
        schedule.sort_by_key(|(event, _)| *event);
        schedule
    }

    pub fn depth_pass(&self) -> &CasterDepthPass {
        &self.depth_pass
    }

    pub fn shadow_pass(&self) -> &ShadowAtlasPass {
        &self.shadow_pass
    }

    pub fn opaque_pass(&self) -> &CasterOpaquePass {
        &self.opaque_pass
    }

    pub fn materials(&self) -> Option<&AtlasMaterials> {
        self.materials.as_ref()
    }

    /// Bind group layout for `MeshCaster` uniform blocks. Available after the
    /// first `prepare_frame`.
    pub fn caster_layout(&self) -> Option<&wgpu::BindGroupLayout> {
        self.caster_layout.as_ref()
    }

    /// Tear the feature down: every lease is force-released, casters drop to
    /// IDLE, and GPU resources owned here are freed. Safe to call twice.
    pub fn dispose(&mut self) {
        self.coordinator.dispose();
        self.materials = None;
        self.caster_layout = None;
        self.applied = None;
    }
}

impl Drop for FakeShadowFeature {
    fn drop(&mut self) {
        self.dispose();
    }
}
