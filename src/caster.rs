// src/caster.rs
//! Per-actor fake-shadow adapter.
//!
//! Each shadow-casting actor owns a [`FakeShadow`] that leases one atlas slot
//! from the coordinator while the actor is enabled. State machine:
//! IDLE -> (wakeup) REQUESTED -> (resolve grants slot) ACTIVE -> (sleep) IDLE,
//! with REQUESTED -> IDLE on cancel and ACTIVE -> IDLE on forced eviction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use glam::{Mat4, Vec2, Vec3, Vec4};
use parking_lot::Mutex;

use crate::atlas::{MatParam, SlotIndex};
use crate::coordinator::ShadowCoordinator;
use crate::error::{Error, Result};
use crate::material::MaterialHandle;
use crate::math;

/// Process-unique caster identifier.
pub type CasterId = u64;

static NEXT_CASTER_ID: AtomicU64 = AtomicU64::new(1);

/// Decal-projector collaborator. The projector component owns the decal
/// transform and sampling window; the adapter only drives uv and enable.
pub trait DecalProjector: Send {
    fn set_uv(&mut self, scale: Vec2, bias: Vec2);
    fn set_enabled(&mut self, enabled: bool);
    /// Decal extent; drives the orthographic projection width/height.
    fn size(&self) -> Vec2;
    /// Projector root position; the shadow camera centers on it.
    fn position(&self) -> Vec3;
}

/// Render-target collaborator (the caster's renderer).
pub trait CasterTarget: Send {
    /// Depth half-range for the projection, from the caster bounds.
    fn bounding_radius(&self) -> f32;
    fn is_skinned(&self) -> bool;
    /// Swap the renderer onto the dedicated atlas material (shadow-mesh
    /// path). Implementations clone shared materials at most once.
    fn apply_material(&mut self, material: MaterialHandle);
    fn write_uniforms(&mut self, uniforms: &CasterUniforms);
}

/// Uniform block pushed into the caster's material(s).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CasterUniforms {
    pub view: Mat4,
    pub proj: Mat4,
    pub offset: Vec4,
    pub clip_rect: Vec4,
    pub clip_enabled: bool,
}

/// Observable lifecycle phase, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasterPhase {
    Idle,
    Requested,
    Active,
}

#[derive(Clone, Copy)]
enum CasterState {
    Idle,
    Requested,
    Active { slot: SlotIndex, param: MatParam },
}

pub(crate) type CasterLink = Weak<Mutex<CasterInner>>;

pub(crate) struct CasterInner {
    label: String,
    shadow_mesh: bool,
    projector: Box<dyn DecalProjector>,
    target: Option<Box<dyn CasterTarget>>,
    state: CasterState,
    is_skinned: bool,
    prev_size: Vec2,
    projection: Mat4,
}

impl CasterInner {
    pub(crate) fn is_requested(&self) -> bool {
        matches!(self.state, CasterState::Requested)
    }

    pub(crate) fn is_shadow_mesh(&self) -> bool {
        self.shadow_mesh
    }

    /// Coordinator callback on lease grant. Guards against a stale callback
    /// racing a cancel: only a REQUESTED caster accepts a setup.
    pub(crate) fn setup(&mut self, param: &MatParam) {
        if !self.is_requested() {
            log::warn!("stale fake-shadow setup for '{}' ignored", self.label);
            return;
        }
        let Some(target) = self.target.as_mut() else {
            log::error!("caster '{}' lost its render target before setup", self.label);
            self.state = CasterState::Idle;
            self.projector.set_enabled(false);
            return;
        };

        self.projector.set_uv(param.uv_scale, param.uv_bias);
        if let Some(handle) = param.material {
            target.apply_material(handle);
        }

        // Force the projection once; afterwards it only tracks size changes.
        let size = self.projector.size();
        let range = target.bounding_radius();
        self.projection = math::shadow_projection(size, range);
        self.prev_size = size;

        let uniforms = CasterUniforms {
            view: math::top_down_view(self.projector.position()),
            proj: self.projection,
            offset: param.offset,
            clip_rect: param.clip_rect,
            clip_enabled: true,
        };
        target.write_uniforms(&uniforms);

        self.state = CasterState::Active {
            slot: param.index,
            param: *param,
        };
    }

    /// Drop back to IDLE without returning anything to the coordinator.
    /// Used on eviction and dispose, where the caller already reclaimed the
    /// slot.
    pub(crate) fn force_idle(&mut self) {
        self.state = CasterState::Idle;
        self.projector.set_enabled(false);
    }

    /// Revoke an active lease back to REQUESTED during a capacity change.
    pub(crate) fn revoke_to_requested(&mut self) {
        if matches!(self.state, CasterState::Active { .. }) {
            self.state = CasterState::Requested;
        }
    }

    /// Recompute the projection if the decal size changed. Returns whether a
    /// recompute happened.
    fn update_projection(&mut self, force: bool) -> bool {
        let size = self.projector.size();
        if !force && self.prev_size == size {
            return false;
        }
        let Some(target) = self.target.as_ref() else {
            return false;
        };
        self.projection = math::shadow_projection(size, target.bounding_radius());
        self.prev_size = size;
        true
    }

    fn update_frame(&mut self) {
        let CasterState::Active { param, .. } = self.state else {
            return;
        };
        // Skinned casters animate their bounds, so their projection refreshes
        // every frame. The view refreshes unconditionally: the actor may move.
        self.update_projection(self.is_skinned);
        let view = math::top_down_view(self.projector.position());
        let uniforms = CasterUniforms {
            view,
            proj: self.projection,
            offset: param.offset,
            clip_rect: param.clip_rect,
            clip_enabled: true,
        };
        if let Some(target) = self.target.as_mut() {
            target.write_uniforms(&uniforms);
        }
    }

    fn phase(&self) -> CasterPhase {
        match self.state {
            CasterState::Idle => CasterPhase::Idle,
            CasterState::Requested => CasterPhase::Requested,
            CasterState::Active { .. } => CasterPhase::Active,
        }
    }
}

/// Actor-side handle to one fake shadow.
///
/// The coordinator holds only weak links; dropping a `FakeShadow` returns its
/// slot automatically.
pub struct FakeShadow {
    id: CasterId,
    inner: Arc<Mutex<CasterInner>>,
    coordinator: ShadowCoordinator,
}

impl FakeShadow {
    /// `shadow_mesh` selects the dedicated-material path (the caster is
    /// re-rendered with the registered fake-shadow shader instead of writing
    /// uniforms into its own materials).
    pub fn new(
        coordinator: &ShadowCoordinator,
        label: impl Into<String>,
        shadow_mesh: bool,
        projector: Box<dyn DecalProjector>,
    ) -> Self {
        Self {
            id: NEXT_CASTER_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(CasterInner {
                label: label.into(),
                shadow_mesh,
                projector,
                target: None,
                state: CasterState::Idle,
                is_skinned: false,
                prev_size: Vec2::ZERO,
                projection: Mat4::IDENTITY,
            })),
            coordinator: coordinator.clone(),
        }
    }

    pub fn id(&self) -> CasterId {
        self.id
    }

    /// Bind the render target. Cached thereafter; rebinding replaces it.
    pub fn bind_target(&self, target: Box<dyn CasterTarget>) {
        self.inner.lock().target = Some(target);
    }

    /// Enable hook. Idempotent while REQUESTED or ACTIVE. Requires a bound
    /// render target; without one the caster stays IDLE with its projector
    /// disabled.
    pub fn wakeup(&self) -> Result<()> {
        let label = {
            let mut inner = self.inner.lock();
            match inner.state {
                CasterState::Requested | CasterState::Active { .. } => return Ok(()),
                CasterState::Idle => {}
            }
            let skinned = match inner.target.as_ref() {
                Some(target) => target.is_skinned(),
                None => {
                    log::error!("caster '{}' enabled without a render target", inner.label);
                    inner.projector.set_enabled(false);
                    return Err(Error::MissingTarget);
                }
            };
            inner.is_skinned = skinned;
            inner.state = CasterState::Requested;
            inner.label.clone()
        };

        // Caster lock is released before calling into the coordinator.
        if self
            .coordinator
            .request(self.id, &label, Arc::downgrade(&self.inner))
        {
            self.inner.lock().projector.set_enabled(true);
            Ok(())
        } else {
            log::error!("fake-shadow request failed for '{label}'; no live coordinator");
            let mut inner = self.inner.lock();
            inner.state = CasterState::Idle;
            inner.projector.set_enabled(false);
            Err(Error::CoordinatorDisposed)
        }
    }

    /// Disable hook. Returns the lease (or cancels the pending request) and
    /// drops to IDLE.
    pub fn sleep(&self) {
        {
            let mut inner = self.inner.lock();
            inner.state = CasterState::Idle;
            inner.projector.set_enabled(false);
        }
        self.coordinator.return_slot(self.id);
    }

    /// Per-frame update. No-op unless ACTIVE.
    pub fn update(&self) {
        self.inner.lock().update_frame();
    }

    pub fn phase(&self) -> CasterPhase {
        self.inner.lock().phase()
    }

    pub fn slot(&self) -> Option<SlotIndex> {
        match self.inner.lock().state {
            CasterState::Active { slot, .. } => Some(slot),
            _ => None,
        }
    }

    pub fn param(&self) -> Option<MatParam> {
        match self.inner.lock().state {
            CasterState::Active { param, .. } => Some(param),
            _ => None,
        }
    }
}

impl Drop for FakeShadow {
    fn drop(&mut self) {
        // A caster that goes away without sleeping must not starve the pool.
        self.coordinator.return_slot(self.id);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct ProjectorState {
        pub enabled: bool,
        pub uv: Option<(Vec2, Vec2)>,
        pub size: Vec2,
        pub position: Vec3,
    }

    pub(crate) struct MockProjector {
        pub state: Arc<Mutex<ProjectorState>>,
    }

    impl DecalProjector for MockProjector {
        fn set_uv(&mut self, scale: Vec2, bias: Vec2) {
            self.state.lock().uv = Some((scale, bias));
        }
        fn set_enabled(&mut self, enabled: bool) {
            self.state.lock().enabled = enabled;
        }
        fn size(&self) -> Vec2 {
            self.state.lock().size
        }
        fn position(&self) -> Vec3 {
            self.state.lock().position
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct TargetState {
        pub skinned: bool,
        pub radius: f32,
        pub material: Option<MaterialHandle>,
        pub uniforms: Option<CasterUniforms>,
        pub uniform_writes: usize,
    }

    pub(crate) struct MockTarget {
        pub state: Arc<Mutex<TargetState>>,
    }

    impl CasterTarget for MockTarget {
        fn bounding_radius(&self) -> f32 {
            self.state.lock().radius
        }
        fn is_skinned(&self) -> bool {
            self.state.lock().skinned
        }
        fn apply_material(&mut self, material: MaterialHandle) {
            self.state.lock().material = Some(material);
        }
        fn write_uniforms(&mut self, uniforms: &CasterUniforms) {
            let mut s = self.state.lock();
            s.uniforms = Some(*uniforms);
            s.uniform_writes += 1;
        }
    }

    pub(crate) struct Harness {
        pub caster: FakeShadow,
        pub projector: Arc<Mutex<ProjectorState>>,
        pub target: Arc<Mutex<TargetState>>,
    }

    /// Build a caster wired to recording mocks, target already bound.
    pub(crate) fn mock_caster(
        coordinator: &ShadowCoordinator,
        label: &str,
        shadow_mesh: bool,
    ) -> Harness {
        let projector = Arc::new(Mutex::new(ProjectorState {
            enabled: false,
            uv: None,
            size: Vec2::new(2.0, 2.0),
            position: Vec3::ZERO,
        }));
        let target = Arc::new(Mutex::new(TargetState {
            skinned: false,
            radius: 3.0,
            ..Default::default()
        }));
        let caster = FakeShadow::new(
            coordinator,
            label,
            shadow_mesh,
            Box::new(MockProjector {
                state: projector.clone(),
            }),
        );
        caster.bind_target(Box::new(MockTarget {
            state: target.clone(),
        }));
        Harness {
            caster,
            projector,
            target,
        }
    }
}
