// src/coordinator.rs
//! Lease coordinator for the shared fake-shadow atlas.
//!
//! Multiplexes a bounded population of casters onto the fixed slot grid.
//! Actors enqueue themselves through [`ShadowCoordinator::request`] from
//! their enable hooks; the pipeline driver runs `set_capacity` then
//! `resolve` once per frame, before the shadow passes are recorded.
//!
//! The coordinator is an explicit shared handle injected into the feature
//! and into every caster. A process-wide guard still enforces that at most
//! one live coordinator exists at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec4;
use parking_lot::Mutex;

use crate::atlas::{AtlasLayout, MatParam};
use crate::caster::{CasterId, CasterLink};
use crate::error::{Error, Result};
use crate::pool::SlotPool;

/// Upper bound on the configurable slot count (a 5x5 grid).
pub const SHADOW_LIMIT: usize = 25;

/// Shared shader parameters published by the coordinator and consumed by the
/// shadow shaders through the global uniform block.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowGlobals {
    /// Grid side length of the current layout.
    pub line: f32,
    /// Global shadow tint.
    pub color: Vec4,
}

impl Default for ShadowGlobals {
    fn default() -> Self {
        Self {
            line: 0.0,
            color: Vec4::new(0.5, 0.5, 0.5, 1.0),
        }
    }
}

static COORDINATOR_LIVE: AtomicBool = AtomicBool::new(false);

struct QueueEntry {
    id: CasterId,
    label: String,
    link: CasterLink,
}

struct Lease {
    label: String,
    slot: usize,
    link: CasterLink,
}

struct CoordinatorState {
    active: bool,
    count: usize,
    resolution: u32,
    layout: AtlasLayout,
    params: Vec<MatParam>,
    pool: SlotPool,
    /// Pending claims, drained most-recent-first by `resolve`.
    queue: Vec<QueueEntry>,
    leases: HashMap<CasterId, Lease>,
    has_mesh_materials: bool,
    globals: ShadowGlobals,
    globals_dirty: bool,
}

impl Drop for CoordinatorState {
    fn drop(&mut self) {
        if self.active {
            COORDINATOR_LIVE.store(false, Ordering::Release);
        }
    }
}

/// Cloneable handle to the one live coordinator.
#[derive(Clone)]
pub struct ShadowCoordinator {
    state: Arc<Mutex<CoordinatorState>>,
}

impl ShadowCoordinator {
    /// Build the coordinator. Errors if another live coordinator exists.
    ///
    /// `has_mesh_materials` reflects whether the feature registered the
    /// dedicated fake-shadow shader; it decides whether granted `MatParam`s
    /// carry a material handle for shadow-mesh casters.
    pub fn new(has_mesh_materials: bool) -> Result<Self> {
        if COORDINATOR_LIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!("FakeShadow coordinator is duplicated");
            return Err(Error::CoordinatorExists);
        }
        Ok(Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                active: true,
                count: 0,
                resolution: 0,
                layout: AtlasLayout::new(0, 1),
                params: Vec::new(),
                pool: SlotPool::new(0),
                queue: Vec::new(),
                leases: HashMap::new(),
                has_mesh_materials,
                globals: ShadowGlobals::default(),
                globals_dirty: true,
            })),
        })
    }

    /// Reconfigure the slot count and atlas resolution. No-op when both are
    /// unchanged. Otherwise every lease is revoked and re-queued; leased
    /// actors that no longer fit are evicted with a per-actor diagnostic.
    ///
    /// Must run before `resolve` in the frame. Completes atomically with
    /// respect to it: a render pass never observes a mixed layout.
    pub fn set_capacity(&self, count: usize, resolution: u32) {
        let mut s = self.state.lock();
        if !s.active {
            log::warn!("set_capacity on a disposed FakeShadow coordinator");
            return;
        }
        let count = if count > SHADOW_LIMIT {
            log::warn!("shadow count {count} clamped to the limit {SHADOW_LIMIT}");
            SHADOW_LIMIT
        } else {
            count
        };
        // A zero-sized atlas would make the one-texel clip inset degenerate.
        let resolution = resolution.max(1);
        if s.count == count && s.resolution == resolution {
            return;
        }

        s.count = count;
        s.resolution = resolution;
        s.layout = AtlasLayout::new(count, resolution);
        let with_materials = s.has_mesh_materials;
        s.params = s.layout.build_params(with_materials);

        // Revoke every lease. Holders re-enter the queue and are re-granted
        // (with the new layout) at the next resolve; once the queue is full
        // the remaining holders are dropped rather than left to spin forever.
        let leases = std::mem::take(&mut s.leases);
        for (id, lease) in leases {
            let Some(actor) = lease.link.upgrade() else {
                continue;
            };
            let mut actor = actor.lock();
            if s.queue.len() >= count {
                log::error!(
                    "evicted fake shadow of '{}'; the max count is insufficient",
                    lease.label
                );
                actor.force_idle();
                continue;
            }
            actor.revoke_to_requested();
            s.queue.push(QueueEntry {
                id,
                label: lease.label,
                link: lease.link,
            });
        }
        s.pool.resize(count);

        s.globals.line = s.layout.line as f32;
        s.globals_dirty = true;
    }

    /// Enqueue a pending claim. Idempotent: a caster that is already queued
    /// or already leased is reported granted without a second entry. Returns
    /// false only when the coordinator has been disposed.
    pub(crate) fn request(&self, id: CasterId, label: &str, link: CasterLink) -> bool {
        let mut s = self.state.lock();
        if !s.active {
            return false;
        }
        if s.leases.contains_key(&id) || s.queue.iter().any(|q| q.id == id) {
            log::error!("duplicated fake-shadow request from '{label}'");
            return true;
        }
        s.queue.push(QueueEntry {
            id,
            label: label.to_owned(),
            link,
        });
        true
    }

    /// Drain the pending queue, most recent request first, granting a free
    /// slot to each live claim. Called once per frame, after `set_capacity`.
    ///
    /// Claims cancelled since enqueue are skipped; a claim that somehow holds
    /// a lease already is a logged error; when the pool runs dry the claim is
    /// forced back to IDLE with an over-request diagnostic.
    pub fn resolve(&self) {
        let mut s = self.state.lock();
        if !s.active {
            return;
        }
        while let Some(entry) = s.queue.pop() {
            let Some(actor) = entry.link.upgrade() else {
                continue;
            };
            let mut actor = actor.lock();
            if !actor.is_requested() {
                // Cancelled between enqueue and resolve.
                continue;
            }
            if s.leases.contains_key(&entry.id) {
                log::error!("'{}' already holds an atlas slot", entry.label);
                continue;
            }
            let Some(slot) = s.pool.acquire_free() else {
                log::error!(
                    "over request from '{}'; increase the max shadow count",
                    entry.label
                );
                actor.force_idle();
                continue;
            };
            let param = s.params[slot];
            if actor.is_shadow_mesh() && param.material.is_none() {
                log::error!(
                    "'{}' casts a shadow mesh but no fake-shadow shader is registered",
                    entry.label
                );
                s.pool.release(slot);
                actor.force_idle();
                continue;
            }
            s.leases.insert(
                entry.id,
                Lease {
                    label: entry.label,
                    slot,
                    link: entry.link,
                },
            );
            actor.setup(&param);
        }
    }

    /// Release the slot held by `id`, or cancel its pending claim. No-op for
    /// a caster that holds neither.
    pub fn return_slot(&self, id: CasterId) {
        let mut s = self.state.lock();
        if let Some(lease) = s.leases.remove(&id) {
            s.pool.release(lease.slot);
        } else if let Some(pos) = s.queue.iter().position(|q| q.id == id) {
            s.queue.remove(pos);
        }
    }

    /// Force-release every lease, clear the queue, and deactivate the
    /// handle. A new coordinator may be constructed afterwards.
    pub fn dispose(&self) {
        let mut s = self.state.lock();
        if !s.active {
            return;
        }
        let leases = std::mem::take(&mut s.leases);
        for (_, lease) in leases {
            if let Some(actor) = lease.link.upgrade() {
                actor.lock().force_idle();
            }
        }
        s.queue.clear();
        s.params.clear();
        s.pool.resize(0);
        s.count = 0;
        s.resolution = 0;
        s.active = false;
        COORDINATOR_LIVE.store(false, Ordering::Release);
    }

    /// Update the global shadow tint.
    pub fn set_color(&self, color: Vec4) {
        let mut s = self.state.lock();
        s.globals.color = color;
        s.globals_dirty = true;
    }

    pub fn globals(&self) -> ShadowGlobals {
        self.state.lock().globals
    }

    /// Whether the shared globals changed since the last call; clears the
    /// flag.
    pub fn take_globals_dirty(&self) -> bool {
        let mut s = self.state.lock();
        std::mem::replace(&mut s.globals_dirty, false)
    }

    /// Snapshot of the current parameter arena (one record per slot).
    pub fn params(&self) -> Vec<MatParam> {
        self.state.lock().params.clone()
    }

    pub fn layout(&self) -> AtlasLayout {
        self.state.lock().layout
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().count
    }

    pub fn free_count(&self) -> usize {
        self.state.lock().pool.free_count()
    }

    pub fn leased_count(&self) -> usize {
        self.state.lock().leases.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::caster::testing::mock_caster;
    use crate::caster::CasterPhase;

    #[test]
    fn nine_casters_fill_a_three_by_three_grid() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(9, 512);

        let casters: Vec<_> = (0..9)
            .map(|i| mock_caster(&coord, &format!("actor-{i}"), false))
            .collect();
        for h in &casters {
            h.caster.wakeup().unwrap();
        }
        coord.resolve();

        let mut slots = Vec::new();
        for h in &casters {
            assert_eq!(h.caster.phase(), CasterPhase::Active);
            slots.push(h.caster.slot().unwrap());
            let bias = h.caster.param().unwrap().uv_bias;
            let third = 1.0 / 3.0;
            let near = |v: f32| {
                (v).abs() < 1e-6 || (v - third).abs() < 1e-6 || (v - 2.0 * third).abs() < 1e-6
            };
            assert!(near(bias.x) && near(bias.y), "bias {bias:?}");
        }
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), 9, "slots must be distinct");
        assert_eq!(coord.free_count(), 0);
        coord.dispose();
    }

    #[test]
    fn over_request_leaves_one_idle() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(4, 512);

        let casters: Vec<_> = (0..5)
            .map(|i| mock_caster(&coord, &format!("actor-{i}"), false))
            .collect();
        for h in &casters {
            h.caster.wakeup().unwrap();
        }
        coord.resolve();

        let active = casters
            .iter()
            .filter(|h| h.caster.phase() == CasterPhase::Active)
            .count();
        let idle = casters
            .iter()
            .filter(|h| h.caster.phase() == CasterPhase::Idle)
            .count();
        assert_eq!(active, 4);
        assert_eq!(idle, 1);
        assert_eq!(coord.free_count(), 0);
        coord.dispose();
    }

    #[test]
    fn capacity_shrink_evicts_the_excess() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(9, 512);

        let casters: Vec<_> = (0..9)
            .map(|i| mock_caster(&coord, &format!("actor-{i}"), false))
            .collect();
        for h in &casters {
            h.caster.wakeup().unwrap();
        }
        coord.resolve();
        assert_eq!(coord.leased_count(), 9);

        coord.set_capacity(4, 512);
        coord.resolve();

        let active: Vec<_> = casters
            .iter()
            .filter(|h| h.caster.phase() == CasterPhase::Active)
            .collect();
        let idle = casters
            .iter()
            .filter(|h| h.caster.phase() == CasterPhase::Idle)
            .count();
        assert_eq!(active.len(), 4);
        assert_eq!(idle, 5);
        assert_eq!(coord.free_count(), 0);
        // Survivors carry parameters of the 2x2 layout.
        for h in &active {
            let param = h.caster.param().unwrap();
            assert!((param.uv_scale.x - 0.5).abs() < 1e-6);
            assert!(param.index < 4);
        }
        coord.dispose();
    }

    #[test]
    fn capacity_growth_regrants_every_holder() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(4, 512);

        let casters: Vec<_> = (0..3)
            .map(|i| mock_caster(&coord, &format!("actor-{i}"), false))
            .collect();
        for h in &casters {
            h.caster.wakeup().unwrap();
        }
        coord.resolve();

        coord.set_capacity(9, 512);
        coord.resolve();
        for h in &casters {
            assert_eq!(h.caster.phase(), CasterPhase::Active);
            let param = h.caster.param().unwrap();
            assert!((param.uv_scale.x - 1.0 / 3.0).abs() < 1e-6);
        }
        assert_eq!(coord.free_count(), 6);
        coord.dispose();
    }

    #[test]
    fn set_capacity_is_idempotent() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(4, 512);

        let h = mock_caster(&coord, "steady", false);
        h.caster.wakeup().unwrap();
        coord.resolve();
        let slot = h.caster.slot().unwrap();

        // Unchanged arguments must not disturb the lease.
        coord.set_capacity(4, 512);
        assert_eq!(h.caster.phase(), CasterPhase::Active);
        assert_eq!(h.caster.slot(), Some(slot));
        assert_eq!(coord.leased_count(), 1);
        coord.dispose();
    }

    #[test]
    fn request_is_idempotent_and_conserves_slots() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(4, 512);

        let h = mock_caster(&coord, "twice", false);
        h.caster.wakeup().unwrap();
        h.caster.wakeup().unwrap();
        assert_eq!(coord.queued_count(), 1);
        coord.resolve();
        assert_eq!(coord.leased_count(), 1);
        assert_eq!(coord.free_count() + coord.leased_count(), coord.capacity());
        coord.dispose();
    }

    #[test]
    fn resolve_skips_cancelled_claims() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(2, 512);

        let a = mock_caster(&coord, "a", false);
        let b = mock_caster(&coord, "b", false);
        a.caster.wakeup().unwrap();
        b.caster.wakeup().unwrap();
        a.caster.sleep();
        coord.resolve();

        assert_eq!(a.caster.phase(), CasterPhase::Idle);
        assert_eq!(b.caster.phase(), CasterPhase::Active);
        assert_eq!(coord.free_count(), 1);
        coord.dispose();
    }

    #[test]
    fn capacity_zero_over_requests_everything() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(0, 512);

        let h = mock_caster(&coord, "nowhere", false);
        h.caster.wakeup().unwrap();
        coord.resolve();
        assert_eq!(h.caster.phase(), CasterPhase::Idle);
        assert_eq!(coord.free_count(), 0);
        coord.dispose();
    }

    #[test]
    fn count_above_limit_is_clamped() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(SHADOW_LIMIT + 5, 1024);
        assert_eq!(coord.capacity(), SHADOW_LIMIT);
        assert_eq!(coord.layout().line, 5);
        coord.dispose();
    }

    #[test]
    fn shadow_mesh_without_shader_is_refused() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(4, 512);

        let h = mock_caster(&coord, "meshy", true);
        h.caster.wakeup().unwrap();
        coord.resolve();
        assert_eq!(h.caster.phase(), CasterPhase::Idle);
        // The grabbed slot went straight back to the pool.
        assert_eq!(coord.free_count(), 4);
        coord.dispose();
    }

    #[test]
    fn shadow_mesh_with_shader_gets_a_material() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(true).unwrap();
        coord.set_capacity(4, 512);

        let h = mock_caster(&coord, "meshy", true);
        h.caster.wakeup().unwrap();
        coord.resolve();
        assert_eq!(h.caster.phase(), CasterPhase::Active);
        let applied = h.target.lock().material;
        assert_eq!(applied, h.caster.param().unwrap().material);
        assert!(applied.is_some());
        coord.dispose();
    }

    #[test]
    fn dispose_forces_idle_and_frees_the_guard() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        coord.set_capacity(2, 512);

        let h = mock_caster(&coord, "goner", false);
        h.caster.wakeup().unwrap();
        coord.resolve();
        assert_eq!(h.caster.phase(), CasterPhase::Active);

        coord.dispose();
        assert_eq!(h.caster.phase(), CasterPhase::Idle);
        assert!(!coord.is_active());
        // Requests against the dead handle fail...
        assert!(matches!(
            h.caster.wakeup(),
            Err(crate::error::Error::CoordinatorDisposed)
        ));
        // ...and a fresh coordinator may be built.
        let next = ShadowCoordinator::new(false).unwrap();
        next.dispose();
    }

    #[test]
    fn duplicate_construction_is_an_error() {
        let _serial = testing::serial_lock();
        let first = ShadowCoordinator::new(false).unwrap();
        assert!(matches!(
            ShadowCoordinator::new(false),
            Err(crate::error::Error::CoordinatorExists)
        ));
        first.dispose();
    }

    #[test]
    fn globals_follow_capacity_and_color() {
        let _serial = testing::serial_lock();
        let coord = ShadowCoordinator::new(false).unwrap();
        assert!(coord.take_globals_dirty());

        coord.set_capacity(9, 512);
        assert!(coord.take_globals_dirty());
        assert_eq!(coord.globals().line, 3.0);
        assert!(!coord.take_globals_dirty());

        coord.set_color(Vec4::new(0.0, 0.0, 0.0, 1.0));
        assert!(coord.take_globals_dirty());
        assert_eq!(coord.globals().color, Vec4::new(0.0, 0.0, 0.0, 1.0));
        coord.dispose();
    }
}
