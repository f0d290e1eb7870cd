// src/lib.rs
//! Fake contact shadows through a grid-packed decal atlas.
//!
//! Dynamic actors project a top-down orthographic silhouette into one cell of
//! a shared atlas texture; a decal projector samples that cell back under the
//! actor. No shadow maps are rendered for the actors at all.
//!
//! The moving parts:
//!
//! - [`coordinator::ShadowCoordinator`] leases atlas slots to casters and
//!   re-derives the grid whenever the configured capacity changes.
//! - [`caster::FakeShadow`] is the per-actor adapter that requests a slot on
//!   wake, pushes view/projection matrices while active, and returns the
//!   slot on sleep (or automatically on drop).
//! - [`feature::FakeShadowFeature`] is the pipeline glue: it runs
//!   `set_capacity` and `resolve` each frame and owns the three render
//!   passes (caster depth, shadow atlas composite, caster opaque).
//!
//! Typical wiring:
//!
//! ```no_run
//! use fake_shadow::{FakeShadowFeature, FakeShadowSettings, FakeShadow};
//! # fn projector() -> Box<dyn fake_shadow::DecalProjector> { unimplemented!() }
//! # fn target() -> Box<dyn fake_shadow::CasterTarget> { unimplemented!() }
//! let feature = FakeShadowFeature::new(FakeShadowSettings::default())?;
//!
//! let shadow = FakeShadow::new(&feature.coordinator(), "player", false, projector());
//! shadow.bind_target(target());
//! shadow.wakeup()?;
//!
//! // per frame, before pass recording:
//! // feature.prepare_frame(&device, &queue, &camera_layout, &object_layout, priming);
//! // shadow.update();
//! # Ok::<(), fake_shadow::Error>(())
//! ```

pub mod atlas;
pub mod caster;
pub mod coordinator;
pub mod error;
pub mod feature;
pub mod material;
pub mod math;
pub mod passes;
pub mod pool;

pub use atlas::{AtlasLayout, MatParam, SlotIndex};
pub use caster::{CasterId, CasterPhase, CasterTarget, CasterUniforms, DecalProjector, FakeShadow};
pub use coordinator::{ShadowCoordinator, ShadowGlobals, SHADOW_LIMIT};
pub use error::{Error, Result};
pub use feature::{FakeShadowFeature, FakeShadowSettings, FeaturePass};
pub use material::{AtlasMaterials, MaterialHandle, MeshCaster};
pub use passes::{CasterDraw, LayerMask, RenderPassEvent};
