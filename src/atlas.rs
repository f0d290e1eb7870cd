// src/atlas.rs
//! Grid layout for the shared decal atlas.
//!
//! Capacity `n` packs into a `line x line` grid with `line = ceil(sqrt(n))`,
//! so every slot transform is a closed-form function of its index. No packing
//! search: all casters render same-size square cells.

use glam::{Vec2, Vec4};

use crate::material::MaterialHandle;

/// Identifier of one atlas grid cell, in `[0, capacity)`.
pub type SlotIndex = usize;

/// Per-slot parameter tuple handed to a caster when its lease is granted.
///
/// Rebuilt wholesale whenever capacity or atlas resolution changes;
/// immutable in between.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatParam {
    pub index: SlotIndex,
    /// Projector uv scale (uniform, `1 / line` on both axes).
    pub uv_scale: Vec2,
    /// Projector uv offset of the cell's lower corner.
    pub uv_bias: Vec2,
    /// Cell center in clip space, used by the atlas shader to place the
    /// silhouette. Only xy are meaningful.
    pub offset: Vec4,
    /// Sampling rectangle `(x, y, w, h)` in uv space, inset by one texel so
    /// bilinear filtering cannot bleed across neighboring cells.
    pub clip_rect: Vec4,
    /// Dedicated atlas material for shadow-mesh casters, when the feature
    /// registered one.
    pub material: Option<MaterialHandle>,
}

/// Derived grid layout for a given `(capacity, resolution)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtlasLayout {
    pub capacity: usize,
    /// Atlas texture edge in pixels.
    pub resolution: u32,
    /// Grid side length, `ceil(sqrt(capacity))`.
    pub line: u32,
}

impl AtlasLayout {
    pub fn new(capacity: usize, resolution: u32) -> Self {
        let line = (capacity as f32).sqrt().ceil() as u32;
        Self {
            capacity,
            resolution,
            line,
        }
    }

    /// Uv extent of one grid cell. Zero for an empty layout.
    pub fn cell_scale(&self) -> f32 {
        if self.line == 0 {
            0.0
        } else {
            1.0 / self.line as f32
        }
    }

    /// Parameter tuple for one slot. `index` must be `< capacity`.
    pub fn cell_param(&self, index: SlotIndex, material: Option<MaterialHandle>) -> MatParam {
        debug_assert!(index < self.capacity);
        let line = self.line as f32;
        let uv_scale = self.cell_scale();
        // Cell extent in clip space is -1..1, twice the uv extent.
        let block = 2.0 * uv_scale;
        let col = (index as u32 % self.line) as f32;
        let row = (index as u32 / self.line) as f32;

        let offset = Vec4::new(
            -1.0 + block * (col + 0.5),
            1.0 - block * (row + 0.5),
            0.0,
            0.0,
        );
        let uv_bias = Vec2::new(uv_scale * col, uv_scale * row);

        let one_px = 1.0 / self.resolution as f32;
        let clip_rect = Vec4::new(
            uv_bias.x + one_px,
            uv_bias.y + one_px,
            uv_scale - 2.0 * one_px,
            uv_scale - 2.0 * one_px,
        );

        MatParam {
            index,
            uv_scale: Vec2::splat(uv_scale),
            uv_bias,
            offset,
            clip_rect,
            material,
        }
    }

    /// Full parameter arena for slots `0..capacity`.
    pub fn build_params(&self, with_materials: bool) -> Vec<MatParam> {
        (0..self.capacity)
            .map(|i| {
                let material = with_materials.then(|| MaterialHandle::for_slot(i));
                self.cell_param(i, material)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_is_ceil_sqrt() {
        for (capacity, line) in [(1, 1), (2, 2), (4, 2), (5, 3), (9, 3), (10, 4), (25, 5)] {
            assert_eq!(AtlasLayout::new(capacity, 512).line, line, "capacity {capacity}");
        }
    }

    #[test]
    fn cell_centers_are_distinct_and_in_clip_space() {
        for capacity in 1..=25usize {
            let layout = AtlasLayout::new(capacity, 512);
            let params = layout.build_params(false);
            assert_eq!(params.len(), capacity);
            for p in &params {
                assert!(p.offset.x > -1.0 && p.offset.x < 1.0);
                assert!(p.offset.y > -1.0 && p.offset.y < 1.0);
            }
            for (i, a) in params.iter().enumerate() {
                for b in params.iter().skip(i + 1) {
                    let dx = (a.offset.x - b.offset.x).abs();
                    let dy = (a.offset.y - b.offset.y).abs();
                    assert!(dx > 1e-6 || dy > 1e-6, "capacity {capacity} has overlapping cells");
                }
            }
        }
    }

    #[test]
    fn three_by_three_bias_values() {
        let layout = AtlasLayout::new(9, 512);
        let params = layout.build_params(false);
        let third = 1.0 / 3.0;
        for p in &params {
            let col = (p.index % 3) as f32;
            let row = (p.index / 3) as f32;
            assert!((p.uv_bias.x - third * col).abs() < 1e-6);
            assert!((p.uv_bias.y - third * row).abs() < 1e-6);
        }
        // The distinct bias values are exactly {0, 1/3, 2/3} on each axis.
        let mut xs: Vec<f32> = params.iter().map(|p| p.uv_bias.x).collect();
        xs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        xs.dedup_by(|a, b| (*a - *b).abs() < 1e-6);
        assert_eq!(xs.len(), 3);
    }

    #[test]
    fn clip_rect_is_inset_one_texel() {
        let layout = AtlasLayout::new(4, 512);
        let p = layout.cell_param(3, None);
        let one_px = 1.0 / 512.0;
        assert!((p.clip_rect.x - (p.uv_bias.x + one_px)).abs() < 1e-7);
        assert!((p.clip_rect.y - (p.uv_bias.y + one_px)).abs() < 1e-7);
        assert!((p.clip_rect.z - (0.5 - 2.0 * one_px)).abs() < 1e-7);
    }

    #[test]
    fn empty_layout_is_harmless() {
        let layout = AtlasLayout::new(0, 512);
        assert_eq!(layout.line, 0);
        assert_eq!(layout.cell_scale(), 0.0);
        assert!(layout.build_params(true).is_empty());
    }
}
