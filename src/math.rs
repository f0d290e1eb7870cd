// src/math.rs
//! Matrix helpers for the fake-shadow passes.
//!
//! The view matrix is rebuilt for every active caster every frame, so it is
//! computed with a closed-form rigid inverse instead of a general 4x4
//! `Mat4::inverse()`.

use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

/// Rotation that points the shadow camera straight down (+90 degrees about X).
pub const ROT_TOP_DOWN: Quat = Quat::from_xyzw(
    std::f32::consts::FRAC_1_SQRT_2,
    0.0,
    0.0,
    std::f32::consts::FRAC_1_SQRT_2,
);

/// Closed-form inverse of a translation * rotation transform.
///
/// `rot` must be normalized. Equivalent to
/// `Mat4::from_rotation_translation(rot, pos).inverse()` without the general
/// matrix inversion.
pub fn rigid_inverse(pos: Vec3, rot: Quat) -> Mat4 {
    // Rotation part of the inverse is the rotation of the conjugate quaternion.
    let x = -rot.x * 2.0;
    let y = -rot.y * 2.0;
    let z = -rot.z * 2.0;
    let xx = -rot.x * x;
    let yy = -rot.y * y;
    let zz = -rot.z * z;
    let xy = -rot.x * y;
    let xz = -rot.x * z;
    let yz = -rot.y * z;
    let wx = rot.w * x;
    let wy = rot.w * y;
    let wz = rot.w * z;

    let m00 = 1.0 - (yy + zz);
    let m10 = xy + wz;
    let m20 = xz - wy;

    let m01 = xy - wz;
    let m11 = 1.0 - (xx + zz);
    let m21 = yz + wx;

    let m02 = xz + wy;
    let m12 = yz - wx;
    let m22 = 1.0 - (xx + yy);

    // Translation column: R^-1 * (-pos).
    let tx = m00 * -pos.x + m01 * -pos.y + m02 * -pos.z;
    let ty = m10 * -pos.x + m11 * -pos.y + m12 * -pos.z;
    let tz = m20 * -pos.x + m21 * -pos.y + m22 * -pos.z;

    Mat4::from_cols(
        Vec4::new(m00, m10, m20, 0.0),
        Vec4::new(m01, m11, m21, 0.0),
        Vec4::new(m02, m12, m22, 0.0),
        Vec4::new(tx, ty, tz, 1.0),
    )
}

/// Top-down view matrix centered on `pos`.
///
/// Inverse of `TRS(pos, ROT_TOP_DOWN, (1, 1, -1))`. The Z-flip scale is its
/// own inverse, so it folds into a sign change on the Z row of the rigid
/// inverse.
pub fn top_down_view(pos: Vec3) -> Mat4 {
    let mut m = rigid_inverse(pos, ROT_TOP_DOWN);
    m.x_axis.z = -m.x_axis.z;
    m.y_axis.z = -m.y_axis.z;
    m.z_axis.z = -m.z_axis.z;
    m.w_axis.z = -m.w_axis.z;
    m
}

/// Symmetric orthographic projection for a caster silhouette.
///
/// `size` is the decal extent, `range` the depth half-range taken from the
/// caster bounds. Depth maps to 0..1 (wgpu convention).
pub fn shadow_projection(size: Vec2, range: f32) -> Mat4 {
    let w = size.x * 0.5;
    let h = size.y * 0.5;
    Mat4::orthographic_rh(-w, w, -h, h, -range, range)
}
