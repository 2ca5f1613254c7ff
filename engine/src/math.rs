//! Geometry layer shared by the culling, rendering, and replication code.
//!
//! The vector/matrix heavy lifting is delegated to [`glam`]; this module adds
//! the scene-level shapes the engine actually reasons about:
//!
//! - [`Transform3D`]: a basis + origin pair, the unit of placement for every
//!   renderable entity and the payload replicated across peers.
//! - [`Aabb`]: position + size box used for occlusion and frustum tests.
//! - [`Plane`] / [`Frustum`]: camera planes extracted from a view-projection
//!   matrix for the culling systems.
//! - [`Projection`]: a perspective projection plus the screen mapping used by
//!   the software rasterizer.
//!
//! # Conventions
//!
//! Cameras look down **-Z** in view space. Depth values handed to the
//! occlusion oracle are *view-space distances in front of the camera*
//! (positive forward), so a depth of `5.0` means five units ahead.

use glam::{Mat3, Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};
use serde::{Deserialize, Serialize};

/// A rigid (or scaled) placement in 3D space: rotation/scale basis plus origin.
///
/// Mirrors the shape the render backend consumes, so transforms flow from
/// systems to backend commands without conversion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform3D {
    /// Rotation and scale.
    pub basis: Mat3,
    /// Translation.
    pub origin: Vec3,
}

impl Transform3D {
    /// The identity placement at the world origin.
    pub const IDENTITY: Self = Self {
        basis: Mat3::IDENTITY,
        origin: Vec3::ZERO,
    };

    /// Construct a transform at `origin` with an identity basis.
    #[inline]
    pub fn from_origin(origin: Vec3) -> Self {
        Self {
            basis: Mat3::IDENTITY,
            origin,
        }
    }

    /// Construct from a basis and origin.
    #[inline]
    pub const fn new(basis: Mat3, origin: Vec3) -> Self {
        Self { basis, origin }
    }

    /// Transform a point: `basis * p + origin`.
    #[inline]
    pub fn xform(&self, point: Vec3) -> Vec3 {
        self.basis * point + self.origin
    }

    /// The inverse of this transform, valid for any invertible basis.
    pub fn affine_inverse(&self) -> Self {
        let inv = self.basis.inverse();
        Self {
            basis: inv,
            origin: inv * -self.origin,
        }
    }

    /// The per-axis scale encoded in the basis (column lengths).
    #[inline]
    pub fn scale(&self) -> Vec3 {
        Vec3::new(
            self.basis.col(0).length(),
            self.basis.col(1).length(),
            self.basis.col(2).length(),
        )
    }

    /// This transform as a homogeneous matrix.
    #[inline]
    pub fn to_mat4(&self) -> Mat4 {
        Mat4::from_cols(
            (self.basis.col(0), 0.0).into(),
            (self.basis.col(1), 0.0).into(),
            (self.basis.col(2), 0.0).into(),
            (self.origin, 1.0).into(),
        )
    }
}

impl Default for Transform3D {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// An axis-aligned box described by its minimum corner and size.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Aabb {
    /// Minimum corner.
    pub position: Vec3,
    /// Extent along each axis; non-negative.
    pub size: Vec3,
}

impl Aabb {
    /// Construct from a minimum corner and size.
    #[inline]
    pub const fn new(position: Vec3, size: Vec3) -> Self {
        Self { position, size }
    }

    /// The maximum corner.
    #[inline]
    pub fn end(&self) -> Vec3 {
        self.position + self.size
    }

    /// The eight corners of the box.
    pub fn corners(&self) -> [Vec3; 8] {
        let min = self.position;
        let max = self.end();
        [
            Vec3::new(min.x, min.y, min.z),
            Vec3::new(max.x, min.y, min.z),
            Vec3::new(min.x, max.y, min.z),
            Vec3::new(max.x, max.y, min.z),
            Vec3::new(min.x, min.y, max.z),
            Vec3::new(max.x, min.y, max.z),
            Vec3::new(min.x, max.y, max.z),
            Vec3::new(max.x, max.y, max.z),
        ]
    }

    /// Apply a transform: translate by the origin and scale the extents.
    ///
    /// This is the cheap conservative form used by the culling systems; it
    /// does not rotate the box, matching how occludee bounds are maintained.
    pub fn transformed(&self, transform: &Transform3D) -> Self {
        Self {
            position: self.position + transform.origin,
            size: self.size * transform.scale(),
        }
    }
}

/// A plane in Hessian normal form: `normal · p + d = 0`.
///
/// Points with a positive [`distance_to`](Self::distance_to) lie on the side
/// the normal points toward (inside, for frustum planes).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub d: f32,
}

impl Plane {
    /// Signed distance from `point` to the plane.
    #[inline]
    pub fn distance_to(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.d
    }

    /// Normalize the plane so `normal` has unit length.
    pub fn normalized(self) -> Self {
        let len = self.normal.length();
        if len <= f32::EPSILON {
            return self;
        }
        Self {
            normal: self.normal / len,
            d: self.d / len,
        }
    }
}

/// The six camera planes, normals pointing inward.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Extract frustum planes from a combined view-projection matrix
    /// (Gribb-Hartmann rows).
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let row = |i: usize| {
            Vec4::new(
                vp.col(0)[i],
                vp.col(1)[i],
                vp.col(2)[i],
                vp.col(3)[i],
            )
        };
        let r0 = row(0);
        let r1 = row(1);
        let r2 = row(2);
        let r3 = row(3);

        let plane = |v: Vec4| {
            Plane {
                normal: v.xyz(),
                d: v.w,
            }
            .normalized()
        };

        Self {
            planes: [
                plane(r3 + r0), // left
                plane(r3 - r0), // right
                plane(r3 + r1), // bottom
                plane(r3 - r1), // top
                plane(r3 + r2), // near
                plane(r3 - r2), // far
            ],
        }
    }

    /// Whether the box intersects the frustum (conservative).
    ///
    /// A box is rejected only if it lies fully behind at least one plane,
    /// using the positive-vertex test.
    pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
        let min = aabb.position;
        let max = aabb.end();
        for plane in &self.planes {
            let support = Vec3::new(
                if plane.normal.x >= 0.0 { max.x } else { min.x },
                if plane.normal.y >= 0.0 { max.y } else { min.y },
                if plane.normal.z >= 0.0 { max.z } else { min.z },
            );
            if plane.distance_to(support) < 0.0 {
                return false;
            }
        }
        true
    }
}

/// A perspective projection plus screen-space mapping helpers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub matrix: Mat4,
    pub near: f32,
}

impl Projection {
    /// Right-handed perspective projection looking down -Z.
    ///
    /// `fov_y` is the vertical field of view in radians.
    pub fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        Self {
            matrix: Mat4::perspective_rh(fov_y, aspect, near, far),
            near,
        }
    }

    /// Perspective projection from a *horizontal* field of view in radians.
    pub fn perspective_hfov(fov_x: f32, aspect: f32, near: f32, far: f32) -> Self {
        let fov_y = 2.0 * ((fov_x * 0.5).tan() / aspect).atan();
        Self::perspective(fov_y, aspect, near, far)
    }

    /// Project a view-space point to pixel coordinates.
    ///
    /// Returns `(screen, view_depth)` where `view_depth` is the positive
    /// distance in front of the camera, or `None` for points at or behind the
    /// near plane.
    pub fn project(&self, view_pos: Vec3, screen_size: Vec2) -> Option<(Vec2, f32)> {
        let depth = -view_pos.z;
        if depth <= self.near {
            return None;
        }
        let clip = self.matrix * Vec4::new(view_pos.x, view_pos.y, view_pos.z, 1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = Vec2::new(clip.x / clip.w, clip.y / clip.w);
        // NDC [-1,1] to pixels, y growing downward.
        let screen = Vec2::new(
            (ndc.x + 1.0) * 0.5 * screen_size.x,
            (1.0 - ndc.y) * 0.5 * screen_size.y,
        );
        Some((screen, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transform_xform_and_inverse_round_trip() {
        // Given
        let transform = Transform3D::new(
            Mat3::from_rotation_y(0.5) * Mat3::from_diagonal(Vec3::splat(2.0)),
            Vec3::new(1.0, 2.0, 3.0),
        );
        let point = Vec3::new(4.0, -1.0, 0.5);

        // When
        let moved = transform.xform(point);
        let back = transform.affine_inverse().xform(moved);

        // Then
        assert!((back - point).length() < 1e-4);
    }

    #[test]
    fn transform_scale_extraction() {
        let transform = Transform3D::new(Mat3::from_diagonal(Vec3::new(2.0, 3.0, 4.0)), Vec3::ZERO);
        let scale = transform.scale();
        assert!((scale - Vec3::new(2.0, 3.0, 4.0)).length() < 1e-5);
    }

    #[test]
    fn aabb_transformed_scales_and_translates() {
        // Given
        let aabb = Aabb::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::splat(2.0));
        let transform = Transform3D::new(
            Mat3::from_diagonal(Vec3::splat(3.0)),
            Vec3::new(10.0, 0.0, 0.0),
        );

        // When
        let world = aabb.transformed(&transform);

        // Then
        assert_eq!(world.position, Vec3::new(9.0, -1.0, -1.0));
        assert_eq!(world.size, Vec3::splat(6.0));
    }

    #[test]
    fn frustum_accepts_point_in_front_rejects_behind() {
        // Given: camera at origin looking down -Z, 90 degree horizontal FOV
        let projection = Projection::perspective_hfov(90f32.to_radians(), 16.0 / 9.0, 0.05, 100.0);
        let view = Mat4::IDENTITY; // camera at origin
        let frustum = Frustum::from_view_projection(&(projection.matrix * view));

        let in_front = Aabb::new(Vec3::new(-0.5, -0.5, -5.5), Vec3::splat(1.0));
        let beside = Aabb::new(Vec3::new(99.5, -0.5, -0.5), Vec3::splat(1.0));

        // Then
        assert!(frustum.intersects_aabb(&in_front));
        assert!(!frustum.intersects_aabb(&beside));
    }

    #[test]
    fn projection_maps_center_to_screen_center() {
        // Given
        let projection = Projection::perspective(60f32.to_radians(), 16.0 / 9.0, 0.05, 100.0);
        let screen = Vec2::new(320.0, 180.0);

        // When: a point straight ahead
        let (pixel, depth) = projection.project(Vec3::new(0.0, 0.0, -5.0), screen).unwrap();

        // Then
        assert!((pixel - Vec2::new(160.0, 90.0)).length() < 1e-3);
        assert!((depth - 5.0).abs() < 1e-5);
    }

    #[test]
    fn projection_rejects_points_behind_camera() {
        let projection = Projection::perspective(60f32.to_radians(), 1.0, 0.05, 100.0);
        let screen = Vec2::new(320.0, 180.0);
        assert!(projection.project(Vec3::new(0.0, 0.0, 5.0), screen).is_none());
        assert!(projection.project(Vec3::ZERO, screen).is_none());
    }
}
