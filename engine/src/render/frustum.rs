//! Camera frustum construction for the culling systems.

use crate::math::{Frustum, Projection, Transform3D};

/// The six camera planes in world space, normals pointing inward.
pub fn camera_frustum(projection: &Projection, camera_transform: &Transform3D) -> Frustum {
    let view = camera_transform.affine_inverse().to_mat4();
    Frustum::from_view_projection(&(projection.matrix * view))
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use crate::math::Aabb;

    use super::*;

    #[test]
    fn frustum_scenario_classification() {
        // Given: camera at origin looking down -Z with a 90 degree
        // horizontal FOV
        let projection =
            Projection::perspective_hfov(90f32.to_radians(), 320.0 / 180.0, 0.05, 1000.0);
        let frustum = camera_frustum(&projection, &Transform3D::IDENTITY);

        // Entity A at (0, 0, -5) is in view; entity B at (100, 0, 0) is not.
        let a = Aabb::new(Vec3::new(-0.5, -0.5, -5.5), Vec3::splat(1.0));
        let b = Aabb::new(Vec3::new(99.5, -0.5, -0.5), Vec3::splat(1.0));

        // Then
        assert!(frustum.intersects_aabb(&a));
        assert!(!frustum.intersects_aabb(&b));
    }

    #[test]
    fn moved_camera_moves_the_frustum() {
        // Given a camera displaced to x = 100 looking down -Z
        let projection =
            Projection::perspective_hfov(90f32.to_radians(), 320.0 / 180.0, 0.05, 1000.0);
        let camera = Transform3D::from_origin(Vec3::new(100.0, 0.0, 0.0));
        let frustum = camera_frustum(&projection, &camera);

        // Then: what was out of view is now straight ahead... of nothing;
        // the box ahead of the new position is visible
        let ahead = Aabb::new(Vec3::new(99.5, -0.5, -5.5), Vec3::splat(1.0));
        let origin_box = Aabb::new(Vec3::new(-0.5, -0.5, -5.5), Vec3::splat(1.0));
        assert!(frustum.intersects_aabb(&ahead));
        assert!(!frustum.intersects_aabb(&origin_box));
    }
}
