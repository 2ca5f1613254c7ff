//! Screen-space primitives for the tile occlusion oracle.
//!
//! Occluder geometry is projected once per tick into [`ScreenTriangle`]s,
//! pixel-space vertices with view-space depths, and occludee bounds into
//! [`ScreenAabb`]s. Tiles are fixed 32×32 pixel squares; each owns a
//! [`TileBuffer`] min-depth image cleared to +∞ every frame.

use glam::{IVec2, Vec2, Vec3};

use crate::math::{Aabb, Projection, Transform3D};

/// Default occlusion buffer width in pixels.
pub const OCCLUSION_WIDTH: u32 = 320;
/// Default occlusion buffer height in pixels.
pub const OCCLUSION_HEIGHT: u32 = 180;
/// Tile edge length in pixels.
pub const TILE_SIZE: u32 = 32;

/// A triangle in screen space with per-vertex view depth.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenTriangle {
    /// Pixel-space vertices.
    pub v0: Vec2,
    pub v1: Vec2,
    pub v2: Vec2,
    /// View-space depths (positive forward).
    pub z0: f32,
    pub z1: f32,
    pub z2: f32,
}

impl ScreenTriangle {
    pub fn new(v0: Vec2, v1: Vec2, v2: Vec2, z0: f32, z1: f32, z2: f32) -> Self {
        Self {
            v0,
            v1,
            v2,
            z0,
            z1,
            z2,
        }
    }

    /// The triangle's pixel-space bounding box `(min, max)`.
    pub fn bounds(&self) -> (Vec2, Vec2) {
        (
            self.v0.min(self.v1).min(self.v2),
            self.v0.max(self.v1).max(self.v2),
        )
    }

    /// Project an indexed triangle soup to screen space.
    ///
    /// `world_transform` carries the occluder's placement; triangles with
    /// any vertex at or behind the near plane are discarded wholesale.
    pub fn project_triangles(
        vertices: &[Vec3],
        indices: &[u32],
        world_transform: &Transform3D,
        camera_transform: &Transform3D,
        projection: &Projection,
        screen_size: Vec2,
    ) -> Vec<ScreenTriangle> {
        let view = camera_transform.affine_inverse();
        let mut out = Vec::with_capacity(indices.len() / 3);

        for tri in indices.chunks_exact(3) {
            let mut screen = [Vec2::ZERO; 3];
            let mut depth = [0.0f32; 3];
            let mut keep = true;
            for (slot, &index) in tri.iter().enumerate() {
                let Some(&local) = vertices.get(index as usize) else {
                    keep = false;
                    break;
                };
                let view_pos = view.xform(world_transform.xform(local));
                match projection.project(view_pos, screen_size) {
                    Some((pixel, z)) => {
                        screen[slot] = pixel;
                        depth[slot] = z;
                    }
                    None => {
                        keep = false;
                        break;
                    }
                }
            }
            if keep {
                out.push(ScreenTriangle::new(
                    screen[0], screen[1], screen[2], depth[0], depth[1], depth[2],
                ));
            }
        }
        out
    }
}

/// An entity's bounds projected to pixel space plus view-depth extents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenAabb {
    pub min: IVec2,
    pub max: IVec2,
    pub min_z: f32,
    pub max_z: f32,
}

impl ScreenAabb {
    /// Project a world-space box. Returns `None` when every corner is at or
    /// behind the near plane; callers treat that as visible (fail-open).
    pub fn from_world_aabb(
        aabb: &Aabb,
        camera_transform: &Transform3D,
        projection: &Projection,
        screen_size: Vec2,
        view_offset: Vec2,
    ) -> Option<Self> {
        let view = camera_transform.affine_inverse();
        let mut min = Vec2::splat(f32::MAX);
        let mut max = Vec2::splat(f32::MIN);
        let mut min_z = f32::MAX;
        let mut max_z = f32::MIN;
        let mut projected = 0;

        for corner in aabb.corners() {
            let view_pos = view.xform(corner);
            let Some((pixel, z)) = projection.project(view_pos, screen_size) else {
                continue;
            };
            let pixel = pixel + view_offset;
            min = min.min(pixel);
            max = max.max(pixel);
            min_z = min_z.min(z);
            max_z = max_z.max(z);
            projected += 1;
        }

        (projected > 0).then(|| Self {
            min: IVec2::new(min.x.floor() as i32, min.y.floor() as i32),
            max: IVec2::new(max.x.ceil() as i32, max.y.ceil() as i32),
            min_z,
            max_z,
        })
    }
}

/// One tile's min-depth image, cleared to +∞ each frame.
#[derive(Clone)]
pub struct TileBuffer {
    pub depth: [[f32; TILE_SIZE as usize]; TILE_SIZE as usize],
}

impl TileBuffer {
    pub fn new() -> Self {
        Self {
            depth: [[f32::INFINITY; TILE_SIZE as usize]; TILE_SIZE as usize],
        }
    }

    pub fn clear(&mut self) {
        for row in &mut self.depth {
            row.fill(f32::INFINITY);
        }
    }
}

impl Default for TileBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangles_behind_near_plane_are_discarded() {
        // Given a quad straddling the camera plane
        let vertices = [
            Vec3::new(-1.0, -1.0, -5.0),
            Vec3::new(1.0, -1.0, -5.0),
            Vec3::new(0.0, 1.0, 5.0), // behind the camera
            Vec3::new(0.0, 1.0, -5.0),
        ];
        let indices = [0u32, 1, 2, 0, 1, 3];
        let projection = Projection::perspective(60f32.to_radians(), 16.0 / 9.0, 0.05, 100.0);

        // When
        let tris = ScreenTriangle::project_triangles(
            &vertices,
            &indices,
            &Transform3D::IDENTITY,
            &Transform3D::IDENTITY,
            &projection,
            Vec2::new(320.0, 180.0),
        );

        // Then: only the fully-in-front triangle survives, at depth 5
        assert_eq!(tris.len(), 1);
        assert!((tris[0].z0 - 5.0).abs() < 1e-4);
    }

    #[test]
    fn screen_aabb_tracks_depth_extents() {
        // Given a box from z=-10 to z=-6 in front of the camera
        let aabb = Aabb::new(Vec3::new(-1.0, -1.0, -10.0), Vec3::new(2.0, 2.0, 4.0));
        let projection = Projection::perspective(60f32.to_radians(), 16.0 / 9.0, 0.05, 100.0);

        // When
        let screen = ScreenAabb::from_world_aabb(
            &aabb,
            &Transform3D::IDENTITY,
            &projection,
            Vec2::new(320.0, 180.0),
            Vec2::ZERO,
        )
        .unwrap();

        // Then
        assert!((screen.min_z - 6.0).abs() < 1e-3);
        assert!((screen.max_z - 10.0).abs() < 1e-3);
        assert!(screen.min.x < screen.max.x);
    }

    #[test]
    fn fully_behind_box_projects_to_none() {
        let aabb = Aabb::new(Vec3::new(-1.0, -1.0, 5.0), Vec3::splat(2.0));
        let projection = Projection::perspective(60f32.to_radians(), 1.0, 0.05, 100.0);
        assert!(
            ScreenAabb::from_world_aabb(
                &aabb,
                &Transform3D::IDENTITY,
                &projection,
                Vec2::new(320.0, 180.0),
                Vec2::ZERO,
            )
            .is_none()
        );
    }

    #[test]
    fn tile_buffer_clears_to_infinity() {
        let mut buffer = TileBuffer::new();
        buffer.depth[3][7] = 1.5;
        buffer.clear();
        assert_eq!(buffer.depth[3][7], f32::INFINITY);
    }
}
