//! The tile occlusion oracle: triangle binning, a software min-depth
//! rasterizer, and screen-AABB visibility queries.
//!
//! The screen is divided into 32×32 pixel tiles. Each frame:
//!
//! 1. bins are cleared and occluder triangles are appended to every tile
//!    their screen bounds touch (per-tile queues, contention-free),
//! 2. tiles are rasterized in parallel; each tile is owned by exactly one
//!    worker while its depth image is written,
//! 3. occludees sample the finished depth image read-only.
//!
//! Visibility is conservative and fail-open: boxes outside the buffer, or
//! boxes whose projection collapses, are reported visible.

use std::sync::RwLock;

use crossbeam::queue::SegQueue;
use glam::{IVec2, Vec2, Vec3};

use crate::core::tasks::WorkerPool;
use crate::occlusion::tile::{ScreenAabb, ScreenTriangle, TILE_SIZE, TileBuffer};

/// Sample points per (tile ∩ box) rectangle: four corners plus the centre.
pub const SAMPLE_OFFSETS: [(f32, f32); 5] =
    [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0), (1.0, 1.0), (0.5, 0.5)];

/// Depth bias keeping occludees from z-fighting their own occluder
/// geometry.
pub const DEPTH_EPSILON: f32 = 0.01;

struct Inner {
    width: u32,
    height: u32,
    tiles_x: u32,
    tiles_y: u32,
    /// Per-tile triangle bins; appended under the read lock so parallel
    /// binning never contends on a shared list.
    bins: Vec<SegQueue<ScreenTriangle>>,
    buffers: Vec<TileBuffer>,
}

impl Inner {
    fn sized(width: u32, height: u32) -> Self {
        let tiles_x = width.div_ceil(TILE_SIZE).max(1);
        let tiles_y = height.div_ceil(TILE_SIZE).max(1);
        let count = (tiles_x * tiles_y) as usize;
        Self {
            width,
            height,
            tiles_x,
            tiles_y,
            bins: (0..count).map(|_| SegQueue::new()).collect(),
            buffers: vec![TileBuffer::new(); count],
        }
    }
}

/// Shared occlusion state consumed by the five-system occlusion chain.
pub struct TileOcclusionManager {
    inner: RwLock<Inner>,
}

impl TileOcclusionManager {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            inner: RwLock::new(Inner::sized(width, height)),
        }
    }

    /// Buffer dimensions in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        let inner = self.inner.read().expect("occlusion state poisoned");
        (inner.width, inner.height)
    }

    /// Tile grid dimensions.
    pub fn tile_counts(&self) -> (u32, u32) {
        let inner = self.inner.read().expect("occlusion state poisoned");
        (inner.tiles_x, inner.tiles_y)
    }

    /// Start a frame: clear bins, resizing the grid if the screen changed.
    pub fn reset(&self, width: u32, height: u32) {
        let mut inner = self.inner.write().expect("occlusion state poisoned");
        if inner.width != width || inner.height != height {
            *inner = Inner::sized(width, height);
            return;
        }
        for bin in &inner.bins {
            while bin.pop().is_some() {}
        }
    }

    /// Append triangles to every tile bin their bounds touch. Safe to call
    /// from many threads at once.
    pub fn bin_triangles(&self, triangles: &[ScreenTriangle]) {
        let inner = self.inner.read().expect("occlusion state poisoned");
        for tri in triangles {
            let (min, max) = tri.bounds();
            if max.x < 0.0 || max.y < 0.0 || min.x >= inner.width as f32 || min.y >= inner.height as f32
            {
                continue;
            }
            let min_tx = ((min.x.floor() as i32).max(0) as u32 / TILE_SIZE).min(inner.tiles_x - 1);
            let max_tx = ((max.x.ceil() as i32).max(0) as u32 / TILE_SIZE).min(inner.tiles_x - 1);
            let min_ty = ((min.y.floor() as i32).max(0) as u32 / TILE_SIZE).min(inner.tiles_y - 1);
            let max_ty = ((max.y.ceil() as i32).max(0) as u32 / TILE_SIZE).min(inner.tiles_y - 1);
            for ty in min_ty..=max_ty {
                for tx in min_tx..=max_tx {
                    inner.bins[(ty * inner.tiles_x + tx) as usize].push(*tri);
                }
            }
        }
    }

    /// Rasterize every binned triangle into its tile's depth image,
    /// parallel across tiles. Each tile is written by exactly one worker.
    pub fn rasterize(&self, pool: &WorkerPool) {
        let mut inner = self.inner.write().expect("occlusion state poisoned");
        let inner = &mut *inner;

        let triangles: Vec<Vec<ScreenTriangle>> = inner
            .bins
            .iter()
            .map(|bin| {
                let mut tris = Vec::new();
                while let Some(tri) = bin.pop() {
                    tris.push(tri);
                }
                tris
            })
            .collect();

        // One dispatch task per contiguous run of tiles; `chunks_mut` hands
        // each task exclusive ownership of its buffers.
        let tiles_x = inner.tiles_x;
        let chunk = (inner.buffers.len() / pool.size().max(1)).max(1);
        let tasks: Vec<crate::core::tasks::GroupTask<'_>> = inner
            .buffers
            .chunks_mut(chunk)
            .zip(triangles.chunks(chunk))
            .enumerate()
            .map(|(chunk_index, (buffers, tris))| {
                Box::new(move || {
                    for (offset, (buffer, tris)) in buffers.iter_mut().zip(tris).enumerate() {
                        let index = (chunk_index * chunk + offset) as u32;
                        let origin = IVec2::new(
                            (index % tiles_x * TILE_SIZE) as i32,
                            (index / tiles_x * TILE_SIZE) as i32,
                        );
                        buffer.clear();
                        for tri in tris {
                            rasterize_triangle_to_tile(tri, buffer, origin);
                        }
                    }
                }) as crate::core::tasks::GroupTask<'_>
            })
            .collect();
        pool.run_group(tasks);
    }

    /// Is the box potentially visible against the current depth image?
    ///
    /// Samples up to [`SAMPLE_OFFSETS`] points per touched tile; the box is
    /// visible if any sample finds it closer than the recorded depth minus
    /// [`DEPTH_EPSILON`]. Boxes outside the buffer are visible (fail-open).
    pub fn is_visible(&self, aabb: &ScreenAabb) -> bool {
        let inner = self.inner.read().expect("occlusion state poisoned");
        let width = inner.width as i32;
        let height = inner.height as i32;

        if aabb.max.x < 0 || aabb.max.y < 0 || aabb.min.x >= width || aabb.min.y >= height {
            return true;
        }

        let min = aabb.min.clamp(IVec2::ZERO, IVec2::new(width - 1, height - 1));
        let max = aabb.max.clamp(IVec2::ZERO, IVec2::new(width - 1, height - 1));

        let tile = TILE_SIZE as i32;
        for ty in (min.y / tile)..=(max.y / tile) {
            for tx in (min.x / tile)..=(max.x / tile) {
                let buffer = &inner.buffers[(ty as u32 * inner.tiles_x + tx as u32) as usize];
                let origin = IVec2::new(tx * tile, ty * tile);
                // The part of the box inside this tile.
                let lo = min.max(origin);
                let hi = max.min(origin + IVec2::splat(tile - 1));
                for (ox, oy) in SAMPLE_OFFSETS {
                    let sx = lo.x + ((hi.x - lo.x) as f32 * ox) as i32 - origin.x;
                    let sy = lo.y + ((hi.y - lo.y) as f32 * oy) as i32 - origin.y;
                    if aabb.min_z < buffer.depth[sy as usize][sx as usize] - DEPTH_EPSILON {
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Depth at a pixel, for diagnostics and tests.
    pub fn depth_at(&self, x: u32, y: u32) -> Option<f32> {
        let inner = self.inner.read().expect("occlusion state poisoned");
        if x >= inner.width || y >= inner.height {
            return None;
        }
        let buffer = &inner.buffers[(y / TILE_SIZE * inner.tiles_x + x / TILE_SIZE) as usize];
        Some(buffer.depth[(y % TILE_SIZE) as usize][(x % TILE_SIZE) as usize])
    }
}

/// Barycentric coordinates of `point` in the triangle, or `None` when the
/// denominator collapses (degenerate triangle: no pixels written).
fn barycentric(point: Vec2, v0: Vec2, v1: Vec2, v2: Vec2) -> Option<Vec3> {
    let e0 = v1 - v0;
    let e1 = v2 - v0;
    let e2 = point - v0;
    let d00 = e0.dot(e0);
    let d01 = e0.dot(e1);
    let d11 = e1.dot(e1);
    let d20 = e2.dot(e0);
    let d21 = e2.dot(e1);
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() <= f32::EPSILON {
        return None;
    }
    let v = (d11 * d20 - d01 * d21) / denom;
    let w = (d00 * d21 - d01 * d20) / denom;
    Some(Vec3::new(1.0 - v - w, v, w))
}

#[inline]
fn inside(bary: Vec3) -> bool {
    bary.x >= 0.0 && bary.y >= 0.0 && bary.z >= 0.0
}

/// Scanline-rasterize one triangle into a tile's depth image, writing
/// min-depth at covered pixel centres.
fn rasterize_triangle_to_tile(tri: &ScreenTriangle, tile: &mut TileBuffer, origin: IVec2) {
    let v0 = tri.v0 - origin.as_vec2();
    let v1 = tri.v1 - origin.as_vec2();
    let v2 = tri.v2 - origin.as_vec2();

    let edge = TILE_SIZE as i32 - 1;
    let min_x = (v0.x.min(v1.x).min(v2.x).floor() as i32).clamp(0, edge);
    let max_x = (v0.x.max(v1.x).max(v2.x).ceil() as i32).clamp(0, edge);
    let min_y = (v0.y.min(v1.y).min(v2.y).floor() as i32).clamp(0, edge);
    let max_y = (v0.y.max(v1.y).max(v2.y).ceil() as i32).clamp(0, edge);

    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let centre = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let Some(bary) = barycentric(centre, v0, v1, v2) else {
                return;
            };
            if inside(bary) {
                let z = bary.x * tri.z0 + bary.y * tri.z1 + bary.z * tri.z2;
                let depth = &mut tile.depth[y as usize][x as usize];
                if z < *depth {
                    *depth = z;
                }
            }
        }
    }
}
