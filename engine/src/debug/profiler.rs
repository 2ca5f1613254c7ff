//! Per-system timing aggregation served through the debugger endpoint.
//!
//! The pipeline samples every system run (total, min, max microseconds,
//! call and entity counts); this module rolls those samples up into
//! world-level snapshots.

use serde::Serialize;

use crate::ecs::world::World;

/// One system's metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub name: String,
    pub time_usec: u64,
    pub call_count: u64,
    pub entity_count: u64,
    pub min_usec: u64,
    pub max_usec: u64,
    pub paused: bool,
}

/// A world's aggregated profiler snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct WorldMetrics {
    pub total_time_usec: u64,
    pub system_count: usize,
    pub systems: Vec<SystemMetrics>,
}

/// Snapshot the profiler state of a world.
pub fn world_metrics(world: &World) -> WorldMetrics {
    let systems: Vec<SystemMetrics> = world
        .systems()
        .iter()
        .map(|system| {
            let stats = system.stats();
            SystemMetrics {
                name: system.name().to_string(),
                time_usec: stats.time_usec,
                call_count: stats.call_count,
                entity_count: stats.entity_count,
                min_usec: stats.min_usec,
                max_usec: stats.max_usec,
                paused: system.paused(),
            }
        })
        .collect();
    WorldMetrics {
        total_time_usec: systems.iter().map(|s| s.time_usec).sum(),
        system_count: systems.len(),
        systems,
    }
}
