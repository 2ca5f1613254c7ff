//! A high-throughput entity-component-system runtime for scene-graph
//! simulation.
//!
//! Worlds of entities carry typed (or tagged) components; systems iterate
//! them under a phased pipeline whose phases form a `DependsOn` DAG.
//! Parallel system execution is bridged to the single-threaded host
//! backends by a pooled, lock-free command queue drained at every phase
//! boundary. On top of the core sit:
//!
//! - a tile-binned software occlusion oracle producing per-tick `Occluded`
//!   tags ([`occlusion`]),
//! - the frustum-culling and deferred render flush systems ([`render`]),
//! - a replication layer mirroring entity state across peers on a fixed
//!   tick ([`net`]),
//! - per-system profiling and an editor debugger endpoint ([`debug`]),
//! - the process-wide [`server::Runtime`] hosts embed.
//!
//! # A minimal embedding
//!
//! ```rust,ignore
//! use turbine_engine::server::Runtime;
//!
//! let mut runtime = Runtime::new(space_backend, navigation_backend, 8);
//! let world = runtime.create_world("main", render_backend);
//!
//! runtime.register_component_type(world, "Health", false)?;
//! let player = runtime.create_entity(world)?;
//! runtime.attach(world, player, "Health", &health_bytes)?;
//!
//! loop {
//!     runtime.progress(world, delta)?;
//! }
//! ```

pub mod core;
pub mod debug;
pub mod ecs;
pub mod math;
pub mod net;
pub mod occlusion;
pub mod render;
pub mod server;

pub use ecs::{
    CommandQueue, Component, ComponentId, EcsError, Entity, Filter, Iter, Rid, SystemDesc,
    World, WorldId, phases,
};
pub use server::Runtime;
