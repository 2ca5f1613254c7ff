//! The entity-component-system core: handles, storage, queries, commands,
//! systems, and the phased pipeline.

pub mod command;
pub mod component;
pub mod entity;
pub mod error;
pub mod handle;
pub mod pipeline;
pub mod query;
pub mod storage;
pub mod system;
pub mod world;

pub use command::{CommandQueue, EnqueueResult};
pub use component::{Component, ComponentId};
pub use entity::Entity;
pub use error::EcsError;
pub use handle::{HandleRegistry, Rid};
pub use pipeline::{PhaseId, Pipeline, phases};
pub use query::{Filter, Query};
pub use system::{Iter, SystemDesc};
pub use world::{World, World3D, WorldId};
