//! Error surface for the ECS layers.
//!
//! Precondition violations (dead entities, unregistered types, unknown
//! phases) are soft: callers observe a best-effort no-op plus an error value.
//! Scheduler construction violations (cycles, duplicate names) are fatal at
//! registration time and surface to the host as a failed `Result`.

use thiserror::Error;

use crate::ecs::entity::Entity;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EcsError {
    #[error("entity {0} is not alive")]
    DeadEntity(Entity),

    #[error("component type `{0}` is not registered")]
    UnknownComponent(String),

    #[error("component name `{0}` is already registered with a different type")]
    DuplicateComponent(String),

    #[error("unknown phase `{0}`")]
    UnknownPhase(String),

    #[error("phase `{0}` already exists")]
    DuplicatePhase(String),

    #[error("phase dependency cycle involving `{0}`")]
    PhaseCycle(String),

    #[error("duplicate system name `{0}`")]
    DuplicateSystem(String),

    #[error("unknown world handle")]
    UnknownWorld,

    #[error("unknown query handle")]
    UnknownQuery,

    #[error("command queue pool exhausted; command dropped")]
    CommandDropped,

    #[error("serialization failed for component `{0}`")]
    Serialization(String),

    #[error("component `{0}` carries no payload")]
    TagHasNoValue(String),
}
