//! Component identity and the per-world type registry.
//!
//! A component type is registered once per world and receives a dense
//! [`ComponentId`] used everywhere else: column indices in the store, bits in
//! scheduler access masks, and type ids on the wire. Registration carries a
//! stable name (the key used by host bindings and replication), an `is_tag`
//! flag for payload-less marker components, and optional serialize /
//! deserialize / inspect hooks.
//!
//! # Declaring components
//!
//! Rust-typed components implement [`Component`], usually through the
//! [`component!`] / [`tag!`] macros:
//!
//! ```rust,ignore
//! pub struct Health { pub hp: u32 }
//! component!(Health, "Health", serde);
//!
//! pub struct Frozen;
//! tag!(Frozen, "Frozen");
//! ```
//!
//! Hosts without a Rust type register *dynamic* components whose payload is
//! an opaque byte blob; the store keeps those in blob columns.
//!
//! # Concurrency
//!
//! Lookups are lock-free reads through sharded maps; registration takes a
//! short write lock on the info vector. A monotonically increasing version
//! invalidates cached queries when a new type appears.

use std::any::{Any, TypeId};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ecs::error::EcsError;

/// Dense per-world component type id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(u32);

impl ComponentId {
    #[inline]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Index into dense per-type arrays (columns, access masks).
    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }

    /// The raw id; stable within a world, used as the wire type id.
    #[inline]
    pub const fn raw(&self) -> u32 {
        self.0
    }
}

/// A type-erased component value in transit (command queue, wire decode).
pub type ErasedValue = Box<dyn Any + Send + Sync>;

/// A statically-typed component.
///
/// `NAME` is the stable registration key. Tags set `IS_TAG` and store no
/// payload; pair-flavored components (directed entity relations such as
/// `ChildOf`) set `IS_PAIR` so the debugger reports them as pairs.
pub trait Component: Send + Sync + 'static {
    const NAME: &'static str;
    const IS_TAG: bool = false;
    const IS_PAIR: bool = false;
}

/// Implement [`Component`] for a payload-carrying type.
///
/// The `serde` form additionally marks the type as wire-capable when
/// registered with [`Registry::register_serde`].
#[macro_export]
macro_rules! component {
    ($ty:ty, $name:literal) => {
        impl $crate::ecs::component::Component for $ty {
            const NAME: &'static str = $name;
        }
    };
    ($ty:ty, $name:literal, pair) => {
        impl $crate::ecs::component::Component for $ty {
            const NAME: &'static str = $name;
            const IS_PAIR: bool = true;
        }
    };
}

/// Implement [`Component`] for a payload-less tag type.
#[macro_export]
macro_rules! tag {
    ($ty:ty, $name:literal) => {
        impl $crate::ecs::component::Component for $ty {
            const NAME: &'static str = $name;
            const IS_TAG: bool = true;
        }
    };
}

/// Serialize hook: erased value reference to wire bytes.
pub type SerializeFn = fn(&dyn Any) -> Option<Vec<u8>>;
/// Deserialize hook: wire bytes to an erased value.
pub type DeserializeFn = fn(&[u8]) -> Option<ErasedValue>;
/// Inspect hook: erased value reference to a debugger dictionary.
pub type InspectFn = fn(&dyn Any) -> serde_json::Value;
/// Column constructor: builds the dense payload storage for this type.
pub type NewDataFn = fn() -> Box<dyn crate::ecs::storage::ColumnData>;

/// Everything the engine knows about a registered component type.
#[derive(Clone)]
pub struct ComponentInfo {
    pub id: ComponentId,
    pub name: String,
    pub is_tag: bool,
    pub is_pair: bool,
    /// `None` for dynamic (blob) components.
    pub type_id: Option<TypeId>,
    pub serialize: Option<SerializeFn>,
    pub deserialize: Option<DeserializeFn>,
    pub inspect: Option<InspectFn>,
    /// `None` for tags, which store no payload.
    pub new_data: Option<NewDataFn>,
}

impl ComponentInfo {
    /// Whether this type can cross the wire.
    #[inline]
    pub fn is_wire_capable(&self) -> bool {
        self.is_tag || (self.serialize.is_some() && self.deserialize.is_some())
    }
}

fn serialize_value<T: Component + Serialize>(value: &dyn Any) -> Option<Vec<u8>> {
    let value = value.downcast_ref::<T>()?;
    bincode::serialize(value).ok()
}

fn deserialize_value<T: Component + DeserializeOwned>(bytes: &[u8]) -> Option<ErasedValue> {
    let value: T = bincode::deserialize(bytes).ok()?;
    Some(Box::new(value))
}

fn inspect_value<T: Component + Serialize>(value: &dyn Any) -> serde_json::Value {
    value
        .downcast_ref::<T>()
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or(serde_json::Value::Null)
}

/// Per-world component type registry.
pub struct Registry {
    by_type: DashMap<TypeId, ComponentId>,
    by_name: DashMap<String, ComponentId>,
    infos: RwLock<Vec<ComponentInfo>>,
    /// Bumped on every registration; query caches key off this.
    version: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_type: DashMap::new(),
            by_name: DashMap::new(),
            infos: RwLock::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Register a Rust-typed component without wire support.
    pub fn register<T: Component>(&self) -> Result<ComponentId, EcsError> {
        self.register_inner::<T>(None, None, None)
    }

    /// Register a Rust-typed component with serde-backed wire + inspect
    /// support.
    pub fn register_serde<T>(&self) -> Result<ComponentId, EcsError>
    where
        T: Component + Serialize + DeserializeOwned,
    {
        self.register_inner::<T>(
            Some(serialize_value::<T>),
            Some(deserialize_value::<T>),
            Some(inspect_value::<T>),
        )
    }

    fn register_inner<T: Component>(
        &self,
        serialize: Option<SerializeFn>,
        deserialize: Option<DeserializeFn>,
        inspect: Option<InspectFn>,
    ) -> Result<ComponentId, EcsError> {
        let type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_type.get(&type_id) {
            return Ok(*existing);
        }
        if self.by_name.contains_key(T::NAME) {
            return Err(EcsError::DuplicateComponent(T::NAME.to_string()));
        }

        let mut infos = self.infos.write().expect("component registry poisoned");
        let id = ComponentId::new(infos.len() as u32);
        infos.push(ComponentInfo {
            id,
            name: T::NAME.to_string(),
            is_tag: T::IS_TAG,
            is_pair: T::IS_PAIR,
            type_id: Some(type_id),
            serialize,
            deserialize,
            inspect,
            new_data: if T::IS_TAG {
                None
            } else {
                Some(crate::ecs::storage::new_typed_data::<T>)
            },
        });
        drop(infos);

        self.by_type.insert(type_id, id);
        self.by_name.insert(T::NAME.to_string(), id);
        self.version.fetch_add(1, Ordering::Release);
        Ok(id)
    }

    /// Register a dynamic component whose payload is an opaque byte blob
    /// (or nothing, for `is_tag`). This is the host-facing
    /// `register_component_type` path.
    pub fn register_dynamic(&self, name: &str, is_tag: bool) -> Result<ComponentId, EcsError> {
        if let Some(existing) = self.by_name.get(name) {
            let infos = self.infos.read().expect("component registry poisoned");
            let info = &infos[existing.index()];
            if info.type_id.is_none() && info.is_tag == is_tag {
                return Ok(*existing);
            }
            return Err(EcsError::DuplicateComponent(name.to_string()));
        }

        let mut infos = self.infos.write().expect("component registry poisoned");
        let id = ComponentId::new(infos.len() as u32);
        infos.push(ComponentInfo {
            id,
            name: name.to_string(),
            is_tag,
            is_pair: false,
            type_id: None,
            serialize: None,
            deserialize: None,
            inspect: None,
            new_data: if is_tag {
                None
            } else {
                Some(crate::ecs::storage::new_blob_data)
            },
        });
        drop(infos);

        self.by_name.insert(name.to_string(), id);
        self.version.fetch_add(1, Ordering::Release);
        Ok(id)
    }

    /// Resolve a registered Rust type.
    pub fn id_of<T: Component>(&self) -> Option<ComponentId> {
        self.by_type.get(&TypeId::of::<T>()).map(|id| *id)
    }

    /// Resolve a registered name.
    pub fn id_by_name(&self, name: &str) -> Option<ComponentId> {
        self.by_name.get(name).map(|id| *id)
    }

    /// Copy of the info for a component id.
    pub fn info(&self, id: ComponentId) -> Option<ComponentInfo> {
        self.infos
            .read()
            .expect("component registry poisoned")
            .get(id.index())
            .cloned()
    }

    /// Copy of every registered info, ordered by id.
    pub fn infos(&self) -> Vec<ComponentInfo> {
        self.infos.read().expect("component registry poisoned").clone()
    }

    /// Number of registered types.
    pub fn len(&self) -> usize {
        self.infos.read().expect("component registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registration version; bumped whenever a type is added.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
