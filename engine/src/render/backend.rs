//! Host backend capability traits.
//!
//! The core never talks to a rendering, physics, or navigation API
//! directly. Hosts hand in implementations of these traits at init; the
//! core consumes them only through opaque [`Rid`] handles, and only from the
//! main thread: every call site is inside the command-queue drain or world
//! setup, both of which hold `&mut World`.
//!
//! Invalid handles are soft failures: the mutating calls return `false` and
//! the caller logs once per RID.

use crate::ecs::handle::{HandleRegistry, Rid};
use crate::math::Transform3D;

/// RGBA color, linear.
pub type Color = [f32; 4];

/// The rendering host: instances, multimeshes, cameras, canvases.
pub trait RenderBackend: Send {
    fn instance_create(&mut self, base: Rid, scenario: Rid) -> Rid;
    fn instance_set_transform(&mut self, instance: Rid, transform: Transform3D) -> bool;

    fn multimesh_create(&mut self) -> Rid;
    fn multimesh_allocate_data(&mut self, multimesh: Rid, instance_count: u32) -> bool;
    fn multimesh_instance_set_transform(
        &mut self,
        multimesh: Rid,
        index: u32,
        transform: Transform3D,
    ) -> bool;
    fn multimesh_instance_set_color(&mut self, multimesh: Rid, index: u32, color: Color) -> bool;
    fn multimesh_get_instance_count(&self, multimesh: Rid) -> u32;

    fn camera_create(&mut self) -> Rid;
    fn canvas_item_create(&mut self) -> Rid;
    fn scenario_create(&mut self) -> Rid;
    fn environment_create(&mut self) -> Rid;

    fn free(&mut self, rid: Rid);
}

/// The physics host; the core only creates and tears down spaces.
pub trait SpaceBackend: Send {
    fn space_create(&mut self) -> Rid;
    fn free(&mut self, rid: Rid);
}

/// The navigation host; the core only creates and tears down maps.
pub trait NavigationBackend: Send {
    fn map_create(&mut self) -> Rid;
    fn free(&mut self, rid: Rid);
}

/// Every call a [`RecordingBackend`] has observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderCall {
    InstanceSetTransform {
        instance: Rid,
        transform: Transform3D,
    },
    MultimeshAllocate {
        multimesh: Rid,
        instance_count: u32,
    },
    MultimeshInstanceSetTransform {
        multimesh: Rid,
        index: u32,
        transform: Transform3D,
    },
    MultimeshInstanceSetColor {
        multimesh: Rid,
        index: u32,
        color: Color,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Instance,
    Multimesh { instance_count: u32 },
    Camera,
    CanvasItem,
    Scenario,
    Environment,
}

/// An in-memory backend for tests: validates handles through a real slot
/// registry and records every mutating call.
///
/// Clones share state, so a test can keep one handle while the world owns
/// another.
#[derive(Default, Clone)]
pub struct RecordingBackend {
    resources: std::sync::Arc<HandleRegistry<Resource>>,
    calls: std::sync::Arc<std::sync::Mutex<Vec<RenderCall>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<RenderCall> {
        self.calls.lock().expect("call log poisoned").clone()
    }

    fn record(&self, call: RenderCall) {
        self.calls.lock().expect("call log poisoned").push(call);
    }

    /// Count of `multimesh_instance_set_transform` calls for one multimesh.
    pub fn multimesh_transform_updates(&self, multimesh: Rid) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(call, RenderCall::MultimeshInstanceSetTransform { multimesh: m, .. } if *m == multimesh)
            })
            .count()
    }

    /// Count of `instance_set_transform` calls for one instance.
    pub fn instance_transform_updates(&self, instance: Rid) -> usize {
        self.calls()
            .iter()
            .filter(|call| {
                matches!(call, RenderCall::InstanceSetTransform { instance: i, .. } if *i == instance)
            })
            .count()
    }
}

impl RenderBackend for RecordingBackend {
    fn instance_create(&mut self, _base: Rid, _scenario: Rid) -> Rid {
        self.resources.insert(Resource::Instance)
    }

    fn instance_set_transform(&mut self, instance: Rid, transform: Transform3D) -> bool {
        if !self.resources.contains(instance) {
            return false;
        }
        self.record(RenderCall::InstanceSetTransform {
            instance,
            transform,
        });
        true
    }

    fn multimesh_create(&mut self) -> Rid {
        self.resources.insert(Resource::Multimesh { instance_count: 0 })
    }

    fn multimesh_allocate_data(&mut self, multimesh: Rid, instance_count: u32) -> bool {
        let updated = self
            .resources
            .with_mut(multimesh, |resource| {
                *resource = Resource::Multimesh { instance_count };
            })
            .is_some();
        if updated {
            self.record(RenderCall::MultimeshAllocate {
                multimesh,
                instance_count,
            });
        }
        updated
    }

    fn multimesh_instance_set_transform(
        &mut self,
        multimesh: Rid,
        index: u32,
        transform: Transform3D,
    ) -> bool {
        let valid = self
            .resources
            .with(multimesh, |resource| {
                matches!(resource, Resource::Multimesh { instance_count } if index < *instance_count)
            })
            .unwrap_or(false);
        if valid {
            self.record(RenderCall::MultimeshInstanceSetTransform {
                multimesh,
                index,
                transform,
            });
        }
        valid
    }

    fn multimesh_instance_set_color(&mut self, multimesh: Rid, index: u32, color: Color) -> bool {
        let valid = self
            .resources
            .with(multimesh, |resource| {
                matches!(resource, Resource::Multimesh { instance_count } if index < *instance_count)
            })
            .unwrap_or(false);
        if valid {
            self.record(RenderCall::MultimeshInstanceSetColor {
                multimesh,
                index,
                color,
            });
        }
        valid
    }

    fn multimesh_get_instance_count(&self, multimesh: Rid) -> u32 {
        self.resources
            .with(multimesh, |resource| match resource {
                Resource::Multimesh { instance_count } => *instance_count,
                _ => 0,
            })
            .unwrap_or(0)
    }

    fn camera_create(&mut self) -> Rid {
        self.resources.insert(Resource::Camera)
    }

    fn canvas_item_create(&mut self) -> Rid {
        self.resources.insert(Resource::CanvasItem)
    }

    fn scenario_create(&mut self) -> Rid {
        self.resources.insert(Resource::Scenario)
    }

    fn environment_create(&mut self) -> Rid {
        self.resources.insert(Resource::Environment)
    }

    fn free(&mut self, rid: Rid) {
        self.resources.remove(rid);
    }
}

/// An in-memory physics space host for tests and headless runs.
#[derive(Default)]
pub struct RecordingSpaceBackend {
    spaces: HandleRegistry<()>,
}

impl SpaceBackend for RecordingSpaceBackend {
    fn space_create(&mut self) -> Rid {
        self.spaces.insert(())
    }

    fn free(&mut self, rid: Rid) {
        self.spaces.remove(rid);
    }
}

/// An in-memory navigation host for tests and headless runs.
#[derive(Default)]
pub struct RecordingNavigationBackend {
    maps: HandleRegistry<()>,
}

impl NavigationBackend for RecordingNavigationBackend {
    fn map_create(&mut self) -> Rid {
        self.maps.insert(())
    }

    fn free(&mut self, rid: Rid) {
        self.maps.remove(rid);
    }
}
