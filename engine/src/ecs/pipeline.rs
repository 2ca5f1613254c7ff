//! The phase DAG and its topological schedule.
//!
//! Phases are named stages related by `DependsOn` edges. Every tick the
//! world walks the phases in a topological order of that DAG and runs each
//! phase's systems; the order is total, so a system in a later phase
//! observes every effect of earlier phases (the command queue is drained at
//! each phase boundary).
//!
//! # Built-in phases
//!
//! The pipeline is born with the standard chain:
//!
//! ```text
//! OnLoad → PostLoad → PreUpdate → OnPhysicsUpdate → OnCollisions
//!        → OnUpdate → OnValidate → PostUpdate → PreStore → OnStore → PostFrame
//! ```
//!
//! Custom phases are created with an optional dependency on an existing
//! phase name; dependencies added later can in principle form a cycle, which
//! is rejected as a fatal scheduler error when the order is next computed.

use std::collections::HashMap;

use crate::ecs::error::EcsError;

/// Names of the built-in phases.
pub mod phases {
    pub const ON_LOAD: &str = "OnLoad";
    pub const POST_LOAD: &str = "PostLoad";
    pub const PRE_UPDATE: &str = "PreUpdate";
    pub const ON_PHYSICS_UPDATE: &str = "OnPhysicsUpdate";
    pub const ON_COLLISIONS: &str = "OnCollisions";
    pub const ON_UPDATE: &str = "OnUpdate";
    pub const ON_VALIDATE: &str = "OnValidate";
    pub const POST_UPDATE: &str = "PostUpdate";
    pub const PRE_STORE: &str = "PreStore";
    pub const ON_STORE: &str = "OnStore";
    pub const POST_FRAME: &str = "PostFrame";

    /// The built-in chain, in dependency order.
    pub const BUILT_IN: [&str; 11] = [
        ON_LOAD,
        POST_LOAD,
        PRE_UPDATE,
        ON_PHYSICS_UPDATE,
        ON_COLLISIONS,
        ON_UPDATE,
        ON_VALIDATE,
        POST_UPDATE,
        PRE_STORE,
        ON_STORE,
        POST_FRAME,
    ];
}

/// Opaque phase handle; index into the pipeline's phase table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhaseId(u32);

impl PhaseId {
    #[inline]
    pub(crate) const fn new(index: u32) -> Self {
        Self(index)
    }

    #[inline]
    pub const fn index(&self) -> usize {
        self.0 as usize
    }
}

struct PhaseNode {
    name: String,
    depends_on: Vec<PhaseId>,
}

/// The per-world phase DAG.
pub struct Pipeline {
    nodes: Vec<PhaseNode>,
    by_name: HashMap<String, PhaseId>,
    /// Cached topological order; rebuilt when edges change.
    order: Vec<PhaseId>,
    dirty: bool,
}

impl Pipeline {
    /// A pipeline pre-populated with the built-in phase chain.
    pub fn new() -> Self {
        let mut pipeline = Self {
            nodes: Vec::new(),
            by_name: HashMap::new(),
            order: Vec::new(),
            dirty: true,
        };
        let mut previous: Option<&str> = None;
        for name in phases::BUILT_IN {
            pipeline
                .create_phase(name, previous)
                .expect("built-in phases are unique");
            previous = Some(name);
        }
        pipeline
    }

    /// Create a phase, optionally depending on an existing phase.
    pub fn create_phase(
        &mut self,
        name: &str,
        depends_on: Option<&str>,
    ) -> Result<PhaseId, EcsError> {
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicatePhase(name.to_string()));
        }
        let depends_on = match depends_on {
            Some(dep) => vec![self.id_of(dep)?],
            None => Vec::new(),
        };
        let id = PhaseId::new(self.nodes.len() as u32);
        self.nodes.push(PhaseNode {
            name: name.to_string(),
            depends_on,
        });
        self.by_name.insert(name.to_string(), id);
        self.dirty = true;
        Ok(id)
    }

    /// Add a `DependsOn` edge between existing phases.
    pub fn add_dependency(&mut self, phase: &str, depends_on: &str) -> Result<(), EcsError> {
        let phase = self.id_of(phase)?;
        let dep = self.id_of(depends_on)?;
        let node = &mut self.nodes[phase.index()];
        if !node.depends_on.contains(&dep) {
            node.depends_on.push(dep);
            self.dirty = true;
        }
        Ok(())
    }

    /// Resolve a phase name.
    pub fn id_of(&self, name: &str) -> Result<PhaseId, EcsError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| EcsError::UnknownPhase(name.to_string()))
    }

    pub fn name_of(&self, id: PhaseId) -> &str {
        &self.nodes[id.index()].name
    }

    pub fn phase_count(&self) -> usize {
        self.nodes.len()
    }

    /// The topological order over phases: a linear extension of the
    /// `DependsOn` relation, stable by creation order among peers.
    ///
    /// A dependency cycle is a scheduler violation and fatal.
    pub fn topological_order(&mut self) -> Result<&[PhaseId], EcsError> {
        if !self.dirty {
            return Ok(&self.order);
        }

        // Kahn's algorithm. Ready phases are visited in creation order so
        // the schedule is deterministic across runs.
        let count = self.nodes.len();
        let mut in_degree = vec![0usize; count];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (index, node) in self.nodes.iter().enumerate() {
            in_degree[index] = node.depends_on.len();
            for dep in &node.depends_on {
                dependents[dep.index()].push(index);
            }
        }

        let mut ready: Vec<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(&index) = ready.first() {
            ready.remove(0);
            order.push(PhaseId::new(index as u32));
            for &dependent in &dependents[index] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    // Keep creation order among newly ready phases.
                    let at = ready.partition_point(|&r| r < dependent);
                    ready.insert(at, dependent);
                }
            }
        }

        if order.len() != count {
            let culprit = (0..count)
                .find(|&i| in_degree[i] > 0)
                .map(|i| self.nodes[i].name.clone())
                .unwrap_or_default();
            return Err(EcsError::PhaseCycle(culprit));
        }

        self.order = order;
        self.dirty = false;
        Ok(&self.order)
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position_of(order: &[PhaseId], pipeline: &Pipeline, name: &str) -> usize {
        order
            .iter()
            .position(|&id| pipeline.name_of(id) == name)
            .unwrap_or_else(|| panic!("phase {name} missing from order"))
    }

    #[test]
    fn built_in_chain_orders_linearly() {
        // Given
        let mut pipeline = Pipeline::new();

        // When
        let order = pipeline.topological_order().unwrap().to_vec();

        // Then: the built-in chain appears in dependency order
        let mut last = 0;
        for name in phases::BUILT_IN {
            let at = position_of(&order, &pipeline, name);
            assert!(at >= last, "{name} scheduled out of order");
            last = at;
        }
    }

    #[test]
    fn custom_phase_orders_after_dependency() {
        // Given
        let mut pipeline = Pipeline::new();
        pipeline.create_phase("A", None).unwrap();
        pipeline.create_phase("B", Some("A")).unwrap();

        // When
        let order = pipeline.topological_order().unwrap().to_vec();

        // Then
        let a = position_of(&order, &pipeline, "A");
        let b = position_of(&order, &pipeline, "B");
        assert!(a < b);
    }

    #[test]
    fn dependency_is_transitive_through_chain() {
        // Given: C -> B -> A
        let mut pipeline = Pipeline::new();
        pipeline.create_phase("A", Some(phases::ON_UPDATE)).unwrap();
        pipeline.create_phase("B", Some("A")).unwrap();
        pipeline.create_phase("C", Some("B")).unwrap();

        // When
        let order = pipeline.topological_order().unwrap().to_vec();

        // Then
        let update = position_of(&order, &pipeline, phases::ON_UPDATE);
        let a = position_of(&order, &pipeline, "A");
        let b = position_of(&order, &pipeline, "B");
        let c = position_of(&order, &pipeline, "C");
        assert!(update < a && a < b && b < c);
    }

    #[test]
    fn duplicate_phase_is_rejected() {
        let mut pipeline = Pipeline::new();
        pipeline.create_phase("Custom", None).unwrap();
        assert!(matches!(
            pipeline.create_phase("Custom", None),
            Err(EcsError::DuplicatePhase(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut pipeline = Pipeline::new();
        assert!(matches!(
            pipeline.create_phase("Custom", Some("Nope")),
            Err(EcsError::UnknownPhase(_))
        ));
    }

    #[test]
    fn cycle_is_fatal() {
        // Given: A -> B plus a back edge B -> A
        let mut pipeline = Pipeline::new();
        pipeline.create_phase("A", None).unwrap();
        pipeline.create_phase("B", Some("A")).unwrap();
        pipeline.add_dependency("A", "B").unwrap();

        // Then
        assert!(matches!(
            pipeline.topological_order(),
            Err(EcsError::PhaseCycle(_))
        ));
    }

    #[test]
    fn order_is_a_linear_extension_of_depends_on() {
        // Given a diamond: D depends on B and C, both depend on A
        let mut pipeline = Pipeline::new();
        pipeline.create_phase("A", None).unwrap();
        pipeline.create_phase("B", Some("A")).unwrap();
        pipeline.create_phase("C", Some("A")).unwrap();
        pipeline.create_phase("D", Some("B")).unwrap();
        pipeline.add_dependency("D", "C").unwrap();

        // When
        let order = pipeline.topological_order().unwrap().to_vec();

        // Then: every edge points forward in the order
        let a = position_of(&order, &pipeline, "A");
        let b = position_of(&order, &pipeline, "B");
        let c = position_of(&order, &pipeline, "C");
        let d = position_of(&order, &pipeline, "D");
        assert!(a < b && a < c && b < d && c < d);
    }
}
