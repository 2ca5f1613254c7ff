//! Process-level services shared by every world: the worker pool.

pub mod tasks;

pub use tasks::WorkerPool;
