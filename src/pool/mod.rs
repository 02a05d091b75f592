//! Pooled rendering engine with thread affinity
//!
//! At most one engine instance is alive per pool. It is created lazily,
//! reset between compatible uses and torn down when a fresh instance is
//! requested or an operation abandons it. Every call into the engine runs on
//! one dedicated affinity thread.

mod registry;
mod resource;
mod worker;

pub use registry::{InstanceId, InstanceRegistry, OperationId};
pub use resource::{AcquireMode, EngineHandle, Lease, Release, ResourcePool, AFFINITY_THREAD_NAME};
pub use worker::AffinityWorker;
