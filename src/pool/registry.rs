//! Registry of live engine instances

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Identifier of one engine instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine-{}", self.0)
    }
}

/// Identifier of one pool acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Wrap a raw operation number
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct InstanceRecord {
    owner: Option<OperationId>,
    created_at: Instant,
}

/// Live instances and the operation currently holding each
///
/// Entries are added when an engine is created and removed when it is torn
/// down, so the registry never outlives the instances it describes.
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    instances: DashMap<InstanceId, InstanceRecord>,
    next_id: AtomicU64,
}

impl InstanceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new instance owned by `owner`
    pub fn register(&self, owner: OperationId) -> InstanceId {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.instances.insert(
            id,
            InstanceRecord {
                owner: Some(owner),
                created_at: Instant::now(),
            },
        );
        id
    }

    /// Hand an unowned (or already owned) instance to `owner`
    ///
    /// Returns `false` if the instance is unknown or held by another operation.
    pub fn claim(&self, id: InstanceId, owner: OperationId) -> bool {
        match self.instances.get_mut(&id) {
            Some(mut record) if record.owner.map_or(true, |held| held == owner) => {
                record.owner = Some(owner);
                true
            }
            _ => false,
        }
    }

    /// Mark an instance as free for reuse
    pub fn release(&self, id: InstanceId) {
        if let Some(mut record) = self.instances.get_mut(&id) {
            record.owner = None;
        }
    }

    /// Forget a torn-down instance
    pub fn remove(&self, id: InstanceId) -> bool {
        self.instances.remove(&id).is_some()
    }

    /// Operation currently holding `id`
    #[must_use]
    pub fn owner(&self, id: InstanceId) -> Option<OperationId> {
        self.instances.get(&id).and_then(|record| record.owner)
    }

    /// Whether `id` is held by an operation other than `operation`
    #[must_use]
    pub fn conflicts(&self, id: InstanceId, operation: OperationId) -> bool {
        self.owner(id).is_some_and(|held| held != operation)
    }

    /// Whether `id` is still live
    #[must_use]
    pub fn contains(&self, id: InstanceId) -> bool {
        self.instances.contains_key(&id)
    }

    /// How long `id` has been live
    #[must_use]
    pub fn age(&self, id: InstanceId) -> Option<Duration> {
        self.instances.get(&id).map(|record| record.created_at.elapsed())
    }

    /// Number of live instances
    #[must_use]
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether no instance is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}
