//! Exclusive, lazily-created engine instance

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use static_assertions::assert_impl_all;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::engine::{EngineFactory, RenderingEngine};
use crate::{Result, SnareError};

use super::{AffinityWorker, InstanceId, InstanceRegistry, OperationId};

/// Name of the thread every engine operation runs on
pub const AFFINITY_THREAD_NAME: &str = "snare-affinity";

/// How an acquisition treats an existing instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireMode {
    /// Always start from a newly created instance
    Fresh,
    /// Reuse a released instance if one is live
    Reuse,
}

/// What happens to the instance when a lease ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Restore neutral state and keep the instance for the next caller
    Reset,
    /// Tear the instance down
    Destroy,
}

/// Engine state owned by the affinity thread
pub struct EngineSlot {
    factory: Arc<dyn EngineFactory>,
    registry: Arc<InstanceRegistry>,
    current: Option<(InstanceId, Box<dyn RenderingEngine>)>,
}

impl EngineSlot {
    fn new(factory: Arc<dyn EngineFactory>, registry: Arc<InstanceRegistry>) -> Self {
        Self {
            factory,
            registry,
            current: None,
        }
    }

    fn acquire(&mut self, operation: OperationId, mode: AcquireMode) -> Result<InstanceId> {
        if let Some(id) = self.current_id() {
            if mode == AcquireMode::Fresh || self.registry.conflicts(id, operation) {
                info!("Evicting {} before {}", id, operation);
                self.destroy_current()?;
            } else if self.registry.claim(id, operation) {
                debug!("Reusing {} for {}", id, operation);
                return Ok(id);
            } else {
                warn!("Dropping unregistered {}", id);
                self.destroy_current()?;
            }
        }

        let engine = self.factory.create()?;
        let id = self.registry.register(operation);
        info!(
            "Created {} engine {} for {}",
            self.factory.name(),
            id,
            operation
        );
        self.current = Some((id, engine));
        Ok(id)
    }

    fn engine(&mut self, id: InstanceId) -> Result<&mut dyn RenderingEngine> {
        match &mut self.current {
            Some((current, engine)) if *current == id => Ok(engine.as_mut()),
            _ => Err(SnareError::unavailable(format!("{id} is no longer live"))),
        }
    }

    fn release(&mut self, id: InstanceId, how: Release) -> Result<()> {
        if self.current_id() != Some(id) {
            debug!("{} already gone at release", id);
            return Ok(());
        }

        match how {
            Release::Reset => {
                let reset = self.engine(id).and_then(|engine| engine.reset());
                match reset {
                    Ok(()) => {
                        self.registry.release(id);
                        debug!("Reset {}", id);
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Reset of {} failed, destroying: {}", id, e);
                        self.destroy_current()?;
                        Err(e)
                    }
                }
            }
            Release::Destroy => self.destroy_current(),
        }
    }

    fn abandon(&mut self, operation: OperationId) {
        if let Some(id) = self.current_id() {
            if self.registry.owner(id) == Some(operation) {
                if let Err(e) = self.destroy_current() {
                    warn!("Failed to destroy abandoned {}: {}", id, e);
                }
            }
        }
    }

    fn default_user_agent(&mut self) -> Result<Option<String>> {
        if let Some((_, engine)) = &self.current {
            return Ok(engine.default_user_agent());
        }

        let mut engine = self.factory.create()?;
        let user_agent = engine.default_user_agent();
        if let Err(e) = engine.destroy() {
            warn!("Failed to destroy probe engine: {}", e);
        }
        Ok(user_agent)
    }

    fn current_id(&self) -> Option<InstanceId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    fn destroy_current(&mut self) -> Result<()> {
        let Some((id, mut engine)) = self.current.take() else {
            return Ok(());
        };

        let age = self.registry.age(id).unwrap_or_default();
        self.registry.remove(id);
        let result = engine.destroy();
        match &result {
            Ok(()) => info!("Destroyed {} after {:?}", id, age),
            Err(e) => warn!("Destroying {} failed: {}", id, e),
        }
        result
    }
}

/// Single engine instance shared by all operations
///
/// One async mutex admits one lease at a time, in arrival order. Every engine
/// call is marshaled onto the affinity thread.
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    worker: AffinityWorker<EngineSlot>,
    lock: Arc<Mutex<()>>,
    registry: Arc<InstanceRegistry>,
    next_operation: AtomicU64,
    backend: &'static str,
}

assert_impl_all!(ResourcePool: Send, Sync);
assert_impl_all!(Lease: Send);
assert_impl_all!(EngineHandle: Send, Sync);

impl ResourcePool {
    /// Start the affinity thread for engines built by `factory`
    ///
    /// # Errors
    ///
    /// Returns error if the affinity thread cannot be spawned
    pub fn new(factory: Arc<dyn EngineFactory>) -> Result<Self> {
        let registry = Arc::new(InstanceRegistry::new());
        let backend = factory.name();

        let slot_registry = Arc::clone(&registry);
        let worker = AffinityWorker::spawn(AFFINITY_THREAD_NAME, move || {
            EngineSlot::new(factory, slot_registry)
        })?;

        Ok(Self {
            inner: Arc::new(PoolInner {
                worker,
                lock: Arc::new(Mutex::new(())),
                registry,
                next_operation: AtomicU64::new(0),
                backend,
            }),
        })
    }

    /// Wait for exclusive access and bind an engine instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance could not be created or a stale one could
    /// not be torn down
    pub async fn acquire(&self, mode: AcquireMode) -> Result<Lease> {
        let guard = Arc::clone(&self.inner.lock).lock_owned().await;
        let operation =
            OperationId::new(self.inner.next_operation.fetch_add(1, Ordering::Relaxed) + 1);

        let mut pending = PendingAcquire {
            worker: self.inner.worker.clone(),
            operation,
            armed: true,
        };
        let instance = self
            .inner
            .worker
            .call(move |slot| slot.acquire(operation, mode))
            .await??;
        pending.armed = false;

        debug!("{} holds {}", operation, instance);
        Ok(Lease {
            pool: self.clone(),
            instance,
            operation,
            released: false,
            _guard: guard,
        })
    }

    /// Default identity string of the engine, without taking the lease lock
    ///
    /// # Errors
    ///
    /// Returns error if a probe engine could not be created
    pub async fn default_user_agent(&self) -> Result<Option<String>> {
        self.inner
            .worker
            .call(EngineSlot::default_user_agent)
            .await?
    }

    /// Instances currently alive
    #[must_use]
    pub fn live_instances(&self) -> usize {
        self.inner.registry.len()
    }

    /// Registry of live instances
    #[must_use]
    pub fn registry(&self) -> &InstanceRegistry {
        &self.inner.registry
    }

    /// Backend name of the factory
    #[must_use]
    pub fn backend(&self) -> &'static str {
        self.inner.backend
    }

    /// Whether the caller runs on the affinity thread
    #[must_use]
    pub fn is_affinity_thread(&self) -> bool {
        self.inner.worker.is_affinity_thread()
    }
}

/// Destroys the instance of an acquisition whose caller went away
struct PendingAcquire {
    worker: AffinityWorker<EngineSlot>,
    operation: OperationId,
    armed: bool,
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.armed {
            let operation = self.operation;
            debug!("{} abandoned during acquisition", operation);
            let _ = self.worker.post(move |slot| slot.abandon(operation));
        }
    }
}

/// Exclusive use of the pooled instance for one operation
///
/// Must be ended with [`release`](Self::release); a lease dropped without it
/// has its instance destroyed on the affinity thread.
pub struct Lease {
    pool: ResourcePool,
    instance: InstanceId,
    operation: OperationId,
    released: bool,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    /// Instance bound to this lease
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Operation holding this lease
    #[must_use]
    pub fn operation(&self) -> OperationId {
        self.operation
    }

    /// Run `f` against the engine on the affinity thread
    ///
    /// # Errors
    ///
    /// Returns error if the instance is gone or `f` fails
    pub async fn with_engine<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut dyn RenderingEngine) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let id = self.instance;
        self.pool
            .inner
            .worker
            .call(move |slot| {
                let engine = slot.engine(id)?;
                f(engine)
            })
            .await?
    }

    /// Evaluate `script` in the current page
    ///
    /// Resolves once the engine reports a result; `None` if it never will.
    ///
    /// # Errors
    ///
    /// Returns error if the instance is gone
    pub async fn evaluate(&self, script: &str) -> Result<Option<String>> {
        let (reply, result) = oneshot::channel();
        let script = script.to_string();

        self.with_engine(move |engine| {
            engine.evaluate_script(
                &script,
                Box::new(move |value| {
                    let _ = reply.send(value);
                }),
            );
            Ok(())
        })
        .await?;

        Ok(result.await.unwrap_or(None))
    }

    /// Fire-and-forget access to the instance, usable from engine threads
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            worker: self.pool.inner.worker.clone(),
            instance: self.instance,
        }
    }

    /// End the lease, resetting or destroying the instance
    ///
    /// # Errors
    ///
    /// Returns error if the instance could not be reset or destroyed
    pub async fn release(mut self, how: Release) -> Result<()> {
        self.released = true;
        let id = self.instance;
        debug!("{} releasing {} ({:?})", self.operation, id, how);

        self.pool
            .inner
            .worker
            .call(move |slot| slot.release(id, how))
            .await?
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            let id = self.instance;
            warn!("{} dropped its lease, destroying {}", self.operation, id);
            let _ = self
                .pool
                .inner
                .worker
                .post(move |slot| {
                    if let Err(e) = slot.release(id, Release::Destroy) {
                        warn!("Failed to destroy {}: {}", id, e);
                    }
                });
        }
    }
}

/// Cloneable reference to a leased instance for fire-and-forget work
#[derive(Clone)]
pub struct EngineHandle {
    worker: AffinityWorker<EngineSlot>,
    instance: InstanceId,
}

impl EngineHandle {
    /// Evaluate `script` without waiting for the result
    ///
    /// # Errors
    ///
    /// Returns error if the affinity thread is gone
    pub fn inject(&self, script: &str) -> Result<()> {
        let id = self.instance;
        let script = script.to_string();

        self.worker.post(move |slot| match slot.engine(id) {
            Ok(engine) => engine.evaluate_script(&script, Box::new(|_| {})),
            Err(e) => debug!("Skipping injection: {}", e),
        })
    }
}
