//! The per-connection handler registry.
//!
//! Packet dispatch is the hot path and arrives from many tasks; lookups take
//! the shared lock and creation is deduplicated under the exclusive lock so a
//! 5-tuple never gets two handlers.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::ConnId;

/// A per-connection handler bound into the pool.
pub trait Handler: Send + Sync + 'static {
    /// Starts the handler's tasks. Invoked exactly once, by the pool.
    fn start(self: Arc<Self>);

    /// Requests the handler to shut down. The handler removes itself from the
    /// pool through its [`Release`] callback.
    fn stop(&self);

    /// A token that is cancelled once the handler has fully terminated.
    fn done(&self) -> CancellationToken;

    /// Access to the concrete type, for owners that need to feed it.
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Default)]
pub struct HandlerPool {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    handlers: RwLock<HashMap<ConnId, Arc<dyn Handler>>>,
}

impl HandlerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap lookup under the shared lock.
    pub fn get(&self, id: &ConnId) -> Option<Arc<dyn Handler>> {
        self.inner.handlers.read().get(id).cloned()
    }

    /// Looks up the handler for `id`, creating it with `factory` on a miss.
    ///
    /// The factory runs under the exclusive lock and must not call back into
    /// the pool for the same id (it would deadlock on itself). On a miss the
    /// new handler is inserted, the lock released, and `start` invoked exactly
    /// once. `existed == true` means the factory was never invoked.
    pub fn get_or_create<F>(
        &self,
        id: &ConnId,
        factory: F,
    ) -> anyhow::Result<(Arc<dyn Handler>, bool)>
    where
        F: FnOnce(Release) -> anyhow::Result<Arc<dyn Handler>>,
    {
        let handler = {
            let mut handlers = self.inner.handlers.write();

            if let Some(existing) = handlers.get(id) {
                return Ok((existing.clone(), true));
            }

            let release = Release {
                pool: Arc::downgrade(&self.inner),
                id: id.clone(),
                released: Arc::new(AtomicBool::new(false)),
            };

            let handler = factory(release)?;
            handlers.insert(id.clone(), handler.clone());

            handler
        };

        handler.clone().start();

        Ok((handler, false))
    }

    pub fn len(&self) -> usize {
        self.inner.handlers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.handlers.read().is_empty()
    }

    /// Stops every handler in a snapshot and waits for each to terminate.
    pub async fn close_all(&self) {
        let snapshot = self
            .inner
            .handlers
            .read()
            .values()
            .cloned()
            .collect::<Vec<_>>();

        for handler in &snapshot {
            handler.stop();
        }

        for handler in snapshot {
            handler.done().cancelled_owned().await;
        }
    }
}

/// Removes a handler's pool entry.
///
/// Captured by the factory and invoked by the handler on every exit path.
/// Invoking it more than once is a no-op.
#[derive(Clone)]
pub struct Release {
    pool: Weak<Inner>,
    id: ConnId,
    released: Arc<AtomicBool>,
}

impl Release {
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(pool) = self.pool.upgrade() {
            pool.handlers.write().remove(&self.id);
        }
    }

    pub fn id(&self) -> &ConnId {
        &self.id
    }

    /// A release bound to nothing, for handlers owned outside a pool.
    pub fn noop(id: ConnId) -> Self {
        Self {
            pool: Weak::new(),
            id,
            released: Arc::new(AtomicBool::new(false)),
        }
    }
}
