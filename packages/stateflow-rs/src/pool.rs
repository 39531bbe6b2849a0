//! Per-dispatcher action pools.
//!
//! Every action type gets one [`ActionPool`], owned by the dispatcher's
//! [`PoolRegistry`]. Instances travel through the pipeline inside a
//! [`PooledAction`] ticket; dropping the ticket hands the instance back.
//!
//! # Reuse Safety
//!
//! An instance is only pooled when the ticket holds the last reference to it.
//! Asynchronous stages receive `Arc` clones of the action, and the ticket is
//! moved into the detached continuation, so the instance cannot return while
//! any stage can still observe it. A handler that leaks a clone beyond its own
//! future simply costs the pool that instance: it is dropped, never reused.

use std::any::{Any, TypeId};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use tracing::debug;

use crate::action::{action_name, Action};

/// Concurrent pool of idle action instances of one type.
pub(crate) struct ActionPool<A> {
    idle: Mutex<Vec<Arc<A>>>,
    capacity: usize,
}

impl<A: Action> ActionPool<A> {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
        }
    }

    fn idle(&self) -> MutexGuard<'_, Vec<Arc<A>>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take an instance, reset it, and let `setup` fill it in.
    ///
    /// The setup runs outside the pool lock.
    pub fn take(self: &Arc<Self>, setup: impl FnOnce(&mut A)) -> PooledAction<A> {
        let action = loop {
            let popped = self.idle().pop();
            let Some(mut arc) = popped else {
                let mut fresh = A::default();
                setup(&mut fresh);
                break Arc::new(fresh);
            };
            if let Some(action) = Arc::get_mut(&mut arc) {
                action.reset();
                setup(action);
                break arc;
            }
            // Shared instances are never pooled; skip defensively.
        };

        PooledAction {
            action: Some(action),
            pool: self.clone(),
        }
    }

    /// Return an instance. Refused when still shared or the pool is full.
    fn give_back(&self, mut action: Arc<A>) {
        if Arc::get_mut(&mut action).is_none() {
            debug!(
                action = action_name::<A>(),
                refs = Arc::strong_count(&action),
                "action still referenced, not pooling"
            );
            return;
        }

        let mut idle = self.idle();
        if idle.len() < self.capacity {
            idle.push(action);
        }
    }

    /// Number of idle instances.
    pub fn len(&self) -> usize {
        self.idle().len()
    }
}

/// Ticket for one pooled action instance.
///
/// Derefs to the action. Dropping the ticket returns the instance to its
/// pool, which happens on success, on handler failure, and while unwinding.
pub struct PooledAction<A: Action> {
    action: Option<Arc<A>>,
    pool: Arc<ActionPool<A>>,
}

impl<A: Action> PooledAction<A> {
    /// A shared reference for stages that outlive the synchronous pipeline.
    pub(crate) fn share(&self) -> Arc<A> {
        Arc::clone(self.arc())
    }

    fn arc(&self) -> &Arc<A> {
        // Only Drop takes the action out.
        self.action
            .as_ref()
            .expect("pooled action used after release")
    }
}

impl<A: Action> Deref for PooledAction<A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.arc()
    }
}

impl<A: Action> Drop for PooledAction<A> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            self.pool.give_back(action);
        }
    }
}

impl<A: Action> std::fmt::Debug for PooledAction<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledAction")
            .field("action", &action_name::<A>())
            .finish_non_exhaustive()
    }
}

/// One pool per action type, scoped to a single dispatcher.
pub(crate) struct PoolRegistry {
    pools: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    capacity: usize,
}

impl PoolRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            pools: DashMap::new(),
            capacity,
        }
    }

    /// Get or create the pool for `A`.
    pub fn pool<A: Action>(&self) -> Arc<ActionPool<A>> {
        let erased = self
            .pools
            .entry(TypeId::of::<A>())
            .or_insert_with(|| {
                Arc::new(ActionPool::<A>::new(self.capacity)) as Arc<dyn Any + Send + Sync>
            })
            .clone();

        // Keyed by TypeId, so the downcast cannot miss.
        erased
            .downcast::<ActionPool<A>>()
            .unwrap_or_else(|_| Arc::new(ActionPool::new(self.capacity)))
    }

    /// Idle count for `A`, without creating a pool.
    pub fn idle_count<A: Action>(&self) -> usize {
        self.pools
            .get(&TypeId::of::<A>())
            .and_then(|erased| erased.clone().downcast::<ActionPool<A>>().ok())
            .map(|pool| pool.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pool_count", &self.pools.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Ping {
        seq: u32,
    }
    impl Action for Ping {}

    #[derive(Debug, Default)]
    struct Pong;
    impl Action for Pong {}

    #[test]
    fn test_take_from_empty_pool_allocates() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let ticket = pool.take(|p| p.seq = 7);
        assert_eq!(ticket.seq, 7);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_drop_returns_instance() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let ticket = pool.take(|_| {});
        drop(ticket);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_reused_instance_is_reset() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let first = pool.take(|p| p.seq = 41);
        let first_ptr = Arc::as_ptr(first.arc());
        drop(first);

        let second = pool.take(|_| {});
        assert_eq!(Arc::as_ptr(second.arc()), first_ptr);
        assert_eq!(second.seq, 0);
    }

    #[test]
    fn test_shared_instance_is_not_pooled() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let ticket = pool.take(|_| {});
        let leaked = ticket.share();
        drop(ticket);
        assert_eq!(pool.len(), 0);
        assert_eq!(Arc::strong_count(&leaked), 1);
    }

    #[test]
    fn test_share_then_release_pools_after_last_clone() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let ticket = pool.take(|_| {});
        let shared = ticket.share();
        drop(shared);
        drop(ticket);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_capacity_bounds_idle_instances() {
        let pool = Arc::new(ActionPool::<Ping>::new(2));
        let tickets: Vec<_> = (0..5).map(|_| pool.take(|_| {})).collect();
        drop(tickets);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_drop_during_unwind_returns_instance() {
        let pool = Arc::new(ActionPool::<Ping>::new(8));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ticket = pool.take(|_| {});
            panic!("simulated handler panic");
        }));
        assert!(result.is_err());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_registry_keeps_pools_per_type() {
        let registry = PoolRegistry::new(8);
        drop(registry.pool::<Ping>().take(|_| {}));
        drop(registry.pool::<Ping>().take(|_| {}));

        assert_eq!(registry.idle_count::<Ping>(), 1);
        assert_eq!(registry.idle_count::<Pong>(), 0);
        assert!(Arc::ptr_eq(&registry.pool::<Ping>(), &registry.pool::<Ping>()));
    }

    #[test]
    fn test_pool_is_safe_across_threads() {
        let pool = Arc::new(ActionPool::<Ping>::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let ticket = pool.take(|p| p.seq = i);
                        assert_eq!(ticket.seq, i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(pool.len() >= 1);
        assert!(pool.len() <= 8);
    }
}
