//! The dispatcher: entry point, action queue and drain loop.
//!
//! # Drain Protocol
//!
//! ```text
//! dispatch(a)
//!   lock(queue)
//!     push a
//!     draining? ──yes──► unlock, return        // the active drainer will run it
//!     draining = true
//!   unlock
//!   loop
//!     lock(queue)
//!       pop ──none──► draining = false, unlock, return
//!     unlock
//!     run pipeline(a)                          // may dispatch, which only enqueues
//! ```
//!
//! One drainer per dispatcher at a time. Actions dispatched from handlers,
//! or from other threads while a drain is running, queue up behind the
//! current action and run in submission order. A [`DrainGuard`] clears the
//! `draining` flag when the loop exits through an error or a panic, so the
//! dispatcher is never wedged.

use std::any::{type_name, Any, TypeId};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use crate::action::{action_name, Action, PayloadAction};
use crate::config::DispatcherConfig;
use crate::error::StateflowError;
use crate::handler::{AsyncFnHandler, Capabilities, FnHandler, FunctionObject, Stage, Wiring};
use crate::pool::{PoolRegistry, PooledAction};
use crate::receiver::Receivers;
use crate::registration::{Partition, Registration};
use crate::registry::{StoreId, StoreKey, StoreRegistry, States};
use crate::store::{StateHandle, StoreBuilder, StoreSeed, SubscribeOptions};
use crate::tracker::AsyncTracker;

/// A pooled action waiting in the queue, with its type erased.
struct QueuedAction {
    type_id: TypeId,
    action_type: &'static str,
    /// A `PooledAction<A>`; dropping it returns the instance to its pool.
    action: Box<dyn Any + Send>,
}

impl QueuedAction {
    fn new<A: Action>(action: PooledAction<A>) -> Self {
        Self {
            type_id: TypeId::of::<A>(),
            action_type: action_name::<A>(),
            action: Box::new(action),
        }
    }
}

#[derive(Default)]
struct Queue {
    pending: VecDeque<QueuedAction>,
    draining: bool,
}

/// Clears `draining` unless disarmed by a clean exit.
struct DrainGuard<'a> {
    queue: &'a Mutex<Queue>,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.draining = false;
        }
    }
}

struct Inner {
    config: DispatcherConfig,
    stores: StoreRegistry,
    receivers: Receivers,
    pools: PoolRegistry,
    queue: Mutex<Queue>,
    tracker: Arc<AsyncTracker>,
    runtime: Option<Handle>,
}

/// Routes actions through their pipelines to the stores.
///
/// Cheap to clone; every clone shares the same stores, receivers, pools and
/// queue.
///
/// # Example
///
/// ```ignore
/// let dispatcher = Dispatcher::builder()
///     .with_store(
///         StoreBuilder::new(Counter(0))
///             .named("counter")
///             .reducer(|n: &Counter, _: &Increment| Counter(n.0 + 1)),
///     )
///     .with_functions(Arc::new(Audit))
///     .build()?;
///
/// let _sub = dispatcher.subscribe::<Counter, _>(StoreKey::Type, |old, new| {
///     println!("{} -> {}", old.0, new.0);
/// })?;
///
/// dispatcher.dispatch::<Increment>()?;
/// assert_eq!(dispatcher.get_state::<Counter>(StoreKey::Type)?.get()?.0, 1);
/// ```
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Dispatch a freshly reset action of type `A`.
    ///
    /// Returns once the action is queued, or, when this call became the
    /// drainer, once the queue is empty. Detached asynchronous effects are
    /// never awaited. Dispatching a type nobody handles is a silent no-op.
    pub fn dispatch<A: Action>(&self) -> Result<(), StateflowError> {
        self.dispatch_with::<A>(|_| {})
    }

    /// Dispatch an action carrying `payload`.
    pub fn dispatch_payload<A: PayloadAction>(&self, payload: A::Payload) -> Result<(), StateflowError> {
        self.dispatch_with::<A>(move |action| action.set_payload(payload))
    }

    /// Dispatch an action filled in by `setup` after it is reset.
    pub fn dispatch_with<A: Action>(&self, setup: impl FnOnce(&mut A)) -> Result<(), StateflowError> {
        let action = self.inner.pools.pool::<A>().take(setup);
        self.submit(QueuedAction::new(action))
    }

    /// Like [`dispatch_with`](Self::dispatch_with), with an extra argument
    /// handed to `setup`.
    pub fn dispatch_with_arg<A: Action, T>(
        &self,
        arg: T,
        setup: impl FnOnce(&mut A, T),
    ) -> Result<(), StateflowError> {
        self.dispatch_with::<A>(move |action| setup(action, arg))
    }

    fn submit(&self, item: QueuedAction) -> Result<(), StateflowError> {
        {
            let mut queue = self.queue();
            let action_type = item.action_type;
            queue.pending.push_back(item);

            let depth = queue.pending.len();
            trace!(action = action_type, depth, draining = queue.draining, "action queued");
            let warn_depth = self.inner.config.queue_warn_depth;
            if warn_depth > 0 && depth == warn_depth + 1 {
                warn!(action = action_type, depth, "pending action queue is growing");
            }

            if queue.draining {
                return Ok(());
            }
            queue.draining = true;
        }

        self.drain()
    }

    /// Run queued actions until the queue is empty.
    ///
    /// The caller must have set `draining`.
    fn drain(&self) -> Result<(), StateflowError> {
        let mut guard = DrainGuard {
            queue: &self.inner.queue,
            armed: true,
        };

        loop {
            let next = {
                let mut queue = self.queue();
                match queue.pending.pop_front() {
                    Some(next) => next,
                    None => {
                        // Cleared under the same lock that saw the queue empty,
                        // so a concurrent submit either lands before this or
                        // becomes the next drainer.
                        queue.draining = false;
                        guard.armed = false;
                        return Ok(());
                    }
                }
            };

            let action_type = next.action_type;
            if let Err(err) = self.run(next) {
                warn!(
                    action = action_type,
                    remaining = self.pending_len(),
                    error = %err,
                    "drain aborted, remaining actions stay queued"
                );
                return Err(err);
            }
        }
    }

    fn run(&self, next: QueuedAction) -> Result<(), StateflowError> {
        let Some(receiver) = self.inner.receivers.get(&next.type_id) else {
            trace!(action = next.action_type, "no receiver, dropping action");
            return Ok(());
        };
        trace!(action = next.action_type, "running pipeline");
        receiver.run(next.action, self)
    }

    /// Drain actions left queued by a drain that stopped on an error.
    ///
    /// No-op while another drain is running.
    pub fn flush(&self) -> Result<(), StateflowError> {
        {
            let mut queue = self.queue();
            if queue.draining || queue.pending.is_empty() {
                return Ok(());
            }
            queue.draining = true;
        }
        self.drain()
    }

    /// Actions queued but not yet started.
    pub fn pending_len(&self) -> usize {
        self.queue().pending.len()
    }

    /// True while some call owns the drain loop.
    pub fn is_draining(&self) -> bool {
        self.queue().draining
    }

    /// Idle pooled instances of `A`.
    pub fn pooled_count<A: Action>(&self) -> usize {
        self.inner.pools.idle_count::<A>()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Run `handler` before the reducers of every `A`.
    pub fn register_pre_action<A, F>(&self, handler: F) -> Registration
    where
        A: Action,
        F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registration = Registration::new();
        self.inner.receivers.receiver::<A>().attach_pre(
            Partition::Flexible,
            Arc::new(FnHandler::<F, A>::new(handler)),
            &mut registration,
        );
        registration
    }

    /// Run `handler` after the reducers of every `A`.
    pub fn register_execute_action<A, F>(&self, handler: F) -> Registration
    where
        A: Action,
        F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registration = Registration::new();
        self.inner.receivers.receiver::<A>().attach_execute(
            Partition::Flexible,
            Arc::new(FnHandler::<F, A>::new(handler)),
            &mut registration,
        );
        registration
    }

    /// Run `handler` concurrently with the other asynchronous effects of `A`.
    pub fn register_execute_action_async<A, F, Fut>(&self, handler: F) -> Registration
    where
        A: Action,
        F: Fn(Arc<A>, Dispatcher) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut registration = Registration::new();
        self.inner.receivers.receiver::<A>().attach_execute_async(
            Partition::Flexible,
            Arc::new(AsyncFnHandler::<F, A>::new(handler)),
            &mut registration,
        );
        registration
    }

    /// Run `handler` last for every `A`.
    pub fn register_post_action<A, F>(&self, handler: F) -> Registration
    where
        A: Action,
        F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut registration = Registration::new();
        self.inner.receivers.receiver::<A>().attach_post(
            Partition::Flexible,
            Arc::new(FnHandler::<F, A>::new(handler)),
            &mut registration,
        );
        registration
    }

    /// Install every capability `object` declares.
    pub fn register_functions<F: FunctionObject>(&self, object: Arc<F>) -> Registration {
        self.install(type_name::<F>(), object, None)
    }

    /// Install only the capabilities `object` declares for `stage`.
    pub fn register_functions_for<F: FunctionObject>(&self, stage: Stage, object: Arc<F>) -> Registration {
        self.install(type_name::<F>(), object, Some(stage))
    }

    /// Install several objects; one disposer removes all of them.
    pub fn register_all<I>(&self, objects: I) -> Registration
    where
        I: IntoIterator<Item = Arc<dyn FunctionObject>>,
    {
        let mut registration = Registration::new();
        for object in objects {
            registration.merge(self.install("dyn FunctionObject", object, None));
        }
        registration
    }

    fn install(&self, owner: &'static str, object: Arc<dyn FunctionObject>, stage: Option<Stage>) -> Registration {
        let mut caps = Capabilities::new(owner);
        object.capabilities(&mut caps);
        if let Some(stage) = stage {
            caps.retain_stage(stage);
        }
        if caps.is_empty() {
            debug!(object = owner, ?stage, "function object declared no capabilities");
        }

        let mut registration = Registration::new();
        caps.install(&mut Wiring {
            receivers: &self.inner.receivers,
            stores: &self.inner.stores,
            partition: Partition::Flexible,
            registration: &mut registration,
        });
        registration
    }

    // =========================================================================
    // State access
    // =========================================================================

    /// Handle to the store selected by `key`.
    ///
    /// [`StoreKey::Type`] fails with
    /// [`StateflowError::AmbiguousStateType`] when several stores hold `S`.
    pub fn get_state<S: Send + Sync + 'static>(
        &self,
        key: StoreKey<'_>,
    ) -> Result<StateHandle<S>, StateflowError> {
        self.inner.stores.handle::<S>(key)
    }

    pub fn try_get_state<S: Send + Sync + 'static>(&self, key: StoreKey<'_>) -> Option<StateHandle<S>> {
        self.get_state(key).ok()
    }

    pub fn get_state_id<S: 'static>(&self, key: StoreKey<'_>) -> Result<StoreId, StateflowError> {
        self.inner.stores.id_of::<S>(key)
    }

    pub fn try_get_state_id<S: 'static>(&self, key: StoreKey<'_>) -> Option<StoreId> {
        self.get_state_id::<S>(key).ok()
    }

    /// Every store, in registration order.
    pub fn get_states(&self) -> States {
        self.inner.stores.states()
    }

    /// Number of stores.
    pub fn store_count(&self) -> usize {
        self.inner.stores.len()
    }

    /// Subscribe to a store with default options (initial call, inline).
    pub fn subscribe<S, F>(&self, key: StoreKey<'_>, callback: F) -> Result<Registration, StateflowError>
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        self.subscribe_with(key, SubscribeOptions::default(), callback)
    }

    pub fn subscribe_with<S, F>(
        &self,
        key: StoreKey<'_>,
        options: SubscribeOptions,
        callback: F,
    ) -> Result<Registration, StateflowError>
    where
        S: Send + Sync + 'static,
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        let (_, store) = self.inner.stores.get::<S>(key)?;
        Ok(store.subscribe(callback, options))
    }

    // =========================================================================
    // Async supervision
    // =========================================================================

    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
    }

    pub(crate) fn tracker(&self) -> &Arc<AsyncTracker> {
        &self.inner.tracker
    }

    /// Detached continuations still running.
    pub fn running_async(&self) -> usize {
        self.inner.tracker.running()
    }

    /// Wait for every detached continuation to finish.
    ///
    /// Returns the first [`StateflowError::AsyncFailed`] recorded since the
    /// previous wait.
    pub async fn wait_idle(&self) -> Result<(), StateflowError> {
        self.inner.tracker.wait_idle().await
    }

    /// [`wait_idle`](Self::wait_idle) with a deadline.
    pub async fn wait_idle_timeout(&self, duration: Duration) -> Result<(), StateflowError> {
        match tokio::time::timeout(duration, self.wait_idle()).await {
            Ok(result) => result,
            Err(_) => Err(StateflowError::Timeout { duration }),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stores", &self.inner.stores)
            .field("receivers", &self.inner.receivers)
            .field("pending", &self.pending_len())
            .field("tracker", &self.inner.tracker)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Dispatcher Builder
// =============================================================================

/// Builder for a [`Dispatcher`].
///
/// Stores and function objects given here are installed into the fixed
/// partitions and stay for the dispatcher's lifetime.
///
/// # Example
///
/// ```ignore
/// let dispatcher = DispatcherBuilder::new()
///     .with_config(DispatcherConfig::from_env()?)
///     .with_store(StoreBuilder::new(Counter(0)).reducer(|n: &Counter, _: &Increment| Counter(n.0 + 1)))
///     .with_store(StoreBuilder::new(Title::default()).named("title"))
///     .with_functions(Arc::new(Audit))
///     .with_runtime(tokio::runtime::Handle::current())
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    stores: Vec<Box<dyn StoreSeed>>,
    functions: Vec<(&'static str, Arc<dyn FunctionObject>)>,
    runtime: Option<Handle>,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            stores: Vec::new(),
            functions: Vec::new(),
            runtime: None,
        }
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a store. Slots follow the order stores are added.
    pub fn with_store<S: Send + Sync + 'static>(mut self, store: StoreBuilder<S>) -> Self {
        self.stores.push(Box::new(store));
        self
    }

    /// Add a function object whose capabilities are fixed for the
    /// dispatcher's lifetime.
    pub fn with_functions<F: FunctionObject>(mut self, object: Arc<F>) -> Self {
        self.functions
            .push((type_name::<F>(), object as Arc<dyn FunctionObject>));
        self
    }

    /// Spawn asynchronous effects on this runtime.
    ///
    /// Without one, the runtime of the dispatching thread is used.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the dispatcher.
    ///
    /// Fails when store names collide or there are too many stores.
    pub fn build(self) -> Result<Dispatcher, StateflowError> {
        let receivers = Receivers::new();
        let stores = StoreRegistry::new(self.stores, &receivers)?;

        // Nothing tracked: fixed handlers are never removed
        let mut fixed = Registration::new();
        for (owner, object) in self.functions {
            let mut caps = Capabilities::new(owner);
            object.capabilities(&mut caps);
            caps.install(&mut Wiring {
                receivers: &receivers,
                stores: &stores,
                partition: Partition::Fixed,
                registration: &mut fixed,
            });
        }
        fixed.leak();

        debug!(
            stores = stores.len(),
            action_types = receivers.len(),
            pool_capacity = self.config.pool_capacity,
            "dispatcher built"
        );

        Ok(Dispatcher {
            inner: Arc::new(Inner {
                pools: PoolRegistry::new(self.config.pool_capacity),
                config: self.config,
                stores,
                receivers,
                queue: Mutex::new(Queue::default()),
                tracker: Arc::new(AsyncTracker::new()),
                runtime: self.runtime,
            }),
        })
    }
}

impl std::fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("config", &self.config)
            .field("stores", &self.stores.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}
