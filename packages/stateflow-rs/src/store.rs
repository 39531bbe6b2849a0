//! Stores: single owners of one typed state value.
//!
//! # Commit Protocol
//!
//! A reducer runs under the store's private mutation lock:
//!
//! ```text
//! lock(mutation)
//!   next      = reducer(current, action)
//!   validated = validate(current, next)      // identity by default
//!   if equivalent(current, validated) -> unlock, no commit, no notification
//!   swap current = validated                 // readers see old or new, never partial
//! unlock(mutation)
//! notify subscribers (old, validated)        // outside every lock
//! ```
//!
//! Subscribers run outside the lock so they can dispatch follow-up actions.

use std::any::{type_name, Any, TypeId};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::trace;

use crate::action::Action;
use crate::error::StateflowError;
use crate::receiver::{BoundReducer, Notification, Receivers};
use crate::registration::{Partition, Registration, RegistrationSet};
use crate::registry::StoreId;

/// Posts a closure onto some execution context (a UI thread, a runtime).
///
/// Used by subscriptions that must not run on the dispatching thread.
pub type ExecutionContext = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// How a subscription is delivered.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Invoke the callback once with `(current, current)` when subscribing.
    pub initial_call: bool,
    /// Deliver notifications through this context instead of inline.
    pub context: Option<ExecutionContext>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            initial_call: true,
            context: None,
        }
    }
}

impl SubscribeOptions {
    pub fn without_initial_call(mut self) -> Self {
        self.initial_call = false;
        self
    }

    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = Some(context);
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("initial_call", &self.initial_call)
            .field("context", &self.context.is_some())
            .finish()
    }
}

type Callback<S> = Arc<dyn Fn(&S, &S) + Send + Sync>;

struct Subscriber<S> {
    callback: Callback<S>,
    context: Option<ExecutionContext>,
}

impl<S> Clone for Subscriber<S> {
    fn clone(&self) -> Self {
        Self {
            callback: self.callback.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S: Send + Sync + 'static> Subscriber<S> {
    fn call(&self, old: &Arc<S>, new: &Arc<S>) {
        match &self.context {
            None => (self.callback)(old, new),
            Some(context) => {
                let callback = self.callback.clone();
                let old = old.clone();
                let new = new.clone();
                context(Box::new(move || callback(&old, &new)));
            }
        }
    }
}

/// A committed transition.
pub(crate) struct Change<S> {
    pub old: Arc<S>,
    pub new: Arc<S>,
}

/// Sole owner of one state value.
pub(crate) struct Store<S> {
    name: Option<Arc<str>>,
    value: RwLock<Arc<S>>,
    mutation: Mutex<()>,
    equivalent: Box<dyn Fn(&S, &S) -> bool + Send + Sync>,
    validate: Option<Box<dyn Fn(&S, S) -> S + Send + Sync>>,
    subscribers: Arc<RegistrationSet<Subscriber<S>>>,
}

impl<S: Send + Sync + 'static> Store<S> {
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn name_arc(&self) -> Option<Arc<str>> {
        self.name.clone()
    }

    /// The live value.
    pub fn current(&self) -> Arc<S> {
        self.value.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run `reducer` under the mutation lock and commit a non-equivalent result.
    ///
    /// Returns the committed change; the caller notifies once it no longer
    /// holds anything the subscribers might need.
    pub fn commit(&self, reducer: impl FnOnce(&S) -> S) -> Option<Change<S>> {
        let _mutation = self.mutation.lock().unwrap_or_else(|e| e.into_inner());

        let old = self.current();
        let next = reducer(&old);
        let next = match &self.validate {
            Some(validate) => validate(&old, next),
            None => next,
        };

        if (self.equivalent)(&old, &next) {
            trace!(store = ?self.name, state = type_name::<S>(), "equivalent value, no commit");
            return None;
        }

        let new = Arc::new(next);
        *self.value.write().unwrap_or_else(|e| e.into_inner()) = new.clone();
        Some(Change { old, new })
    }

    /// Hand a committed change to every subscriber, fixed first.
    pub fn notify(&self, change: &Change<S>) {
        let subscribers = self.subscribers.snapshot();
        trace!(
            store = ?self.name,
            subscribers = subscribers.len(),
            "notifying subscribers"
        );
        for subscriber in subscribers.iter() {
            subscriber.call(&change.old, &change.new);
        }
    }

    #[cfg(test)]
    pub fn reduce(&self, reducer: impl FnOnce(&S) -> S) -> bool {
        match self.commit(reducer) {
            Some(change) => {
                self.notify(&change);
                true
            }
            None => false,
        }
    }

    /// Add a runtime subscription.
    pub fn subscribe<F>(&self, callback: F, options: SubscribeOptions) -> Registration
    where
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        self.attach(Partition::Flexible, callback, options)
    }

    /// Add a subscription to the given partition.
    ///
    /// With `initial_call` the callback sees `(current, current)` before this
    /// returns (or is posted to the context, if one is set).
    pub fn attach<F>(&self, partition: Partition, callback: F, options: SubscribeOptions) -> Registration
    where
        F: Fn(&S, &S) + Send + Sync + 'static,
    {
        let subscriber = Subscriber {
            callback: Arc::new(callback),
            context: options.context,
        };
        let key = self.subscribers.add(partition, subscriber.clone());

        let mut registration = Registration::new();
        if partition == Partition::Flexible {
            registration.track(self.subscribers.removal(key));
        }

        if options.initial_call {
            let current = self.current();
            subscriber.call(&current, &current);
        }
        registration
    }

    pub fn handle(self: &Arc<Self>, id: StoreId) -> StateHandle<S> {
        StateHandle {
            id,
            store: Arc::downgrade(self),
        }
    }
}

impl<S> fmt::Debug for Store<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("name", &self.name)
            .field("state", &type_name::<S>())
            .finish_non_exhaustive()
    }
}

/// Type-erased store, so one registry can hold every state type.
pub(crate) trait AnyStore: Send + Sync {
    fn name(&self) -> Option<&str>;
    fn state_type(&self) -> TypeId;
    fn state_type_name(&self) -> &'static str;
    fn value_any(&self) -> Arc<dyn Any + Send + Sync>;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<S: Send + Sync + 'static> AnyStore for Store<S> {
    fn name(&self) -> Option<&str> {
        Store::name(self)
    }

    fn state_type(&self) -> TypeId {
        TypeId::of::<S>()
    }

    fn state_type_name(&self) -> &'static str {
        type_name::<S>()
    }

    fn value_any(&self) -> Arc<dyn Any + Send + Sync> {
        self.current()
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// =============================================================================
// Builder
// =============================================================================

type ReducerInstaller<S> = Box<dyn FnOnce(&Arc<Store<S>>, &Receivers) + Send>;

/// Declares a store: its initial value, name, hooks and reducers.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, PartialEq)]
/// struct Counter(i64);
///
/// let store = StoreBuilder::new(Counter(0))
///     .named("counter")
///     .reducer(|n: &Counter, _: &Increment| Counter(n.0 + 1))
///     .reducer(|_: &Counter, _: &Reset| Counter(0))
///     .validate(|_old, new| Counter(new.0.min(100)));
/// ```
pub struct StoreBuilder<S> {
    name: Option<String>,
    initial: S,
    equivalent: Box<dyn Fn(&S, &S) -> bool + Send + Sync>,
    validate: Option<Box<dyn Fn(&S, S) -> S + Send + Sync>>,
    reducers: Vec<ReducerInstaller<S>>,
}

impl<S: Send + Sync + 'static> StoreBuilder<S> {
    /// A store whose equality hook is `PartialEq`.
    pub fn new(initial: S) -> Self
    where
        S: PartialEq,
    {
        Self::with_equivalence(initial, |a: &S, b: &S| a == b)
    }

    /// A store with a custom equality hook.
    pub fn with_equivalence(
        initial: S,
        equivalent: impl Fn(&S, &S) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: None,
            initial,
            equivalent: Box::new(equivalent),
            validate: None,
            reducers: Vec::new(),
        }
    }

    /// Names must be unique within one dispatcher.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Bind a reducer for action type `A`. Reducers for the same action run
    /// in the order stores and reducers were registered.
    pub fn reducer<A: Action>(mut self, reducer: impl Fn(&S, &A) -> S + Send + Sync + 'static) -> Self {
        let reducer: Arc<dyn Fn(&S, &A) -> S + Send + Sync> = Arc::new(reducer);
        self.reducers.push(Box::new(move |store, receivers| {
            receivers.receiver::<A>().add_reducer(Arc::new(StoreReducer {
                store: store.clone(),
                reducer,
            }));
        }));
        self
    }

    /// Post-process every reducer result before the equality check.
    pub fn validate(mut self, validate: impl Fn(&S, S) -> S + Send + Sync + 'static) -> Self {
        self.validate = Some(Box::new(validate));
        self
    }

    fn into_store(self) -> (Arc<Store<S>>, Vec<ReducerInstaller<S>>) {
        let store = Arc::new(Store {
            name: self.name.map(Arc::from),
            value: RwLock::new(Arc::new(self.initial)),
            mutation: Mutex::new(()),
            equivalent: self.equivalent,
            validate: self.validate,
            subscribers: Arc::new(RegistrationSet::new()),
        });
        (store, self.reducers)
    }
}

impl<S> fmt::Debug for StoreBuilder<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreBuilder")
            .field("name", &self.name)
            .field("state", &type_name::<S>())
            .field("reducers", &self.reducers.len())
            .finish()
    }
}

/// A store declaration waiting for its dispatcher.
pub(crate) trait StoreSeed: Send {
    fn name(&self) -> Option<&str>;
    /// Create the store and bind its reducers to their receivers.
    fn plant(self: Box<Self>, receivers: &Receivers) -> Arc<dyn AnyStore>;
}

impl<S: Send + Sync + 'static> StoreSeed for StoreBuilder<S> {
    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn plant(self: Box<Self>, receivers: &Receivers) -> Arc<dyn AnyStore> {
        let (store, reducers) = self.into_store();
        for install in reducers {
            install(&store, receivers);
        }
        store
    }
}

/// A reducer bound to its store.
struct StoreReducer<S, A> {
    store: Arc<Store<S>>,
    reducer: Arc<dyn Fn(&S, &A) -> S + Send + Sync>,
}

impl<S: Send + Sync + 'static, A: Action> BoundReducer<A> for StoreReducer<S, A> {
    fn store_name(&self) -> Option<&str> {
        self.store.name()
    }

    fn reduce(&self, action: &A) -> Option<Notification> {
        let change = self.store.commit(|state| (self.reducer)(state, action))?;
        let store = self.store.clone();
        Some(Box::new(move || store.notify(&change)))
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Read-only view of one store's live value.
///
/// Does not keep the store alive. Reads after the owning dispatcher is gone
/// fail with [`StateflowError::StoreReleased`].
pub struct StateHandle<S> {
    id: StoreId,
    store: Weak<Store<S>>,
}

impl<S: Send + Sync + 'static> StateHandle<S> {
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> Option<Arc<str>> {
        self.store.upgrade().and_then(|store| store.name_arc())
    }

    /// The store's current value at the time of the call.
    pub fn value(&self) -> Result<Arc<S>, StateflowError> {
        self.store
            .upgrade()
            .map(|store| store.current())
            .ok_or(StateflowError::StoreReleased {
                type_name: type_name::<S>(),
            })
    }

    /// Clone of the current value.
    pub fn get(&self) -> Result<S, StateflowError>
    where
        S: Clone,
    {
        self.value().map(|value| S::clone(&value))
    }

    pub fn is_released(&self) -> bool {
        self.store.strong_count() == 0
    }
}

impl<S> Clone for StateHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            store: self.store.clone(),
        }
    }
}

impl<S> fmt::Debug for StateHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateHandle")
            .field("id", &self.id)
            .field("state", &type_name::<S>())
            .finish()
    }
}
