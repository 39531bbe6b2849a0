//! Per-action-type pipelines.
//!
//! # Pipeline
//!
//! ```text
//! pre-actions ─► reducers (+ store notifications) ─► execute-actions
//!                                                        │
//!                    no async effects ◄──────────────────┤
//!                         │                              │ async effects
//!                         ▼                              ▼
//!                   post-actions               spawn continuation ─┐
//!                   pool return                                    │
//!                                          join_all(async effects) │
//!                                          post-actions            │
//!                                          pool return ◄───────────┘
//! ```
//!
//! Every stage iterates a snapshot, fixed handlers first. Synchronous stages
//! stop at the first failing handler and the error propagates out of the
//! drain loop. Asynchronous effects are isolated from each other; their
//! failures are collected and reported through the dispatcher's tracker.

use std::any::{Any, TypeId};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, error, trace, warn};

use crate::action::{action_name, Action};
use crate::dispatcher::Dispatcher;
use crate::error::{panic_message, StateflowError};
use crate::handler::{ExecuteAction, ExecuteActionAsync, PostAction, PreAction, Stage};
use crate::pool::PooledAction;
use crate::registration::{Partition, Registration, RegistrationSet, Snapshot};

/// Deferred store notification, run right after its reducer commits.
pub(crate) type Notification = Box<dyn FnOnce()>;

/// A reducer already bound to the store it mutates.
pub(crate) trait BoundReducer<A>: Send + Sync {
    fn store_name(&self) -> Option<&str>;
    /// Commit under the store's lock. Returns the notification when the
    /// value changed.
    fn reduce(&self, action: &A) -> Option<Notification>;
}

/// Run one synchronous handler, turning errors and panics into
/// [`StateflowError`].
pub(crate) fn run_guarded(
    stage: Stage,
    action_type: &'static str,
    f: impl FnOnce() -> anyhow::Result<()>,
) -> Result<(), StateflowError> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => {
            error!(action = action_type, stage = %stage, error = %source, "handler failed");
            Err(StateflowError::HandlerFailed {
                stage,
                action_type,
                source,
            })
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(action = action_type, stage = %stage, panic = %message, "handler panicked");
            Err(StateflowError::HandlerPanicked {
                stage,
                action_type,
                message,
            })
        }
    }
}

/// Handlers and reducers for action type `A`.
pub(crate) struct ActionReceiver<A: Action> {
    reducers: Arc<RegistrationSet<Arc<dyn BoundReducer<A>>>>,
    pre: Arc<RegistrationSet<Arc<dyn PreAction<A>>>>,
    execute: Arc<RegistrationSet<Arc<dyn ExecuteAction<A>>>>,
    execute_async: Arc<RegistrationSet<Arc<dyn ExecuteActionAsync<A>>>>,
    post: Arc<RegistrationSet<Arc<dyn PostAction<A>>>>,
}

fn attach<T: Clone + Send + Sync + 'static>(
    set: &Arc<RegistrationSet<T>>,
    partition: Partition,
    handler: T,
    registration: &mut Registration,
) {
    let key = set.add(partition, handler);
    if partition == Partition::Flexible {
        registration.track(set.removal(key));
    }
}

impl<A: Action> ActionReceiver<A> {
    fn new() -> Self {
        Self {
            reducers: Arc::new(RegistrationSet::new()),
            pre: Arc::new(RegistrationSet::new()),
            execute: Arc::new(RegistrationSet::new()),
            execute_async: Arc::new(RegistrationSet::new()),
            post: Arc::new(RegistrationSet::new()),
        }
    }

    /// Reducers are bound once, when the dispatcher is built.
    pub fn add_reducer(&self, reducer: Arc<dyn BoundReducer<A>>) {
        trace!(
            action = action_name::<A>(),
            store = ?reducer.store_name(),
            "binding reducer"
        );
        self.reducers.add(Partition::Fixed, reducer);
    }

    pub fn attach_pre(
        &self,
        partition: Partition,
        handler: Arc<dyn PreAction<A>>,
        registration: &mut Registration,
    ) {
        attach(&self.pre, partition, handler, registration);
    }

    pub fn attach_execute(
        &self,
        partition: Partition,
        handler: Arc<dyn ExecuteAction<A>>,
        registration: &mut Registration,
    ) {
        attach(&self.execute, partition, handler, registration);
    }

    pub fn attach_execute_async(
        &self,
        partition: Partition,
        handler: Arc<dyn ExecuteActionAsync<A>>,
        registration: &mut Registration,
    ) {
        attach(&self.execute_async, partition, handler, registration);
    }

    pub fn attach_post(
        &self,
        partition: Partition,
        handler: Arc<dyn PostAction<A>>,
        registration: &mut Registration,
    ) {
        attach(&self.post, partition, handler, registration);
    }

    /// Run the pipeline for one action.
    ///
    /// Returns once the synchronous stages are done. Asynchronous effects, if
    /// any, continue on the runtime and keep the action out of its pool
    /// until they finish.
    fn process(&self, action: PooledAction<A>, dispatcher: &Dispatcher) -> Result<(), StateflowError> {
        let action_type = action_name::<A>();

        for handler in self.pre.snapshot().iter() {
            run_guarded(Stage::PreAction, action_type, || {
                handler.pre_action(&action, dispatcher)
            })?;
        }

        for reducer in self.reducers.snapshot().iter() {
            let mut notification = None;
            run_guarded(Stage::Reducer, action_type, || {
                notification = reducer.reduce(&action);
                Ok(())
            })?;
            if let Some(notify) = notification {
                run_guarded(Stage::Subscriber, action_type, || {
                    notify();
                    Ok(())
                })?;
            }
        }

        for handler in self.execute.snapshot().iter() {
            run_guarded(Stage::ExecuteAction, action_type, || {
                handler.execute(&action, dispatcher)
            })?;
        }

        let effects = self.execute_async.snapshot();
        if effects.is_empty() {
            return run_post(&self.post, &action, dispatcher);
        }

        let Some(runtime) = dispatcher.runtime() else {
            warn!(
                action = action_type,
                effects = effects.len(),
                "asynchronous handlers registered but no tokio runtime available"
            );
            return Err(StateflowError::NoAsyncRuntime { action_type });
        };

        let guard = dispatcher.tracker().start();
        let post = self.post.clone();
        let dispatcher = dispatcher.clone();
        trace!(action = action_type, effects = effects.len(), "spawning async continuation");

        runtime.spawn(async move {
            let mut failures = run_effects(effects, &action, &dispatcher).await;

            if let Err(err) = run_post(&post, &action, &dispatcher) {
                failures.push(err);
            }

            // Last reference: back to the pool
            drop(action);

            if !failures.is_empty() {
                error!(
                    action = action_type,
                    failures = failures.len(),
                    "async continuation finished with failures"
                );
                guard.fail(StateflowError::AsyncFailed {
                    action_type,
                    failures,
                });
            }
            drop(guard);
        });

        Ok(())
    }
}

fn run_post<A: Action>(
    post: &RegistrationSet<Arc<dyn PostAction<A>>>,
    action: &A,
    dispatcher: &Dispatcher,
) -> Result<(), StateflowError> {
    for handler in post.snapshot().iter() {
        run_guarded(Stage::PostAction, action_name::<A>(), || {
            handler.post_action(action, dispatcher)
        })?;
    }
    Ok(())
}

/// Fan out every asynchronous effect and wait for all of them.
///
/// One failing or panicking effect never cancels its siblings.
async fn run_effects<A: Action>(
    effects: Snapshot<Arc<dyn ExecuteActionAsync<A>>>,
    action: &PooledAction<A>,
    dispatcher: &Dispatcher,
) -> Vec<StateflowError> {
    let action_type = action_name::<A>();

    let futures = effects.iter().map(|handler| {
        let handler = handler.clone();
        let shared = action.share();
        let dispatcher = dispatcher.clone();
        AssertUnwindSafe(async move { handler.execute_async(shared, dispatcher).await }).catch_unwind()
    });

    let mut failures = Vec::new();
    for result in join_all(futures).await {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                error!(action = action_type, error = %source, "async handler failed");
                failures.push(StateflowError::HandlerFailed {
                    stage: Stage::ExecuteActionAsync,
                    action_type,
                    source,
                });
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(action = action_type, panic = %message, "async handler panicked");
                failures.push(StateflowError::HandlerPanicked {
                    stage: Stage::ExecuteActionAsync,
                    action_type,
                    message,
                });
            }
        }
    }
    failures
}

/// Type-erased receiver, so one map can hold every action type.
pub(crate) trait AnyReceiver: Send + Sync {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    /// Run the pipeline for a boxed `PooledAction`.
    fn run(&self, action: Box<dyn Any + Send>, dispatcher: &Dispatcher) -> Result<(), StateflowError>;
}

impl<A: Action> AnyReceiver for ActionReceiver<A> {
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn run(&self, action: Box<dyn Any + Send>, dispatcher: &Dispatcher) -> Result<(), StateflowError> {
        match action.downcast::<PooledAction<A>>() {
            Ok(action) => self.process(*action, dispatcher),
            Err(_) => {
                // Queue entries are keyed by the same TypeId
                warn!(action = action_name::<A>(), "queued action did not match its receiver");
                Ok(())
            }
        }
    }
}

/// Receivers keyed by action type, created on first use.
#[derive(Default)]
pub(crate) struct Receivers {
    map: DashMap<TypeId, Arc<dyn AnyReceiver>>,
}

impl Receivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the receiver for `A`.
    pub fn receiver<A: Action>(&self) -> Arc<ActionReceiver<A>> {
        let erased = self
            .map
            .entry(TypeId::of::<A>())
            .or_insert_with(|| {
                debug!(action = action_name::<A>(), "creating action receiver");
                Arc::new(ActionReceiver::<A>::new()) as Arc<dyn AnyReceiver>
            })
            .clone();

        // Keyed by TypeId, so the downcast cannot miss.
        erased
            .as_any_arc()
            .downcast::<ActionReceiver<A>>()
            .unwrap_or_else(|_| Arc::new(ActionReceiver::new()))
    }

    /// The receiver for a queued action, if anything was ever registered.
    pub fn get(&self, type_id: &TypeId) -> Option<Arc<dyn AnyReceiver>> {
        self.map.get(type_id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl std::fmt::Debug for Receivers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receivers")
            .field("action_types", &self.map.len())
            .finish()
    }
}
