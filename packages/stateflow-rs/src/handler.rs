//! Pipeline stage traits and capability declaration.
//!
//! A handler object implements one or more stage traits for concrete action
//! or state types, then lists them in [`FunctionObject::capabilities`]. The
//! dispatcher binds each declared capability to the matching receiver or
//! store when the object is registered, so the dispatch path never inspects
//! types.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stateflow::{Capabilities, Dispatcher, ExecuteAction, FunctionObject, Subscribe};
//!
//! struct Audit;
//!
//! impl ExecuteAction<Increment> for Audit {
//!     fn execute(&self, _: &Increment, _: &Dispatcher) -> anyhow::Result<()> {
//!         tracing::info!("increment seen");
//!         Ok(())
//!     }
//! }
//!
//! impl Subscribe<Counter> for Audit {
//!     fn on_update(&self, store: Option<&str>, old: &Counter, new: &Counter) {
//!         tracing::info!(?store, old = old.0, new = new.0, "counter changed");
//!     }
//! }
//!
//! impl FunctionObject for Audit {
//!     fn capabilities(self: Arc<Self>, caps: &mut Capabilities) {
//!         caps.execute_action::<Increment>(self.clone())
//!             .subscribe::<Counter>(self);
//!     }
//! }
//! ```

use std::any::type_name;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use crate::action::Action;
use crate::dispatcher::Dispatcher;
use crate::receiver::Receivers;
use crate::registration::{Partition, Registration};
use crate::registry::StoreRegistry;
use crate::store::SubscribeOptions;

/// A pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PreAction,
    Reducer,
    ExecuteAction,
    ExecuteActionAsync,
    PostAction,
    /// Store change notification, run right after its reducer commits.
    Subscriber,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::PreAction => "pre-action",
            Stage::Reducer => "reducer",
            Stage::ExecuteAction => "execute-action",
            Stage::ExecuteActionAsync => "execute-action-async",
            Stage::PostAction => "post-action",
            Stage::Subscriber => "subscriber",
        };
        f.write_str(name)
    }
}

/// Runs before any reducer sees the action.
pub trait PreAction<A: Action>: Send + Sync + 'static {
    fn pre_action(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()>;
}

/// Synchronous side effect, run inline after the reducers.
///
/// Effects may dispatch further actions; those are queued behind the current
/// action rather than run nested.
pub trait ExecuteAction<A: Action>: Send + Sync + 'static {
    fn execute(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()>;
}

/// Asynchronous side effect.
///
/// All asynchronous effects of one action run concurrently in a detached
/// continuation; the drain loop does not wait for them. The action goes back
/// to its pool only after every one of them has finished and dropped its
/// `Arc`.
#[async_trait]
pub trait ExecuteActionAsync<A: Action>: Send + Sync + 'static {
    async fn execute_async(&self, action: Arc<A>, dispatcher: Dispatcher) -> anyhow::Result<()>;
}

/// Runs last: inline when the action has no asynchronous effects, otherwise
/// after all of them complete.
pub trait PostAction<A: Action>: Send + Sync + 'static {
    fn post_action(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()>;
}

/// Observes every store holding state type `S`.
pub trait Subscribe<S>: Send + Sync + 'static {
    /// Called after a change commits, outside the store's lock.
    fn on_update(&self, store: Option<&str>, old: &S, new: &S);
}

/// A handler object that declares which stages it takes part in.
pub trait FunctionObject: Send + Sync + 'static {
    /// Declare every (stage, type) pair this object handles.
    fn capabilities(self: Arc<Self>, caps: &mut Capabilities);
}

/// Where capability installers put their handlers.
pub(crate) struct Wiring<'a> {
    pub receivers: &'a Receivers,
    pub stores: &'a StoreRegistry,
    pub partition: Partition,
    pub registration: &'a mut Registration,
}

type Installer = Box<dyn FnOnce(&mut Wiring<'_>) + Send>;

/// Registration-time probe filled in by [`FunctionObject::capabilities`].
///
/// Records each declared `(stage, type)` pair together with a typed
/// installer that binds the handler when the object is registered.
pub struct Capabilities {
    owner: &'static str,
    declared: Vec<(Stage, &'static str)>,
    installers: Vec<(Stage, Installer)>,
}

impl Capabilities {
    pub(crate) fn new(owner: &'static str) -> Self {
        Self {
            owner,
            declared: Vec::new(),
            installers: Vec::new(),
        }
    }

    fn push(&mut self, stage: Stage, target: &'static str, installer: Installer) -> &mut Self {
        self.declared.push((stage, target));
        self.installers.push((stage, installer));
        self
    }

    pub fn pre_action<A: Action>(&mut self, handler: Arc<dyn PreAction<A>>) -> &mut Self {
        self.push(
            Stage::PreAction,
            type_name::<A>(),
            Box::new(move |wiring| {
                wiring
                    .receivers
                    .receiver::<A>()
                    .attach_pre(wiring.partition, handler, wiring.registration)
            }),
        )
    }

    pub fn execute_action<A: Action>(&mut self, handler: Arc<dyn ExecuteAction<A>>) -> &mut Self {
        self.push(
            Stage::ExecuteAction,
            type_name::<A>(),
            Box::new(move |wiring| {
                wiring
                    .receivers
                    .receiver::<A>()
                    .attach_execute(wiring.partition, handler, wiring.registration)
            }),
        )
    }

    pub fn execute_action_async<A: Action>(
        &mut self,
        handler: Arc<dyn ExecuteActionAsync<A>>,
    ) -> &mut Self {
        self.push(
            Stage::ExecuteActionAsync,
            type_name::<A>(),
            Box::new(move |wiring| {
                wiring.receivers.receiver::<A>().attach_execute_async(
                    wiring.partition,
                    handler,
                    wiring.registration,
                )
            }),
        )
    }

    pub fn post_action<A: Action>(&mut self, handler: Arc<dyn PostAction<A>>) -> &mut Self {
        self.push(
            Stage::PostAction,
            type_name::<A>(),
            Box::new(move |wiring| {
                wiring
                    .receivers
                    .receiver::<A>()
                    .attach_post(wiring.partition, handler, wiring.registration)
            }),
        )
    }

    /// Subscribe to every store holding `S`. No initial call is made.
    pub fn subscribe<S: Send + Sync + 'static>(&mut self, handler: Arc<dyn Subscribe<S>>) -> &mut Self {
        self.push(
            Stage::Subscriber,
            type_name::<S>(),
            Box::new(move |wiring| {
                for store in wiring.stores.stores_of::<S>() {
                    let handler = handler.clone();
                    let name = store.name_arc();
                    let options = SubscribeOptions::default().without_initial_call();
                    let callback = move |old: &S, new: &S| {
                        handler.on_update(name.as_deref(), old, new)
                    };
                    let registration = store.attach(wiring.partition, callback, options);
                    wiring.registration.merge(registration);
                }
            }),
        )
    }

    /// Every `(stage, type name)` pair declared so far.
    pub fn declared(&self) -> &[(Stage, &'static str)] {
        &self.declared
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }

    /// Drop every capability not belonging to `stage`.
    pub(crate) fn retain_stage(&mut self, stage: Stage) {
        self.declared.retain(|(s, _)| *s == stage);
        self.installers.retain(|(s, _)| *s == stage);
    }

    pub(crate) fn install(self, wiring: &mut Wiring<'_>) {
        trace!(
            object = self.owner,
            capabilities = self.declared.len(),
            partition = ?wiring.partition,
            "installing function object"
        );
        for (_, installer) in self.installers {
            installer(wiring);
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("owner", &self.owner)
            .field("declared", &self.declared)
            .finish()
    }
}

// =============================================================================
// Closure adapters
// =============================================================================

pub(crate) struct FnHandler<F, A> {
    f: F,
    _action: PhantomData<fn(&A)>,
}

impl<F, A> FnHandler<F, A> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _action: PhantomData,
        }
    }
}

impl<F, A> PreAction<A> for FnHandler<F, A>
where
    A: Action,
    F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn pre_action(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()> {
        (self.f)(action, dispatcher)
    }
}

impl<F, A> ExecuteAction<A> for FnHandler<F, A>
where
    A: Action,
    F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn execute(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()> {
        (self.f)(action, dispatcher)
    }
}

impl<F, A> PostAction<A> for FnHandler<F, A>
where
    A: Action,
    F: Fn(&A, &Dispatcher) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn post_action(&self, action: &A, dispatcher: &Dispatcher) -> anyhow::Result<()> {
        (self.f)(action, dispatcher)
    }
}

pub(crate) struct AsyncFnHandler<F, A> {
    f: F,
    _action: PhantomData<fn(Arc<A>)>,
}

impl<F, A> AsyncFnHandler<F, A> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _action: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut, A> ExecuteActionAsync<A> for AsyncFnHandler<F, A>
where
    A: Action,
    F: Fn(Arc<A>, Dispatcher) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute_async(&self, action: Arc<A>, dispatcher: Dispatcher) -> anyhow::Result<()> {
        (self.f)(action, dispatcher).await
    }
}
