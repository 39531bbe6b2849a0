//! # Stateflow
//!
//! A typed action-dispatch runtime where reducers own state, effects react,
//! and a single drain loop serializes every mutation.
//!
//! ## Core Concepts
//!
//! - [`Action`] = a pooled, typed message describing an intended transition
//! - Store = the sole owner of one state value, declared with [`StoreBuilder`]
//! - Handlers = pre-actions, effects (sync and async), post-actions and
//!   subscribers, registered as closures or through [`FunctionObject`]
//!
//! ## Architecture
//!
//! ```text
//! dispatch::<A>()
//!     │ take from ActionPool<A>, reset, set up
//!     ▼
//! Queue ──► drain loop (one drainer per dispatcher)
//!     │
//!     ▼ ActionReceiver<A>
//!   PreAction ─► reducers ─► Store.commit ─► subscribers(old, new)
//!     │
//!     ├─► ExecuteAction
//!     │
//!     ├─ no async effects ─► PostAction ─► back to pool
//!     │
//!     └─ async effects ─► spawned continuation
//!                           join_all(ExecuteActionAsync)
//!                           PostAction
//!                           back to pool
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One drainer** - actions dispatched during a drain (from handlers or
//!    other threads) queue behind the current action, in submission order
//! 2. **Commit then notify** - a store value changes only under its own lock,
//!    subscribers run after the lock is released
//! 3. **Idempotent commits** - an equivalent result commits nothing and
//!    notifies no one
//! 4. **Safe reuse** - an action returns to its pool only when no stage,
//!    asynchronous ones included, still holds it
//! 5. **Scoped ids** - a [`StoreId`] only resolves on the dispatcher that
//!    minted it
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use stateflow::{Action, Dispatcher, StoreBuilder, StoreKey};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Counter(i64);
//!
//! #[derive(Default)]
//! struct Increment;
//! impl Action for Increment {}
//!
//! let dispatcher = Dispatcher::builder()
//!     .with_store(
//!         StoreBuilder::new(Counter(0))
//!             .named("counter")
//!             .reducer(|n: &Counter, _: &Increment| Counter(n.0 + 1)),
//!     )
//!     .build()?;
//!
//! let _sub = dispatcher.subscribe::<Counter, _>(StoreKey::Type, |old, new| {
//!     println!("{} -> {}", old.0, new.0);
//! })?;
//!
//! dispatcher.dispatch::<Increment>()?;
//! dispatcher.dispatch::<Increment>()?;
//!
//! let counter = dispatcher.get_state::<Counter>(StoreKey::Name("counter"))?;
//! assert_eq!(counter.get()?.0, 2);
//! ```
//!
//! ## Failure Policy
//!
//! Synchronous stages stop at the first failing (or panicking) handler, and
//! the error is returned from the `dispatch` call that owns the drain loop.
//! Actions still queued stay queued for the next dispatch or
//! [`Dispatcher::flush`]. Asynchronous effects are isolated from each other;
//! their failures are collected and returned by [`Dispatcher::wait_idle`].

// Core modules
mod action;
mod config;
mod dispatcher;
mod error;
mod handler;
mod pool;
mod receiver;
mod registration;
mod registry;
mod store;
mod tracker;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export action traits
pub use action::{Action, PayloadAction};

// Re-export configuration
pub use config::{DispatcherConfig, DEFAULT_POOL_CAPACITY, DEFAULT_QUEUE_WARN_DEPTH};

// Re-export dispatcher types (primary entry point)
pub use dispatcher::{Dispatcher, DispatcherBuilder};

// Re-export error types
pub use error::StateflowError;

// Re-export handler types
pub use handler::{
    Capabilities, ExecuteAction, ExecuteActionAsync, FunctionObject, PostAction, PreAction, Stage,
    Subscribe,
};

// Re-export pool ticket
pub use pool::PooledAction;

// Re-export registration types
pub use registration::{Partition, Registration};

// Re-export store and registry types
pub use registry::{AnyStateHandle, States, StoreId, StoreKey, MAX_STORES};
pub use store::{ExecutionContext, StateHandle, StoreBuilder, SubscribeOptions};

// Re-export commonly used external types
pub use async_trait::async_trait;
