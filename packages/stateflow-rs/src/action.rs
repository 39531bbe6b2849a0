//! Action traits.
//!
//! An action is a transient, mutable message whose identity is its type.
//! Instances are pooled and reused, so every action must be able to return
//! itself to a freshly constructed state.
//!
//! # Example
//!
//! ```ignore
//! use stateflow::{Action, PayloadAction};
//!
//! #[derive(Default)]
//! struct Increment;
//! impl Action for Increment {}
//!
//! #[derive(Default)]
//! struct Rename {
//!     name: String,
//! }
//! impl Action for Rename {}
//!
//! impl PayloadAction for Rename {
//!     type Payload = String;
//!
//!     fn set_payload(&mut self, payload: String) {
//!         self.name = payload;
//!     }
//! }
//! ```

/// A typed message describing an intended state transition.
///
/// Actions are pulled from a per-type pool, reset, filled in, and handed to
/// exactly one pipeline run. They go back to the pool once every stage,
/// including detached asynchronous stages, has let go of them.
pub trait Action: Default + Send + Sync + 'static {
    /// Return the instance to a state indistinguishable from `Default`.
    ///
    /// Called on every instance before it is reused. The default
    /// implementation assigns `Self::default()`; override it to keep
    /// allocations (e.g. clear a `Vec` instead of replacing it).
    fn reset(&mut self) {
        *self = Self::default();
    }
}

/// An action that carries a single payload value.
///
/// Used by [`Dispatcher::dispatch_payload`](crate::Dispatcher::dispatch_payload).
pub trait PayloadAction: Action {
    /// The payload type.
    type Payload: Send + 'static;

    /// Attach the payload. Called after [`Action::reset`].
    fn set_payload(&mut self, payload: Self::Payload);
}

/// Human-readable name of an action type, used in logs and errors.
pub(crate) fn action_name<A: Action>() -> &'static str {
    std::any::type_name::<A>()
}
