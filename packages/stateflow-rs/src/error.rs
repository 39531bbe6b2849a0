//! Structured error types for stateflow.
//!
//! `StateflowError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Handlers stay ergonomic (they return `anyhow::Result`),
//! and the dispatcher wraps whatever they produce with the stage and action
//! type that failed.
//!
//! # Error Taxonomy
//!
//! - **Lookup errors** (`AmbiguousStateType`, `UnknownStoreId`, ...) are
//!   returned to the call site that asked for the resolution.
//! - **Handler errors** (`HandlerFailed`, `HandlerPanicked`) abort the
//!   remaining synchronous stages of the action and are returned from the
//!   `dispatch` call that owns the drain loop.
//! - **Asynchronous errors** (`AsyncFailed`) are collected by the detached
//!   continuation and surfaced by [`Dispatcher::wait_idle`](crate::Dispatcher::wait_idle).
//!
//! A dispatch of an action type nobody registered for is not an error.
//!
//! # Example
//!
//! ```ignore
//! use stateflow::{StateflowError, StoreKey};
//!
//! match dispatcher.get_state::<Counter>(StoreKey::Type) {
//!     Ok(handle) => println!("count = {}", handle.get()?.0),
//!     Err(StateflowError::AmbiguousStateType { type_name, count }) => {
//!         eprintln!("{count} stores hold {type_name}; look it up by name");
//!     }
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::any::Any;
use std::time::Duration;

use thiserror::Error;

use crate::handler::Stage;
use crate::registry::StoreId;

/// Errors produced by the dispatcher, its stores and its handlers.
///
/// Each variant includes context about what went wrong.
#[derive(Debug, Error)]
pub enum StateflowError {
    /// More than one store holds the requested state type.
    #[error("{count} stores hold state type {type_name}; look it up by id or name")]
    AmbiguousStateType {
        /// Human-readable state type name.
        type_name: &'static str,
        /// How many stores matched.
        count: usize,
    },

    /// No store holds the requested state type.
    #[error("no store holds state type {type_name}")]
    StateTypeNotFound {
        /// Human-readable state type name.
        type_name: &'static str,
    },

    /// No store is registered under the requested name.
    #[error("no store named {name:?}")]
    StateNameNotFound {
        /// The name that was looked up.
        name: String,
    },

    /// The id was minted by another registry, or its slot is out of range.
    #[error("store id {id} does not belong to this dispatcher")]
    UnknownStoreId {
        /// The rejected id.
        id: StoreId,
    },

    /// The store was found but holds a different state type.
    #[error("store {id} holds {actual}, not {expected}")]
    StateTypeMismatch {
        /// The id the lookup resolved to.
        id: StoreId,
        /// The state type the caller asked for.
        expected: &'static str,
        /// The state type the store actually holds.
        actual: &'static str,
    },

    /// Two stores were registered under the same name.
    #[error("store name {name:?} is registered more than once")]
    DuplicateStoreName {
        /// The duplicated name.
        name: String,
    },

    /// The registry cannot encode this many slots into a store id.
    #[error("{count} stores exceed the registry limit of {max}")]
    TooManyStores {
        /// How many stores were supplied.
        count: usize,
        /// The maximum a single registry can hold.
        max: usize,
    },

    /// A state handle outlived the dispatcher that owned its store.
    #[error("store for {type_name} has been released")]
    StoreReleased {
        /// Human-readable state type name.
        type_name: &'static str,
    },

    /// A handler returned an error.
    #[error("{stage} handler for {action_type} failed: {source}")]
    HandlerFailed {
        /// The pipeline stage the handler was registered for.
        stage: Stage,
        /// Human-readable action type name.
        action_type: &'static str,
        /// The error the handler returned.
        #[source]
        source: anyhow::Error,
    },

    /// A handler panicked. The panic was caught so the drain loop survives.
    #[error("{stage} handler for {action_type} panicked: {message}")]
    HandlerPanicked {
        /// The pipeline stage the handler was registered for.
        stage: Stage,
        /// Human-readable action type name.
        action_type: &'static str,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// One or more handlers in a detached asynchronous continuation failed.
    #[error("{} asynchronous handler(s) for {action_type} failed", .failures.len())]
    AsyncFailed {
        /// Human-readable action type name.
        action_type: &'static str,
        /// Every failure the continuation observed, in completion order.
        failures: Vec<StateflowError>,
    },

    /// Asynchronous handlers exist but there is no tokio runtime to run them on.
    #[error("no tokio runtime available to run asynchronous handlers for {action_type}")]
    NoAsyncRuntime {
        /// Human-readable action type name.
        action_type: &'static str,
    },

    /// Timeout waiting for detached asynchronous work to finish.
    #[error("operation timed out after {duration:?}")]
    Timeout {
        /// How long we waited.
        duration: Duration,
    },
}

impl StateflowError {
    /// Returns true for errors raised by user handlers rather than by lookups.
    pub fn is_handler_failure(&self) -> bool {
        matches!(
            self,
            StateflowError::HandlerFailed { .. }
                | StateflowError::HandlerPanicked { .. }
                | StateflowError::AsyncFailed { .. }
        )
    }

    /// The pipeline stage that failed, for handler failures.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StateflowError::HandlerFailed { stage, .. }
            | StateflowError::HandlerPanicked { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Extract a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_state_type_display() {
        let err = StateflowError::AmbiguousStateType {
            type_name: "i32",
            count: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("2 stores"));
        assert!(msg.contains("i32"));
    }

    #[test]
    fn test_handler_failed_keeps_source() {
        let err = StateflowError::HandlerFailed {
            stage: Stage::ExecuteAction,
            action_type: "Increment",
            source: anyhow::anyhow!("disk full"),
        };
        assert!(err.to_string().contains("disk full"));
        assert!(err.to_string().contains("Increment"));
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.is_handler_failure());
        assert_eq!(err.stage(), Some(Stage::ExecuteAction));
    }

    #[test]
    fn test_async_failed_counts_failures() {
        let err = StateflowError::AsyncFailed {
            action_type: "Load",
            failures: vec![
                StateflowError::HandlerPanicked {
                    stage: Stage::ExecuteActionAsync,
                    action_type: "Load",
                    message: "boom".into(),
                },
                StateflowError::HandlerFailed {
                    stage: Stage::PostAction,
                    action_type: "Load",
                    source: anyhow::anyhow!("nope"),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "2 asynchronous handler(s) for Load failed"
        );
        assert!(err.is_handler_failure());
        assert_eq!(err.stage(), None);
    }

    #[test]
    fn test_lookup_errors_are_not_handler_failures() {
        let err = StateflowError::StateNameNotFound {
            name: "counter".into(),
        };
        assert!(!err.is_handler_failure());
        assert_eq!(err.to_string(), "no store named \"counter\"");
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = StateflowError::Timeout {
            duration: Duration::from_secs(1),
        }
        .into();

        let downcast = err.downcast_ref::<StateflowError>();
        assert!(matches!(downcast, Some(StateflowError::Timeout { .. })));
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(boxed.as_ref()), "static str");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }
}
