//! Store registry and store ids.
//!
//! # Id Encoding
//!
//! ```text
//!  31            16 15             0
//! +----------------+----------------+
//! |  registry tag  |   slot index   |   id = slot ^ (tag << 16)
//! +----------------+----------------+
//! ```
//!
//! Every registry draws a tag from a process-wide counter that never yields
//! zero. Decoding XORs the tag back out and requires the upper half to be
//! zero, so an id minted by another registry (or a bare slot number) fails
//! the check instead of aliasing an unrelated store.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::StateflowError;
use crate::receiver::Receivers;
use crate::store::{AnyStore, StateHandle, Store, StoreSeed};

/// Maximum number of stores a single registry can hold.
pub const MAX_STORES: usize = 1 << 16;

static NEXT_TAG: AtomicU32 = AtomicU32::new(0);

fn next_tag() -> u32 {
    // 1..=0xFFFF, wrapping
    NEXT_TAG.fetch_add(1, Ordering::Relaxed) % 0xFFFF + 1
}

/// Opaque id of one store, scoped to the dispatcher that minted it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId(u32);

impl StoreId {
    /// The raw encoded value.
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Rebuild an id from its raw value, e.g. after passing it through FFI.
    ///
    /// Nothing is validated here; resolution checks the registry tag.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<u32> for StoreId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({:#010x})", self.0)
    }
}

/// How to find a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKey<'a> {
    /// The only store holding the requested state type.
    Type,
    Id(StoreId),
    Name(&'a str),
}

impl From<StoreId> for StoreKey<'_> {
    fn from(id: StoreId) -> Self {
        StoreKey::Id(id)
    }
}

impl<'a> From<&'a str> for StoreKey<'a> {
    fn from(name: &'a str) -> Self {
        StoreKey::Name(name)
    }
}

/// All stores of one dispatcher, fixed at construction.
pub(crate) struct StoreRegistry {
    tag: u32,
    stores: Arc<[Arc<dyn AnyStore>]>,
    names: HashMap<String, usize>,
}

impl StoreRegistry {
    /// Plant every store, assigning slots in order.
    pub fn new(seeds: Vec<Box<dyn StoreSeed>>, receivers: &Receivers) -> Result<Self, StateflowError> {
        if seeds.len() > MAX_STORES {
            return Err(StateflowError::TooManyStores {
                count: seeds.len(),
                max: MAX_STORES,
            });
        }

        let mut names = HashMap::new();
        for (slot, seed) in seeds.iter().enumerate() {
            if let Some(name) = seed.name() {
                if names.insert(name.to_string(), slot).is_some() {
                    return Err(StateflowError::DuplicateStoreName {
                        name: name.to_string(),
                    });
                }
            }
        }

        let stores: Vec<Arc<dyn AnyStore>> = seeds
            .into_iter()
            .map(|seed| seed.plant(receivers))
            .collect();

        let tag = next_tag();
        debug!(stores = stores.len(), tag, "store registry initialized");

        Ok(Self {
            tag,
            stores: Arc::from(stores),
            names,
        })
    }

    fn encode(&self, slot: usize) -> StoreId {
        StoreId(slot as u32 ^ (self.tag << 16))
    }

    fn decode(&self, id: StoreId) -> Option<usize> {
        let raw = id.0 ^ (self.tag << 16);
        if raw >> 16 != 0 {
            return None;
        }
        let slot = raw as usize;
        (slot < self.stores.len()).then_some(slot)
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Resolve `key` to a slot holding `S`.
    fn slot_of<S: 'static>(&self, key: StoreKey<'_>) -> Result<usize, StateflowError> {
        let slot = match key {
            StoreKey::Type => {
                let mut matches = self
                    .stores
                    .iter()
                    .enumerate()
                    .filter(|(_, store)| store.state_type() == TypeId::of::<S>())
                    .map(|(slot, _)| slot);
                let first = matches.next().ok_or(StateflowError::StateTypeNotFound {
                    type_name: type_name::<S>(),
                })?;
                let extra = matches.count();
                if extra > 0 {
                    return Err(StateflowError::AmbiguousStateType {
                        type_name: type_name::<S>(),
                        count: extra + 1,
                    });
                }
                return Ok(first);
            }
            StoreKey::Id(id) => self
                .decode(id)
                .ok_or(StateflowError::UnknownStoreId { id })?,
            StoreKey::Name(name) => {
                *self
                    .names
                    .get(name)
                    .ok_or_else(|| StateflowError::StateNameNotFound {
                        name: name.to_string(),
                    })?
            }
        };

        let store = &self.stores[slot];
        if store.state_type() != TypeId::of::<S>() {
            return Err(StateflowError::StateTypeMismatch {
                id: self.encode(slot),
                expected: type_name::<S>(),
                actual: store.state_type_name(),
            });
        }
        Ok(slot)
    }

    fn typed<S: Send + Sync + 'static>(&self, slot: usize) -> Option<Arc<Store<S>>> {
        self.stores[slot].clone().as_any_arc().downcast::<Store<S>>().ok()
    }

    /// Resolve `key` to its id and store.
    pub fn get<S: Send + Sync + 'static>(
        &self,
        key: StoreKey<'_>,
    ) -> Result<(StoreId, Arc<Store<S>>), StateflowError> {
        let slot = self.slot_of::<S>(key)?;
        let store = self.typed::<S>(slot).ok_or(StateflowError::StateTypeMismatch {
            id: self.encode(slot),
            expected: type_name::<S>(),
            actual: self.stores[slot].state_type_name(),
        })?;
        Ok((self.encode(slot), store))
    }

    pub fn id_of<S: 'static>(&self, key: StoreKey<'_>) -> Result<StoreId, StateflowError> {
        self.slot_of::<S>(key).map(|slot| self.encode(slot))
    }

    pub fn handle<S: Send + Sync + 'static>(
        &self,
        key: StoreKey<'_>,
    ) -> Result<StateHandle<S>, StateflowError> {
        let (id, store) = self.get::<S>(key)?;
        Ok(store.handle(id))
    }

    /// Every store holding `S`, in slot order.
    pub fn stores_of<S: Send + Sync + 'static>(&self) -> Vec<Arc<Store<S>>> {
        (0..self.stores.len())
            .filter(|slot| self.stores[*slot].state_type() == TypeId::of::<S>())
            .filter_map(|slot| self.typed::<S>(slot))
            .collect()
    }

    pub fn states(&self) -> States {
        States {
            tag: self.tag,
            stores: self.stores.clone(),
        }
    }
}

impl fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreRegistry")
            .field("tag", &self.tag)
            .field("stores", &self.stores.len())
            .field("named", &self.names.len())
            .finish()
    }
}

/// Every store of a dispatcher, as of the call to
/// [`Dispatcher::get_states`](crate::Dispatcher::get_states).
///
/// Handles are created lazily while iterating. Iterating again starts over.
#[derive(Clone)]
pub struct States {
    tag: u32,
    stores: Arc<[Arc<dyn AnyStore>]>,
}

impl States {
    pub fn iter(&self) -> impl Iterator<Item = AnyStateHandle> + '_ {
        self.stores
            .iter()
            .enumerate()
            .map(move |(slot, store)| AnyStateHandle {
                id: StoreId(slot as u32 ^ (self.tag << 16)),
                state_type: store.state_type_name(),
                store: Arc::downgrade(store),
            })
    }

    pub fn len(&self) -> usize {
        self.stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}

impl<'a> IntoIterator for &'a States {
    type Item = AnyStateHandle;
    type IntoIter = Box<dyn Iterator<Item = AnyStateHandle> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl fmt::Debug for States {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("States")
            .field("stores", &self.stores.len())
            .finish()
    }
}

/// Untyped handle to one store's live value.
#[derive(Clone)]
pub struct AnyStateHandle {
    id: StoreId,
    state_type: &'static str,
    store: Weak<dyn AnyStore>,
}

impl AnyStateHandle {
    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.store
            .upgrade()
            .and_then(|store| store.name().map(str::to_string))
    }

    pub fn state_type_name(&self) -> &'static str {
        self.state_type
    }

    /// Current value, type-erased.
    pub fn value(&self) -> Result<Arc<dyn Any + Send + Sync>, StateflowError> {
        self.store
            .upgrade()
            .map(|store| store.value_any())
            .ok_or(StateflowError::StoreReleased {
                type_name: self.state_type,
            })
    }

    /// A typed handle, when the store holds `S`.
    pub fn downcast<S: Send + Sync + 'static>(&self) -> Option<StateHandle<S>> {
        let store = self.store.upgrade()?;
        let typed = store.as_any_arc().downcast::<Store<S>>().ok()?;
        Some(typed.handle(self.id))
    }
}

impl fmt::Debug for AnyStateHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyStateHandle")
            .field("id", &self.id)
            .field("state", &self.state_type)
            .finish()
    }
}
