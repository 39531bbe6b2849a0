//! Fixed/flexible handler collections and their disposers.
//!
//! A [`RegistrationSet`] holds handlers in two partitions:
//! - **Fixed**: installed while the dispatcher is built, never removed
//! - **Flexible**: added and removed at runtime (ad hoc subscriptions, callbacks)
//!
//! Both partitions are copy-on-write. Iteration works on a [`Snapshot`] taken
//! when the iteration begins, so handlers added or removed mid-iteration
//! (including by the handlers being iterated) never disturb it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use smallvec::SmallVec;

/// Which partition a handler lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    /// Installed at startup, immutable for the dispatcher's lifetime.
    Fixed,
    /// Added and removed after startup.
    Flexible,
}

#[derive(Clone)]
struct Entry<T> {
    key: u64,
    handler: T,
}

/// Handler references split into fixed and flexible partitions.
pub(crate) struct RegistrationSet<T> {
    fixed: RwLock<Arc<[Entry<T>]>>,
    flexible: RwLock<Arc<[Entry<T>]>>,
    next_key: AtomicU64,
}

impl<T: Clone + Send + Sync + 'static> RegistrationSet<T> {
    pub fn new() -> Self {
        Self {
            fixed: RwLock::new(Arc::from(Vec::new())),
            flexible: RwLock::new(Arc::from(Vec::new())),
            next_key: AtomicU64::new(1),
        }
    }

    fn partition(&self, partition: Partition) -> &RwLock<Arc<[Entry<T>]>> {
        match partition {
            Partition::Fixed => &self.fixed,
            Partition::Flexible => &self.flexible,
        }
    }

    /// Append a handler and return its removal key.
    pub fn add(&self, partition: Partition, handler: T) -> u64 {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        let mut slot = self
            .partition(partition)
            .write()
            .unwrap_or_else(|e| e.into_inner());

        let mut entries = slot.to_vec();
        entries.push(Entry { key, handler });
        *slot = Arc::from(entries);
        key
    }

    /// Remove a flexible handler. Fixed handlers are never removed.
    ///
    /// Returns false when the key is unknown (already removed).
    pub fn remove(&self, key: u64) -> bool {
        let mut slot = self.flexible.write().unwrap_or_else(|e| e.into_inner());
        if !slot.iter().any(|entry| entry.key == key) {
            return false;
        }

        let remaining: Vec<_> = slot.iter().filter(|e| e.key != key).cloned().collect();
        *slot = Arc::from(remaining);
        true
    }

    /// Immutable view of both partitions at this instant.
    pub fn snapshot(&self) -> Snapshot<T> {
        let fixed = self.fixed.read().unwrap_or_else(|e| e.into_inner()).clone();
        let flexible = self
            .flexible
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        Snapshot { fixed, flexible }
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// A deferred removal that holds only a weak reference to this set.
    pub fn removal(self: &Arc<Self>, key: u64) -> Removal {
        let set: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            if let Some(set) = set.upgrade() {
                set.remove(key);
            }
        })
    }
}

impl<T> std::fmt::Debug for RegistrationSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fixed = self.fixed.read().map(|s| s.len()).unwrap_or(0);
        let flexible = self.flexible.read().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("RegistrationSet")
            .field("fixed", &fixed)
            .field("flexible", &flexible)
            .finish()
    }
}

/// Point-in-time view of a [`RegistrationSet`]; iterates fixed then flexible.
pub(crate) struct Snapshot<T> {
    fixed: Arc<[Entry<T>]>,
    flexible: Arc<[Entry<T>]>,
}

impl<T> Snapshot<T> {
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.fixed
            .iter()
            .chain(self.flexible.iter())
            .map(|entry| &entry.handler)
    }

    pub fn len(&self) -> usize {
        self.fixed.len() + self.flexible.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deferred removal of one handler.
pub(crate) type Removal = Box<dyn FnOnce() + Send>;

/// Disposer for handlers added at runtime.
///
/// `dispose()` removes exactly the handlers this registration added, and
/// nothing else. Disposing twice is a no-op. Dropping a `Registration`
/// disposes it; call [`leak`](Self::leak) to keep the handlers installed for
/// the dispatcher's lifetime instead.
///
/// # Example
///
/// ```ignore
/// let registration = dispatcher.register_execute_action::<Saved, _>(|_, _| {
///     println!("saved");
///     Ok(())
/// });
///
/// dispatcher.dispatch::<Saved>()?;   // prints "saved"
/// registration.dispose();
/// dispatcher.dispatch::<Saved>()?;   // prints nothing
/// ```
#[must_use = "dropping a Registration removes its handlers immediately"]
pub struct Registration {
    removals: Mutex<SmallVec<[Removal; 4]>>,
}

impl Registration {
    pub(crate) fn new() -> Self {
        Self {
            removals: Mutex::new(SmallVec::new()),
        }
    }

    /// Track a handler that this registration must remove on dispose.
    pub(crate) fn track(&mut self, removal: Removal) {
        self.removals
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .push(removal);
    }

    /// Fold another registration's handlers into this one.
    pub(crate) fn merge(&mut self, mut other: Registration) {
        let taken = std::mem::take(other.removals.get_mut().unwrap_or_else(|e| e.into_inner()));
        self.removals
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .extend(taken);
    }

    /// Remove every handler this registration added.
    pub fn dispose(&self) {
        let removals = {
            let mut guard = self.removals.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for removal in removals {
            removal();
        }
    }

    /// True once disposed (or when nothing was registered).
    pub fn is_disposed(&self) -> bool {
        self.len() == 0
    }

    /// Number of handlers still owned by this registration.
    pub fn len(&self) -> usize {
        self.removals
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Keep the handlers installed; nothing will remove them.
    pub fn leak(mut self) {
        self.removals
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("handlers", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(set: &RegistrationSet<&'static str>) -> Vec<&'static str> {
        set.snapshot().iter().copied().collect()
    }

    #[test]
    fn test_snapshot_iterates_fixed_then_flexible() {
        let set = RegistrationSet::new();
        set.add(Partition::Flexible, "flex-1");
        set.add(Partition::Fixed, "fixed-1");
        set.add(Partition::Flexible, "flex-2");
        set.add(Partition::Fixed, "fixed-2");

        assert_eq!(collect(&set), vec!["fixed-1", "fixed-2", "flex-1", "flex-2"]);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_remove_only_touches_flexible() {
        let set = RegistrationSet::new();
        let fixed = set.add(Partition::Fixed, "fixed");
        let flex = set.add(Partition::Flexible, "flex");

        assert!(!set.remove(fixed));
        assert!(set.remove(flex));
        assert!(!set.remove(flex));
        assert_eq!(collect(&set), vec!["fixed"]);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_changes() {
        let set = RegistrationSet::new();
        let a = set.add(Partition::Flexible, "a");
        set.add(Partition::Flexible, "b");

        let snapshot = set.snapshot();
        set.remove(a);
        set.add(Partition::Flexible, "c");

        let seen: Vec<_> = snapshot.iter().copied().collect();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(collect(&set), vec!["b", "c"]);
    }

    #[test]
    fn test_registration_dispose_removes_exactly_its_handlers() {
        let set = Arc::new(RegistrationSet::new());
        set.add(Partition::Flexible, "other");

        let mut registration = Registration::new();
        registration.track(set.removal(set.add(Partition::Flexible, "mine-1")));
        registration.track(set.removal(set.add(Partition::Flexible, "mine-2")));
        assert_eq!(registration.len(), 2);

        registration.dispose();
        assert!(registration.is_disposed());
        assert_eq!(collect(&set), vec!["other"]);

        // Second dispose is a no-op
        registration.dispose();
        assert_eq!(collect(&set), vec!["other"]);
    }

    #[test]
    fn test_registration_drop_disposes() {
        let set = Arc::new(RegistrationSet::new());
        {
            let mut registration = Registration::new();
            registration.track(set.removal(set.add(Partition::Flexible, "scoped")));
            assert_eq!(set.len(), 1);
        }
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_registration_leak_keeps_handlers() {
        let set = Arc::new(RegistrationSet::new());
        let mut registration = Registration::new();
        registration.track(set.removal(set.add(Partition::Flexible, "forever")));
        registration.leak();
        assert_eq!(collect(&set), vec!["forever"]);
    }

    #[test]
    fn test_merge_combines_removals() {
        let set = Arc::new(RegistrationSet::new());
        let mut first = Registration::new();
        first.track(set.removal(set.add(Partition::Flexible, "one")));
        let mut second = Registration::new();
        second.track(set.removal(set.add(Partition::Flexible, "two")));

        first.merge(second);
        // `second` was consumed without removing anything
        assert_eq!(set.len(), 2);

        first.dispose();
        assert_eq!(set.len(), 0);
    }

    #[test]
    fn test_removal_after_set_dropped_is_harmless() {
        let set = Arc::new(RegistrationSet::new());
        let mut registration = Registration::new();
        registration.track(set.removal(set.add(Partition::Flexible, "orphan")));
        drop(set);
        registration.dispose();
        assert!(registration.is_disposed());
    }

    #[test]
    fn test_concurrent_add_remove_during_iteration() {
        let set = Arc::new(RegistrationSet::new());
        for i in 0..32u64 {
            set.add(Partition::Flexible, i);
        }

        let writer = {
            let set = set.clone();
            std::thread::spawn(move || {
                for i in 0..500u64 {
                    let key = set.add(Partition::Flexible, 1000 + i);
                    set.remove(key);
                }
            })
        };

        for _ in 0..500 {
            let snapshot = set.snapshot();
            let first: Vec<u64> = snapshot.iter().copied().collect();
            let second: Vec<u64> = snapshot.iter().copied().collect();
            assert_eq!(first, second);
            assert!(first.len() >= 32);
        }
        writer.join().unwrap();
        assert_eq!(set.len(), 32);
    }
}
