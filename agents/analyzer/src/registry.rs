//! Set of monitored processes shared by the connection handlers and the
//! run controller.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Operating system process identifier.
pub type ProcessId = u32;

/// Thread-safe set of tracked process ids.
///
/// Every mutation goes through one mutex. Liveness queries in
/// [`ProcessRegistry::remove_if_dead`] run on a copy of the set, so the guard
/// is never held across a call into the operating system.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    pids: Mutex<HashSet<ProcessId>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // The set has no multi-step invariant, so a panic in another holder
    // cannot leave it half-updated.
    fn lock(&self) -> MutexGuard<'_, HashSet<ProcessId>> {
        self.pids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `pid`. Returns `false` if it was already tracked.
    pub fn add(&self, pid: ProcessId) -> bool {
        self.lock().insert(pid)
    }

    pub fn add_many<I>(&self, pids: I)
    where
        I: IntoIterator<Item = ProcessId>,
    {
        for pid in pids {
            self.add(pid);
        }
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.lock().contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the tracked ids, in no particular order.
    pub fn snapshot(&self) -> Vec<ProcessId> {
        self.lock().iter().copied().collect()
    }

    /// Drop every tracked process for which `is_alive` reports `false` and
    /// return how many remain.
    pub fn remove_if_dead<F>(&self, is_alive: F) -> usize
    where
        F: Fn(ProcessId) -> bool,
    {
        let dead: Vec<ProcessId> = self
            .snapshot()
            .into_iter()
            .filter(|&pid| !is_alive(pid))
            .collect();

        let mut pids = self.lock();
        for pid in &dead {
            pids.remove(pid);
        }
        pids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_is_idempotent() {
        let registry = ProcessRegistry::new();

        assert!(registry.add(100));
        assert!(!registry.add(100));
        registry.add_many([100, 200, 200, 300, 100]);

        assert_eq!(registry.len(), 3);
        let mut pids = registry.snapshot();
        pids.sort_unstable();
        assert_eq!(pids, vec![100, 200, 300]);
    }

    #[test]
    fn test_concurrent_adds_are_not_lost() {
        let registry = Arc::new(ProcessRegistry::new());
        let threads: Vec<_> = (0..8u32)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for i in 0..250u32 {
                        registry.add(worker * 1000 + i);
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(registry.len(), 2000);
    }

    #[test]
    fn test_remove_if_dead_prunes_and_counts() {
        let registry = ProcessRegistry::new();
        registry.add_many([1, 2, 3, 4]);

        let remaining = registry.remove_if_dead(|pid| pid % 2 == 0);

        assert_eq!(remaining, 2);
        assert!(!registry.contains(1));
        assert!(registry.contains(2));
        assert!(!registry.contains(3));
        assert!(registry.contains(4));
    }

    #[test]
    fn test_remove_if_dead_on_empty_registry() {
        let registry = ProcessRegistry::new();
        assert_eq!(registry.remove_if_dead(|_| false), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_add_during_prune_is_kept() {
        let registry = ProcessRegistry::new();
        registry.add(1);

        // A process announced while liveness is being queried must survive.
        let remaining = registry.remove_if_dead(|_| {
            registry.add(42);
            false
        });

        assert_eq!(remaining, 1);
        assert!(registry.contains(42));
    }
}
