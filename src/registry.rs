use crate::engine::EnvironmentHandle;
use crate::host::ContextId;

/// One environment known to the plugin layer and the script context that
/// created it. Ownership is a lifecycle association only: any caller knowing
/// a handle may operate on the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryEntry {
    pub environment: EnvironmentHandle,
    pub owner: ContextId,
}

/// Table of environments created through the plugin, keyed by handle.
///
/// The registry never invents handles (the engine allocates them) and never
/// touches engine state; erasing environments is the caller's job. It holds
/// no lock of its own — every operation runs under the interface guard.
#[derive(Debug, Default)]
pub struct EnvironmentRegistry {
    entries: Vec<RegistryEntry>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Records a freshly created environment. The engine guarantees handle
    /// freshness, so a duplicate insert indicates a protocol bug upstream.
    pub fn add(&mut self, environment: EnvironmentHandle, owner: ContextId) {
        debug_assert!(
            !self.entries.iter().any(|e| e.environment == environment),
            "environment {environment} registered twice"
        );
        self.entries.push(RegistryEntry { environment, owner });
    }

    /// Removes the entry for `environment` if present. Safe no-op otherwise.
    /// Returns whether an entry was removed.
    pub fn remove_by_handle(&mut self, environment: EnvironmentHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.environment != environment);
        self.entries.len() != before
    }

    /// Removes and returns one arbitrary environment owned by `owner`, or
    /// `None` when that owner has nothing left. The teardown sweep calls this
    /// in a loop, erasing each returned environment from the engine in turn.
    pub fn remove_one_by_owner(&mut self, owner: ContextId) -> Option<EnvironmentHandle> {
        let index = self.entries.iter().position(|e| e.owner == owner)?;
        Some(self.entries.swap_remove(index).environment)
    }

    pub fn owner_of(&self, environment: EnvironmentHandle) -> Option<ContextId> {
        self.entries
            .iter()
            .find(|e| e.environment == environment)
            .map(|e| e.owner)
    }

    pub fn owned_by(&self, owner: ContextId) -> Vec<EnvironmentHandle> {
        self.entries
            .iter()
            .filter(|e| e.owner == owner)
            .map(|e| e.environment)
            .collect()
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_one_by_owner_drains_only_that_owner() {
        let mut registry = EnvironmentRegistry::new();
        registry.add(1, 100);
        registry.add(2, 100);
        registry.add(3, 200);

        let mut drained = Vec::new();
        while let Some(env) = registry.remove_one_by_owner(100) {
            drained.push(env);
        }
        drained.sort_unstable();
        assert_eq!(drained, vec![1, 2]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner_of(3), Some(200));
        assert_eq!(registry.remove_one_by_owner(100), None);
    }

    #[test]
    fn remove_by_handle_is_idempotent() {
        let mut registry = EnvironmentRegistry::new();
        registry.add(7, 1);
        assert!(registry.remove_by_handle(7));
        assert!(!registry.remove_by_handle(7));
        assert!(registry.is_empty());
    }
}
