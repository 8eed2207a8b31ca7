//! Path checker and prioritizer plugin interface.
//!
//! The reference implementation dynamically loads checker/prioritizer
//! shared objects by name. We model the same seam as a pair of traits with
//! a process-wide, statically-populated registry; no `dlopen` is required.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use crate::path::PathState;

/// A path checker: determines whether I/O currently succeeds on a path.
pub trait Checker: Send + Sync {
    /// Checker name, as used in configuration (`directio`, `tur`, ...).
    fn name(&self) -> &str;

    /// Run one check against the open path file descriptor.
    ///
    /// `fd` is an opaque descriptor value; concrete implementations
    /// downcast or reinterpret it according to their own I/O strategy.
    /// The core never inspects it.
    fn check(&self, fd: i32) -> PathState;
}

/// A path prioritizer: assigns a relative priority to a path.
pub trait Prioritizer: Send + Sync {
    /// Prioritizer name, as used in configuration (`alua`, `const`, ...).
    fn name(&self) -> &str;

    /// Compute the priority of the path behind `fd`. Higher is preferred;
    /// `UNDEF` (-1) means "could not be determined".
    fn get_prio(&self, fd: i32) -> i32;
}

/// Sentinel priority value meaning "undetermined", matching the C source's
/// `PRIO_UNDEF`.
pub const PRIO_UNDEF: i32 = -1;

/// Trivial checker that always reports the path as up. Used by tests and
/// as the reference "no hardware available" fallback.
#[derive(Debug, Default)]
pub struct AlwaysUpChecker;

impl Checker for AlwaysUpChecker {
    fn name(&self) -> &str {
        "always_up"
    }

    fn check(&self, _fd: i32) -> PathState {
        PathState::Up
    }
}

/// Trivial prioritizer returning a fixed value for every path. Used by
/// tests and as the default when no prioritizer is configured.
#[derive(Debug)]
pub struct ConstPrioritizer(pub i32);

impl Default for ConstPrioritizer {
    fn default() -> Self {
        Self(1)
    }
}

impl Prioritizer for ConstPrioritizer {
    fn name(&self) -> &str {
        "const"
    }

    fn get_prio(&self, _fd: i32) -> i32 {
        self.0
    }
}

/// Process-wide registry mapping a plugin name to its vtable, populated at
/// startup. Mirrors the reference implementation's static linkage of
/// checker/prioritizer objects without requiring `dlopen`.
#[derive(Default)]
pub struct PluginRegistry {
    checkers: Mutex<HashMap<String, Arc<dyn Checker>>>,
    prioritizers: Mutex<HashMap<String, Arc<dyn Prioritizer>>>,
}

impl PluginRegistry {
    /// Register a checker implementation under its own [`Checker::name`].
    pub fn register_checker(&self, checker: Arc<dyn Checker>) {
        self.checkers
            .lock()
            .unwrap()
            .insert(checker.name().to_string(), checker);
    }

    /// Register a prioritizer implementation under its own
    /// [`Prioritizer::name`].
    pub fn register_prioritizer(&self, prio: Arc<dyn Prioritizer>) {
        self.prioritizers
            .lock()
            .unwrap()
            .insert(prio.name().to_string(), prio);
    }

    /// Look up a checker by configured name.
    pub fn checker(&self, name: &str) -> Option<Arc<dyn Checker>> {
        self.checkers.lock().unwrap().get(name).cloned()
    }

    /// Look up a prioritizer by configured name.
    pub fn prioritizer(&self, name: &str) -> Option<Arc<dyn Prioritizer>> {
        self.prioritizers.lock().unwrap().get(name).cloned()
    }
}

/// The process-wide registry, populated with the two builtin reference
/// implementations on first access.
pub fn registry() -> &'static PluginRegistry {
    static REGISTRY: OnceLock<PluginRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let reg = PluginRegistry::default();
        reg.register_checker(Arc::new(AlwaysUpChecker));
        reg.register_prioritizer(Arc::new(ConstPrioritizer::default()));
        reg
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        let reg = registry();
        assert!(reg.checker("always_up").is_some());
        assert!(reg.checker("no-such-checker").is_none());
        assert_eq!(reg.prioritizer("const").unwrap().get_prio(-1), 1);
    }

    #[test]
    fn test_custom_registration() {
        let reg = PluginRegistry::default();
        reg.register_prioritizer(Arc::new(ConstPrioritizer(42)));
        assert_eq!(reg.prioritizer("const").unwrap().get_prio(0), 42);
        assert!(reg.prioritizer("alua").is_none());
    }
}
