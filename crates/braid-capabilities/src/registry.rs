use std::collections::HashMap;
use std::sync::Arc;

use braid_core::error::{BraidError, Result};
use braid_core::traits::Capability;
use braid_core::types::CapabilityInfo;

/// Registry of invocable capabilities, keyed by name.
///
/// Populated at startup, then shared read-only behind an `Arc` by every run.
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: HashMap::new(),
        }
    }

    /// Register a capability. A later registration under the same name wins.
    pub fn register(&mut self, capability: impl Capability) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, Arc::new(capability));
    }

    /// Register an already shared capability.
    pub fn register_arc(&mut self, capability: Arc<dyn Capability>) {
        let name = capability.name().to_string();
        self.capabilities.insert(name, capability);
    }

    /// Unregister a capability by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.capabilities.remove(name).is_some()
    }

    /// Get a capability by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    /// Get a capability by name, failing with a resolution error.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Capability>> {
        self.get(name)
            .ok_or_else(|| BraidError::CapabilityNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.capabilities.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Capability metadata, sorted by name.
    pub fn infos(&self) -> Vec<CapabilityInfo> {
        let mut infos: Vec<CapabilityInfo> = self
            .capabilities
            .values()
            .map(|c| CapabilityInfo {
                name: c.name().to_string(),
                description: c.description().to_string(),
                streaming: c.streaming(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.capabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty()
    }

    /// Create a registry with all built-in capabilities registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // ── Data ────────────────────────────────────────────────
        registry.register(crate::builtin::data::EchoCapability);
        registry.register(crate::builtin::data::JsonQueryCapability);
        registry.register(crate::builtin::data::TemplateCapability);

        // ── Arithmetic ──────────────────────────────────────────
        registry.register(crate::builtin::math::MathCapability);

        // ── Timing / streaming ──────────────────────────────────
        registry.register(crate::builtin::timing::DelayCapability);
        registry.register(crate::builtin::text::TextStreamCapability);

        registry
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}
