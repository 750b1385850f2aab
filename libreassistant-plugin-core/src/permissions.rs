//! # Permission Gate Module
//!
//! Holds the set of user-approved capabilities per plugin. The supervisor
//! refuses to start a plugin until its declared permissions are a subset of
//! the approved set.
//!
//! Grants are mutated only on explicit user action (or during bootstrap when
//! the auto-approve flag is set from local configuration); every other
//! component reads through the accessors. Writes take the writer half of the
//! lock, reads are shared.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::manifest::{Capability, PluginDescriptor};

/// Per-plugin capability grant set.
pub struct PermissionGate {
    grants: RwLock<HashMap<String, BTreeSet<Capability>>>,
    auto_approve: AtomicBool,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self {
            grants: RwLock::new(HashMap::new()),
            auto_approve: AtomicBool::new(false),
        }
    }

    /// Enable or disable auto-approve-all mode.
    ///
    /// Only the lifecycle controller flips this, and only when the local
    /// configuration asks for it; it is never reachable from the HTTP
    /// surface.
    pub fn set_auto_approve(&self, enabled: bool) {
        if enabled {
            tracing::warn!(
                "permission auto-approve enabled: every declared capability will be granted at start"
            );
        }
        self.auto_approve.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_approve_enabled(&self) -> bool {
        self.auto_approve.load(Ordering::Relaxed)
    }

    /// Grant the given capabilities to a plugin, merging with prior grants.
    pub fn approve(&self, plugin_id: &str, capabilities: impl IntoIterator<Item = Capability>) {
        let mut grants = self.grants.write().expect("permission lock poisoned");
        let entry = grants.entry(plugin_id.to_string()).or_default();
        for capability in capabilities {
            entry.insert(capability);
        }
        tracing::info!(plugin = plugin_id, granted = ?entry, "permissions approved");
    }

    /// Remove every grant for a plugin.
    pub fn revoke(&self, plugin_id: &str) {
        self.grants
            .write()
            .expect("permission lock poisoned")
            .remove(plugin_id);
        tracing::info!(plugin = plugin_id, "permissions revoked");
    }

    /// Capabilities currently granted to a plugin.
    pub fn granted(&self, plugin_id: &str) -> BTreeSet<Capability> {
        self.grants
            .read()
            .expect("permission lock poisoned")
            .get(plugin_id)
            .cloned()
            .unwrap_or_default()
    }

    /// True iff every capability the descriptor declares has been granted.
    ///
    /// In auto-approve mode the declared set is granted on the spot, so the
    /// check always passes.
    pub fn is_satisfied(&self, descriptor: &PluginDescriptor) -> bool {
        if self.auto_approve_enabled() {
            self.approve(&descriptor.id, descriptor.permissions.iter().copied());
            return true;
        }
        let grants = self.grants.read().expect("permission lock poisoned");
        match grants.get(&descriptor.id) {
            Some(granted) => descriptor.permissions.is_subset(granted),
            None => descriptor.permissions.is_empty(),
        }
    }

    /// Declared capabilities that have not been granted, sorted.
    pub fn missing(&self, descriptor: &PluginDescriptor) -> Vec<Capability> {
        let granted = self.granted(&descriptor.id);
        descriptor
            .permissions
            .difference(&granted)
            .copied()
            .collect()
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}
