//! Installation registry: the mapping from a code host's `installation_id`
//! to the account/sender credential triple that authorizes the service on
//! that installation's behalf.
//!
//! Entries are registered on an `installation.created` webhook and removed
//! on `installation.deleted`; nothing else mutates the registry.
//!
//! # Example
//!
//! ```
//! use inspectd_installation::InstallationRegistry;
//! use inspectd_types::Installation;
//! use chrono::Utc;
//!
//! let registry = InstallationRegistry::new();
//! registry.register(Installation {
//!     installation_id: 42,
//!     account_id: 7,
//!     sender_id: 99,
//!     enabled_at: Utc::now(),
//! });
//! assert!(registry.get(42).is_some());
//! registry.deregister(42);
//! assert!(registry.get(42).is_none());
//! ```

use std::collections::HashMap;
use std::sync::RwLock;

use inspectd_types::Installation;

/// In-memory credential registry. A real deployment backs this with the
/// `installations` table named in the wire contract; this registry holds
/// the same rows in memory.
#[derive(Debug, Default)]
pub struct InstallationRegistry {
    installations: RwLock<HashMap<i64, Installation>>,
}

impl InstallationRegistry {
    pub fn new() -> Self {
        Self {
            installations: RwLock::new(HashMap::new()),
        }
    }

    /// Registers or replaces the credential triple for an installation.
    pub fn register(&self, installation: Installation) {
        self.installations
            .write()
            .expect("installations lock poisoned")
            .insert(installation.installation_id, installation);
    }

    /// Removes an installation's credential triple. Idempotent: removing an
    /// installation that was never registered (or already removed) is not
    /// an error.
    pub fn deregister(&self, installation_id: i64) {
        self.installations
            .write()
            .expect("installations lock poisoned")
            .remove(&installation_id);
    }

    pub fn get(&self, installation_id: i64) -> Option<Installation> {
        self.installations
            .read()
            .expect("installations lock poisoned")
            .get(&installation_id)
            .cloned()
    }

    pub fn is_registered(&self, installation_id: i64) -> bool {
        self.installations
            .read()
            .expect("installations lock poisoned")
            .contains_key(&installation_id)
    }

    pub fn len(&self) -> usize {
        self.installations.read().expect("installations lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
