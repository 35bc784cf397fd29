//! Remote Directory
//!
//! Name-to-reference lookup used for distributed addressing. The object core
//! only touches it at activation and deactivation boundaries.

use crate::error::{Result, RuntimeError};
use crate::transport::{ObjectKey, RemoteReference};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;
use tracing::{debug, warn};

/// External name service
pub trait RemoteDirectory: Send + Sync {
    /// Bind `reference` under `key`. An existing binding is replaced only
    /// when `force` is set; otherwise the call fails with
    /// `RegistrationConflict`.
    fn register(&self, key: ObjectKey, reference: RemoteReference, force: bool) -> Result<()>;

    fn resolve(&self, key: ObjectKey) -> Result<RemoteReference>;

    fn unregister(&self, key: ObjectKey) -> Result<()>;

    fn list(&self) -> Vec<ObjectKey>;
}

#[derive(Debug, Clone)]
struct Binding {
    reference: RemoteReference,
    bound_at: SystemTime,
}

/// In-process directory
#[derive(Debug)]
pub struct LocalDirectory {
    bindings: RwLock<HashMap<ObjectKey, Binding>>,
    available: AtomicBool,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the directory going away (every call fails as unavailable)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: ObjectKey) -> bool {
        self.bindings.read().contains_key(&key)
    }

    /// When `key` was last bound
    pub fn bound_at(&self, key: ObjectKey) -> Option<SystemTime> {
        self.bindings.read().get(&key).map(|b| b.bound_at)
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(RuntimeError::transport_unavailable("directory unreachable"))
        }
    }
}

impl Default for LocalDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteDirectory for LocalDirectory {
    fn register(&self, key: ObjectKey, reference: RemoteReference, force: bool) -> Result<()> {
        self.ensure_available()?;
        let mut bindings = self.bindings.write();

        if let Some(existing) = bindings.get(&key) {
            if !force {
                return Err(RuntimeError::registration_conflict(key));
            }
            warn!(
                key = %key,
                previous = existing.reference.handle(),
                "Replacing existing directory binding"
            );
        }

        debug!(key = %key, handle = reference.handle(), "Binding reference");
        bindings.insert(
            key,
            Binding {
                reference,
                bound_at: SystemTime::now(),
            },
        );
        Ok(())
    }

    fn resolve(&self, key: ObjectKey) -> Result<RemoteReference> {
        self.ensure_available()?;
        self.bindings
            .read()
            .get(&key)
            .map(|b| b.reference.clone())
            .ok_or_else(|| RuntimeError::not_found(key))
    }

    fn unregister(&self, key: ObjectKey) -> Result<()> {
        self.ensure_available()?;
        match self.bindings.write().remove(&key) {
            Some(_) => {
                debug!(key = %key, "Unbound reference");
                Ok(())
            }
            None => Err(RuntimeError::not_found(key)),
        }
    }

    fn list(&self) -> Vec<ObjectKey> {
        self.bindings.read().keys().copied().collect()
    }
}
