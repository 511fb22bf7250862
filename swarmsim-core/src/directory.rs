//! Name-based lookup of shared capability objects.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::node::TransportError;

/// Errors from name binding and registration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("No object bound under name: {name}")]
    NotBound { name: String },

    #[error("Name already bound: {name}")]
    AlreadyBound { name: String },

    #[error("Name already registered by a different node: {name}")]
    NameTaken { name: String },

    #[error("Registry transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Thread-safe name directory.
///
/// Holds shared handles, so a lookup keeps the object alive independently
/// of later unbinding.
pub struct Directory<T: ?Sized> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T: ?Sized> Directory<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Binds `object` under `name`.
    ///
    /// # Errors
    /// - `RegistryError::AlreadyBound` - Another object already holds the name
    pub fn bind(&self, name: impl Into<String>, object: Arc<T>) -> Result<(), RegistryError> {
        let name = name.into();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            return Err(RegistryError::AlreadyBound { name });
        }
        tracing::debug!("Bound {} in directory", name);
        entries.insert(name, object);
        Ok(())
    }

    /// Binds `object` under `name`, replacing any previous binding.
    pub fn rebind(&self, name: impl Into<String>, object: Arc<T>) -> Option<Arc<T>> {
        self.entries.write().insert(name.into(), object)
    }

    /// Removes the binding for `name`, returning the object that held it.
    pub fn unbind(&self, name: &str) -> Option<Arc<T>> {
        self.entries.write().remove(name)
    }

    /// Resolves `name` to its bound object.
    ///
    /// # Errors
    /// - `RegistryError::NotBound` - Nothing is bound under the name
    pub fn lookup(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotBound {
                name: name.to_string(),
            })
    }

    /// Bound names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl<T: ?Sized> Default for Directory<T> {
    fn default() -> Self {
        Self::new()
    }
}
