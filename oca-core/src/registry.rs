//! Class registry
//!
//! Maps `(ClassID, ClassVersion)` to a factory. Controllers use it to build a
//! proxy for a remote object whose class they learned at runtime; a remote
//! class that is not registered resolves to its nearest registered ancestor.

use crate::error::{OcaError, OcaResult};
use crate::status::OcaStatus;
use crate::types::{ClassID, ClassIdentification, ClassVersion};
use std::collections::HashMap;

/// Registry of factories keyed by class identity
#[derive(Debug, Clone)]
pub struct ClassRegistry<F> {
    factories: HashMap<(ClassID, ClassVersion), F>,
}

impl<F> Default for ClassRegistry<F> {
    fn default() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }
}

impl<F> ClassRegistry<F> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for one class version
    ///
    /// # Errors
    /// Returns `Status(ParameterError)` if the class version is already registered
    pub fn register(&mut self, class_id: ClassID, version: ClassVersion, factory: F) -> OcaResult<()> {
        let key = (class_id, version);
        if self.factories.contains_key(&key) {
            return Err(OcaError::Status(OcaStatus::ParameterError));
        }
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Find the factory for a class identification
    ///
    /// Starting from the requested class, each ancestor is tried in turn; within
    /// each class, versions are tried from the requested one down to 1.
    pub fn resolve(&self, identification: &ClassIdentification) -> OcaResult<&F> {
        self.resolve_with_identity(identification).map(|(_, factory)| factory)
    }

    /// Like [`resolve`](Self::resolve), also returning the identity that matched
    pub fn resolve_with_identity(
        &self,
        identification: &ClassIdentification,
    ) -> OcaResult<(ClassIdentification, &F)> {
        let mut class_id = Some(identification.class_id.clone());

        while let Some(current) = class_id {
            for version in (1..=identification.class_version.max(1)).rev() {
                if let Some(factory) = self.factories.get(&(current.clone(), version)) {
                    return Ok((ClassIdentification::new(current, version), factory));
                }
            }
            class_id = current.parent();
        }

        Err(OcaError::UnknownClass(identification.to_string()))
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
