//! Algorithm registry
//!
//! Binaries that ship several algorithms register them by name; the runner
//! binds the one named by `algorithm.entry_point`.

use std::collections::HashMap;

use super::{Algorithm, AlgorithmCallbacks, LoadError};

#[derive(Default, Clone)]
pub struct AlgorithmRegistry {
    algorithms: HashMap<String, AlgorithmCallbacks>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callbacks: AlgorithmCallbacks) {
        self.algorithms.insert(name.into(), callbacks);
    }

    pub fn get(&self, name: &str) -> Option<&AlgorithmCallbacks> {
        self.algorithms.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.algorithms.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bind the algorithm registered under `entry_point`
    pub fn resolve(&self, entry_point: &str) -> Result<Algorithm, LoadError> {
        let callbacks = self
            .algorithms
            .get(entry_point)
            .ok_or_else(|| LoadError::UnknownAlgorithm(entry_point.to_string()))?;
        tracing::info!("loading algorithm {}", entry_point);
        callbacks.clone().bind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_resolve_by_entry_point() {
        let mut registry = AlgorithmRegistry::new();
        registry.register("main", AlgorithmCallbacks::new().start(|_c, _b| async { Ok(Value::Null) }));
        registry.register("broken", AlgorithmCallbacks::new());

        assert!(registry.resolve("main").is_ok());
        assert_eq!(registry.names(), vec!["broken", "main"]);
        assert_eq!(
            registry.resolve("broken").err(),
            Some(LoadError::MissingMethod("start"))
        );
        assert_eq!(
            registry.resolve("other").err().map(|e| e.to_string()),
            Some("unable to find algorithm other".to_string())
        );
    }
}
