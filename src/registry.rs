// src/registry.rs

//! Alias → layer registry.
//!
//! A trivial collaborator letting application code resolve channel layers
//! by name ("default", "background", ...) instead of threading `LayerPtr`s
//! everywhere.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::LayerPtr;

/// Registry of named channel layers.
#[derive(Default)]
pub struct LayerRegistry {
    layers: RwLock<HashMap<String, LayerPtr>>,
}

impl LayerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a layer under an alias, replacing any previous holder.
    pub async fn register(&self, alias: impl Into<String>, layer: LayerPtr) {
        self.layers.write().await.insert(alias.into(), layer);
    }

    /// Look up a layer by alias.
    pub async fn get(&self, alias: &str) -> Option<LayerPtr> {
        self.layers.read().await.get(alias).cloned()
    }

    /// Whether any layer is registered at all.
    pub async fn has_any(&self) -> bool {
        !self.layers.read().await.is_empty()
    }

    /// Remove and return the layer registered under an alias.
    pub async fn unregister(&self, alias: &str) -> Option<LayerPtr> {
        self.layers.write().await.remove(alias)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::InMemoryLayer;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_register_get_unregister() {
        // ---
        let registry = LayerRegistry::new();
        assert!(!registry.has_any().await);
        assert!(registry.get("default").await.is_none());

        let layer: LayerPtr = Arc::new(InMemoryLayer::default());
        registry.register("default", layer).await;

        assert!(registry.has_any().await);
        assert!(registry.get("default").await.is_some());

        assert!(registry.unregister("default").await.is_some());
        assert!(!registry.has_any().await);
        assert!(registry.unregister("default").await.is_none());
    }
}
