/// Hot-swap engine adapter registry using ArcSwap
///
/// Each registration swaps the entire map pointer, so lookups on the execution
/// path never take a lock and adapters can be replaced while executions run.

use crate::adapter::EngineAdapter;
use crate::workflow::EngineType;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

pub struct AdapterRegistry {
    /// Key: engine type, Value: adapter serving it
    adapters: ArcSwap<HashMap<EngineType, Arc<dyn EngineAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Register or replace the adapter for an engine type
    pub fn register(&self, engine_type: EngineType, adapter: Arc<dyn EngineAdapter>) {
        // rcu retries the clone-and-swap if another registration raced us
        self.adapters.rcu(|current| {
            let mut next = (**current).clone();
            next.insert(engine_type, Arc::clone(&adapter));
            next
        });
        tracing::info!("🔌 Registered engine adapter: {}", engine_type);
    }

    pub fn unregister(&self, engine_type: EngineType) -> bool {
        let mut removed = false;
        self.adapters.rcu(|current| {
            let mut next = (**current).clone();
            removed = next.remove(&engine_type).is_some();
            next
        });
        if removed {
            tracing::info!("🔌 Removed engine adapter: {}", engine_type);
        }
        removed
    }

    /// Lock-free lookup
    pub fn get(&self, engine_type: EngineType) -> Option<Arc<dyn EngineAdapter>> {
        self.adapters.load().get(&engine_type).cloned()
    }

    pub fn contains(&self, engine_type: EngineType) -> bool {
        self.adapters.load().contains_key(&engine_type)
    }

    pub fn engine_types(&self) -> Vec<EngineType> {
        let mut types: Vec<EngineType> = self.adapters.load().keys().copied().collect();
        types.sort();
        types
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("engine_types", &self.engine_types())
            .finish()
    }
}
