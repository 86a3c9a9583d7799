use std::collections::HashMap;
use std::sync::Mutex;

use futures::future::BoxFuture;

use gatehouse_core::error::{GatehouseError, Result};
use gatehouse_core::flow::FlowDefinition;
use gatehouse_core::instance::InstanceRecord;
use gatehouse_core::traits::InstanceStore;
use gatehouse_core::types::InstanceId;

/// Process-local store. Same append-only contract as the SQLite store.
#[derive(Default)]
pub struct MemoryInstanceStore {
    definitions: Mutex<HashMap<String, FlowDefinition>>,
    instances: Mutex<HashMap<InstanceId, InstanceRecord>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned(e: impl std::fmt::Display) -> GatehouseError {
    GatehouseError::Database(format!("store lock poisoned: {}", e))
}

impl InstanceStore for MemoryInstanceStore {
    fn save_definition(&self, def: &FlowDefinition) -> BoxFuture<'_, Result<()>> {
        let def = def.clone();
        Box::pin(async move {
            self.definitions
                .lock()
                .map_err(poisoned)?
                .insert(def.id.clone(), def);
            Ok(())
        })
    }

    fn load_definition(&self, id: &str) -> BoxFuture<'_, Result<Option<FlowDefinition>>> {
        let id = id.to_string();
        Box::pin(async move { Ok(self.definitions.lock().map_err(poisoned)?.get(&id).cloned()) })
    }

    fn list_definitions(&self) -> BoxFuture<'_, Result<Vec<FlowDefinition>>> {
        Box::pin(async move {
            let mut defs: Vec<FlowDefinition> =
                self.definitions.lock().map_err(poisoned)?.values().cloned().collect();
            defs.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(defs)
        })
    }

    fn save_instance(&self, record: &InstanceRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            let mut instances = self.instances.lock().map_err(poisoned)?;
            let merged = match instances.get(&record.id) {
                // Keep stored steps; take only what lies past them.
                Some(existing) => {
                    let mut history = existing.history().to_vec();
                    history.extend(record.history().iter().skip(history.len()).cloned());
                    record.restore(history)
                }
                None => record,
            };
            instances.insert(merged.id.clone(), merged);
            Ok(())
        })
    }

    fn load_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<Option<InstanceRecord>>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.instances.lock().map_err(poisoned)?.get(&id).cloned()) })
    }

    fn delete_instance(&self, id: &InstanceId) -> BoxFuture<'_, Result<bool>> {
        let id = id.clone();
        Box::pin(async move { Ok(self.instances.lock().map_err(poisoned)?.remove(&id).is_some()) })
    }

    fn list_instances(&self) -> BoxFuture<'_, Result<Vec<InstanceId>>> {
        Box::pin(async move {
            Ok(self.instances.lock().map_err(poisoned)?.keys().cloned().collect())
        })
    }
}
