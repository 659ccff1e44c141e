#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use stepledger::engine::{Engine, EngineConfig};
use stepledger::serialization::JsonMap;
use stepledger::store::{BlobStore, MemoryBlobStore, MemoryStore, Store};

/// Engine over fresh in-memory stores, with handles to both.
pub fn memory_engine() -> (Engine, Arc<MemoryStore>, Arc<MemoryBlobStore>) {
    memory_engine_with(EngineConfig::default())
}

pub fn memory_engine_with(config: EngineConfig) -> (Engine, Arc<MemoryStore>, Arc<MemoryBlobStore>) {
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let engine = Engine::builder()
        .store(store.clone() as Arc<dyn Store>)
        .blobs(blobs.clone() as Arc<dyn BlobStore>)
        .config(config)
        .build();
    (engine, store, blobs)
}

/// Build a variables-update map from key/value pairs.
pub fn updates(pairs: &[(&str, Value)]) -> JsonMap {
    let mut map = JsonMap::new();
    for (key, value) in pairs {
        map.insert((*key).to_string(), value.clone());
    }
    map
}
