// src/kv.rs
// Storage abstraction over the Spin key-value store.
// Every store consumer takes `&impl KeyValueStore` so tests can substitute
// an in-memory map instead of a live Spin store.

use spin_sdk::key_value::Store;

pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()>;
    fn delete(&self, key: &str) -> Result<(), ()>;
}

impl KeyValueStore for Store {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, ()> {
        Store::get(self, key).map_err(|_| ())
    }
    fn set(&self, key: &str, value: &[u8]) -> Result<(), ()> {
        Store::set(self, key, value).map_err(|_| ())
    }
    fn delete(&self, key: &str) -> Result<(), ()> {
        Store::delete(self, key).map_err(|_| ())
    }
}

/// Read a JSON value from the store, returning None on missing or
/// undecodable entries (corrupt blobs are treated as absent, not fatal).
pub fn get_json<T: serde::de::DeserializeOwned>(
    store: &impl KeyValueStore,
    key: &str,
) -> Option<T> {
    store
        .get(key)
        .ok()
        .flatten()
        .and_then(|v| serde_json::from_slice(&v).ok())
}

/// Serialize and write a JSON value. Write failures are logged and swallowed;
/// in-memory state stays authoritative for the request.
pub fn set_json<T: serde::Serialize>(store: &impl KeyValueStore, key: &str, value: &T) {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            if store.set(key, &bytes).is_err() {
                eprintln!("[kv] failed to persist key {}", key);
            }
        }
        Err(e) => eprintln!("[kv] failed to serialize value for key {}: {}", key, e),
    }
}
