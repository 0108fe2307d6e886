//! The parameter cache (spec §4.K): a read-through/write-through local mirror of directory-held
//! parameters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use axon_common::Result;

use crate::master::{MasterClient, Value};

/// Local mirror of directory-held parameters, populated lazily on read and kept current on
/// write and on the directory's `paramUpdate` push.
pub struct ParamCache {
    master: Arc<MasterClient>,
    caller_id: String,
    caller_api: String,
    cache: Mutex<HashMap<String, Value>>,
}

impl ParamCache {
    pub fn new(master: Arc<MasterClient>, caller_id: impl Into<String>, caller_api: impl Into<String>) -> Self {
        Self {
            master,
            caller_id: caller_id.into(),
            caller_api: caller_api.into(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Checks the local cache first; on miss, fetches from the directory and populates it.
    pub async fn get_param(&self, key: &str) -> Option<Value> {
        if let Some(value) = self.cache.lock().get(key).cloned() {
            return Some(value);
        }
        match self.master.get_param(&self.caller_id, key).await {
            Ok(value) => {
                self.cache.lock().insert(key.to_string(), value.clone());
                Some(value)
            }
            Err(_) => None,
        }
    }

    pub async fn set_param(&self, key: &str, value: Value) -> Result<()> {
        self.master.set_param(&self.caller_id, key, value.clone()).await?;
        self.cache.lock().insert(key.to_string(), value);
        Ok(())
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        self.master.delete_param(&self.caller_id, key).await?;
        self.cache.lock().remove(key);
        Ok(())
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        if self.cache.lock().contains_key(key) {
            return Ok(true);
        }
        self.master.has_param(&self.caller_id, key).await
    }

    pub async fn search_param(&self, key: &str) -> Result<Option<String>> {
        self.master.search_param(&self.caller_id, key).await
    }

    /// Subscribes for future `paramUpdate` pushes on `key`, populating the cache with whatever
    /// the directory currently holds.
    pub async fn subscribe_param(&self, key: &str) -> Result<Value> {
        let value = self.master.subscribe_param(&self.caller_id, &self.caller_api, key).await?;
        self.cache.lock().insert(key.to_string(), value.clone());
        Ok(value)
    }

    /// Invoked from the directory-RPC server's `paramUpdate` handler. Updates unconditionally,
    /// even for keys this process never explicitly subscribed to (mirrors upstream's permissive
    /// behavior).
    pub fn apply_update(&self, key: &str, value: Value) {
        self.cache.lock().insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_update_is_unconditional() {
        let master = Arc::new(MasterClient::new("http://127.0.0.1:1"));
        let cache = ParamCache::new(master, "/tester", "http://127.0.0.1:2");
        cache.apply_update("/never_subscribed", Value::Int(7));
        assert_eq!(cache.cache.lock().get("/never_subscribed"), Some(&Value::Int(7)));
    }
}
