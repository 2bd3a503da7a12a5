//! Client-wide prepared-statement cache (§3, §4.6, §9 "Prepared-cache
//! ownership"). Shared across every `Connection`; consulted during
//! `UNPREPARED` recovery and updated when a rows response carries a
//! `newResultId`. Each entry is mutated through single-writer discipline:
//! readers only ever see a fully-assigned field, never a torn entry,
//! because every update is one reference swap (§5 "Shared resources").

use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
pub struct PreparedMetadata {
    pub result_id: Option<Vec<u8>>,
    pub bind_markers_count: usize,
}

#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub query: String,
    pub keyspace: Option<String>,
    pub meta: PreparedMetadata,
}

/// Keyed by the opaque `queryId` the server returned from `PREPARE`.
#[derive(Default)]
pub struct PreparedCache {
    entries: RwLock<std::collections::HashMap<Vec<u8>, Arc<RwLock<PreparedEntry>>>>,
}

impl PreparedCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, query_id: Vec<u8>, entry: PreparedEntry) {
        self.entries
            .write()
            .expect("prepared cache lock poisoned")
            .insert(query_id, Arc::new(RwLock::new(entry)));
    }

    pub fn get(&self, query_id: &[u8]) -> Option<Arc<RwLock<PreparedEntry>>> {
        self.entries
            .read()
            .expect("prepared cache lock poisoned")
            .get(query_id)
            .cloned()
    }

    /// Update the cached result id after a rows response carries a
    /// `newResultId` (§4.6 "Result-metadata refresh"). A single field
    /// assignment under the entry's own lock; never touches the rest of
    /// `entries`.
    pub fn refresh_result_id(&self, query_id: &[u8], new_result_id: Vec<u8>) {
        if let Some(entry) = self.get(query_id) {
            entry
                .write()
                .expect("prepared entry lock poisoned")
                .meta
                .result_id = Some(new_result_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn refresh_updates_only_result_id() {
        let cache = PreparedCache::new();
        let id = vec![1, 2, 3];
        cache.insert(
            id.clone(),
            PreparedEntry {
                query: "SELECT * FROM t WHERE k = ?".to_string(),
                keyspace: Some("ks".to_string()),
                meta: PreparedMetadata {
                    result_id: Some(vec![0xAA]),
                    bind_markers_count: 1,
                },
            },
        );

        cache.refresh_result_id(&id, vec![0xBB]);

        let entry = cache.get(&id).unwrap();
        let entry = entry.read().unwrap();
        assert_eq!(entry.meta.result_id, Some(vec![0xBB]));
        assert_eq!(entry.keyspace.as_deref(), Some("ks"));
    }

    #[test]
    fn unknown_query_id_refresh_is_a_noop() {
        let cache = PreparedCache::new();
        cache.refresh_result_id(&[9, 9], vec![1]);
        assert!(cache.get(&[9, 9]).is_none());
    }
}
