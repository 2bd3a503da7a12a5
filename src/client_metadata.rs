//! The `ClientMetadata` collaborator (§6): the core's read-only window
//! into schema/cluster state it does not own. Implementations live
//! outside this crate (cluster metadata discovery is explicitly out of
//! scope, §1).

use crate::host::Host;
use crate::prepared_cache::PreparedEntry;
use std::sync::Arc;

pub trait ClientMetadata: Send + Sync {
    /// Looks up a prepared statement's cached text/metadata/keyspace by
    /// its opaque `queryId`, used during `UNPREPARED` recovery (§4.6).
    fn get_prepared_by_id(&self, query_id: &[u8]) -> Option<PreparedEntry>;

    /// Resolves the replica set for a routing key, consumed by the
    /// token-aware fraction of a load-balancing policy's query plan;
    /// the core never computes this itself (§1 Non-goals).
    fn get_replicas(&self, keyspace: &str, routing_key: &[u8]) -> Vec<Arc<dyn Host>>;
}
