//! The `Host` collaborator (§3): opaque to the core except for the
//! handful of fields and the one operation `RequestHandler` needs to
//! acquire a connection. Concrete host bookkeeping (topology, token
//! ownership, health tracking) lives outside this crate's scope.

use std::time::SystemTime;

use async_trait::async_trait;

use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Workload {
    Cassandra,
    Analytics,
    Search,
    Graph,
}

#[async_trait]
pub trait Host: Send + Sync {
    fn address(&self) -> &Endpoint;
    fn datacenter(&self) -> &str;
    fn is_up(&self) -> bool;
    fn get_in_flight(&self) -> usize;
    fn get_response_count(&self) -> u64;
    fn is_up_since(&self) -> Option<SystemTime>;
    fn workloads(&self) -> &[Workload];

    /// Acquire a connection to this host for a request against the given
    /// keyspace, per §3 "borrowConnection(keyspace) -> Connection".
    async fn borrow_connection(&self, keyspace: Option<&str>) -> Result<Connection>;
}
