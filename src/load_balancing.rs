//! The `LoadBalancingPolicy` collaborator (§6). The core only consumes
//! the query-plan iterator contract; concrete strategies (token-aware,
//! DC-aware round robin, ...) are explicitly out of scope (§1 Non-goals).

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::execution_options::ExecutionOptions;
use crate::host::Host;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDistance {
    Local,
    Remote,
    Ignored,
}

/// A lazy, possibly-finite ordered sequence of hosts to try for one user
/// request (§3, GLOSSARY "Query plan"). Consumed one host at a time by
/// `RequestHandler`; a policy is free to compute the next host only when
/// asked.
pub trait QueryPlan: Send {
    fn next(&mut self) -> Option<Arc<dyn Host>>;
}

/// A plan over a fixed, pre-computed list — the common case for simple
/// policies (round robin over "up" hosts, etc).
pub struct VecQueryPlan {
    hosts: std::vec::IntoIter<Arc<dyn Host>>,
}

impl VecQueryPlan {
    pub fn new(hosts: Vec<Arc<dyn Host>>) -> Self {
        Self {
            hosts: hosts.into_iter(),
        }
    }
}

impl QueryPlan for VecQueryPlan {
    fn next(&mut self) -> Option<Arc<dyn Host>> {
        self.hosts.next()
    }
}

#[async_trait]
pub trait LoadBalancingPolicy: Send + Sync {
    async fn init(&self, hosts: &[Arc<dyn Host>]) -> Result<()>;

    fn get_distance(&self, host: &dyn Host) -> HostDistance;

    async fn new_query_plan(
        &self,
        keyspace: Option<&str>,
        options: &ExecutionOptions,
    ) -> Result<Box<dyn QueryPlan>>;

    /// Arbitrary policy-specific knobs surfaced to callers that need them
    /// (e.g. the configured local datacenter) — opaque to the core (§6).
    fn get_options(&self) -> std::collections::HashMap<String, String> {
        std::collections::HashMap::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn vec_query_plan_yields_hosts_in_order_then_stops() {
        let mut plan = VecQueryPlan::new(Vec::new());
        assert!(plan.next().is_none());
    }
}
