//! Per-request effective settings (§3 `ExecutionOptions`): the result of
//! resolving what the caller passed against the selected execution
//! profile and the client-wide defaults in `ClientConfig`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::load_balancing::LoadBalancingPolicy;
use crate::protocol::request::Consistency;
use crate::retry_policy::RetryPolicy;
use crate::speculative_execution::SpeculativeExecutionPolicy;

#[derive(Clone)]
pub struct ExecutionOptions {
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub fetch_size: Option<i32>,
    pub page_state: Option<Vec<u8>>,
    pub custom_payload: Option<HashMap<String, Vec<u8>>>,
    pub read_timeout: Option<Duration>,

    pub is_idempotent: bool,
    pub prepare: bool,
    pub capture_stack_trace: bool,
    pub auto_page: bool,
    pub trace_query: bool,
    pub counter: bool,
    pub logged: bool,

    pub keyspace: Option<String>,
    pub routing_key: Option<Vec<u8>>,
    pub routing_indexes: Option<Vec<usize>>,
    pub routing_names: Option<Vec<String>>,
    pub fixed_host: Option<Endpoint>,
    pub preferred_host: Option<Endpoint>,

    /// Resolved request timestamp (§3): either user-supplied or produced by
    /// the configured generator, only when the negotiated protocol version
    /// supports it (`ProtocolVersion::supports_timestamps`).
    pub timestamp: Option<i64>,

    /// Via the execution profile (§3); `None` falls back to the request
    /// handler's client-wide default.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub load_balancing_policy: Option<Arc<dyn LoadBalancingPolicy>>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
}

impl std::fmt::Debug for ExecutionOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionOptions")
            .field("consistency", &self.consistency)
            .field("is_idempotent", &self.is_idempotent)
            .field("keyspace", &self.keyspace)
            .field("fixed_host", &self.fixed_host)
            .finish_non_exhaustive()
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            consistency: Consistency::LocalOne,
            serial_consistency: None,
            fetch_size: None,
            page_state: None,
            custom_payload: None,
            read_timeout: None,
            is_idempotent: false,
            prepare: false,
            capture_stack_trace: false,
            auto_page: true,
            trace_query: false,
            counter: false,
            logged: true,
            keyspace: None,
            routing_key: None,
            routing_indexes: None,
            routing_names: None,
            fixed_host: None,
            preferred_host: None,
            timestamp: None,
            retry_policy: None,
            load_balancing_policy: None,
            speculative_execution_policy: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_are_not_idempotent() {
        let opts = ExecutionOptions::default();
        assert!(!opts.is_idempotent);
        assert_eq!(opts.consistency, Consistency::LocalOne);
    }
}
