//! The `SpeculativeExecutionPolicy` collaborator (§4.6, §6, §8 property 9,
//! scenario S6). Drives how many parallel attempts `RequestHandler`
//! schedules on top of the initial execution, and at what delay.

use std::time::Duration;

/// What the request handler knows about the query when asking for a plan
/// — intentionally thin, since query planning/parsing is out of scope (§1).
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub query: String,
    pub is_idempotent: bool,
}

/// One request's sequence of speculative-execution delays. `next_execution`
/// is polled each time the handler is ready to consider another parallel
/// attempt; `None` means "stop, no more speculative attempts" (§4.6's
/// "negative number to stop").
pub trait SpeculativeExecutionPlan: Send {
    fn next_execution(&mut self) -> Option<Duration>;
}

pub trait SpeculativeExecutionPolicy: Send + Sync {
    fn new_plan(&self, keyspace: Option<&str>, query_info: &QueryInfo) -> Box<dyn SpeculativeExecutionPlan>;
}

/// A fixed delay repeated up to `max_speculative_executions` times (§8 S6:
/// `ConstantSpeculativeExecutionPolicy(delay=20, max=2)`).
#[derive(Debug, Clone, Copy)]
pub struct ConstantSpeculativeExecutionPolicy {
    pub delay: Duration,
    pub max_speculative_executions: usize,
}

struct ConstantPlan {
    delay: Duration,
    remaining: usize,
}

impl SpeculativeExecutionPlan for ConstantPlan {
    fn next_execution(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn new_plan(&self, _keyspace: Option<&str>, _query_info: &QueryInfo) -> Box<dyn SpeculativeExecutionPlan> {
        Box::new(ConstantPlan {
            delay: self.delay,
            remaining: self.max_speculative_executions,
        })
    }
}

/// A request never eligible for speculative execution (e.g. not
/// idempotent, or the profile doesn't configure one) gets this no-op plan.
pub struct NoSpeculativeExecutionPlan;

impl SpeculativeExecutionPlan for NoSpeculativeExecutionPlan {
    fn next_execution(&mut self) -> Option<Duration> {
        None
    }
}
