//! The `RetryPolicy` collaborator (§6, §4.6 "Retry policy contract"). The
//! core only consumes the decision contract; concrete policies beyond the
//! one default below are a user/driver concern, not this crate's (§1).

use crate::error::Error;
use crate::protocol::request::Consistency;

/// What kind of server/client failure triggered a policy consultation
/// (§4.6's table). Carried alongside the decision-method arguments so a
/// policy can special-case without the request handler duplicating logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
}

impl WriteType {
    /// Map the wire string carried in a `WRITE_TIMEOUT` error body (§6) to
    /// the typed variant a `RetryPolicy` matches on. An unrecognized value
    /// (a future server-side write type this core doesn't know about yet)
    /// falls back to `Simple`, the most conservative (least-special-cased)
    /// member.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "BATCH" => Self::Batch,
            "UNLOGGED_BATCH" => Self::UnloggedBatch,
            "COUNTER" => Self::Counter,
            "BATCH_LOG" => Self::BatchLog,
            "CAS" => Self::Cas,
            "VIEW" => Self::View,
            "CDC" => Self::Cdc,
            _ => Self::Simple,
        }
    }
}

/// One past attempt, recorded for policies that want the full history
/// rather than just a retry count.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub retry_count: u32,
    pub is_idempotent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry the request. `use_current_host = true` keeps the same
    /// coordinator; otherwise the handler advances the query plan (§4.6).
    Retry {
        consistency: Option<Consistency>,
        use_current_host: bool,
    },
    /// Succeed with an empty result instead of propagating the failure.
    Ignore,
    /// Propagate the failure to the caller unchanged.
    Rethrow,
}

/// Decisions for the four failure classes §4.6 names. Idempotence gating
/// (writeTimeout/requestError require `execOptions.isIdempotent`) is the
/// request handler's job, applied *before* consulting the policy — a
/// policy implementation never sees a non-idempotent write-timeout/
/// request-error call (§4.6).
pub trait RetryPolicy: Send + Sync {
    fn on_unavailable(
        &self,
        ctx: RetryContext,
        consistency: Consistency,
        required: i32,
        alive: i32,
    ) -> RetryDecision;

    fn on_read_timeout(
        &self,
        ctx: RetryContext,
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    ) -> RetryDecision;

    fn on_write_timeout(
        &self,
        ctx: RetryContext,
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    ) -> RetryDecision;

    fn on_request_error(&self, ctx: RetryContext, error: &Error) -> RetryDecision;
}

/// A conservative default: retry once on the same host for the read
/// paths (unavailable/read-timeout, where idempotence isn't required per
/// §4.6), never retry write-timeout/request-error beyond what the
/// idempotence gate already allows through, and always retry those on a
/// fresh host since the coordinator that timed out is the likely cause.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_unavailable(
        &self,
        ctx: RetryContext,
        _consistency: Consistency,
        _required: i32,
        _alive: i32,
    ) -> RetryDecision {
        if ctx.retry_count == 0 {
            RetryDecision::Retry {
                consistency: None,
                use_current_host: false,
            }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_read_timeout(
        &self,
        ctx: RetryContext,
        _consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    ) -> RetryDecision {
        if ctx.retry_count == 0 && received >= required && !data_present {
            RetryDecision::Retry {
                consistency: None,
                use_current_host: true,
            }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_write_timeout(
        &self,
        ctx: RetryContext,
        _consistency: Consistency,
        _received: i32,
        _required: i32,
        write_type: WriteType,
    ) -> RetryDecision {
        if ctx.retry_count == 0 && write_type == WriteType::BatchLog {
            RetryDecision::Retry {
                consistency: None,
                use_current_host: true,
            }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_request_error(&self, ctx: RetryContext, _error: &Error) -> RetryDecision {
        if ctx.retry_count == 0 {
            RetryDecision::Retry {
                consistency: None,
                use_current_host: false,
            }
        } else {
            RetryDecision::Rethrow
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn ctx(retry_count: u32) -> RetryContext {
        RetryContext {
            retry_count,
            is_idempotent: true,
        }
    }

    #[test]
    fn default_policy_retries_unavailable_once_on_next_host() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_unavailable(ctx(0), Consistency::Quorum, 3, 2);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                consistency: None,
                use_current_host: false
            }
        );
        assert_eq!(
            policy.on_unavailable(ctx(1), Consistency::Quorum, 3, 2),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn default_policy_retries_read_timeout_on_same_host_when_enough_replies() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_read_timeout(ctx(0), Consistency::One, 1, 1, false);
        assert_eq!(
            decision,
            RetryDecision::Retry {
                consistency: None,
                use_current_host: true
            }
        );
    }

    #[test]
    fn write_type_falls_back_to_simple_for_unknown_wire_value() {
        assert_eq!(WriteType::from_wire("BATCH_LOG"), WriteType::BatchLog);
        assert_eq!(WriteType::from_wire("SOMETHING_NEW"), WriteType::Simple);
    }

    #[test]
    fn default_policy_rethrows_request_error_after_one_retry() {
        let policy = DefaultRetryPolicy;
        let err = Error::DriverInternalError("boom".to_string());
        assert_ne!(policy.on_request_error(ctx(0), &err), RetryDecision::Rethrow);
        assert_eq!(policy.on_request_error(ctx(1), &err), RetryDecision::Rethrow);
    }
}
