//! The per-user-request orchestrator (§3, §4.6): drives one `Request`
//! through host selection, coordinator-side retry, speculative execution,
//! and `UNPREPARED` recovery until it produces a result or exhausts
//! recovery. This is the other half of the core alongside `Connection`
//! (§1); where `Connection` owns one socket, `RequestHandler` owns one
//! logical call and is discarded once `send()` resolves.
//!
//! Grounded on the teacher's query-retry loop in `sync/conn.rs`
//! (`query_drop`/`exec_drop` wrapped in a bounded retry-on-error loop) and
//! generalized to the host-iteration, speculative-execution, and
//! prepared-statement recovery machinery spec.md §4.6 calls for, none of
//! which the teacher's single-server MySQL driver needed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::oneshot;

use crate::config::TimestampGeneration;
use crate::connection::{Connection, StreamRequest};
use crate::endpoint::Endpoint;
use crate::error::{Error, ErrorCode, Result};
use crate::host::Host;
use crate::load_balancing::{LoadBalancingPolicy, QueryPlan};
use crate::prepared_cache::PreparedCache;
use crate::protocol::request::{Consistency, Request};
use crate::protocol::response::{QueryResult, ServerErrorDetail};
use crate::retry_policy::{RetryContext, RetryDecision, RetryPolicy, WriteType};
use crate::speculative_execution::{QueryInfo, SpeculativeExecutionPlan, SpeculativeExecutionPolicy};
use crate::ExecutionOptions;

/// Everything `RequestHandler` needs from the (out-of-scope, §1) client
/// façade: the prepared-statement cache, the known host set a fixed-host
/// request resolves against, and the client-wide policy defaults an
/// execution profile may override (§3 `ExecutionOptions`, §6 collaborators).
pub struct RequestHandlerContext {
    pub hosts: Vec<Arc<dyn Host>>,
    pub prepared_cache: Arc<PreparedCache>,
    pub default_load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub default_retry_policy: Arc<dyn RetryPolicy>,
    pub keyspace: Option<String>,
    /// `policies.timestampGeneration` (§6): how to produce a request
    /// timestamp when the caller supplied none.
    pub timestamp_generation: TimestampGeneration,
    /// Last timestamp handed out by `Monotonic` generation, in
    /// microseconds since the epoch — bumped by at least one microsecond
    /// per call so two requests issued within the same clock tick still
    /// get distinct, increasing timestamps. Callers constructing a fresh
    /// context should start this at `AtomicI64::new(i64::MIN)`.
    pub last_timestamp_micros: AtomicI64,
}

impl RequestHandlerContext {
    /// Resolve the effective request timestamp (§3 "timestamp"): `None`
    /// when generation is off, else the next value from the configured
    /// generator. Whether the negotiated protocol version actually
    /// supports sending it is left to `QueryParams`/`BatchParams::write`,
    /// which already omit the field below the version that supports it.
    fn generate_timestamp(&self) -> Option<i64> {
        match self.timestamp_generation {
            TimestampGeneration::None => None,
            TimestampGeneration::Monotonic => Some(self.next_monotonic_timestamp()),
        }
    }

    fn next_monotonic_timestamp(&self) -> i64 {
        let now_micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        loop {
            let last = self.last_timestamp_micros.load(Ordering::SeqCst);
            let next = if now_micros > last { now_micros } else { last + 1 };
            if self
                .last_timestamp_micros
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return next;
            }
        }
    }
}

/// The outcome of a completed `send()` (§4.6 "Completion"): the result
/// itself plus the bookkeeping a caller or higher layer needs to report
/// query tracing / metrics.
#[derive(Debug)]
pub struct ExecutionResult {
    pub queried_host: Endpoint,
    pub tried_hosts: HashMap<Endpoint, Error>,
    pub result: QueryResult,
}

/// What kind of server/client failure a response represents, with the
/// decision-method arguments extracted from it (§4.6's retry table).
enum FailureKind<'a> {
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },
    RequestError(&'a Error),
}

fn classify(err: &Error) -> FailureKind<'_> {
    if let Error::ResponseError { code, detail, .. } = err {
        match (code, detail) {
            (ErrorCode::Unavailable, ServerErrorDetail::Unavailable { consistency, required, alive }) => {
                return FailureKind::Unavailable {
                    consistency: *consistency,
                    required: *required,
                    alive: *alive,
                };
            }
            (
                ErrorCode::ReadTimeout,
                ServerErrorDetail::ReadTimeout {
                    consistency,
                    received,
                    required,
                    data_present,
                },
            ) => {
                return FailureKind::ReadTimeout {
                    consistency: *consistency,
                    received: *received,
                    required: *required,
                    data_present: *data_present,
                };
            }
            (
                ErrorCode::WriteTimeout,
                ServerErrorDetail::WriteTimeout {
                    consistency,
                    received,
                    required,
                    write_type,
                },
            ) => {
                return FailureKind::WriteTimeout {
                    consistency: *consistency,
                    received: *received,
                    required: *required,
                    write_type: WriteType::from_wire(write_type),
                };
            }
            _ => {}
        }
    }
    FailureKind::RequestError(err)
}

/// What an attempt does next after one host-level failure (§4.6 "Retry
/// policy contract"). Distinct from `RetryDecision` because `RequestError`
/// that never reached a policy consultation (serialization failures,
/// §7 "never consulted for serialization-side errors") also needs to
/// short-circuit straight to `Rethrow`.
enum NextStep {
    RetrySameHost(Option<Consistency>),
    RetryNextHost(Error),
    Ignore,
    Rethrow(Error),
}

/// Whether this failure kind requires `execOptions.isIdempotent` before the
/// retry policy is even consulted (§4.6 "Idempotence gate").
fn requires_idempotence(kind: &FailureKind<'_>) -> bool {
    matches!(kind, FailureKind::WriteTimeout { .. } | FailureKind::RequestError(_))
}

fn consult_policy(policy: &dyn RetryPolicy, ctx: RetryContext, kind: &FailureKind<'_>) -> RetryDecision {
    match kind {
        FailureKind::Unavailable {
            consistency,
            required,
            alive,
        } => policy.on_unavailable(ctx, *consistency, *required, *alive),
        FailureKind::ReadTimeout {
            consistency,
            received,
            required,
            data_present,
        } => policy.on_read_timeout(ctx, *consistency, *received, *required, *data_present),
        FailureKind::WriteTimeout {
            consistency,
            received,
            required,
            write_type,
        } => policy.on_write_timeout(ctx, *consistency, *received, *required, *write_type),
        FailureKind::RequestError(err) => policy.on_request_error(ctx, err),
    }
}

/// Decide what to do about one failure, applying the idempotence gate
/// before ever calling the policy (§4.6, §7 "never consulted for
/// serialization-side errors" is handled by callers not invoking this for
/// those at all).
///
/// A request that never hit the wire (`SocketError{request_not_written:
/// true}`) is safe to retry on another host regardless of idempotence
/// (§7, §9's two-level socket-error distinction) — checked before the
/// idempotence gate and without ever reaching the retry policy, since
/// this isn't a server failure classification the policy was written to
/// reason about.
fn decide(policy: &dyn RetryPolicy, retry_count: &AtomicU32, is_idempotent: bool, err: Error) -> NextStep {
    if err.is_safe_to_retry_anywhere() {
        return NextStep::RetryNextHost(err);
    }
    let kind = classify(&err);
    if requires_idempotence(&kind) && !is_idempotent {
        return NextStep::Rethrow(err);
    }
    let ctx = RetryContext {
        retry_count: retry_count.load(Ordering::SeqCst),
        is_idempotent,
    };
    match consult_policy(policy, ctx, &kind) {
        RetryDecision::Retry {
            consistency,
            use_current_host,
        } => {
            retry_count.fetch_add(1, Ordering::SeqCst);
            if use_current_host {
                NextStep::RetrySameHost(consistency)
            } else {
                NextStep::RetryNextHost(err)
            }
        }
        RetryDecision::Ignore => NextStep::Ignore,
        RetryDecision::Rethrow => NextStep::Rethrow(err),
    }
}

/// Coordinates every in-flight attempt for one `send()` call: the shared
/// tried-hosts ledger, the one-shot result gate the first successful (or
/// fatally failed) attempt writes to, and the count of attempts still
/// alive so the last one to give up can report `NoHostAvailable` instead
/// of leaving the caller waiting forever (§4.6 Speculative execution).
struct Shared {
    tried_hosts: Mutex<HashMap<Endpoint, Error>>,
    settled: AtomicBool,
    winner: Mutex<Option<oneshot::Sender<Result<ExecutionResult>>>>,
    alive_attempts: AtomicUsize,
}

impl Shared {
    fn record_tried(&self, endpoint: Endpoint, err: Error) {
        self.tried_hosts
            .lock()
            .expect("tried_hosts mutex poisoned")
            .insert(endpoint, err);
    }

    fn take_tried_hosts(&self) -> HashMap<Endpoint, Error> {
        std::mem::take(&mut self.tried_hosts.lock().expect("tried_hosts mutex poisoned"))
    }

    fn settle(&self, outcome: Result<ExecutionResult>) {
        if self.settled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(sender) = self.winner.lock().expect("winner mutex poisoned").take() {
            let _ = sender.send(outcome);
        }
    }

    /// One attempt task is giving up (its pull of the shared plan came back
    /// empty). If it was the last one standing and nobody has settled yet,
    /// the whole request fails with the aggregate `NoHostAvailable` (§4.6
    /// "exhausted with no success").
    fn attempt_finished(&self) {
        if self.alive_attempts.fetch_sub(1, Ordering::SeqCst) == 1 && !self.settled.load(Ordering::SeqCst) {
            let inner_errors = self.take_tried_hosts().into_iter().map(|(e, err)| (e, Box::new(err))).collect();
            self.settle(Err(Error::NoHostAvailable { inner_errors }));
        }
    }
}

pub struct RequestHandler {
    request: Request,
    options: ExecutionOptions,
    context: Arc<RequestHandlerContext>,
}

impl RequestHandler {
    /// Build the handler and resolve `ExecutionOptions` onto the outgoing
    /// request once up front (§3 "ExecutionOptions resolution"): consistency,
    /// serial consistency, fetch size, paging state, an explicit keyspace
    /// override, and a timestamp (user-supplied, or freshly generated if
    /// `context` is configured to) land on the request's own parameter
    /// block here, so every retry and speculative attempt downstream sends
    /// the same resolved values — only `with_consistency` overrides them
    /// afterward, per a retry decision's own consistency override.
    pub fn new(request: Request, options: ExecutionOptions, context: Arc<RequestHandlerContext>) -> Self {
        let timestamp = options.timestamp.or_else(|| context.generate_timestamp());
        let request = resolve_request_options(request, &options, timestamp);
        Self {
            request,
            options,
            context,
        }
    }

    fn keyspace(&self) -> Option<String> {
        self.options.keyspace.clone().or_else(|| self.context.keyspace.clone())
    }

    fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        self.options
            .retry_policy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.context.default_retry_policy))
    }

    fn load_balancing_policy(&self) -> Arc<dyn LoadBalancingPolicy> {
        self.options
            .load_balancing_policy
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.context.default_load_balancing_policy))
    }

    /// Build the query plan for this request: a single fixed host with no
    /// load balancing if `execOptions.host` names one, else whatever the
    /// resolved load-balancing policy produces (§4.6 "Host iteration").
    async fn new_query_plan(&self) -> Result<Box<dyn QueryPlan>> {
        if let Some(fixed) = &self.options.fixed_host {
            let host = self
                .context
                .hosts
                .iter()
                .find(|h| h.address() == fixed)
                .cloned()
                .ok_or_else(|| Error::BadConfigError(format!("fixed host {fixed} is not a known host")))?;
            return Ok(Box::new(crate::load_balancing::VecQueryPlan::new(vec![host])));
        }
        self.load_balancing_policy()
            .new_query_plan(self.keyspace().as_deref(), &self.options)
            .await
    }

    /// Drive this request to completion or exhaustion (§4.6 `send`).
    pub async fn send(self) -> Result<ExecutionResult> {
        let plan = self.new_query_plan().await?;
        let plan = Arc::new(Mutex::new(plan));
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            tried_hosts: Mutex::new(HashMap::new()),
            settled: AtomicBool::new(false),
            winner: Mutex::new(Some(tx)),
            alive_attempts: AtomicUsize::new(1),
        });
        let retry_count = Arc::new(AtomicU32::new(0));
        let handler = Arc::new(self);

        tokio::spawn(run_attempt(
            Arc::clone(&handler),
            Arc::clone(&plan),
            Arc::clone(&shared),
            Arc::clone(&retry_count),
        ));

        if handler.options.is_idempotent {
            if let Some(policy) = handler.options.speculative_execution_policy.clone() {
                let query_info = QueryInfo {
                    query: describe_query(&handler.request),
                    is_idempotent: true,
                };
                let spec_plan = policy.new_plan(handler.keyspace().as_deref(), &query_info);
                tokio::spawn(drive_speculative_executions(
                    handler,
                    plan,
                    Arc::clone(&shared),
                    retry_count,
                    spec_plan,
                ));
                return rx.await.unwrap_or_else(|_| {
                    Err(Error::DriverInternalError(
                        "request handler dropped before settling".to_string(),
                    ))
                });
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(Error::DriverInternalError(
                "request handler dropped before settling".to_string(),
            ))
        })
    }
}

/// A human-readable query description for `SpeculativeExecutionPolicy`
/// consumers; query text itself isn't retained on `Execute`/`Batch` (only
/// the opaque prepared id/entries are), so this is best-effort (§4.6).
fn describe_query(request: &Request) -> String {
    match request {
        Request::Query { query, .. } => query.clone(),
        Request::Execute { id, .. } => format!("prepared:{}", hex(id)),
        Request::Batch { queries, .. } => format!("batch({} statements)", queries.len()),
        other => format!("{other:?}"),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Schedule additional parallel attempts on the shared query plan while the
/// initial execution is in flight (§4.6 "Speculative execution", §8
/// property 9). Stops as soon as the plan says so, the request already
/// settled, or every host has been handed out.
async fn drive_speculative_executions(
    handler: Arc<RequestHandler>,
    plan: Arc<Mutex<Box<dyn QueryPlan>>>,
    shared: Arc<Shared>,
    retry_count: Arc<AtomicU32>,
    mut spec_plan: Box<dyn SpeculativeExecutionPlan>,
) {
    loop {
        if shared.settled.load(Ordering::SeqCst) {
            return;
        }
        let Some(delay) = spec_plan.next_execution() else {
            return;
        };
        tokio::time::sleep(delay).await;
        if shared.settled.load(Ordering::SeqCst) {
            return;
        }
        shared.alive_attempts.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(run_attempt(
            Arc::clone(&handler),
            Arc::clone(&plan),
            Arc::clone(&shared),
            Arc::clone(&retry_count),
        ));
    }
}

/// One parallel execution's full lifetime: pull hosts from the shared plan
/// until it succeeds, is told to stop retrying, or the plan runs dry
/// (§4.6). Every other in-flight attempt is abandoned the instant one
/// settles `shared` — checked at the top of each loop rather than torn
/// down eagerly, since a late response is already a no-op at the
/// connection layer (§4.6 "abandoned").
async fn run_attempt(
    handler: Arc<RequestHandler>,
    plan: Arc<Mutex<Box<dyn QueryPlan>>>,
    shared: Arc<Shared>,
    retry_count: Arc<AtomicU32>,
) {
    let retry_policy = handler.retry_policy();
    let is_idempotent = handler.options.is_idempotent;

    'hosts: loop {
        if shared.settled.load(Ordering::SeqCst) {
            break;
        }
        let host = {
            let mut guard = plan.lock().expect("query plan mutex poisoned");
            guard.next()
        };
        let Some(host) = host else { break };

        // A policy that answers `RetrySameHost` here means "try this host
        // again", not "give up on it" — re-attempt the borrow on the same
        // `host` rather than pulling a new one from the shared plan
        // (§4.6 `useCurrentHost`).
        let connection = 'borrow: loop {
            match host.borrow_connection(handler.keyspace().as_deref()).await {
                Ok(connection) => break 'borrow connection,
                Err(err) => match decide(retry_policy.as_ref(), &retry_count, is_idempotent, err) {
                    NextStep::RetrySameHost(_) => continue 'borrow,
                    NextStep::RetryNextHost(err) => {
                        shared.record_tried(host.address().clone(), err);
                        continue 'hosts;
                    }
                    NextStep::Ignore => {
                        shared.settle(Ok(ExecutionResult {
                            queried_host: host.address().clone(),
                            tried_hosts: shared.take_tried_hosts(),
                            result: QueryResult::Void,
                        }));
                        return;
                    }
                    NextStep::Rethrow(err) => {
                        shared.settle(Err(err));
                        return;
                    }
                },
            }
        };

        let mut request = handler.request.clone();
        loop {
            match send_once(&handler, &connection, &request, &retry_count).await {
                Ok(result) => {
                    shared.settle(Ok(ExecutionResult {
                        queried_host: host.address().clone(),
                        tried_hosts: shared.take_tried_hosts(),
                        result,
                    }));
                    return;
                }
                Err(AttemptError::NextHost(err)) => {
                    shared.record_tried(host.address().clone(), err);
                    continue 'hosts;
                }
                Err(AttemptError::RetrySameHost(new_request)) => {
                    request = new_request;
                    continue;
                }
                Err(AttemptError::Ignore) => {
                    shared.settle(Ok(ExecutionResult {
                        queried_host: host.address().clone(),
                        tried_hosts: shared.take_tried_hosts(),
                        result: QueryResult::Void,
                    }));
                    return;
                }
                Err(AttemptError::Rethrow(err)) => {
                    shared.settle(Err(err));
                    return;
                }
            }
        }
    }

    shared.attempt_finished();
}

enum AttemptError {
    NextHost(Error),
    RetrySameHost(Request),
    Ignore,
    Rethrow(Error),
}

/// Send one request on an already-borrowed connection, driving `UNPREPARED`
/// recovery inline and classifying any other failure into the next step
/// the caller's retry loop should take (§4.6).
async fn send_once(
    handler: &RequestHandler,
    connection: &Connection,
    request: &Request,
    retry_count: &AtomicU32,
) -> std::result::Result<QueryResult, AttemptError> {
    let (stream_request, rx, _cancel) = StreamRequest::new(request.clone());
    let stream_request = apply_options(stream_request, &handler.options);
    connection.send_stream(stream_request).await;

    let outcome = rx.await.unwrap_or_else(|_| Err(Error::socket_closed(false, None)));

    match outcome {
        Ok(result) => {
            maybe_refresh_result_metadata(handler, request, &result);
            Ok(result)
        }
        Err(Error::ResponseError {
            code: ErrorCode::Unprepared,
            unprepared_id: Some(query_id),
            ..
        }) => recover_from_unprepared(handler, connection, request, &query_id)
            .await
            .map_err(AttemptError::NextHost),
        Err(err) => Err(to_attempt_error(handler, request, retry_count, err)),
    }
}

fn to_attempt_error(handler: &RequestHandler, request: &Request, retry_count: &AtomicU32, err: Error) -> AttemptError {
    let retry_policy = handler.retry_policy();
    match decide(retry_policy.as_ref(), retry_count, handler.options.is_idempotent, err) {
        NextStep::RetrySameHost(consistency) => {
            let retried = match consistency {
                Some(c) => request.with_consistency(c),
                None => request.clone(),
            };
            AttemptError::RetrySameHost(retried)
        }
        NextStep::RetryNextHost(err) => AttemptError::NextHost(err),
        NextStep::Ignore => AttemptError::Ignore,
        NextStep::Rethrow(err) => AttemptError::Rethrow(err),
    }
}

/// If a rows response carries a `newResultId`, refresh the prepared-cache
/// entry's cached result metadata id before the caller ever sees the
/// result (§4.6 "Result-metadata refresh", §8 scenario S5).
fn maybe_refresh_result_metadata(handler: &RequestHandler, request: &Request, result: &QueryResult) {
    let Request::Execute { id, .. } = request else { return };
    let QueryResult::Rows(rows) = result else { return };
    if let Some(new_id) = &rows.metadata.new_metadata_id {
        handler.context.prepared_cache.refresh_result_id(id, new_id.clone());
    }
}

/// `UNPREPARED` recovery (§4.6): reprepare on the exact connection that
/// reported the miss, update the cache, then retry the original `Execute`
/// on that same connection. A `PREPARE` failure here moves on to the next
/// host rather than retrying further on this one.
async fn recover_from_unprepared(
    handler: &RequestHandler,
    connection: &Connection,
    request: &Request,
    query_id: &[u8],
) -> Result<QueryResult> {
    let entry = handler
        .context
        .prepared_cache
        .get(query_id)
        .ok_or_else(|| Error::DriverInternalError("server reported UNPREPARED for an unknown query id".to_string()))?;

    let (query, keyspace) = {
        let guard = entry.read().expect("prepared entry lock poisoned");
        (guard.query.clone(), guard.keyspace.clone())
    };

    if keyspace.is_some() && !connection.negotiated_version().supports_prepare_keyspace() {
        return Err(Error::DriverInternalError(format!(
            "statement {} was prepared against a different keyspace and cannot be \
             repaired on protocol version {:?}",
            hex(query_id),
            connection.negotiated_version()
        )));
    }

    let prepared = connection.prepare_once(&query, keyspace.as_deref()).await?;

    {
        let mut guard = entry.write().expect("prepared entry lock poisoned");
        guard.meta.result_id = prepared.result_metadata_id.clone();
    }

    let retried_request = match request {
        Request::Execute { params, .. } => Request::Execute {
            id: prepared.id.clone(),
            result_metadata_id: prepared.result_metadata_id.clone(),
            params: params.clone(),
        },
        other => other.clone(),
    };

    let (stream_request, rx, _cancel) = StreamRequest::new(retried_request.clone());
    let stream_request = apply_options(stream_request, &handler.options);
    connection.send_stream(stream_request).await;
    let result = rx.await.unwrap_or_else(|_| Err(Error::socket_closed(false, None)))?;
    maybe_refresh_result_metadata(handler, &retried_request, &result);
    Ok(result)
}

/// Resolve `ExecutionOptions` onto the request's own wire parameter block
/// (§3 "ExecutionOptions resolution"). Called once, at construction, so a
/// later `with_consistency` retry override isn't clobbered by re-resolving
/// the unchanged options on top of it.
fn resolve_request_options(request: Request, options: &ExecutionOptions, timestamp: Option<i64>) -> Request {
    let mut request = request;
    match &mut request {
        Request::Query { params, .. } | Request::Execute { params, .. } => {
            params.consistency = options.consistency;
            params.serial_consistency = options.serial_consistency;
            params.page_size = options.fetch_size;
            if let Some(page_state) = &options.page_state {
                params.paging_state = Some(page_state.clone());
            }
            params.default_timestamp = timestamp;
            if let Some(keyspace) = &options.keyspace {
                params.keyspace = Some(keyspace.clone());
            }
        }
        Request::Batch { params, .. } => {
            params.consistency = options.consistency;
            params.serial_consistency = options.serial_consistency;
            params.default_timestamp = timestamp;
            if let Some(keyspace) = &options.keyspace {
                params.keyspace = Some(keyspace.clone());
            }
        }
        Request::Startup(_)
        | Request::Credentials { .. }
        | Request::Options
        | Request::Register { .. }
        | Request::Prepare { .. }
        | Request::AuthResponse { .. }
        | Request::Cancel { .. } => {}
    }
    request
}

/// Apply the stream-envelope-level options (§3 "ExecutionOptions
/// resolution"): these aren't part of the request's own wire body, so they
/// land on `StreamRequest` at send time instead of on the `Request` once
/// up front.
fn apply_options(stream_request: StreamRequest, options: &ExecutionOptions) -> StreamRequest {
    let mut stream_request = stream_request;
    if let Some(payload) = options.custom_payload.clone() {
        stream_request = stream_request.with_custom_payload(payload);
    }
    if let Some(timeout) = options.read_timeout {
        stream_request = stream_request.with_read_timeout(timeout);
    }
    stream_request
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::load_balancing::{HostDistance, VecQueryPlan};
    use crate::protocol::request::QueryParams;
    use crate::protocol::version::ProtocolVersion;
    use crate::retry_policy::DefaultRetryPolicy;

    struct NoHostsPolicy;

    #[async_trait]
    impl LoadBalancingPolicy for NoHostsPolicy {
        async fn init(&self, _hosts: &[Arc<dyn Host>]) -> Result<()> {
            Ok(())
        }

        fn get_distance(&self, _host: &dyn Host) -> HostDistance {
            HostDistance::Local
        }

        async fn new_query_plan(&self, _keyspace: Option<&str>, _options: &ExecutionOptions) -> Result<Box<dyn QueryPlan>> {
            Ok(Box::new(VecQueryPlan::new(Vec::new())))
        }
    }

    /// A policy that panics if consulted, used to assert a non-idempotent
    /// request never reaches the retry policy for write-timeout/request-error
    /// (§4.6 idempotence gate, §8 property 10).
    struct PanicsIfConsulted;

    impl RetryPolicy for PanicsIfConsulted {
        fn on_unavailable(&self, _: RetryContext, _: Consistency, _: i32, _: i32) -> RetryDecision {
            panic!("must not be consulted")
        }
        fn on_read_timeout(&self, _: RetryContext, _: Consistency, _: i32, _: i32, _: bool) -> RetryDecision {
            panic!("must not be consulted")
        }
        fn on_write_timeout(&self, _: RetryContext, _: Consistency, _: i32, _: i32, _: WriteType) -> RetryDecision {
            panic!("must not be consulted")
        }
        fn on_request_error(&self, _: RetryContext, _: &Error) -> RetryDecision {
            panic!("must not be consulted")
        }
    }

    fn test_context(hosts: Vec<Arc<dyn Host>>) -> Arc<RequestHandlerContext> {
        Arc::new(RequestHandlerContext {
            hosts,
            prepared_cache: Arc::new(PreparedCache::new()),
            default_load_balancing_policy: Arc::new(NoHostsPolicy),
            default_retry_policy: Arc::new(DefaultRetryPolicy),
            keyspace: None,
            timestamp_generation: TimestampGeneration::None,
            last_timestamp_micros: AtomicI64::new(i64::MIN),
        })
    }

    fn query_request() -> Request {
        Request::Query {
            query: "SELECT * FROM t".to_string(),
            params: QueryParams::default(),
        }
    }

    #[test]
    fn resolve_request_options_merges_onto_query_params() {
        let mut options = ExecutionOptions::default();
        options.consistency = Consistency::Quorum;
        options.serial_consistency = Some(Consistency::LocalSerial);
        options.fetch_size = Some(500);
        options.page_state = Some(vec![1, 2, 3]);
        options.keyspace = Some("ks".to_string());

        let resolved = resolve_request_options(query_request(), &options, Some(42));
        let Request::Query { params, .. } = resolved else {
            panic!("expected a Query request");
        };
        assert_eq!(params.consistency, Consistency::Quorum);
        assert_eq!(params.serial_consistency, Some(Consistency::LocalSerial));
        assert_eq!(params.page_size, Some(500));
        assert_eq!(params.paging_state, Some(vec![1, 2, 3]));
        assert_eq!(params.default_timestamp, Some(42));
        assert_eq!(params.keyspace, Some("ks".to_string()));
    }

    #[test]
    fn monotonic_timestamp_generation_is_strictly_increasing() {
        let context = Arc::new(RequestHandlerContext {
            hosts: Vec::new(),
            prepared_cache: Arc::new(PreparedCache::new()),
            default_load_balancing_policy: Arc::new(NoHostsPolicy),
            default_retry_policy: Arc::new(DefaultRetryPolicy),
            keyspace: None,
            timestamp_generation: TimestampGeneration::Monotonic,
            last_timestamp_micros: AtomicI64::new(i64::MIN),
        });

        let first = context.generate_timestamp().expect("monotonic generation must produce a value");
        let second = context.generate_timestamp().expect("monotonic generation must produce a value");
        assert!(second > first);
    }

    #[test]
    fn no_timestamp_generation_leaves_timestamp_unset() {
        let context = test_context(Vec::new());
        assert_eq!(context.generate_timestamp(), None);
    }

    #[tokio::test]
    async fn exhausted_plan_with_no_successes_yields_no_host_available() {
        let context = test_context(Vec::new());
        let handler = RequestHandler::new(query_request(), ExecutionOptions::default(), context);
        let result = handler.send().await;
        assert!(matches!(result, Err(Error::NoHostAvailable { .. })));
    }

    #[test]
    fn non_idempotent_request_error_is_rethrown_without_consulting_policy() {
        let retry_count = AtomicU32::new(0);
        let err = Error::DriverInternalError("boom".to_string());
        let step = decide(&PanicsIfConsulted, &retry_count, false, err);
        assert!(matches!(step, NextStep::Rethrow(_)));
    }

    #[test]
    fn never_written_socket_error_retries_on_next_host_without_idempotence() {
        let retry_count = AtomicU32::new(0);
        let err = Error::socket_closed(true, None);
        let step = decide(&PanicsIfConsulted, &retry_count, false, err);
        assert!(matches!(step, NextStep::RetryNextHost(_)));
        // The policy was never consulted (it would have panicked), and this
        // isn't a policy-driven retry, so the shared counter is untouched.
        assert_eq!(retry_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn possibly_written_socket_error_is_still_gated_by_idempotence() {
        let retry_count = AtomicU32::new(0);
        let err = Error::socket_closed(false, None);
        let step = decide(&PanicsIfConsulted, &retry_count, false, err);
        assert!(matches!(step, NextStep::Rethrow(_)));
    }

    #[test]
    fn idempotent_request_error_does_consult_policy() {
        let retry_count = AtomicU32::new(0);
        let err = Error::DriverInternalError("boom".to_string());
        let step = decide(&DefaultRetryPolicy, &retry_count, true, err);
        assert!(matches!(step, NextStep::RetryNextHost(_)));
        assert_eq!(retry_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unavailable_does_not_require_idempotence() {
        assert!(!requires_idempotence(&FailureKind::Unavailable {
            consistency: Consistency::Quorum,
            required: 3,
            alive: 1
        }));
        assert!(!requires_idempotence(&FailureKind::ReadTimeout {
            consistency: Consistency::One,
            received: 0,
            required: 1,
            data_present: false
        }));
        assert!(requires_idempotence(&FailureKind::WriteTimeout {
            consistency: Consistency::One,
            received: 0,
            required: 1,
            write_type: WriteType::Simple
        }));
    }

    struct FakeHost {
        endpoint: Endpoint,
        connection: Connection,
    }

    #[async_trait]
    impl Host for FakeHost {
        fn address(&self) -> &Endpoint {
            &self.endpoint
        }
        fn datacenter(&self) -> &str {
            "dc1"
        }
        fn is_up(&self) -> bool {
            true
        }
        fn get_in_flight(&self) -> usize {
            self.connection.in_flight()
        }
        fn get_response_count(&self) -> u64 {
            0
        }
        fn is_up_since(&self) -> Option<std::time::SystemTime> {
            None
        }
        fn workloads(&self) -> &[crate::host::Workload] {
            &[]
        }
        async fn borrow_connection(&self, _keyspace: Option<&str>) -> Result<Connection> {
            Ok(self.connection.clone())
        }
    }

    fn fake_connection_options(endpoint: Endpoint) -> ConnectionOptions {
        ConnectionOptions {
            endpoint,
            socket_options: crate::config::SocketOptions::default(),
            ssl_options: None,
            pooling: crate::config::PoolingOptions {
                heart_beat_interval: Duration::ZERO,
            },
            protocol_options: crate::config::ProtocolOptions::default(),
            auth_provider: None,
            prepared_cache: Arc::new(PreparedCache::new()),
        }
    }

    #[tokio::test]
    async fn a_dead_first_host_is_skipped_in_favor_of_a_working_second() {
        let (dead_client, _dead_server) = tokio::io::duplex(4096);
        let dead_connection =
            Connection::from_duplex_for_test(dead_client, ProtocolVersion::V4, &fake_connection_options(Endpoint::new("dead", 9042)));
        // Closed immediately: every `send_stream` on it fails fast.
        dead_connection.close().await;

        let (alive_client, _alive_server) = tokio::io::duplex(4096);
        let alive_connection = Connection::from_duplex_for_test(
            alive_client,
            ProtocolVersion::V4,
            &fake_connection_options(Endpoint::new("alive", 9042)),
        );

        let hosts: Vec<Arc<dyn Host>> = vec![
            Arc::new(FakeHost {
                endpoint: Endpoint::new("dead", 9042),
                connection: dead_connection,
            }),
            Arc::new(FakeHost {
                endpoint: Endpoint::new("alive", 9042),
                connection: alive_connection,
            }),
        ];

        struct TwoHostPlanPolicy(Vec<Arc<dyn Host>>);

        #[async_trait]
        impl LoadBalancingPolicy for TwoHostPlanPolicy {
            async fn init(&self, _hosts: &[Arc<dyn Host>]) -> Result<()> {
                Ok(())
            }
            fn get_distance(&self, _host: &dyn Host) -> HostDistance {
                HostDistance::Local
            }
            async fn new_query_plan(&self, _keyspace: Option<&str>, _options: &ExecutionOptions) -> Result<Box<dyn QueryPlan>> {
                Ok(Box::new(VecQueryPlan::new(self.0.clone())))
            }
        }

        let context = Arc::new(RequestHandlerContext {
            hosts: hosts.clone(),
            prepared_cache: Arc::new(PreparedCache::new()),
            default_load_balancing_policy: Arc::new(TwoHostPlanPolicy(hosts)),
            default_retry_policy: Arc::new(DefaultRetryPolicy),
            keyspace: None,
            timestamp_generation: TimestampGeneration::None,
            last_timestamp_micros: AtomicI64::new(i64::MIN),
        });

        let mut options = ExecutionOptions::default();
        options.is_idempotent = true;
        let handler = RequestHandler::new(query_request(), options, context);

        // The "alive" connection never gets a real server on the other end
        // either, so this still won't produce a `Result`; what this proves
        // is that the dead host's immediate socket error is recorded in
        // `tried_hosts` and the plan moves on rather than settling on it.
        let outcome = tokio::time::timeout(Duration::from_millis(200), handler.send()).await;
        assert!(outcome.is_err(), "expected the alive connection's request to still be pending");
    }
}
