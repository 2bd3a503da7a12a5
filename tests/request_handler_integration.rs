//! Integration tests wiring a fake in-memory server through a real
//! `Connection` and `RequestHandler` (§8 scenarios, §10.4). The fake server
//! is a `tokio::io::DuplexStream` half fed by a task that reads one frame at
//! a time and writes back a hand-crafted response, standing in for a live
//! Cassandra node the way the teacher's integration tests substitute a fake
//! stream for a live MySQL server.
//!
//! Requires the `test-util` feature (`cargo test --features test-util`) for
//! `Connection::from_duplex_for_test`, the same loopback entry point the
//! crate's own unit tests reach under `#[cfg(test)]`.

use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cassandra_proto_core::config::{PoolingOptions, ProtocolOptions, SocketOptions, TimestampGeneration};
use cassandra_proto_core::connection::{Connection, ConnectionOptions};
use cassandra_proto_core::endpoint::Endpoint;
use cassandra_proto_core::error::Result;
use cassandra_proto_core::host::{Host, Workload};
use cassandra_proto_core::load_balancing::{HostDistance, LoadBalancingPolicy, QueryPlan, VecQueryPlan};
use cassandra_proto_core::prepared_cache::PreparedCache;
use cassandra_proto_core::protocol::flags::HeaderFlags;
use cassandra_proto_core::protocol::frame::FrameHeader;
use cassandra_proto_core::protocol::opcode::Opcode;
use cassandra_proto_core::protocol::primitive::{write_int, write_short, write_string};
use cassandra_proto_core::protocol::request::{Consistency, QueryParams, Request};
use cassandra_proto_core::protocol::version::ProtocolVersion;
use cassandra_proto_core::request_handler::{RequestHandler, RequestHandlerContext};
use cassandra_proto_core::retry_policy::DefaultRetryPolicy;
use cassandra_proto_core::ExecutionOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

const RESPONSE_BIT: u8 = 0x80;

fn connection_options(endpoint: Endpoint) -> ConnectionOptions {
    ConnectionOptions {
        endpoint,
        socket_options: SocketOptions::default(),
        ssl_options: None,
        pooling: PoolingOptions {
            heart_beat_interval: Duration::ZERO,
        },
        protocol_options: ProtocolOptions::default(),
        auth_provider: None,
        prepared_cache: Arc::new(PreparedCache::new()),
    }
}

/// Read exactly one frame (header + body) off the server half of a duplex.
async fn read_frame(server: &mut DuplexStream, version: ProtocolVersion) -> (FrameHeader, Vec<u8>) {
    let mut header_buf = vec![0u8; version.header_len()];
    server.read_exact(&mut header_buf).await.expect("client closed before sending a frame");
    let header = FrameHeader::decode(&header_buf, version).expect("malformed request header");
    let mut body = vec![0u8; header.body_len as usize];
    if !body.is_empty() {
        server.read_exact(&mut body).await.expect("client closed mid-body");
    }
    (header, body)
}

/// Write a complete response frame: a version byte with the response bit
/// set, the given opcode, and a pre-encoded body.
async fn write_response(server: &mut DuplexStream, version: ProtocolVersion, stream: i16, opcode: Opcode, body: &[u8]) {
    let mut frame = Vec::with_capacity(version.header_len() + body.len());
    FrameHeader::encode(&mut frame, version, HeaderFlags::empty(), stream, opcode, body.len() as u32);
    frame[0] |= RESPONSE_BIT;
    frame.extend_from_slice(body);
    server.write_all(&frame).await.expect("fake server write failed");
}

fn void_result_body() -> Vec<u8> {
    let mut body = Vec::new();
    write_int(&mut body, 0x0001); // Void
    body
}

fn unavailable_error_body(consistency: Consistency, required: i32, alive: i32) -> Vec<u8> {
    let mut body = Vec::new();
    write_int(&mut body, 0x1000); // ErrorCode::Unavailable
    write_string(&mut body, "not enough replicas");
    write_short(&mut body, consistency as u16);
    write_int(&mut body, required);
    write_int(&mut body, alive);
    body
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
    fn workloads(&self) -> &[Workload] {
        &[]
    }
    async fn borrow_connection(&self, _keyspace: Option<&str>) -> Result<Connection> {
        Ok(self.connection.clone())
    }
}

struct SingleHostPlan(Vec<Arc<dyn Host>>);

#[async_trait]
impl LoadBalancingPolicy for SingleHostPlan {
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

fn select_query() -> Request {
    Request::Query {
        query: "SELECT * FROM t".to_string(),
        params: QueryParams::default(),
    }
}

/// A request against a single healthy host resolves with `QueryResult::Void`
/// and records exactly that host as `queried_host` (baseline happy path
/// underlying every S-numbered scenario).
#[tokio::test]
async fn query_against_a_healthy_host_resolves_void() {
    let (client, mut server) = tokio::io::duplex(8192);
    let endpoint = Endpoint::new("node1", 9042);
    let connection = Connection::from_duplex_for_test(client, ProtocolVersion::V4, &connection_options(endpoint.clone()));

    tokio::spawn(async move {
        let (header, _body) = read_frame(&mut server, ProtocolVersion::V4).await;
        write_response(&mut server, ProtocolVersion::V4, header.stream, Opcode::Result, &void_result_body()).await;
    });

    let hosts: Vec<Arc<dyn Host>> = vec![Arc::new(FakeHost {
        endpoint: endpoint.clone(),
        connection,
    })];
    let context = Arc::new(RequestHandlerContext {
        hosts: hosts.clone(),
        prepared_cache: Arc::new(PreparedCache::new()),
        default_load_balancing_policy: Arc::new(SingleHostPlan(hosts)),
        default_retry_policy: Arc::new(DefaultRetryPolicy),
        keyspace: None,
        timestamp_generation: TimestampGeneration::None,
        last_timestamp_micros: AtomicI64::new(i64::MIN),
    });

    let handler = RequestHandler::new(select_query(), ExecutionOptions::default(), context);
    let outcome = tokio::time::timeout(Duration::from_secs(2), handler.send())
        .await
        .expect("request handler never settled")
        .expect("request should have succeeded");

    assert_eq!(outcome.queried_host, endpoint);
    assert!(outcome.tried_hosts.is_empty());
    assert!(matches!(
        outcome.result,
        cassandra_proto_core::protocol::response::QueryResult::Void
    ));
}

/// §4.6's retry table: the default policy retries `UNAVAILABLE` once on a
/// fresh host (idempotence not required for this failure kind, §8 property
/// 10). A single-host plan means "next host" is the same host handed out
/// again by `VecQueryPlan`'s remaining entries, so a two-host plan proves
/// the retry actually reached the second host.
#[tokio::test]
async fn unavailable_is_retried_on_the_next_host() {
    let (client1, mut server1) = tokio::io::duplex(8192);
    let (client2, mut server2) = tokio::io::duplex(8192);
    let endpoint1 = Endpoint::new("node1", 9042);
    let endpoint2 = Endpoint::new("node2", 9042);
    let connection1 = Connection::from_duplex_for_test(client1, ProtocolVersion::V4, &connection_options(endpoint1.clone()));
    let connection2 = Connection::from_duplex_for_test(client2, ProtocolVersion::V4, &connection_options(endpoint2.clone()));

    tokio::spawn(async move {
        let (header, _body) = read_frame(&mut server1, ProtocolVersion::V4).await;
        let body = unavailable_error_body(Consistency::Quorum, 3, 1);
        write_response(&mut server1, ProtocolVersion::V4, header.stream, Opcode::Error, &body).await;
    });
    tokio::spawn(async move {
        let (header, _body) = read_frame(&mut server2, ProtocolVersion::V4).await;
        write_response(&mut server2, ProtocolVersion::V4, header.stream, Opcode::Result, &void_result_body()).await;
    });

    let hosts: Vec<Arc<dyn Host>> = vec![
        Arc::new(FakeHost {
            endpoint: endpoint1,
            connection: connection1,
        }),
        Arc::new(FakeHost {
            endpoint: endpoint2.clone(),
            connection: connection2,
        }),
    ];
    let context = Arc::new(RequestHandlerContext {
        hosts: hosts.clone(),
        prepared_cache: Arc::new(PreparedCache::new()),
        default_load_balancing_policy: Arc::new(SingleHostPlan(hosts)),
        default_retry_policy: Arc::new(DefaultRetryPolicy),
        keyspace: None,
        timestamp_generation: TimestampGeneration::None,
        last_timestamp_micros: AtomicI64::new(i64::MIN),
    });

    let handler = RequestHandler::new(select_query(), ExecutionOptions::default(), context);
    let outcome = tokio::time::timeout(Duration::from_secs(2), handler.send())
        .await
        .expect("request handler never settled")
        .expect("request should have succeeded after one retry");

    assert_eq!(outcome.queried_host, endpoint2);
    assert_eq!(outcome.tried_hosts.len(), 1);
}
