//! Native-protocol connection and request-execution core for Cassandra/DSE
//! drivers (§1 OVERVIEW).
//!
//! This crate owns exactly two things: a single-socket [`connection::Connection`]
//! that speaks the CQL binary protocol over one multiplexed TCP/TLS stream,
//! and a [`request_handler::RequestHandler`] that drives one user request
//! through host selection, coordinator-side retry, speculative execution,
//! and `UNPREPARED` recovery. Everything above that line — cluster topology,
//! schema metadata, a query builder, connection pooling across many hosts —
//! is a collaborator this crate only defines a trait for ([`host::Host`],
//! [`load_balancing::LoadBalancingPolicy`], [`client_metadata::ClientMetadata`],
//! ...), not something it implements.

pub mod client_metadata;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod execution_options;
pub mod host;
pub mod load_balancing;
pub mod operation;
pub mod prepared_cache;
pub mod protocol;
pub mod request_handler;
pub mod retry_policy;
pub mod speculative_execution;
pub mod stream_id_pool;
pub mod write_queue;

pub use config::ClientConfig;
pub use connection::{Connection, ConnectionOptions};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use execution_options::ExecutionOptions;
pub use request_handler::{ExecutionResult, RequestHandler, RequestHandlerContext};
