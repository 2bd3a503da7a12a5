//! The native-protocol framing layer (§3, §4.1, §6): header codec, body
//! primitives, request encoders, and response parsing. Connection lifecycle
//! and request orchestration live one level up, in `crate::connection` and
//! `crate::request_handler`.

pub mod cql_type;
pub mod flags;
pub mod frame;
pub mod opcode;
pub mod primitive;
pub mod request;
pub mod response;
pub mod version;

pub use cql_type::{ColumnSpec, CqlType};
pub use flags::{HeaderFlags, PrepareFlags, QueryFlags, ResultFlags};
pub use frame::{FrameDecoder, FrameHeader};
pub use opcode::Opcode;
pub use request::Request;
pub use response::{NodeEvent, QueryResult, Response, SchemaChange, ServerError};
pub use version::ProtocolVersion;
