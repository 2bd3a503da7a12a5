//! Typed outgoing requests (§6). Each variant knows how to serialize its
//! own body; `Request::write` adds the frame header and returns one
//! complete frame ready for the write queue. Grounded on the teacher's
//! `protocol/command/*.rs` free `write_*` functions, gathered here under
//! one `Request` value so the write queue (§4.3) can hold a homogeneous
//! queue of `{request, options, callback}` the way spec.md's `WriteQueue`
//! does.

mod batch;
mod consistency;
mod query_params;
mod startup;
mod value;

pub use batch::{BatchEntry, BatchParams, BatchType};
pub use consistency::Consistency;
pub use query_params::QueryParams;
pub use startup::StartupOptions;
pub use value::{BoundValues, Value};

use std::collections::HashMap;

use super::flags::HeaderFlags;
use super::frame::FrameHeader;
use super::opcode::Opcode;
use super::primitive::{
    write_bytes, write_custom_payload, write_int, write_long_string, write_short_bytes,
    write_string, write_string_list, BytesValue,
};
use super::version::ProtocolVersion;
use crate::error::Result;

/// A request value, carrying every field needed to reproduce its body.
/// `Clone` gives the `clone()` operation spec.md calls for (batch entries
/// duplicate a prepared statement's bound-value template per execution).
#[derive(Debug, Clone)]
pub enum Request {
    Startup(StartupOptions),
    Credentials { username: String, password: String },
    Options,
    Register { event_types: Vec<String> },
    Query { query: String, params: QueryParams },
    Prepare { query: String, keyspace: Option<String> },
    Execute {
        id: Vec<u8>,
        result_metadata_id: Option<Vec<u8>>,
        params: QueryParams,
    },
    Batch {
        batch_type: BatchType,
        queries: Vec<BatchEntry>,
        params: BatchParams,
    },
    AuthResponse { token: Vec<u8> },
    Cancel { operation_id: i32 },
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup(_) => Opcode::Startup,
            Request::Credentials { .. } => Opcode::Credentials,
            Request::Options => Opcode::Options,
            Request::Register { .. } => Opcode::Register,
            Request::Query { .. } => Opcode::Query,
            Request::Prepare { .. } => Opcode::Prepare,
            Request::Execute { .. } => Opcode::Execute,
            Request::Batch { .. } => Opcode::Batch,
            Request::AuthResponse { .. } => Opcode::AuthResponse,
            Request::Cancel { .. } => Opcode::Cancel,
        }
    }

    /// Serialize this request to one complete frame: header + body. The
    /// body length recorded in the header doubles as the accounting figure
    /// the write queue uses for coalescing (§4.1, "record the body length").
    pub fn write(
        &self,
        version: ProtocolVersion,
        stream: i16,
        custom_payload: Option<&HashMap<String, Vec<u8>>>,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        let mut flags = HeaderFlags::empty();
        if let Some(payload) = custom_payload {
            flags |= HeaderFlags::CUSTOM_PAYLOAD;
            write_custom_payload(&mut body, payload);
        }

        self.write_body(&mut body, version);

        let mut frame = Vec::with_capacity(version.header_len() + body.len());
        FrameHeader::encode(
            &mut frame,
            version,
            flags,
            stream,
            self.opcode(),
            body.len() as u32,
        );
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Clone this request with its consistency overridden, for a retry
    /// decision that carries a replacement consistency level (§4.6 `Retry`).
    /// A no-op clone for request kinds that carry no consistency field.
    #[must_use]
    pub fn with_consistency(&self, consistency: Consistency) -> Self {
        let mut cloned = self.clone();
        match &mut cloned {
            Request::Query { params, .. } | Request::Execute { params, .. } => {
                params.consistency = consistency;
            }
            Request::Batch { params, .. } => {
                params.consistency = consistency;
            }
            Request::Startup(_)
            | Request::Credentials { .. }
            | Request::Options
            | Request::Register { .. }
            | Request::Prepare { .. }
            | Request::AuthResponse { .. }
            | Request::Cancel { .. } => {}
        }
        cloned
    }

    fn write_body(&self, out: &mut Vec<u8>, version: ProtocolVersion) {
        match self {
            Request::Startup(opts) => opts.write(out),
            Request::Credentials { username, password } => {
                let pairs = [("username", username.as_str()), ("password", password.as_str())];
                super::primitive::write_string_map(out, &pairs);
            }
            Request::Options => {}
            Request::Register { event_types } => write_string_list(out, event_types),
            Request::Query { query, params } => {
                write_long_string(out, query);
                params.write(out, version);
            }
            Request::Prepare { query, keyspace } => {
                write_long_string(out, query);
                if version.supports_prepare_keyspace() {
                    let mut flags = super::flags::PrepareFlags::empty();
                    if keyspace.is_some() {
                        flags |= super::flags::PrepareFlags::WITH_KEYSPACE;
                    }
                    write_int(out, flags.bits() as i32);
                    if let Some(keyspace) = keyspace {
                        write_string(out, keyspace);
                    }
                }
            }
            Request::Execute {
                id,
                result_metadata_id,
                params,
            } => {
                write_short_bytes(out, id);
                if version.supports_result_metadata_id() {
                    if let Some(result_metadata_id) = result_metadata_id {
                        write_short_bytes(out, result_metadata_id);
                    }
                }
                params.write(out, version);
            }
            Request::Batch {
                batch_type,
                queries,
                params,
            } => {
                out.push(*batch_type as u8);
                super::primitive::write_short(out, queries.len() as u16);
                for entry in queries {
                    entry.write(out);
                }
                params.write(out, version);
            }
            Request::AuthResponse { token } => {
                write_bytes(out, BytesValue::Value(token));
            }
            Request::Cancel { operation_id } => {
                write_int(out, 1);
                write_int(out, *operation_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::primitive::FrameReader;

    #[test]
    fn options_request_has_empty_body() {
        let frame = Request::Options.write(ProtocolVersion::V4, 1, None).unwrap();
        let header = FrameHeader::decode(&frame, ProtocolVersion::V4).unwrap();
        assert_eq!(header.body_len, 0);
        assert_eq!(header.opcode, Opcode::Options);
    }

    #[test]
    fn query_request_carries_consistency_and_query_text() {
        let params = QueryParams {
            consistency: Consistency::Quorum,
            ..Default::default()
        };
        let frame = Request::Query {
            query: "SELECT * FROM t".to_string(),
            params,
        }
        .write(ProtocolVersion::V4, 9, None)
        .unwrap();

        let header_len = ProtocolVersion::V4.header_len();
        let mut r = FrameReader::new(&frame[header_len..]);
        assert_eq!(r.read_long_string().unwrap(), "SELECT * FROM t");
        // consistency (short) + flags (1 byte, no values set)
        assert_eq!(r.read_short().unwrap(), Consistency::Quorum as u16);
    }

    #[test]
    fn execute_omits_result_metadata_id_below_v5() {
        let params = QueryParams::default();
        let frame = Request::Execute {
            id: vec![1, 2, 3, 4],
            result_metadata_id: Some(vec![9, 9]),
            params,
        }
        .write(ProtocolVersion::V4, 2, None)
        .unwrap();

        let header_len = ProtocolVersion::V4.header_len();
        let mut r = FrameReader::new(&frame[header_len..]);
        assert_eq!(r.read_short_bytes().unwrap(), &[1, 2, 3, 4]);
        // next field must be consistency (short), not a second short-bytes id
        assert_eq!(r.read_short().unwrap(), Consistency::One as u16);
    }

    #[test]
    fn with_consistency_overrides_query_params_only() {
        let request = Request::Query {
            query: "SELECT * FROM t".to_string(),
            params: QueryParams::default(),
        };
        let retried = request.with_consistency(Consistency::All);
        match retried {
            Request::Query { params, .. } => assert_eq!(params.consistency, Consistency::All),
            _ => panic!("expected Query"),
        }
    }

    #[test]
    fn with_consistency_is_a_noop_for_requests_without_one() {
        let request = Request::Options;
        let retried = request.with_consistency(Consistency::All);
        assert!(matches!(retried, Request::Options));
    }

    #[test]
    fn custom_payload_sets_header_flag() {
        let mut payload = HashMap::new();
        payload.insert("trace".to_string(), vec![1]);
        let frame = Request::Options
            .write(ProtocolVersion::V4, 1, Some(&payload))
            .unwrap();
        let header = FrameHeader::decode(&frame, ProtocolVersion::V4).unwrap();
        assert!(header.flags.contains(HeaderFlags::CUSTOM_PAYLOAD));
    }
}
