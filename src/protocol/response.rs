//! Parses server-to-client frame bodies (§4.1, §6) into typed `Response`
//! values. Grounded on the teacher's `protocol/response.rs`, which parses
//! `OkPayload`/`ErrPayload` off the same kind of opcode-routed dispatch;
//! here the dispatch key is the CQL opcode instead of MySQL's first-byte
//! sentinel, and RESULT further dispatches on its own 4-byte `kind`.

use std::net::SocketAddr;

use bytes::Bytes;

use super::cql_type::{ColumnSpec, CqlType};
use super::flags::ResultFlags;
use super::opcode::Opcode;
use super::primitive::FrameReader;
use super::request::Consistency;
use super::version::ProtocolVersion;
use crate::error::{Error, ErrorCode, Result};

/// One parsed response body, keyed by the frame's opcode (§4.1).
#[derive(Debug, Clone)]
pub enum Response {
    Error(ServerError),
    Ready,
    Authenticate { authenticator: String },
    Supported { options: std::collections::HashMap<String, Vec<String>> },
    Result(QueryResult),
    AuthChallenge { token: Vec<u8> },
    AuthSuccess { token: Option<Vec<u8>> },
    Event(NodeEvent),
}

#[derive(Debug, Clone)]
pub struct ServerError {
    pub code: ErrorCode,
    pub message: String,
    /// For `Unprepared`, the query id the server no longer recognizes
    /// (§4.6, RequestHandler's UNPREPARED recovery path).
    pub unprepared_id: Option<Vec<u8>>,
    /// The error-kind-specific tail for the three codes a retry policy
    /// acts on (§6, §4.6's retry table); every other code carries `None`.
    pub detail: ServerErrorDetail,
}

#[derive(Debug, Clone)]
pub enum ServerErrorDetail {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: String,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },
}

#[derive(Debug, Clone)]
pub enum QueryResult {
    Void,
    Rows(RowsResult),
    SetKeyspace(String),
    Prepared(PreparedResult),
    SchemaChange(SchemaChange),
}

#[derive(Debug, Clone, Default)]
pub struct ResultMetadata {
    pub flags: ResultFlags,
    pub columns_count: i32,
    pub paging_state: Option<Vec<u8>>,
    pub new_metadata_id: Option<Vec<u8>>,
    pub columns: Option<Vec<ColumnSpec>>,
}

#[derive(Debug, Clone)]
pub struct RowsResult {
    pub metadata: ResultMetadata,
    /// Raw per-column bytes, one `Vec` per row. Value decoding stays the
    /// external Encoder's job; this layer only slices out the frames.
    pub rows: Vec<Vec<Option<Bytes>>>,
}

#[derive(Debug, Clone)]
pub struct PreparedResult {
    pub id: Vec<u8>,
    pub result_metadata_id: Option<Vec<u8>>,
    pub bind_markers: ResultMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone)]
pub enum SchemaChangeTarget {
    Keyspace,
    Table { name: String },
    UserType { name: String },
    Function { name: String, arg_types: Vec<String> },
    Aggregate { name: String, arg_types: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct SchemaChange {
    pub change_type: String,
    pub keyspace: String,
    pub target: SchemaChangeTarget,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    TopologyChange { change_type: String, address: SocketAddr },
    StatusChange { change_type: String, address: SocketAddr },
    SchemaChange(SchemaChange),
}

fn malformed(what: &str) -> Error {
    Error::ProtocolError(format!("malformed response: {what}"))
}

pub fn parse(opcode: Opcode, body: &[u8], version: ProtocolVersion) -> Result<Response> {
    let mut r = FrameReader::new(body);
    match opcode {
        Opcode::Error => Ok(Response::Error(parse_error(&mut r)?)),
        Opcode::Ready => Ok(Response::Ready),
        Opcode::Authenticate => Ok(Response::Authenticate {
            authenticator: r.read_string()?.to_string(),
        }),
        Opcode::Supported => Ok(Response::Supported {
            options: read_string_multimap(&mut r)?,
        }),
        Opcode::AuthChallenge => Ok(Response::AuthChallenge {
            token: r.read_bytes()?.map(<[u8]>::to_vec).unwrap_or_default(),
        }),
        Opcode::AuthSuccess => Ok(Response::AuthSuccess {
            token: r.read_bytes()?.map(<[u8]>::to_vec),
        }),
        Opcode::Result => Ok(Response::Result(parse_result(&mut r, version)?)),
        Opcode::Event => Ok(Response::Event(parse_event(&mut r)?)),
        other => Err(malformed(&format!("{other:?} is not a response opcode"))),
    }
}

fn read_consistency(r: &mut FrameReader<'_>) -> Result<Consistency> {
    let raw = r.read_short()?;
    Consistency::from_raw(raw).ok_or_else(|| malformed("unrecognized consistency level"))
}

fn parse_error(r: &mut FrameReader<'_>) -> Result<ServerError> {
    let code = ErrorCode::from(r.read_int()? as u32);
    let message = r.read_string()?.to_string();
    let unprepared_id = match code {
        ErrorCode::Unprepared => Some(r.read_short_bytes()?.to_vec()),
        _ => None,
    };
    let detail = match code {
        ErrorCode::Unavailable => ServerErrorDetail::Unavailable {
            consistency: read_consistency(r)?,
            required: r.read_int()?,
            alive: r.read_int()?,
        },
        ErrorCode::WriteTimeout => ServerErrorDetail::WriteTimeout {
            consistency: read_consistency(r)?,
            received: r.read_int()?,
            required: r.read_int()?,
            write_type: r.read_string()?.to_string(),
        },
        ErrorCode::ReadTimeout => ServerErrorDetail::ReadTimeout {
            consistency: read_consistency(r)?,
            received: r.read_int()?,
            required: r.read_int()?,
            data_present: r.read_u8()? != 0,
        },
        _ => ServerErrorDetail::None,
    };
    Ok(ServerError {
        code,
        message,
        unprepared_id,
        detail,
    })
}

fn read_string_multimap(
    r: &mut FrameReader<'_>,
) -> Result<std::collections::HashMap<String, Vec<String>>> {
    let count = r.read_short()?;
    let mut map = std::collections::HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = r.read_string()?.to_string();
        let values = r
            .read_string_list()?
            .into_iter()
            .map(str::to_string)
            .collect();
        map.insert(key, values);
    }
    Ok(map)
}

fn parse_result(r: &mut FrameReader<'_>, version: ProtocolVersion) -> Result<QueryResult> {
    let kind = r.read_int()?;
    Ok(match kind {
        0x0001 => QueryResult::Void,
        0x0002 => QueryResult::Rows(parse_rows(r, version)?),
        0x0003 => QueryResult::SetKeyspace(r.read_string()?.to_string()),
        0x0004 => QueryResult::Prepared(parse_prepared(r, version)?),
        0x0005 => QueryResult::SchemaChange(parse_schema_change(r)?),
        other => return Err(malformed(&format!("unrecognized result kind {other}"))),
    })
}

fn parse_result_metadata(r: &mut FrameReader<'_>, version: ProtocolVersion) -> Result<ResultMetadata> {
    let raw_flags = r.read_int()? as u32;
    let flags = ResultFlags::from_bits_retain(raw_flags);
    let columns_count = r.read_int()?;

    let paging_state = if flags.contains(ResultFlags::HAS_MORE_PAGES) {
        r.read_bytes()?.map(<[u8]>::to_vec)
    } else {
        None
    };

    let new_metadata_id = if version.supports_result_metadata_id()
        && flags.contains(ResultFlags::METADATA_CHANGED)
    {
        Some(r.read_short_bytes()?.to_vec())
    } else {
        None
    };

    let columns = if flags.contains(ResultFlags::NO_METADATA) {
        None
    } else {
        let global_spec = if flags.contains(ResultFlags::GLOBAL_TABLES_SPEC) {
            let keyspace = r.read_string()?.to_string();
            let table = r.read_string()?.to_string();
            Some((keyspace, table))
        } else {
            None
        };

        let mut specs = Vec::with_capacity(columns_count.max(0) as usize);
        for _ in 0..columns_count {
            let (keyspace, table) = match &global_spec {
                Some((k, t)) => (k.clone(), t.clone()),
                None => {
                    let keyspace = r.read_string()?.to_string();
                    let table = r.read_string()?.to_string();
                    (keyspace, table)
                }
            };
            let name = r.read_string()?.to_string();
            let type_spec = CqlType::read(r)?;
            specs.push(ColumnSpec {
                keyspace,
                table,
                name,
                type_spec,
            });
        }
        Some(specs)
    };

    Ok(ResultMetadata {
        flags,
        columns_count,
        paging_state,
        new_metadata_id,
        columns,
    })
}

fn parse_rows(r: &mut FrameReader<'_>, version: ProtocolVersion) -> Result<RowsResult> {
    let metadata = parse_result_metadata(r, version)?;
    let rows_count = r.read_int()?;
    if rows_count < 0 {
        return Err(malformed("negative rows count"));
    }
    let columns_count = metadata.columns_count.max(0) as usize;
    let mut rows = Vec::with_capacity(rows_count as usize);
    for _ in 0..rows_count {
        let mut row = Vec::with_capacity(columns_count);
        for _ in 0..columns_count {
            row.push(r.read_bytes()?.map(Bytes::copy_from_slice));
        }
        rows.push(row);
    }
    Ok(RowsResult { metadata, rows })
}

fn parse_prepared(r: &mut FrameReader<'_>, version: ProtocolVersion) -> Result<PreparedResult> {
    let id = r.read_short_bytes()?.to_vec();
    let result_metadata_id = if version.supports_result_metadata_id() {
        Some(r.read_short_bytes()?.to_vec())
    } else {
        None
    };
    let bind_markers = parse_result_metadata(r, version)?;
    let result_metadata = parse_result_metadata(r, version)?;
    Ok(PreparedResult {
        id,
        result_metadata_id,
        bind_markers,
        result_metadata,
    })
}

fn parse_schema_change(r: &mut FrameReader<'_>) -> Result<SchemaChange> {
    let change_type = r.read_string()?.to_string();
    let target_kind = r.read_string()?.to_string();
    let keyspace = r.read_string()?.to_string();
    let target = match target_kind.as_str() {
        "KEYSPACE" => SchemaChangeTarget::Keyspace,
        "TABLE" => SchemaChangeTarget::Table {
            name: r.read_string()?.to_string(),
        },
        "TYPE" => SchemaChangeTarget::UserType {
            name: r.read_string()?.to_string(),
        },
        "FUNCTION" => SchemaChangeTarget::Function {
            name: r.read_string()?.to_string(),
            arg_types: r
                .read_string_list()?
                .into_iter()
                .map(str::to_string)
                .collect(),
        },
        "AGGREGATE" => SchemaChangeTarget::Aggregate {
            name: r.read_string()?.to_string(),
            arg_types: r
                .read_string_list()?
                .into_iter()
                .map(str::to_string)
                .collect(),
        },
        other => return Err(malformed(&format!("unrecognized schema change target {other}"))),
    };
    Ok(SchemaChange {
        change_type,
        keyspace,
        target,
    })
}

fn parse_event(r: &mut FrameReader<'_>) -> Result<NodeEvent> {
    let event_type = r.read_string()?;
    match event_type {
        "TOPOLOGY_CHANGE" => Ok(NodeEvent::TopologyChange {
            change_type: r.read_string()?.to_string(),
            address: r.read_inet()?,
        }),
        "STATUS_CHANGE" => Ok(NodeEvent::StatusChange {
            change_type: r.read_string()?.to_string(),
            address: r.read_inet()?,
        }),
        "SCHEMA_CHANGE" => Ok(NodeEvent::SchemaChange(parse_schema_change(r)?)),
        other => Err(malformed(&format!("unrecognized event type {other}"))),
    }
}
