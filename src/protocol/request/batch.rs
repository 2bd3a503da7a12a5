//! `BATCH` body (§6): a type byte, a counted list of entries (each a plain
//! query string or a prepared statement id), then a trailing parameter
//! block over the same field order `QueryParams` uses, restricted to the
//! subset BATCH carries (no page size, no skip-metadata, no per-statement
//! keyspace override — those don't apply to a batch as a whole).

use super::consistency::Consistency;
use super::value::BoundValues;
use crate::protocol::flags::QueryFlags;
use crate::protocol::primitive::{
    write_int, write_long, write_long_string, write_short_bytes, write_string,
};
use crate::protocol::version::ProtocolVersion;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone)]
pub enum BatchStatement {
    Query(String),
    Prepared(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub statement: BatchStatement,
    pub values: BoundValues,
}

impl BatchEntry {
    pub fn write(&self, out: &mut Vec<u8>) {
        match &self.statement {
            BatchStatement::Query(query) => {
                out.push(0);
                write_long_string(out, query);
            }
            BatchStatement::Prepared(id) => {
                out.push(1);
                write_short_bytes(out, id);
            }
        }
        self.values.write(out);
    }
}

#[derive(Debug, Clone)]
pub struct BatchParams {
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
    pub keyspace: Option<String>,
}

impl Default for BatchParams {
    fn default() -> Self {
        Self {
            consistency: Consistency::One,
            serial_consistency: None,
            default_timestamp: None,
            keyspace: None,
        }
    }
}

impl BatchParams {
    fn flags(&self, version: ProtocolVersion) -> QueryFlags {
        let mut flags = QueryFlags::empty();
        if self.serial_consistency.is_some() {
            flags |= QueryFlags::WITH_SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() && version.supports_timestamps() {
            flags |= QueryFlags::WITH_DEFAULT_TIMESTAMP;
        }
        if self.keyspace.is_some() && version.supports_keyspace_in_request() {
            flags |= QueryFlags::WITH_KEYSPACE;
        }
        flags
    }

    pub fn write(&self, out: &mut Vec<u8>, version: ProtocolVersion) {
        out.extend_from_slice(&self.consistency.to_be_bytes());
        let flags = self.flags(version);
        if version.uses_4byte_query_flags() {
            write_int(out, flags.bits() as i32);
        } else {
            out.push(flags.bits() as u8);
        }
        if let Some(serial) = self.serial_consistency {
            out.extend_from_slice(&serial.to_be_bytes());
        }
        if flags.contains(QueryFlags::WITH_DEFAULT_TIMESTAMP) {
            write_long(out, self.default_timestamp.unwrap_or_default());
        }
        if flags.contains(QueryFlags::WITH_KEYSPACE) {
            write_string(out, self.keyspace.as_deref().unwrap_or_default());
        }
    }
}

