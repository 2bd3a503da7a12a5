//! The parameter block shared by QUERY, EXECUTE, and (a subset of) BATCH
//! (§4.1). Field order after the flags word is fixed: `n+values, pageSize,
//! pagingState, serialConsistency, defaultTimestamp, keyspace` — encoded
//! here in exactly that order regardless of which flags are set.

use super::consistency::Consistency;
use super::value::BoundValues;
use crate::protocol::flags::QueryFlags;
use crate::protocol::primitive::{write_bytes, write_int, write_long, write_string, BytesValue};
use crate::protocol::version::ProtocolVersion;

#[derive(Debug, Clone)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub values: BoundValues,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
    pub keyspace: Option<String>,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            consistency: Consistency::One,
            values: BoundValues::Positional(Vec::new()),
            skip_metadata: false,
            page_size: None,
            paging_state: None,
            serial_consistency: None,
            default_timestamp: None,
            keyspace: None,
        }
    }
}

impl QueryParams {
    fn flags(&self, version: ProtocolVersion) -> QueryFlags {
        let mut flags = QueryFlags::empty();
        if !self.values.is_empty() {
            flags |= QueryFlags::VALUES;
        }
        if self.values.has_names() {
            flags |= QueryFlags::WITH_NAMES_FOR_VALUES;
        }
        if self.skip_metadata {
            flags |= QueryFlags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= QueryFlags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= QueryFlags::WITH_PAGING_STATE;
        }
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

        if flags.contains(QueryFlags::VALUES) {
            self.values.write(out);
        }
        if let Some(page_size) = self.page_size {
            write_int(out, page_size);
        }
        if let Some(paging_state) = &self.paging_state {
            write_bytes(out, BytesValue::Value(paging_state));
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
