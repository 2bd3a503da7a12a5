//! Bitflag sets for the frame header and the QUERY/EXECUTE/BATCH parameter
//! block (§4.1). Grounded on the teacher's `bitflags!` usage in
//! `constant.rs` for `CapabilityFlags`/`ServerStatusFlags`.

bitflags::bitflags! {
    /// Frame header flags, applied before the body is written (§4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const TRACING = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
    }
}

bitflags::bitflags! {
    /// QUERY/EXECUTE/BATCH parameter-block flags. Represented as a 32-bit
    /// set; encoders narrow to 1 byte on protocol v2-v4 and widen to 4
    /// bytes from DSE v2 onward (§4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct QueryFlags: u32 {
        const VALUES = 0x01;
        const SKIP_METADATA = 0x02;
        const PAGE_SIZE = 0x04;
        const WITH_PAGING_STATE = 0x08;
        const WITH_SERIAL_CONSISTENCY = 0x10;
        const WITH_DEFAULT_TIMESTAMP = 0x20;
        const WITH_NAMES_FOR_VALUES = 0x40;
        const WITH_KEYSPACE = 0x80;
    }
}

bitflags::bitflags! {
    /// PREPARE request flags, DSE v2+ only (§6).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PrepareFlags: u32 {
        const WITH_KEYSPACE = 0x01;
    }
}

bitflags::bitflags! {
    /// RESULT metadata flags carried in Rows/Prepared bodies (§4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ResultFlags: u32 {
        const GLOBAL_TABLES_SPEC = 0x0001;
        const HAS_MORE_PAGES = 0x0002;
        const NO_METADATA = 0x0004;
        const METADATA_CHANGED = 0x0008;
    }
}
