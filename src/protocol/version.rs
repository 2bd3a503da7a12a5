/// Negotiated wire-protocol version (§3).
///
/// Core Cassandra versions are a small dense integer range; DSE extends the
/// range with two custom variants that layer extra capabilities on top of
/// v4 framing. Capability gates are exposed as methods rather than raw
/// numeric comparisons because the DSE variants are not simply "v5, v6...".
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProtocolVersion {
    V1 = 1,
    V2 = 2,
    V3 = 3,
    V4 = 4,
    V5 = 5,
    DseV1 = 0x41,
    DseV2 = 0x42,
}

impl ProtocolVersion {
    pub const MAX_CORE: ProtocolVersion = ProtocolVersion::V4;

    pub fn from_raw(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::V1),
            2 => Some(Self::V2),
            3 => Some(Self::V3),
            4 => Some(Self::V4),
            5 => Some(Self::V5),
            0x41 => Some(Self::DseV1),
            0x42 => Some(Self::DseV2),
            _ => None,
        }
    }

    pub fn raw(self) -> u8 {
        self as u8
    }

    /// Width in bytes of the stream id field in the frame header (§4.2).
    pub fn stream_id_width(self) -> usize {
        match self {
            Self::V1 | Self::V2 => 1,
            _ => 2,
        }
    }

    /// Length of the frame header: 8 bytes for v1-v2, 9 bytes otherwise (§4.1).
    pub fn header_len(self) -> usize {
        4 + 1 + 1 + 1 + self.stream_id_width()
    }

    pub fn stream_id_capacity(self) -> usize {
        match self.stream_id_width() {
            1 => 128,
            _ => 32_768,
        }
    }

    pub fn supports_paging(self) -> bool {
        self >= Self::V2
    }

    pub fn supports_timestamps(self) -> bool {
        self >= Self::V3
    }

    /// v5 introduces the prepared-result metadata id; DSE v1/v2 stay on the
    /// v4-shaped result metadata (§3, §4.1).
    pub fn supports_result_metadata_id(self) -> bool {
        self == Self::V5
    }

    pub fn is_dse(self) -> bool {
        matches!(self, Self::DseV1 | Self::DseV2)
    }

    /// DSE v2 widens the query/batch flags word to 4 bytes (§4.1).
    pub fn uses_4byte_query_flags(self) -> bool {
        self == Self::DseV2
    }

    pub fn supports_keyspace_in_request(self) -> bool {
        self == Self::DseV2
    }

    pub fn supports_prepare_keyspace(self) -> bool {
        self == Self::DseV2
    }

    /// Walk one step down the negotiation ladder during handshake
    /// downgrade (§3, S1). Only core versions participate; a DSE variant
    /// downgrades straight to the highest core version below it.
    pub fn step_down(self) -> Option<Self> {
        match self {
            Self::DseV2 | Self::DseV1 => Some(Self::V4),
            Self::V5 => Some(Self::V4),
            Self::V4 => Some(Self::V3),
            Self::V3 => Some(Self::V2),
            Self::V2 => Some(Self::V1),
            Self::V1 => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn stream_id_width_matches_spec() {
        assert_eq!(ProtocolVersion::V1.stream_id_width(), 1);
        assert_eq!(ProtocolVersion::V2.stream_id_width(), 1);
        assert_eq!(ProtocolVersion::V3.stream_id_width(), 2);
        assert_eq!(ProtocolVersion::DseV2.stream_id_width(), 2);
    }

    #[test]
    fn capacities_match_spec() {
        assert_eq!(ProtocolVersion::V2.stream_id_capacity(), 128);
        assert_eq!(ProtocolVersion::V3.stream_id_capacity(), 32_768);
        assert_eq!(ProtocolVersion::DseV2.stream_id_capacity(), 32_768);
    }

    #[test]
    fn dse_v2_only_gets_keyspace_and_wide_flags() {
        assert!(ProtocolVersion::DseV2.supports_keyspace_in_request());
        assert!(!ProtocolVersion::DseV1.supports_keyspace_in_request());
        assert!(ProtocolVersion::DseV2.uses_4byte_query_flags());
        assert!(!ProtocolVersion::DseV1.uses_4byte_query_flags());
    }

    #[test]
    fn downgrade_ladder_from_v4() {
        assert_eq!(ProtocolVersion::V4.step_down(), Some(ProtocolVersion::V3));
        assert_eq!(ProtocolVersion::V3.step_down(), Some(ProtocolVersion::V2));
        assert_eq!(ProtocolVersion::V2.step_down(), Some(ProtocolVersion::V1));
        assert_eq!(ProtocolVersion::V1.step_down(), None);
    }
}
