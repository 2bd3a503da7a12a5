//! Client-wide configuration (§6 "Configuration options"). Mirrors the
//! teacher's `Opts`: a plain struct with a `Default` impl, grouped into
//! the same nested option families the spec's table uses rather than one
//! flat bag of fields.

use std::time::Duration;

use crate::protocol::request::Consistency;
use crate::protocol::version::ProtocolVersion;

#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub read_timeout: Option<Duration>,
    pub keep_alive: bool,
    pub keep_alive_delay: Duration,
    pub tcp_no_delay: bool,
    pub coalescing_threshold: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Some(Duration::from_secs(12)),
            keep_alive: true,
            keep_alive_delay: Duration::from_secs(30),
            tcp_no_delay: true,
            coalescing_threshold: 8192,
        }
    }
}

/// TLS options. Carried verbatim from §6: present means "use TLS", with
/// certificate verification defaulted off unless the caller opts in —
/// a deliberately-insecure-by-default knob inherited from the spec (see
/// DESIGN.md), not invented here.
#[derive(Debug, Clone)]
pub struct SslOptions {
    pub reject_unauthorized: bool,
}

impl Default for SslOptions {
    fn default() -> Self {
        Self {
            reject_unauthorized: false,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolingOptions {
    /// Idle-query interval; `Duration::ZERO` disables heartbeats (§4.5).
    pub heart_beat_interval: Duration,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            heart_beat_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProtocolOptions {
    pub max_version: ProtocolVersion,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            max_version: ProtocolVersion::MAX_CORE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
    pub consistency: Consistency,
    pub fetch_size: i32,
    pub default_is_idempotent: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            consistency: Consistency::LocalOne,
            fetch_size: 5000,
            default_is_idempotent: false,
        }
    }
}

/// Whether and how request timestamps are generated client-side when the
/// negotiated protocol version supports them (§6 `policies.timestampGeneration`).
#[derive(Debug, Clone, Copy, Default)]
pub enum TimestampGeneration {
    #[default]
    None,
    Monotonic,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Policies {
    pub timestamp_generation: TimestampGeneration,
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub socket_options: SocketOptions,
    pub ssl_options: Option<SslOptions>,
    pub pooling: PoolingOptions,
    pub protocol_options: ProtocolOptions,
    pub query_options: QueryOptions,
    pub policies: Policies,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_disable_tls() {
        let config = ClientConfig::default();
        assert!(config.ssl_options.is_none());
    }

    #[test]
    fn ssl_options_default_to_no_cert_verification() {
        let ssl = SslOptions::default();
        assert!(!ssl.reject_unauthorized);
    }

    #[test]
    fn protocol_options_cap_at_core_max() {
        let config = ClientConfig::default();
        assert_eq!(config.protocol_options.max_version, ProtocolVersion::V4);
    }
}
