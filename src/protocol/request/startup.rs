//! `STARTUP` body: a string map of option keys (§6). Grounded on the
//! teacher's `write_init_db`/capability-negotiation style of small,
//! purpose-built writers rather than a generic map-builder.

use crate::protocol::primitive::write_string_map;

#[derive(Debug, Clone)]
pub struct StartupOptions {
    pub cql_version: String,
    pub driver_name: String,
    pub driver_version: String,
    pub no_compact: bool,
    pub client_id: Option<String>,
    pub application_name: Option<String>,
    pub application_version: Option<String>,
}

impl Default for StartupOptions {
    fn default() -> Self {
        Self {
            cql_version: "3.0.0".to_string(),
            driver_name: env!("CARGO_PKG_NAME").to_string(),
            driver_version: env!("CARGO_PKG_VERSION").to_string(),
            no_compact: false,
            client_id: None,
            application_name: None,
            application_version: None,
        }
    }
}

impl StartupOptions {
    pub fn write(&self, out: &mut Vec<u8>) {
        let mut pairs: Vec<(&str, &str)> = vec![
            ("CQL_VERSION", &self.cql_version),
            ("DRIVER_NAME", &self.driver_name),
            ("DRIVER_VERSION", &self.driver_version),
        ];
        if self.no_compact {
            pairs.push(("NO_COMPACT", "true"));
        }
        if let Some(client_id) = &self.client_id {
            pairs.push(("CLIENT_ID", client_id));
        }
        if let Some(application_name) = &self.application_name {
            pairs.push(("APPLICATION_NAME", application_name));
        }
        if let Some(application_version) = &self.application_version {
            pairs.push(("APPLICATION_VERSION", application_version));
        }
        write_string_map(out, &pairs);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::protocol::primitive::FrameReader;

    #[test]
    fn default_startup_carries_cql_version() {
        let opts = StartupOptions::default();
        let mut buf = Vec::new();
        opts.write(&mut buf);
        let mut r = FrameReader::new(&buf);
        let map = r.read_string_map().unwrap();
        assert_eq!(map.get("CQL_VERSION").map(String::as_str), Some("3.0.0"));
    }
}
