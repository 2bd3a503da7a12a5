//! Body primitives for the framing layer (§4.1): big-endian fixed-width
//! integers, length-prefixed bytes/strings, and the counted collections
//! built on top of them. Grounded on the teacher's `protocol/primitive.rs`
//! (big-endian readers returning `(value, rest)`), adapted to a cursor
//! struct instead of re-slicing by hand at every call site.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

/// A null value (`bytes` length `-1`).
pub const BYTES_NULL_LEN: i32 = -1;
/// An "unset" value (`bytes` length `-2`) — the field is omitted entirely.
pub const BYTES_UNSET_LEN: i32 = -2;

fn malformed(what: &str) -> Error {
    Error::ProtocolError(format!("malformed frame: {what}"))
}

/// A read cursor over one frame body.
pub struct FrameReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.data.len() < self.pos + n {
            return Err(malformed("unexpected end of frame body"));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_short(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_int(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_long(&mut self) -> Result<i64> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// `bytes`: 4-byte length prefix; `-1` is null, `-2` is "unset" (§4.1).
    pub fn read_bytes(&mut self) -> Result<Option<&'a [u8]>> {
        let len = self.read_int()?;
        match len {
            BYTES_NULL_LEN | BYTES_UNSET_LEN => Ok(None),
            n if n < 0 => Err(malformed("negative bytes length")),
            n => Ok(Some(self.take(n as usize)?)),
        }
    }

    pub fn read_short_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_short()?;
        self.take(len as usize)
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_short_bytes()?;
        std::str::from_utf8(bytes).map_err(|_| malformed("string is not valid utf-8"))
    }

    pub fn read_long_string(&mut self) -> Result<&'a str> {
        let len = self.read_int()?;
        if len < 0 {
            return Err(malformed("negative long-string length"));
        }
        let bytes = self.take(len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| malformed("long string is not valid utf-8"))
    }

    pub fn read_string_list(&mut self) -> Result<Vec<&'a str>> {
        let count = self.read_short()?;
        (0..count).map(|_| self.read_string()).collect()
    }

    pub fn read_string_map(&mut self) -> Result<HashMap<String, String>> {
        let count = self.read_short()?;
        let mut map = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let k = self.read_string()?.to_string();
            let v = self.read_string()?.to_string();
            map.insert(k, v);
        }
        Ok(map)
    }

    /// `inet`: a 1-byte address length, the address itself, then a 4-byte
    /// port (§4.1, used by EVENT bodies and `system.peers`-style results).
    pub fn read_inet(&mut self) -> Result<SocketAddr> {
        let len = self.read_u8()?;
        let addr = self.take(len as usize)?;
        let ip = match addr.len() {
            4 => IpAddr::V4(Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3])),
            16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(addr);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            _ => return Err(malformed("invalid inet address length")),
        };
        let port = self.read_int()?;
        if !(0..=u16::MAX as i32).contains(&port) {
            return Err(malformed("inet port out of range"));
        }
        Ok(SocketAddr::new(ip, port as u16))
    }

    /// `customPayload`: 2-byte count of key/`bytes` pairs (§4.1).
    pub fn read_custom_payload(&mut self) -> Result<HashMap<String, Vec<u8>>> {
        let count = self.read_short()?;
        let mut map = HashMap::with_capacity(count as usize);
        for _ in 0..count {
            let k = self.read_string()?.to_string();
            let v = self.read_bytes()?.unwrap_or(&[]).to_vec();
            map.insert(k, v);
        }
        Ok(map)
    }
}

/// `bytes` write value, carrying the null/unset distinction (§4.1).
#[derive(Debug, Clone, Copy)]
pub enum BytesValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn write_short(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_int(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_long(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_be_bytes());
}

pub fn write_bytes(out: &mut Vec<u8>, value: BytesValue<'_>) {
    match value {
        BytesValue::Null => write_int(out, BYTES_NULL_LEN),
        BytesValue::Unset => write_int(out, BYTES_UNSET_LEN),
        BytesValue::Value(bytes) => {
            write_int(out, bytes.len() as i32);
            out.extend_from_slice(bytes);
        }
    }
}

pub fn write_short_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_short(out, bytes.len() as u16);
    out.extend_from_slice(bytes);
}

pub fn write_string(out: &mut Vec<u8>, s: &str) {
    write_short_bytes(out, s.as_bytes());
}

pub fn write_long_string(out: &mut Vec<u8>, s: &str) {
    write_int(out, s.len() as i32);
    out.extend_from_slice(s.as_bytes());
}

pub fn write_string_list<S: AsRef<str>>(out: &mut Vec<u8>, items: &[S]) {
    write_short(out, items.len() as u16);
    for item in items {
        write_string(out, item.as_ref());
    }
}

pub fn write_string_map<K: AsRef<str>, V: AsRef<str>>(out: &mut Vec<u8>, map: &[(K, V)]) {
    write_short(out, map.len() as u16);
    for (k, v) in map {
        write_string(out, k.as_ref());
        write_string(out, v.as_ref());
    }
}

pub fn write_custom_payload(out: &mut Vec<u8>, payload: &HashMap<String, Vec<u8>>) {
    write_short(out, payload.len() as u16);
    for (k, v) in payload {
        write_string(out, k);
        write_bytes(out, BytesValue::Value(v));
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "SELECT 1");
        let mut r = FrameReader::new(&buf);
        assert_eq!(r.read_string().unwrap(), "SELECT 1");
    }

    #[test]
    fn bytes_null_and_unset_are_distinct() {
        let mut buf = Vec::new();
        write_bytes(&mut buf, BytesValue::Null);
        write_bytes(&mut buf, BytesValue::Unset);
        write_bytes(&mut buf, BytesValue::Value(b"hi"));
        let mut r = FrameReader::new(&buf);
        assert_eq!(r.read_bytes().unwrap(), None);
        assert_eq!(r.read_bytes().unwrap(), None);
        assert_eq!(r.read_bytes().unwrap(), Some(&b"hi"[..]));
    }

    #[test]
    fn rejects_truncated_body() {
        let buf = vec![0u8, 5]; // claims a 5-length short-bytes but has none
        let mut r = FrameReader::new(&buf);
        assert!(r.read_string().is_err());
    }

    #[test]
    fn string_map_round_trips() {
        let mut buf = Vec::new();
        write_string_map(&mut buf, &[("CQL_VERSION", "3.0.0"), ("DRIVER_NAME", "core")]);
        let mut r = FrameReader::new(&buf);
        let map = r.read_string_map().unwrap();
        assert_eq!(map.get("CQL_VERSION").map(String::as_str), Some("3.0.0"));
        assert_eq!(map.get("DRIVER_NAME").map(String::as_str), Some("core"));
    }
}
