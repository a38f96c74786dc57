//! Content-addressed node identity.
//!
//! A `NodeHash` collapses two node configurations that differ only in their
//! `"tag"` field to the same identity, so a node reachable via two
//! differently-labeled subscription entries still dedupes into one pool
//! entry.

use std::fmt;
use std::str::FromStr;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// 128-bit content hash of a node's canonicalized configuration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHash([u8; 16]);

/// Returned by `NodeHash::parse_hex` when the input isn't 32 lowercase hex chars.
#[derive(Debug, thiserror::Error)]
#[error("invalid node hash: {0}")]
pub struct ParseHashError(String);

impl NodeHash {
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        NodeHash(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 32 lowercase hex characters, per spec's wire form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn parse_hex(s: &str) -> Result<Self, ParseHashError> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ParseHashError(s.to_string()));
        }
        let mut out = [0u8; 16];
        hex::decode_to_slice(s, &mut out).map_err(|_| ParseHashError(s.to_string()))?;
        Ok(NodeHash(out))
    }

    /// Hash raw node configuration bytes, canonicalizing as JSON (and
    /// dropping `"tag"`) when possible, falling back to hashing the raw
    /// bytes directly when the input doesn't parse as JSON.
    pub fn from_raw_options(raw: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(raw) {
            Ok(mut value) => {
                strip_tag(&mut value);
                let canonical = canonicalize(&value);
                Self::digest(canonical.as_bytes())
            }
            Err(_) => Self::digest(raw),
        }
    }

    fn digest(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let full = hasher.finalize();
        let mut out = [0u8; 16];
        out.copy_from_slice(&full[..16]);
        NodeHash(out)
    }
}

impl fmt::Debug for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHash({})", self.to_hex())
    }
}

impl fmt::Display for NodeHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for NodeHash {
    type Err = ParseHashError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_hex(s)
    }
}

fn strip_tag(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("tag");
    }
}

/// Prints a `Value` with object keys sorted, so field reordering in the
/// source config never changes the hash.
fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}
