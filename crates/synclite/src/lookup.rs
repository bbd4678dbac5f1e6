//! Canonical byte encoding for parameter lookup tuples and replica ids.
//!
//! The encoding is a persisted index key: equality of encoded bytes must
//! imply equality of logical tuples, and the layout must be stable across
//! platforms and process restarts. The leading version byte exists so the
//! layout can change without corrupting existing indexes.

use crate::error::{Result, SyncError};
use crate::types::RowValue;

const ENCODING_VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_INT: u8 = 0x01;
const TAG_NUMBER: u8 = 0x02;
const TAG_TEXT: u8 = 0x03;
const TAG_BLOB: u8 = 0x04;

/// One primitive element of a lookup tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupValue {
    Null,
    /// Integer (bigint) element; distinct from Number so that `1` and `1.0`
    /// encode differently, matching the evaluator's type model.
    BigInt(i64),
    Number(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<&RowValue> for LookupValue {
    fn from(v: &RowValue) -> Self {
        match v {
            RowValue::Null => LookupValue::Null,
            RowValue::Integer(i) => LookupValue::BigInt(*i),
            RowValue::Real(f) => LookupValue::Number(*f),
            RowValue::Text(s) => LookupValue::Text(s.clone()),
            RowValue::Blob(b) => LookupValue::Blob(b.clone()),
        }
    }
}

/// A canonically-encoded lookup tuple, used as the reverse-index key for
/// parameter queries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Lookup(Vec<u8>);

impl Lookup {
    pub fn from_values(values: &[LookupValue]) -> Lookup {
        Lookup(encode_values(values))
    }

    /// Wrap raw bytes previously produced by `from_values`.
    pub fn from_bytes(bytes: Vec<u8>) -> Lookup {
        Lookup(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Decode back into values. Used for diagnostics; the persisted index
    /// only ever compares encoded bytes.
    pub fn decode(&self) -> Result<Vec<LookupValue>> {
        decode_values(&self.0)
    }
}

/// Encode a tuple of primitive values: version byte, then for each value a
/// tag byte and a fixed or length-prefixed payload (big endian lengths).
pub fn encode_values(values: &[LookupValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 * values.len() + 1);
    out.push(ENCODING_VERSION);
    for value in values {
        match value {
            LookupValue::Null => out.push(TAG_NULL),
            LookupValue::BigInt(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_be_bytes());
            }
            LookupValue::Number(f) => {
                out.push(TAG_NUMBER);
                out.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            LookupValue::Text(s) => {
                out.push(TAG_TEXT);
                out.extend_from_slice(&(s.len() as u32).to_be_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            LookupValue::Blob(b) => {
                out.push(TAG_BLOB);
                out.extend_from_slice(&(b.len() as u32).to_be_bytes());
                out.extend_from_slice(b);
            }
        }
    }
    out
}

pub fn decode_values(bytes: &[u8]) -> Result<Vec<LookupValue>> {
    let mut values = Vec::new();
    if bytes.is_empty() {
        return Err(SyncError::InvalidData("empty lookup encoding".into()));
    }
    if bytes[0] != ENCODING_VERSION {
        return Err(SyncError::InvalidData(format!(
            "unsupported lookup encoding version {}",
            bytes[0]
        )));
    }
    let mut pos = 1;
    while pos < bytes.len() {
        let tag = bytes[pos];
        pos += 1;
        match tag {
            TAG_NULL => values.push(LookupValue::Null),
            TAG_INT => {
                let raw = take(bytes, &mut pos, 8)?;
                values.push(LookupValue::BigInt(i64::from_be_bytes(
                    raw.try_into().unwrap(),
                )));
            }
            TAG_NUMBER => {
                let raw = take(bytes, &mut pos, 8)?;
                values.push(LookupValue::Number(f64::from_bits(u64::from_be_bytes(
                    raw.try_into().unwrap(),
                ))));
            }
            TAG_TEXT => {
                let len = read_len(bytes, &mut pos)?;
                let raw = take(bytes, &mut pos, len)?;
                let s = std::str::from_utf8(raw)
                    .map_err(|_| SyncError::InvalidData("lookup text is not utf-8".into()))?;
                values.push(LookupValue::Text(s.to_string()));
            }
            TAG_BLOB => {
                let len = read_len(bytes, &mut pos)?;
                let raw = take(bytes, &mut pos, len)?;
                values.push(LookupValue::Blob(raw.to_vec()));
            }
            other => {
                return Err(SyncError::InvalidData(format!(
                    "unknown lookup tag 0x{other:02x}"
                )))
            }
        }
    }
    Ok(values)
}

fn read_len(bytes: &[u8], pos: &mut usize) -> Result<usize> {
    let raw = take(bytes, pos, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()) as usize)
}

fn take<'a>(bytes: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
    if *pos + n > bytes.len() {
        return Err(SyncError::InvalidData("truncated lookup encoding".into()));
    }
    let out = &bytes[*pos..*pos + n];
    *pos += n;
    Ok(out)
}

/// Encode the replica-identity values of a row with the same primitive
/// encoding, producing the `replica_id_bytes` half of a source key.
pub fn encode_replica_id(values: &[RowValue]) -> Vec<u8> {
    let tuple: Vec<LookupValue> = values.iter().map(LookupValue::from).collect();
    encode_values(&tuple)
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

pub fn from_hex(s: &str) -> Result<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(SyncError::InvalidData("odd hex length".into()));
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| SyncError::InvalidData("bad hex".into()))
        })
        .collect()
}
