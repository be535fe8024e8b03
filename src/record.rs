//! Record codec: the self-describing row format used as the payload of
//! every table and index cell. A record is a header (its own length as a
//! varint, followed by one serial-type varint per column) followed by the
//! concatenated column bodies. See
//! https://www.sqlite.org/fileformat2.html#record_format.

use crate::serial_type::{self, StorageClass};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error(transparent)]
    Varint(#[from] crate::varint::Error),
    #[error("record body shorter than its header claims")]
    Truncated,
    #[error("serial type {0} is reserved and cannot appear in a stored record")]
    ReservedSerialType(i64),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One column value as decoded from, or about to be encoded into, a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(Vec<u8>),
    Blob(Vec<u8>),
}

impl Value {
    pub fn storage_class(&self) -> StorageClass {
        match self {
            Value::Null => StorageClass::Null,
            Value::Integer(_) => StorageClass::Integral,
            Value::Real(_) => StorageClass::Real,
            Value::Text(_) => StorageClass::Text,
            Value::Blob(_) => StorageClass::Blob,
        }
    }

    /// The narrowest serial type that can represent this value exactly.
    /// Integers pick the smallest of the six signed-integer widths (with
    /// the constant-0/1 codes 8/9 used for those two exact values), mirroring
    /// SQLite's own space-minimizing encoder.
    fn serial_type(&self) -> i64 {
        match self {
            Value::Null => 0,
            Value::Integer(0) => 8,
            Value::Integer(1) => 9,
            Value::Integer(n) => match *n {
                n if n >= i8::MIN as i64 && n <= i8::MAX as i64 => 1,
                n if n >= i16::MIN as i64 && n <= i16::MAX as i64 => 2,
                n if n >= -(1 << 23) && n < (1 << 23) => 3,
                n if n >= i32::MIN as i64 && n <= i32::MAX as i64 => 4,
                n if n >= -(1 << 47) && n < (1 << 47) => 5,
                _ => 6,
            },
            Value::Real(_) => 7,
            Value::Blob(b) => 12 + 2 * b.len() as i64,
            Value::Text(t) => 13 + 2 * t.len() as i64,
        }
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Value::Null | Value::Integer(0) | Value::Integer(1) => {}
            Value::Integer(n) => {
                let st = self.serial_type();
                let width = serial_type::content_size(st);
                let bytes = n.to_be_bytes(); // 8 bytes, big-endian
                out.extend_from_slice(&bytes[8 - width..]);
            }
            Value::Real(f) => out.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Text(t) => out.extend_from_slice(t),
            Value::Blob(b) => out.extend_from_slice(b),
        }
    }

    fn decode_body(serial_type: i64, body: &[u8]) -> Result<Value> {
        if serial_type::is_reserved(serial_type) {
            return Err(Error::ReservedSerialType(serial_type));
        }
        Ok(match serial_type {
            0 => Value::Null,
            8 => Value::Integer(0),
            9 => Value::Integer(1),
            1..=6 => {
                let width = serial_type::content_size(serial_type);
                let sign_extend = body[0] & 0x80 != 0;
                let mut bytes = [if sign_extend { 0xFFu8 } else { 0u8 }; 8];
                bytes[8 - width..].copy_from_slice(body);
                Value::Integer(i64::from_be_bytes(bytes))
            }
            7 => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(body);
                Value::Real(f64::from_bits(u64::from_be_bytes(bytes)))
            }
            x if x >= 12 && x % 2 == 0 => Value::Blob(body.to_vec()),
            x if x >= 13 => Value::Text(body.to_vec()),
            _ => Value::Null,
        })
    }
}

/// Encodes a row's column values into the concatenated
/// `header_length ‖ serial_type*... ‖ body*...` record format. The header
/// length varint is self-referential: its own encoded size is counted in
/// the total it reports.
pub fn encode(values: &[Value]) -> Vec<u8> {
    let mut serial_types = Vec::with_capacity(values.len());
    let mut type_varints = Vec::new();
    for v in values {
        let st = v.serial_type();
        serial_types.push(st);
        let mut tmp = [0u8; crate::varint::MAX_LEN];
        let n = crate::varint::write(&mut tmp, st).unwrap();
        type_varints.extend_from_slice(&tmp[..n]);
    }

    // The header-length varint's own width affects the total, so grow the
    // assumed width until it stabilizes (it can only grow by reaching the
    // next varint-length boundary, which happens at most a couple of times).
    let mut header_len_width = 1usize;
    loop {
        let header_len = header_len_width + type_varints.len();
        let actual_width = crate::varint::encoded_len(header_len as i64);
        if actual_width == header_len_width {
            break;
        }
        header_len_width = actual_width;
    }
    let header_len = header_len_width + type_varints.len();

    let mut out = Vec::new();
    let mut tmp = [0u8; crate::varint::MAX_LEN];
    let n = crate::varint::write(&mut tmp, header_len as i64).unwrap();
    out.extend_from_slice(&tmp[..n]);
    out.extend_from_slice(&type_varints);
    for v in values {
        v.encode_body(&mut out);
    }
    out
}

/// Decodes a record body (as assembled from inline bytes plus any overflow
/// chain) into its column values, in a single pass over the header.
pub fn decode(record: &[u8]) -> Result<Vec<Value>> {
    let (header_len, n) = crate::varint::read(record)?;
    let header_len = header_len as usize;
    if header_len > record.len() {
        return Err(Error::Truncated);
    }
    let mut header_pos = n;
    let mut serial_types = Vec::new();
    while header_pos < header_len {
        let (st, n) = crate::varint::read(&record[header_pos..])?;
        serial_types.push(st);
        header_pos += n;
    }

    let mut values = Vec::with_capacity(serial_types.len());
    let mut body_pos = header_len;
    for st in serial_types {
        let size = serial_type::content_size(st);
        if body_pos + size > record.len() {
            return Err(Error::Truncated);
        }
        values.push(Value::decode_body(st, &record[body_pos..body_pos + size])?);
        body_pos += size;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_types() {
        let values = vec![
            Value::Null,
            Value::Integer(0),
            Value::Integer(1),
            Value::Integer(127),
            Value::Integer(-128),
            Value::Integer(70000),
            Value::Integer(-70000),
            Value::Integer(i64::MAX),
            Value::Integer(i64::MIN),
            Value::Real(3.5),
            Value::Text(b"hello".to_vec()),
            Value::Blob(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        ];
        let encoded = encode(&values);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn empty_row_encodes_to_minimal_header() {
        let encoded = encode(&[]);
        assert_eq!(encoded, vec![1u8]); // header_len=1, no serial types, no body
        assert_eq!(decode(&encoded).unwrap(), vec![]);
    }

    #[test]
    fn chooses_narrowest_integer_serial_type() {
        assert_eq!(Value::Integer(0).serial_type(), 8);
        assert_eq!(Value::Integer(1).serial_type(), 9);
        assert_eq!(Value::Integer(100).serial_type(), 1);
        assert_eq!(Value::Integer(100_000).serial_type(), 3);
        assert_eq!(Value::Integer(i64::MAX).serial_type(), 6);
    }

    #[test]
    fn rejects_reserved_serial_type() {
        // header_len=2, one serial type varint (10), no body
        let record = vec![2u8, 10u8];
        assert_eq!(decode(&record), Err(Error::ReservedSerialType(10)));
    }

    #[test]
    fn text_and_blob_serial_types_encode_length_in_the_type_code() {
        let t = Value::Text(b"abc".to_vec());
        assert_eq!(t.serial_type(), 13 + 2 * 3);
        let b = Value::Blob(vec![1, 2]);
        assert_eq!(b.serial_type(), 12 + 2 * 2);
    }

    #[test]
    fn large_header_crosses_a_varint_length_boundary() {
        // Enough columns that the header-length varint itself needs 2 bytes,
        // exercising the self-referential width-stabilization loop.
        let values: Vec<Value> = (0..100).map(Value::Integer).collect();
        let encoded = encode(&values);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, values);
    }
}
