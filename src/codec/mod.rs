//! # Binary Codec Module
//!
//! Type-tagged, length-prefixed encoding of column values, zlib-compressed
//! column blocks, and the columnar table-file container.
//!
//! # On-disk layout
//!
//! ```text
//! value:        [null_flag u8][payload]
//! column block: [compressed u8]([orig_size u32 LE][zlib bytes] | [count u32 LE][value×count])
//! file header:  [magic "COLDB"][version u8][name_len u16][name]
//!               [col_count u32][row_count u64][column_defs…]
//! column def:   [name_len u16][name][type_tag u8][flags u8][default_len u32][default]
//! table file:   [checksum 8B = SHA-256(rest) truncated][header][{block_len u32}{block}]×col_count
//! ```
//!
//! Fixed-width payloads are little-endian. `STRING`/`BYTES`/`JSON`/`ARRAY`
//! payloads carry a `u32` length prefix; `JSON`/`ARRAY` are serialized as
//! UTF-8 JSON text. `TIMESTAMP` is an `i64` of milliseconds since the epoch.
//! Column-def flags: bit0 nullable, bit1 indexed, bit2 compressed.
//!
//! # Guarantees
//!
//! - **Integrity:** the read path rejects files whose magic or truncated
//!   SHA-256 checksum mismatch.
//! - **Compression is opportunistic:** a column block is only stored
//!   compressed when zlib actually shrinks it.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::schema::{Column, DataType, SchemaError, Value};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Magic prefix of the columnar table file.
pub const TABLE_MAGIC: &[u8; 5] = b"COLDB";

/// Current table-file format version.
pub const TABLE_VERSION: u8 = 1;

/// Truncated SHA-256 length prepended to a table file.
pub const CHECKSUM_LEN: usize = 8;

/// Blocks smaller than this are never worth compressing.
const COMPRESS_MIN_LEN: usize = 100;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by encode/decode operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O error (compression streams).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Magic or checksum mismatch, or a malformed structure.
    #[error("Integrity failure: {0}")]
    Integrity(String),

    /// Buffer ended before a complete structure could be read.
    #[error("Unexpected end of buffer at offset {0}")]
    UnexpectedEof(usize),

    /// Value does not fit the declared column type.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// JSON (de)serialization failure for JSON/ARRAY payloads.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Bounds-checked little-endian reader over a byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

// ------------------------------------------------------------------------------------------------
// Compression helpers
// ------------------------------------------------------------------------------------------------

/// zlib-compresses `data` at the default level.
pub fn zlib_compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inverse of [`zlib_compress`].
pub fn zlib_decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Value encoding
// ------------------------------------------------------------------------------------------------

/// Encodes a single value as `[null_flag][payload]` for the given type.
pub fn encode_value(value: &Value, data_type: DataType) -> Result<Vec<u8>, CodecError> {
    if value.is_null() {
        return Ok(vec![1]);
    }
    let mut out = vec![0u8];
    match data_type {
        DataType::Int32 => {
            let v = value.as_i64().and_then(|v| i32::try_from(v).ok()).ok_or_else(|| {
                CodecError::Schema(SchemaError::TypeMismatch {
                    expected: data_type,
                    value: value.display_string(),
                })
            })?;
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataType::Int64 | DataType::Timestamp => {
            let v = value.as_i64().ok_or_else(|| {
                CodecError::Schema(SchemaError::TypeMismatch {
                    expected: data_type,
                    value: value.display_string(),
                })
            })?;
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataType::Float32 => {
            let v = value.as_f64().ok_or_else(|| {
                CodecError::Schema(SchemaError::TypeMismatch {
                    expected: data_type,
                    value: value.display_string(),
                })
            })? as f32;
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataType::Float64 => {
            let v = value.as_f64().ok_or_else(|| {
                CodecError::Schema(SchemaError::TypeMismatch {
                    expected: data_type,
                    value: value.display_string(),
                })
            })?;
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataType::Bool => {
            let v = matches!(value, Value::Bool(true));
            out.push(u8::from(v));
        }
        DataType::String => {
            let s = match value {
                Value::Str(s) => s.clone(),
                other => other.display_string(),
            };
            out.extend_from_slice(&(s.len() as u32).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        DataType::Bytes => {
            let b = match value {
                Value::Bytes(b) => b.as_slice(),
                Value::Str(s) => s.as_bytes(),
                other => {
                    return Err(CodecError::Schema(SchemaError::TypeMismatch {
                        expected: data_type,
                        value: other.display_string(),
                    }));
                }
            };
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        DataType::Json | DataType::Array => {
            let text = serde_json::to_string(&value.to_json())?;
            out.extend_from_slice(&(text.len() as u32).to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        DataType::Null => {}
    }
    Ok(out)
}

/// Decodes one value at the cursor position.
pub fn decode_value(cursor: &mut Cursor<'_>, data_type: DataType) -> Result<Value, CodecError> {
    if cursor.u8()? == 1 {
        return Ok(Value::Null);
    }
    Ok(match data_type {
        DataType::Int32 => Value::Int32(cursor.i32()?),
        DataType::Int64 => Value::Int64(cursor.i64()?),
        DataType::Float32 => Value::Float32(cursor.f32()?),
        DataType::Float64 => Value::Float64(cursor.f64()?),
        DataType::Bool => Value::Bool(cursor.u8()? != 0),
        DataType::Timestamp => Value::Timestamp(cursor.i64()?),
        DataType::String => {
            let len = cursor.u32()? as usize;
            let bytes = cursor.take(len)?;
            Value::Str(String::from_utf8_lossy(bytes).into_owned())
        }
        DataType::Bytes => {
            let len = cursor.u32()? as usize;
            Value::Bytes(cursor.take(len)?.to_vec())
        }
        DataType::Json => {
            let len = cursor.u32()? as usize;
            Value::Json(serde_json::from_slice(cursor.take(len)?)?)
        }
        DataType::Array => {
            let len = cursor.u32()? as usize;
            let json: serde_json::Value = serde_json::from_slice(cursor.take(len)?)?;
            match Value::from_json_untyped(&json) {
                Value::Array(items) => Value::Array(items),
                other => Value::Array(vec![other]),
            }
        }
        DataType::Null => Value::Null,
    })
}

// ------------------------------------------------------------------------------------------------
// Column blocks
// ------------------------------------------------------------------------------------------------

/// Encodes a full column of values into one block, compressing when it pays.
pub fn encode_column(
    values: &[Value],
    data_type: DataType,
    compress: bool,
) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::with_capacity(values.len() * 8 + 4);
    raw.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for value in values {
        raw.extend_from_slice(&encode_value(value, data_type)?);
    }

    if compress && raw.len() > COMPRESS_MIN_LEN {
        let compressed = zlib_compress(&raw)?;
        if compressed.len() < raw.len() {
            let mut out = Vec::with_capacity(compressed.len() + 5);
            out.push(1);
            out.extend_from_slice(&(raw.len() as u32).to_le_bytes());
            out.extend_from_slice(&compressed);
            return Ok(out);
        }
    }

    let mut out = Vec::with_capacity(raw.len() + 1);
    out.push(0);
    out.extend_from_slice(&raw);
    Ok(out)
}

fn column_plaintext(block: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut cursor = Cursor::new(block);
    match cursor.u8()? {
        1 => {
            let original_size = cursor.u32()? as usize;
            let plain = zlib_decompress(cursor.take(cursor.remaining())?)?;
            if plain.len() != original_size {
                return Err(CodecError::Integrity(format!(
                    "column block inflated to {} bytes, expected {original_size}",
                    plain.len()
                )));
            }
            Ok(plain)
        }
        0 => Ok(cursor.take(cursor.remaining())?.to_vec()),
        other => Err(CodecError::Integrity(format!(
            "bad column compression flag {other}"
        ))),
    }
}

/// Decodes every value of a column block.
pub fn decode_column(block: &[u8], data_type: DataType) -> Result<Vec<Value>, CodecError> {
    let plain = column_plaintext(block)?;
    let mut cursor = Cursor::new(&plain);
    let count = cursor.u32()? as usize;
    let mut values = Vec::with_capacity(count);
    for _ in 0..count {
        values.push(decode_value(&mut cursor, data_type)?);
    }
    Ok(values)
}

/// Decodes only the value at row position `index`, skipping everything before
/// it. Point lookups use this to avoid materializing whole columns.
pub fn decode_column_value_at(
    block: &[u8],
    data_type: DataType,
    index: usize,
) -> Result<Option<Value>, CodecError> {
    let plain = column_plaintext(block)?;
    let mut cursor = Cursor::new(&plain);
    let count = cursor.u32()? as usize;
    if index >= count {
        return Ok(None);
    }
    for _ in 0..index {
        skip_value(&mut cursor, data_type)?;
    }
    Ok(Some(decode_value(&mut cursor, data_type)?))
}

fn skip_value(cursor: &mut Cursor<'_>, data_type: DataType) -> Result<(), CodecError> {
    if cursor.u8()? == 1 {
        return Ok(());
    }
    let fixed = match data_type {
        DataType::Int32 | DataType::Float32 => 4,
        DataType::Int64 | DataType::Float64 | DataType::Timestamp => 8,
        DataType::Bool => 1,
        DataType::Null => 0,
        DataType::String | DataType::Bytes | DataType::Json | DataType::Array => {
            let len = cursor.u32()? as usize;
            cursor.take(len)?;
            return Ok(());
        }
    };
    cursor.take(fixed)?;
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// File header
// ------------------------------------------------------------------------------------------------

const FLAG_NULLABLE: u8 = 1 << 0;
const FLAG_INDEXED: u8 = 1 << 1;
const FLAG_COMPRESSED: u8 = 1 << 2;

/// Encodes the table-file header (without checksum).
pub fn encode_header(
    table_name: &str,
    columns: &[Column],
    row_count: u64,
) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    out.extend_from_slice(TABLE_MAGIC);
    out.push(TABLE_VERSION);
    out.extend_from_slice(&(table_name.len() as u16).to_le_bytes());
    out.extend_from_slice(table_name.as_bytes());
    out.extend_from_slice(&(columns.len() as u32).to_le_bytes());
    out.extend_from_slice(&row_count.to_le_bytes());
    for col in columns {
        out.extend_from_slice(&(col.name.len() as u16).to_le_bytes());
        out.extend_from_slice(col.name.as_bytes());
        out.push(col.data_type.tag());
        let mut flags = 0u8;
        if col.nullable {
            flags |= FLAG_NULLABLE;
        }
        if col.indexed {
            flags |= FLAG_INDEXED;
        }
        if col.compressed {
            flags |= FLAG_COMPRESSED;
        }
        out.push(flags);
        match &col.default {
            Some(default) if !default.is_null() => {
                let bytes = encode_value(default, col.data_type)?;
                out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
                out.extend_from_slice(&bytes);
            }
            _ => out.extend_from_slice(&0u32.to_le_bytes()),
        }
    }
    Ok(out)
}

/// Decoded table-file header.
pub struct FileHeader {
    pub table_name: String,
    pub columns: Vec<Column>,
    pub row_count: u64,
    /// Byte length of the header within the file body.
    pub header_len: usize,
}

/// Decodes the table-file header from the start of `data`.
pub fn decode_header(data: &[u8]) -> Result<FileHeader, CodecError> {
    let mut cursor = Cursor::new(data);
    let magic = cursor.take(TABLE_MAGIC.len())?;
    if magic != TABLE_MAGIC {
        return Err(CodecError::Integrity("bad table file magic".into()));
    }
    let version = cursor.u8()?;
    if version != TABLE_VERSION {
        return Err(CodecError::Integrity(format!(
            "unsupported table file version {version}"
        )));
    }
    let name_len = cursor.u16()? as usize;
    let table_name = String::from_utf8_lossy(cursor.take(name_len)?).into_owned();
    let col_count = cursor.u32()? as usize;
    let row_count = cursor.u64()?;

    let mut columns = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        let len = cursor.u16()? as usize;
        let name = String::from_utf8_lossy(cursor.take(len)?).into_owned();
        let data_type = DataType::from_tag(cursor.u8()?)?;
        let flags = cursor.u8()?;
        let default_len = cursor.u32()? as usize;
        let default = if default_len > 0 {
            let bytes = cursor.take(default_len)?;
            Some(decode_value(&mut Cursor::new(bytes), data_type)?)
        } else {
            None
        };
        let mut col = Column::new(name, data_type);
        col.nullable = flags & FLAG_NULLABLE != 0;
        col.indexed = flags & FLAG_INDEXED != 0;
        col.compressed = flags & FLAG_COMPRESSED != 0;
        col.default = default;
        columns.push(col);
    }

    Ok(FileHeader {
        table_name,
        columns,
        row_count,
        header_len: cursor.position(),
    })
}

// ------------------------------------------------------------------------------------------------
// Whole-file assembly
// ------------------------------------------------------------------------------------------------

/// Truncated SHA-256 checksum over a file body.
pub fn compute_checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&digest[..CHECKSUM_LEN]);
    out
}

/// Assembles a complete table file: checksum, header, then one
/// length-prefixed block per column in schema order.
pub fn encode_table_file(
    table_name: &str,
    columns: &[Column],
    data: &[Vec<Value>],
    row_count: u64,
) -> Result<Vec<u8>, CodecError> {
    let mut body = encode_header(table_name, columns, row_count)?;
    for (col, values) in columns.iter().zip(data.iter()) {
        let block = encode_column(values, col.data_type, col.compressed)?;
        body.extend_from_slice(&(block.len() as u32).to_le_bytes());
        body.extend_from_slice(&block);
    }
    let mut out = Vec::with_capacity(body.len() + CHECKSUM_LEN);
    out.extend_from_slice(&compute_checksum(&body));
    out.extend_from_slice(&body);
    Ok(out)
}

/// Fully-decoded table file.
#[derive(Debug)]
pub struct TableFile {
    pub table_name: String,
    pub columns: Vec<Column>,
    pub row_count: u64,
    /// Column-major values in schema order, each inner vec `row_count` long.
    pub data: Vec<Vec<Value>>,
}

/// Verifies checksum and magic, then decodes the header and every column.
pub fn decode_table_file(file: &[u8]) -> Result<TableFile, CodecError> {
    if file.len() < CHECKSUM_LEN {
        return Err(CodecError::UnexpectedEof(file.len()));
    }
    let (stored, body) = file.split_at(CHECKSUM_LEN);
    if stored != compute_checksum(body) {
        return Err(CodecError::Integrity("table file checksum mismatch".into()));
    }

    let header = decode_header(body)?;
    let mut cursor = Cursor::new(&body[header.header_len..]);
    let mut data = Vec::with_capacity(header.columns.len());
    for col in &header.columns {
        let block_len = cursor.u32()? as usize;
        let block = cursor.take(block_len)?;
        let values = decode_column(block, col.data_type)?;
        if values.len() as u64 != header.row_count {
            return Err(CodecError::Integrity(format!(
                "column '{}' has {} values, expected {}",
                col.name,
                values.len(),
                header.row_count
            )));
        }
        data.push(values);
    }

    Ok(TableFile {
        table_name: header.table_name,
        columns: header.columns,
        row_count: header.row_count,
        data,
    })
}
