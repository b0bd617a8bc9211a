//! Low-level reading and writing of HashLink bytecode
//!
//! Every integer field of a module goes through the variable-length integer
//! codec implemented here. Pools of strings and byte blocks share a common
//! "total size, payload, per-entry trailer" layout which is also handled here.

use thiserror::Error;

/// Largest magnitude representable by the 4-byte varint tier (exclusive)
pub const VARINT_LIMIT: u32 = 0x2000_0000;

/// Errors that can occur while decoding bytecode
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Unexpected end of bytecode stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),

    /// A count or index that must be non-negative was negative
    #[error("Negative count or index {value} at offset {offset}")]
    NegativeIndex {
        /// Decoded value
        value: i32,
        /// Offset of the varint
        offset: usize,
    },

    /// Pool header declares a negative total size
    #[error("Invalid pool size {0} at offset {1}")]
    InvalidPoolSize(i32, usize),

    /// A string or byte block lies outside its pool payload
    #[error("Pool entry {index} out of bounds (start {start}, end {end}, size {size})")]
    PoolEntryOutOfBounds {
        /// Entry index
        index: usize,
        /// Start of the entry inside the payload
        start: usize,
        /// End of the entry inside the payload
        end: usize,
        /// Payload size
        size: usize,
    },

    /// Unknown type kind tag
    #[error("Unknown type kind {0} at offset {1}")]
    UnknownTypeKind(u8, usize),

    /// Unknown opcode tag
    #[error("Invalid opcode {0} at offset {1}")]
    InvalidOpcode(i32, usize),

    /// The generic decode path reached the arity entry that only the switch
    /// layout may use
    #[error("Corrupted arity table entry for opcode {0}")]
    CorruptedArity(u8),

    /// An element count larger than the rest of the input
    #[error("Count {count} at offset {offset} exceeds the {remaining} bytes left")]
    CountExceedsInput {
        /// Decoded count
        count: usize,
        /// Bytes left after the count
        remaining: usize,
        /// Offset of the varint
        offset: usize,
    },

    /// The debug position stream produced more entries than instructions
    #[error("Debug positions overrun: expected {expected}, decoded {decoded}")]
    DebugOverrun {
        /// Instruction count of the function
        expected: usize,
        /// Positions decoded so far
        decoded: usize,
    },
}

/// Errors that can occur while encoding bytecode
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Magnitude does not fit the 29-bit varint range
    #[error("Value {0} out of range for a variable-length integer")]
    VarIntOutOfRange(i64),

    /// A pool payload does not fit its 4-byte size header
    #[error("Pool payload of {0} bytes is too large")]
    PoolTooLarge(usize),

    /// Source file index cannot be represented in a file-change record
    #[error("Debug file index {0} out of range")]
    DebugFileOutOfRange(i32),

    /// Line cannot be represented in an absolute-line record
    #[error("Debug line {0} out of range")]
    DebugLineOutOfRange(i32),

    /// An instruction carries fewer arguments than its opcode requires
    #[error("Opcode {opcode} needs at least {expected} arguments, got {actual}")]
    MissingArguments {
        /// Opcode name
        opcode: &'static str,
        /// Minimum argument count
        expected: usize,
        /// Argument count present
        actual: usize,
    },

    /// The generic encode path reached the arity entry reserved for switch
    #[error("Corrupted arity table entry for opcode {0}")]
    CorruptedArity(u8),
}

/// Bytecode writer
///
/// Appends little-endian scalars, varints and pools to a growable buffer.
pub struct BytecodeWriter {
    /// Internal buffer containing the bytecode
    pub(crate) buffer: Vec<u8>,
}

impl BytecodeWriter {
    /// Create a new bytecode writer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new bytecode writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Get the current bytecode buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the bytecode buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset (length of bytecode)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit raw bytes
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a 32-bit signed integer (little-endian)
    pub fn emit_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a 64-bit float (little-endian)
    pub fn emit_f64(&mut self, value: f64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    // ===== Variable-Length Integers =====

    /// Emit a signed variable-length integer
    ///
    /// - `0..=0x7F`: one byte, top bit clear
    /// - magnitude `< 0x2000`: two bytes, first byte `10s` + 5 high bits
    /// - magnitude `< 0x20000000`: four bytes, first byte `11s` + 5 high bits,
    ///   remaining 24 bits big-endian
    pub fn emit_varint(&mut self, value: i32) -> Result<(), EncodeError> {
        if (0..0x80).contains(&value) {
            self.emit_u8(value as u8);
            return Ok(());
        }

        let magnitude = value.unsigned_abs();
        let negative = value < 0;

        if magnitude < 0x2000 {
            let tag = if negative { 0xA0 } else { 0x80 };
            self.emit_u8((magnitude >> 8) as u8 | tag);
            self.emit_u8(magnitude as u8);
        } else if magnitude < VARINT_LIMIT {
            let tag = if negative { 0xE0 } else { 0xC0 };
            self.emit_u8((magnitude >> 24) as u8 | tag);
            self.emit_u8((magnitude >> 16) as u8);
            self.emit_u8((magnitude >> 8) as u8);
            self.emit_u8(magnitude as u8);
        } else {
            return Err(EncodeError::VarIntOutOfRange(value as i64));
        }

        Ok(())
    }

    /// Emit a pool count or index as a varint
    pub fn emit_index(&mut self, value: usize) -> Result<(), EncodeError> {
        let value = i32::try_from(value).map_err(|_| EncodeError::VarIntOutOfRange(value as i64))?;
        self.emit_varint(value)
    }

    // ===== Pools =====

    /// Emit a string pool
    ///
    /// Layout: i32 total size (each string plus its NUL), NUL-terminated
    /// UTF-8 strings, then one length varint per string.
    pub fn emit_string_pool(&mut self, strings: &[String]) -> Result<(), EncodeError> {
        let total: usize = strings.iter().map(|s| s.len() + 1).sum();
        self.emit_pool_size(total)?;

        for s in strings {
            self.emit_bytes(s.as_bytes());
            self.emit_u8(0);
        }
        for s in strings {
            self.emit_index(s.len())?;
        }
        Ok(())
    }

    /// Emit a byte-block pool
    ///
    /// Layout: i32 total size, concatenated blocks, then the start offset of
    /// every block as a varint.
    pub fn emit_bytes_pool(&mut self, blocks: &[Vec<u8>]) -> Result<(), EncodeError> {
        let total: usize = blocks.iter().map(Vec::len).sum();
        self.emit_pool_size(total)?;

        for block in blocks {
            self.emit_bytes(block);
        }

        let mut position = 0;
        for block in blocks {
            self.emit_index(position)?;
            position += block.len();
        }
        Ok(())
    }

    fn emit_pool_size(&mut self, total: usize) -> Result<(), EncodeError> {
        let total = i32::try_from(total).map_err(|_| EncodeError::PoolTooLarge(total))?;
        self.emit_i32(total);
        Ok(())
    }
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode reader
///
/// Every read is bounds-checked and reports the offset it failed at.
pub struct BytecodeReader<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> BytecodeReader<'a> {
    /// Create a new bytecode reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            position: 0,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    // ===== Basic Reading =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        if self.position >= self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let value = self.buffer[self.position];
        self.position += 1;
        Ok(value)
    }

    /// Borrow the next `count` bytes
    pub fn read_slice(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(count)
            .filter(|end| *end <= self.buffer.len())
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        self.read_slice(count).map(<[u8]>::to_vec)
    }

    /// Read a 32-bit signed integer (little-endian)
    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        let bytes = self.read_slice(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read a 64-bit float (little-endian)
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        let bytes = self.read_slice(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_le_bytes(raw))
    }

    // ===== Variable-Length Integers =====

    /// Read a signed variable-length integer
    pub fn read_varint(&mut self) -> Result<i32, DecodeError> {
        let first = self.read_u8()? as i32;

        if first & 0x80 == 0 {
            return Ok(first & 0x7F);
        }

        let magnitude = if first & 0x40 == 0 {
            ((first & 0x1F) << 8) | self.read_u8()? as i32
        } else {
            let b1 = self.read_u8()? as i32;
            let b2 = self.read_u8()? as i32;
            let b3 = self.read_u8()? as i32;
            ((first & 0x1F) << 24) | (b1 << 16) | (b2 << 8) | b3
        };

        if first & 0x20 == 0 {
            Ok(magnitude)
        } else {
            Ok(-magnitude)
        }
    }

    /// Read a varint that must be a non-negative count or index
    pub fn read_index(&mut self) -> Result<usize, DecodeError> {
        let offset = self.position;
        let value = self.read_varint()?;
        usize::try_from(value).map_err(|_| DecodeError::NegativeIndex { value, offset })
    }

    /// Read an element count
    ///
    /// Every element takes at least one byte, so a count larger than the
    /// rest of the input is rejected before anything is allocated for it.
    pub fn read_count(&mut self) -> Result<usize, DecodeError> {
        let offset = self.position;
        let count = self.read_index()?;
        let remaining = self.remaining();
        if count > remaining {
            return Err(DecodeError::CountExceedsInput {
                count,
                remaining,
                offset,
            });
        }
        Ok(count)
    }

    // ===== Pools =====

    fn read_pool_payload(&mut self) -> Result<&'a [u8], DecodeError> {
        let offset = self.position;
        let size = self.read_i32()?;
        let size = usize::try_from(size).map_err(|_| DecodeError::InvalidPoolSize(size, offset))?;
        self.read_slice(size)
    }

    /// Read a string pool of `count` entries
    pub fn read_string_pool(&mut self, count: usize) -> Result<Vec<String>, DecodeError> {
        let payload_start = self.position + 4;
        let payload = self.read_pool_payload()?;
        let mut strings = Vec::with_capacity(count);
        let mut offset = 0;

        for index in 0..count {
            let length = self.read_index()?;
            let end = offset + length;
            if end > payload.len() {
                return Err(DecodeError::PoolEntryOutOfBounds {
                    index,
                    start: offset,
                    end,
                    size: payload.len(),
                });
            }

            let s = std::str::from_utf8(&payload[offset..end])
                .map_err(|_| DecodeError::InvalidUtf8(payload_start + offset))?;
            strings.push(s.to_string());
            offset = end + 1;
        }

        Ok(strings)
    }

    /// Read a byte-block pool of `count` entries
    pub fn read_bytes_pool(&mut self, count: usize) -> Result<Vec<Vec<u8>>, DecodeError> {
        let payload = self.read_pool_payload()?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut starts = Vec::with_capacity(count);
        for _ in 0..count {
            starts.push(self.read_index()?);
        }

        let mut blocks = Vec::with_capacity(count);
        for (index, &start) in starts.iter().enumerate() {
            let end = starts.get(index + 1).copied().unwrap_or(payload.len());
            if start > end || end > payload.len() {
                return Err(DecodeError::PoolEntryOutOfBounds {
                    index,
                    start,
                    end,
                    size: payload.len(),
                });
            }
            blocks.push(payload[start..end].to_vec());
        }

        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_varint(value: i32) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();
        writer.emit_varint(value).unwrap();
        writer.into_bytes()
    }

    fn decode_varint(bytes: &[u8]) -> i32 {
        BytecodeReader::new(bytes).read_varint().unwrap()
    }

    #[test]
    fn test_varint_tiers() {
        assert_eq!(encode_varint(0), vec![0x00]);
        assert_eq!(encode_varint(0x7F), vec![0x7F]);
        assert_eq!(encode_varint(0x80), vec![0x80, 0x80]);
        assert_eq!(encode_varint(0x1FFF), vec![0x9F, 0xFF]);
        assert_eq!(encode_varint(0x2000), vec![0xC0, 0x00, 0x20, 0x00]);
        assert_eq!(encode_varint(0x1FFF_FFFF), vec![0xDF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_varint_negative() {
        assert_eq!(encode_varint(-1), vec![0xA0, 0x01]);
        assert_eq!(encode_varint(-0x1FFF), vec![0xBF, 0xFF]);
        assert_eq!(encode_varint(-0x2000), vec![0xE0, 0x00, 0x20, 0x00]);
        assert_eq!(decode_varint(&[0xA0, 0x01]), -1);
        assert_eq!(decode_varint(&[0xE0, 0x00, 0x20, 0x00]), -0x2000);
    }

    #[test]
    fn test_varint_boundaries_roundtrip() {
        for value in [
            -0x1FFF_FFFF,
            -0x2001,
            -0x80,
            -0x7F,
            -1,
            1,
            0x7F,
            0x80,
            0x1FFF,
            0x2000,
            0x1234_5678,
            0x1FFF_FFFF,
        ] {
            assert_eq!(decode_varint(&encode_varint(value)), value, "value {}", value);
        }
    }

    #[test]
    fn test_varint_out_of_range() {
        let mut writer = BytecodeWriter::new();
        assert!(matches!(
            writer.emit_varint(0x2000_0000),
            Err(EncodeError::VarIntOutOfRange(_))
        ));
        assert!(writer.emit_varint(-0x2000_0000).is_err());
        assert!(writer.emit_varint(i32::MIN).is_err());
        assert!(writer.buffer().is_empty());
    }

    #[test]
    fn test_read_index_rejects_negative() {
        let bytes = encode_varint(-5);
        let result = BytecodeReader::new(&bytes).read_index();
        assert!(matches!(
            result,
            Err(DecodeError::NegativeIndex { value: -5, offset: 0 })
        ));
    }

    #[test]
    fn test_read_count_bounded_by_input() {
        let mut reader = BytecodeReader::new(&[3, 0, 0, 0]);
        assert_eq!(reader.read_count().unwrap(), 3);

        let mut reader = BytecodeReader::new(&[0xDF, 0xFF, 0xFF, 0xFF, 0]);
        match reader.read_count() {
            Err(DecodeError::CountExceedsInput {
                count,
                remaining,
                offset,
            }) => {
                assert_eq!(count, 0x1FFF_FFFF);
                assert_eq!(remaining, 1);
                assert_eq!(offset, 0);
            }
            other => panic!("expected oversized count, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_bounds_checking() {
        let bytes = vec![0xC0, 0x01];
        let mut reader = BytecodeReader::new(&bytes);
        assert!(matches!(reader.read_varint(), Err(DecodeError::UnexpectedEnd(_))));

        let mut reader = BytecodeReader::new(&[0x01, 0x02]);
        assert!(reader.read_i32().is_err());
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_reader_primitives() {
        let mut writer = BytecodeWriter::new();
        writer.emit_u8(0x42);
        writer.emit_i32(-42);
        writer.emit_f64(2.5);

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);

        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_i32().unwrap(), -42);
        assert_eq!(reader.read_f64().unwrap(), 2.5);
        assert!(!reader.has_more());
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_string_pool_layout() {
        let strings = vec!["ab".to_string(), String::new(), "c".to_string()];
        let mut writer = BytecodeWriter::new();
        writer.emit_string_pool(&strings).unwrap();

        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..4], &6i32.to_le_bytes());
        assert_eq!(&bytes[4..10], b"ab\0\0c\0");
        assert_eq!(&bytes[10..], &[2, 0, 1]);
    }

    #[test]
    fn test_string_pool_multibyte() {
        let strings = vec![
            "héllo".to_string(),
            String::new(),
            "日本語".to_string(),
            "🦀 crab".to_string(),
        ];
        let mut writer = BytecodeWriter::new();
        writer.emit_string_pool(&strings).unwrap();

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        assert_eq!(reader.read_string_pool(strings.len()).unwrap(), strings);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_string_pool_out_of_bounds() {
        let mut writer = BytecodeWriter::new();
        writer.emit_i32(2);
        writer.emit_bytes(b"a\0");
        writer.emit_varint(5).unwrap();

        let bytes = writer.into_bytes();
        let result = BytecodeReader::new(&bytes).read_string_pool(1);
        assert!(matches!(result, Err(DecodeError::PoolEntryOutOfBounds { index: 0, .. })));
    }

    #[test]
    fn test_string_pool_invalid_utf8() {
        let mut writer = BytecodeWriter::new();
        writer.emit_i32(3);
        writer.emit_bytes(&[0xFF, 0xFE, 0x00]);
        writer.emit_varint(2).unwrap();

        let bytes = writer.into_bytes();
        let result = BytecodeReader::new(&bytes).read_string_pool(1);
        assert!(matches!(result, Err(DecodeError::InvalidUtf8(4))));
    }

    #[test]
    fn test_bytes_pool_layout() {
        let blocks = vec![vec![1, 2, 3], vec![], vec![4]];
        let mut writer = BytecodeWriter::new();
        writer.emit_bytes_pool(&blocks).unwrap();

        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..4], &4i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(&bytes[8..], &[0, 3, 3]);

        let mut reader = BytecodeReader::new(&bytes);
        assert_eq!(reader.read_bytes_pool(3).unwrap(), blocks);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_empty_bytes_pool_has_no_offsets() {
        let mut writer = BytecodeWriter::new();
        writer.emit_bytes_pool(&[]).unwrap();
        writer.emit_u8(0x55);

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        assert!(reader.read_bytes_pool(0).unwrap().is_empty());
        assert_eq!(reader.read_u8().unwrap(), 0x55);
    }
}
