//! Per-instruction debug positions
//!
//! Each method carries one `(file, line)` pair per instruction, compressed
//! into a byte stream whose record kind is selected by the low bits of the
//! leading byte:
//!
//! | low bits | bytes | record |
//! |---|---|---|
//! | `xxxxxxx1` | 2 | file change: `((a >> 1) << 8) \| b` |
//! | `ddcccc10` | 1 | `cccc` instructions on the current line, then `line += dd` |
//! | `lllll100` | 1 | `line += lllll`, one instruction |
//! | `lllll000` | 3 | `line = lllll \| b << 5 \| c << 13`, one instruction |

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError, EncodeError};

/// Largest run stored in a single repeat record
const MAX_REPEAT: usize = 15;

/// Exclusive upper bound of a file index
pub const MAX_DEBUG_FILE: i32 = 1 << 15;

/// Exclusive upper bound of an absolute line
pub const MAX_DEBUG_LINE: i32 = 1 << 21;

/// Source position of one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugPosition {
    /// Index into the module's debug file list (`-1` before any file record)
    pub file: i32,
    /// Source line
    pub line: i32,
}

impl DebugPosition {
    /// Create a new position
    pub fn new(file: i32, line: i32) -> Self {
        Self { file, line }
    }
}

/// Encode one position per instruction
pub fn encode_positions(
    writer: &mut BytecodeWriter,
    positions: &[DebugPosition],
) -> Result<(), EncodeError> {
    let mut file = -1;
    let mut line = 0;
    let mut pending = 0;

    for pos in positions {
        if pos.file != file {
            flush_repeat(writer, &mut line, &mut pending, pos.line);
            if !(0..MAX_DEBUG_FILE).contains(&pos.file) {
                return Err(EncodeError::DebugFileOutOfRange(pos.file));
            }
            file = pos.file;
            writer.emit_u8((((pos.file >> 8) << 1) | 1) as u8);
            writer.emit_u8(pos.file as u8);
        }

        if pos.line != line {
            flush_repeat(writer, &mut line, &mut pending, pos.line);
        }

        if pos.line == line {
            pending += 1;
            continue;
        }

        let delta = pos.line - line;
        if delta > 0 && delta < 32 {
            writer.emit_u8(((delta << 3) | 4) as u8);
        } else {
            if !(0..MAX_DEBUG_LINE).contains(&pos.line) {
                return Err(EncodeError::DebugLineOutOfRange(pos.line));
            }
            writer.emit_u8(((pos.line & 0x1F) << 3) as u8);
            writer.emit_u8((pos.line >> 5) as u8);
            writer.emit_u8((pos.line >> 13) as u8);
        }
        line = pos.line;
    }

    let last = line;
    flush_repeat(writer, &mut line, &mut pending, last);
    Ok(())
}

/// Write the pending run, folding a small forward step to `next_line` into
/// the last record.
fn flush_repeat(writer: &mut BytecodeWriter, line: &mut i32, pending: &mut usize, next_line: i32) {
    if *pending == 0 {
        return;
    }

    while *pending > MAX_REPEAT {
        writer.emit_u8(((MAX_REPEAT << 2) | 2) as u8);
        *pending -= MAX_REPEAT;
    }

    let delta = next_line - *line;
    let delta = if delta > 0 && delta < 4 { delta } else { 0 };
    writer.emit_u8(((delta << 6) as usize | (*pending << 2) | 2) as u8);
    *line += delta;
    *pending = 0;
}

/// Decode `count` positions
pub fn decode_positions(
    reader: &mut BytecodeReader<'_>,
    count: usize,
) -> Result<Vec<DebugPosition>, DecodeError> {
    let mut positions = Vec::with_capacity(count);
    let mut file = -1;
    let mut line = 0;

    while positions.len() < count {
        let a = reader.read_u8()? as i32;

        if a & 1 != 0 {
            file = ((a >> 1) << 8) | reader.read_u8()? as i32;
        } else if a & 2 != 0 {
            let repeat = ((a >> 2) & 15) as usize;
            if positions.len() + repeat > count {
                return Err(DecodeError::DebugOverrun {
                    expected: count,
                    decoded: positions.len() + repeat,
                });
            }
            positions.extend(std::iter::repeat(DebugPosition::new(file, line)).take(repeat));
            line += a >> 6;
        } else if a & 4 != 0 {
            line += a >> 3;
            positions.push(DebugPosition::new(file, line));
        } else {
            let b = reader.read_u8()? as i32;
            let c = reader.read_u8()? as i32;
            line = (a >> 3) | (b << 5) | (c << 13);
            positions.push(DebugPosition::new(file, line));
        }
    }

    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(positions: &[DebugPosition]) -> Vec<u8> {
        let mut writer = BytecodeWriter::new();
        encode_positions(&mut writer, positions).unwrap();
        writer.into_bytes()
    }

    fn roundtrip(positions: &[DebugPosition]) {
        let bytes = encode(positions);
        let mut reader = BytecodeReader::new(&bytes);
        let decoded = decode_positions(&mut reader, positions.len()).unwrap();
        assert_eq!(decoded, positions);
        assert!(!reader.has_more(), "trailing debug bytes");
    }

    fn at(file: i32, lines: &[i32]) -> Vec<DebugPosition> {
        lines.iter().map(|&line| DebugPosition::new(file, line)).collect()
    }

    #[test]
    fn test_placeholder_positions() {
        // Every instruction at file 0, line 0: one file record and one run
        let bytes = encode(&at(0, &[0, 0, 0]));
        assert_eq!(bytes, vec![0x01, 0x00, (3 << 2) | 2]);
        roundtrip(&at(0, &[0, 0, 0]));
    }

    #[test]
    fn test_small_delta_step() {
        let bytes = encode(&at(0, &[10]));
        assert_eq!(bytes, vec![0x01, 0x00, (10 << 3) | 4]);
        roundtrip(&at(0, &[10, 12, 40, 41]));
    }

    #[test]
    fn test_run_folds_small_delta() {
        // Two instructions on line 5, then line 7: the run carries delta 2
        let bytes = encode(&at(0, &[5, 5, 7]));
        assert_eq!(bytes, vec![0x01, 0x00, (5 << 3) | 4, (1 << 2) | 2 | (2 << 6), (1 << 2) | 2]);
        roundtrip(&at(0, &[5, 5, 7]));
    }

    #[test]
    fn test_long_runs_split() {
        let positions = at(1, &[3; 40]);
        roundtrip(&positions);

        let bytes = encode(&positions);
        let runs: Vec<u8> = bytes.iter().copied().filter(|b| b & 3 == 2).collect();
        assert_eq!(runs, vec![(15 << 2) | 2, (15 << 2) | 2, (9 << 2) | 2]);
    }

    #[test]
    fn test_absolute_lines() {
        let bytes = encode(&at(0, &[100_000]));
        assert_eq!(bytes.len(), 2 + 3);
        assert_eq!(bytes[2] & 7, 0);

        roundtrip(&at(0, &[100_000, 32, 5000, 4, MAX_DEBUG_LINE - 1, 0, 64]));
    }

    #[test]
    fn test_file_changes() {
        let mut positions = at(0, &[1, 1, 2]);
        positions.extend(at(300, &[2, 90]));
        positions.extend(at(MAX_DEBUG_FILE - 1, &[7]));
        positions.extend(at(0, &[7, 7]));
        roundtrip(&positions);
    }

    #[test]
    fn test_out_of_range_positions() {
        let mut writer = BytecodeWriter::new();
        assert!(matches!(
            encode_positions(&mut writer, &at(MAX_DEBUG_FILE, &[0])),
            Err(EncodeError::DebugFileOutOfRange(_))
        ));
        assert!(matches!(
            encode_positions(&mut writer, &at(0, &[MAX_DEBUG_LINE])),
            Err(EncodeError::DebugLineOutOfRange(_))
        ));
        assert!(matches!(
            encode_positions(&mut writer, &at(0, &[-3])),
            Err(EncodeError::DebugLineOutOfRange(-3))
        ));
    }

    #[test]
    fn test_overrun_detected() {
        // A run of 4 for a 2-instruction function
        let bytes = [0x01, 0x00, (4 << 2) | 2];
        let result = decode_positions(&mut BytecodeReader::new(&bytes), 2);
        assert!(matches!(result, Err(DecodeError::DebugOverrun { expected: 2, decoded: 4 })));
    }

    #[test]
    fn test_empty() {
        assert!(encode(&[]).is_empty());
        let decoded = decode_positions(&mut BytecodeReader::new(&[]), 0).unwrap();
        assert!(decoded.is_empty());
    }
}
