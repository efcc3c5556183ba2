//! Register table planning and decoding for block protocols.
//!
//! A register table is planned into as few reads as possible: rows are grouped
//! per unit id and register kind, joined into address-contiguous runs, and each
//! run is cut into chunks of at most [`MAX_CHUNK_REGISTERS`] words. Chunks that
//! were split are not merged back with their neighbours.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::{DataType, Error, Result, Value};

pub const MAX_CHUNK_REGISTERS: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterKind {
    Holding,
    Input,
}

impl RegisterKind {
    pub fn function_code(&self) -> u8 {
        match self {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }
}

impl FromStr for RegisterKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "holding" | "hr" | "" => Ok(RegisterKind::Holding),
            "input" | "ir" => Ok(RegisterKind::Input),
            other => Err(Error::Catalog(format!("unknown register kind {other:?}"))),
        }
    }
}

/// Wire representation of a register value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterFormat {
    Float32,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
}

impl RegisterFormat {
    /// Width in 16-bit words.
    pub fn width(&self) -> u16 {
        match self {
            RegisterFormat::Int16 | RegisterFormat::Uint16 => 1,
            RegisterFormat::Float32 | RegisterFormat::Int32 | RegisterFormat::Uint32 => 2,
            RegisterFormat::Int64 | RegisterFormat::Uint64 => 4,
        }
    }

    /// Format used when a catalog row names only the storage type.
    pub fn default_for(datatype: DataType) -> Option<Self> {
        match datatype {
            DataType::Float => Some(RegisterFormat::Float32),
            DataType::Int => Some(RegisterFormat::Int32),
            DataType::Bool => Some(RegisterFormat::Uint16),
            DataType::String => None,
        }
    }
}

impl FromStr for RegisterFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "float32" | "ieee754" | "float" | "real" => Ok(RegisterFormat::Float32),
            "int16" => Ok(RegisterFormat::Int16),
            "uint16" => Ok(RegisterFormat::Uint16),
            "int32" => Ok(RegisterFormat::Int32),
            "uint32" => Ok(RegisterFormat::Uint32),
            "int64" => Ok(RegisterFormat::Int64),
            "uint64" => Ok(RegisterFormat::Uint64),
            other => Err(Error::Catalog(format!("unknown register format {other:?}"))),
        }
    }
}

/// Byte order inside one 16-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// Order of the registers making up a multi-word value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WordOrder {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Endianness {
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default)]
    pub word_order: WordOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterRow {
    pub id: usize,
    pub address: u16,
    pub kind: RegisterKind,
    pub format: RegisterFormat,
    pub scale: f64,
    pub unit_id: u8,
}

/// One protocol read covering a set of rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub unit_id: u8,
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
    /// Positions into the planned row slice.
    pub rows: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The link failed; the device must be treated as disconnected.
    Connection(String),
    /// The device answered but the answer is unusable for this chunk.
    Rejected(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Connection(msg) => write!(f, "connection error: {msg}"),
            ReadError::Rejected(msg) => write!(f, "read rejected: {msg}"),
        }
    }
}

/// Transport used by [`read_table`].
pub trait RegisterReader {
    fn read(
        &mut self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> std::result::Result<Vec<u16>, ReadError>;
}

/// Plan the reads for a register table.
pub fn plan_reads(rows: &[RegisterRow]) -> Vec<ReadChunk> {
    let mut groups: BTreeMap<(u8, RegisterKind), Vec<usize>> = BTreeMap::new();
    for (pos, row) in rows.iter().enumerate() {
        groups.entry((row.unit_id, row.kind)).or_default().push(pos);
    }

    let mut chunks = Vec::new();
    for ((unit_id, kind), mut members) in groups {
        members.sort_by_key(|pos| (rows[*pos].address, *pos));
        for run in contiguous_runs(rows, &members) {
            cut_run(rows, &run, unit_id, kind, &mut chunks);
        }
    }
    chunks
}

fn end_of(row: &RegisterRow) -> u32 {
    row.address as u32 + row.format.width() as u32
}

/// Split address-sorted rows wherever the next row does not start at or
/// before the end of the current run. Rows sharing registers stay together so
/// reads never overlap.
fn contiguous_runs(rows: &[RegisterRow], members: &[usize]) -> Vec<Vec<usize>> {
    let mut runs: Vec<Vec<usize>> = Vec::new();
    let mut run_end = 0u32;
    for &pos in members {
        let row = &rows[pos];
        match runs.last_mut() {
            Some(run) if (row.address as u32) <= run_end => {
                run.push(pos);
                run_end = run_end.max(end_of(row));
            }
            _ => {
                runs.push(vec![pos]);
                run_end = end_of(row);
            }
        }
    }
    runs
}

/// Bucket a run by offset / 100 from the current chunk base. A row that
/// would spill past the bucket opens the next chunk at its own address.
fn cut_run(
    rows: &[RegisterRow],
    run: &[usize],
    unit_id: u8,
    kind: RegisterKind,
    chunks: &mut Vec<ReadChunk>,
) {
    let limit = MAX_CHUNK_REGISTERS as u32;
    let mut current: Option<(u32, u32, Vec<usize>)> = None;
    for &pos in run {
        let row = &rows[pos];
        let start = row.address as u32;
        let end = end_of(row);
        current = match current.take() {
            Some((base, chunk_end, mut members)) if end - base <= limit => {
                members.push(pos);
                Some((base, chunk_end.max(end), members))
            }
            Some(done) => {
                chunks.push(finish_chunk(unit_id, kind, done));
                Some((start, end, vec![pos]))
            }
            None => Some((start, end, vec![pos])),
        };
    }
    if let Some(done) = current {
        chunks.push(finish_chunk(unit_id, kind, done));
    }
}

fn finish_chunk(unit_id: u8, kind: RegisterKind, chunk: (u32, u32, Vec<usize>)) -> ReadChunk {
    let (base, end, rows) = chunk;
    ReadChunk {
        unit_id,
        kind,
        start: base as u16,
        count: (end - base) as u16,
        rows,
    }
}

/// Decode one value from its registers, then apply `scale`.
///
/// Integers keep their integer type when the scale is exactly one.
pub fn decode_value(
    words: &[u16],
    format: RegisterFormat,
    endianness: Endianness,
    scale: f64,
) -> Result<Value> {
    let width = format.width() as usize;
    if words.len() < width {
        return Err(Error::Decode(format!(
            "need {width} registers for {format:?}, got {}",
            words.len()
        )));
    }
    let bytes = ordered_bytes(&words[..width], endianness);

    let raw: i128 = match format {
        RegisterFormat::Float32 => {
            let raw = f32::from_be_bytes(array4(&bytes));
            if !raw.is_finite() {
                return Err(Error::Decode(format!("invalid float32 value {raw}")));
            }
            return scaled(raw as f64, scale);
        }
        RegisterFormat::Int16 => i16::from_be_bytes([bytes[0], bytes[1]]) as i128,
        RegisterFormat::Uint16 => u16::from_be_bytes([bytes[0], bytes[1]]) as i128,
        RegisterFormat::Int32 => i32::from_be_bytes(array4(&bytes)) as i128,
        RegisterFormat::Uint32 => u32::from_be_bytes(array4(&bytes)) as i128,
        RegisterFormat::Int64 => i64::from_be_bytes(array8(&bytes)) as i128,
        RegisterFormat::Uint64 => u64::from_be_bytes(array8(&bytes)) as i128,
    };
    if scale == 1.0 {
        if let Ok(int) = i64::try_from(raw) {
            return Ok(Value::Int(int));
        }
    }
    scaled(raw as f64, scale)
}

fn scaled(raw: f64, scale: f64) -> Result<Value> {
    let value = raw * scale;
    if !value.is_finite() {
        return Err(Error::Decode(format!("{raw} scaled by {scale} is not finite")));
    }
    Ok(Value::Float(value))
}

fn ordered_bytes(words: &[u16], endianness: Endianness) -> Vec<u8> {
    let mut ordered: Vec<u16> = words.to_vec();
    if endianness.word_order == WordOrder::Little {
        ordered.reverse();
    }
    let mut bytes = Vec::with_capacity(ordered.len() * 2);
    for word in ordered {
        let pair = match endianness.byte_order {
            ByteOrder::Big => word.to_be_bytes(),
            ByteOrder::Little => word.to_le_bytes(),
        };
        bytes.extend_from_slice(&pair);
    }
    bytes
}

fn array4(bytes: &[u8]) -> [u8; 4] {
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

fn array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

/// Outcome of decoding one table: one entry per input row, keyed by row id.
#[derive(Debug, Default)]
pub struct TableReadout {
    pub values: BTreeMap<usize, Result<Value>>,
}

/// Read and decode every row of a table.
///
/// A connection-class read failure aborts the whole table. A rejected chunk
/// only fails the rows it covers.
pub fn read_table<R: RegisterReader + ?Sized>(
    reader: &mut R,
    rows: &[RegisterRow],
    endianness: Endianness,
) -> std::result::Result<TableReadout, ReadError> {
    let mut readout = TableReadout::default();
    for chunk in plan_reads(rows) {
        let words = match reader.read(chunk.unit_id, chunk.kind, chunk.start, chunk.count) {
            Ok(words) => words,
            Err(ReadError::Connection(msg)) => return Err(ReadError::Connection(msg)),
            Err(ReadError::Rejected(msg)) => {
                for pos in &chunk.rows {
                    readout
                        .values
                        .insert(rows[*pos].id, Err(Error::Decode(msg.clone())));
                }
                continue;
            }
        };
        for pos in &chunk.rows {
            let row = &rows[*pos];
            let offset = (row.address - chunk.start) as usize;
            let slice = words.get(offset..).unwrap_or(&[]);
            readout
                .values
                .insert(row.id, decode_value(slice, row.format, endianness, row.scale));
        }
    }
    Ok(readout)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: usize, address: u16, format: RegisterFormat) -> RegisterRow {
        RegisterRow {
            id,
            address,
            kind: RegisterKind::Holding,
            format,
            scale: 1.0,
            unit_id: 1,
        }
    }

    fn assert_chunks_valid(rows: &[RegisterRow], chunks: &[ReadChunk]) {
        let mut covered = vec![0usize; rows.len()];
        for chunk in chunks {
            assert!(chunk.count <= MAX_CHUNK_REGISTERS, "chunk too large: {chunk:?}");
            for pos in &chunk.rows {
                covered[*pos] += 1;
                let r = &rows[*pos];
                assert!(r.address >= chunk.start);
                assert!(end_of(r) <= chunk.start as u32 + chunk.count as u32);
            }
        }
        assert!(covered.iter().all(|c| *c == 1), "rows not covered exactly once");
        for (i, a) in chunks.iter().enumerate() {
            for b in &chunks[i + 1..] {
                if a.unit_id != b.unit_id || a.kind != b.kind {
                    continue;
                }
                let a_end = a.start as u32 + a.count as u32;
                let b_end = b.start as u32 + b.count as u32;
                assert!(
                    a_end <= b.start as u32 || b_end <= a.start as u32,
                    "overlap {a:?} {b:?}"
                );
            }
        }
    }

    #[test]
    fn contiguous_rows_share_one_read() {
        let rows = vec![
            row(0, 10, RegisterFormat::Float32),
            row(1, 12, RegisterFormat::Int16),
            row(2, 13, RegisterFormat::Uint32),
            row(3, 40, RegisterFormat::Int64),
        ];
        let chunks = plan_reads(&rows);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].start, chunks[0].count), (10, 5));
        assert_eq!((chunks[1].start, chunks[1].count), (40, 4));
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn long_runs_are_cut_at_one_hundred() {
        let rows: Vec<RegisterRow> = (0..150)
            .map(|i| row(i, 1000 + 2 * i as u16, RegisterFormat::Float32))
            .collect();
        let chunks = plan_reads(&rows);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start, chunks[0].count), (1000, 100));
        assert_eq!((chunks[1].start, chunks[1].count), (1100, 100));
        assert_eq!((chunks[2].start, chunks[2].count), (1200, 100));
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn straddling_row_opens_next_chunk() {
        // 99 single words then a float that would need registers 99 and 100.
        let mut rows: Vec<RegisterRow> = (0..99).map(|i| row(i, i as u16, RegisterFormat::Int16)).collect();
        rows.push(row(99, 99, RegisterFormat::Float32));
        let chunks = plan_reads(&rows);
        assert_eq!(chunks.len(), 2);
        assert_eq!((chunks[0].start, chunks[0].count), (0, 99));
        assert_eq!((chunks[1].start, chunks[1].count), (99, 2));
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn split_chunks_are_not_merged_back() {
        // A run of 101 words yields a 100-word chunk and a 1-word tail.
        let mut rows: Vec<RegisterRow> = (0..101).map(|i| row(i, i as u16, RegisterFormat::Uint16)).collect();
        rows.push(row(101, 105, RegisterFormat::Uint16));
        let chunks = plan_reads(&rows);
        let shapes: Vec<(u16, u16)> = chunks.iter().map(|c| (c.start, c.count)).collect();
        assert_eq!(shapes, vec![(0, 100), (100, 1), (105, 1)]);
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn units_and_kinds_are_planned_separately() {
        let mut rows = vec![row(0, 0, RegisterFormat::Uint16), row(1, 1, RegisterFormat::Uint16)];
        rows[1].unit_id = 2;
        rows.push(RegisterRow {
            kind: RegisterKind::Input,
            ..row(2, 0, RegisterFormat::Uint16)
        });
        let chunks = plan_reads(&rows);
        assert_eq!(chunks.len(), 3);
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn shared_registers_do_not_overlap() {
        let rows = vec![
            row(0, 0, RegisterFormat::Uint32),
            row(1, 0, RegisterFormat::Uint16),
            row(2, 1, RegisterFormat::Uint16),
        ];
        let chunks = plan_reads(&rows);
        assert_eq!(chunks.len(), 1);
        assert_chunks_valid(&rows, &chunks);
    }

    #[test]
    fn decodes_all_orders() {
        // 123.456f32 = 0x42F6_E979
        let cases = [
            (ByteOrder::Big, WordOrder::Big, [0x42F6, 0xE979]),
            (ByteOrder::Big, WordOrder::Little, [0xE979, 0x42F6]),
            (ByteOrder::Little, WordOrder::Big, [0xF642, 0x79E9]),
            (ByteOrder::Little, WordOrder::Little, [0x79E9, 0xF642]),
        ];
        for (byte_order, word_order, words) in cases {
            let endianness = Endianness { byte_order, word_order };
            let value = decode_value(&words, RegisterFormat::Float32, endianness, 1.0).unwrap();
            match value {
                Value::Float(v) => assert!((v - 123.456).abs() < 1e-4, "{byte_order:?}/{word_order:?}"),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn decodes_integers_and_scale() {
        let be = Endianness::default();
        assert_eq!(
            decode_value(&[0xFFFF], RegisterFormat::Int16, be, 1.0).unwrap(),
            Value::Int(-1)
        );
        assert_eq!(
            decode_value(&[0xFFFF], RegisterFormat::Uint16, be, 1.0).unwrap(),
            Value::Int(65535)
        );
        assert_eq!(
            decode_value(&[0x0001, 0x0000], RegisterFormat::Uint32, be, 1.0).unwrap(),
            Value::Int(65536)
        );
        assert_eq!(
            decode_value(&[0, 0, 0, 250], RegisterFormat::Int64, be, 0.1).unwrap(),
            Value::Float(25.0)
        );
        assert!(matches!(
            decode_value(&[0x7FC0, 0x0000], RegisterFormat::Float32, be, 1.0),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode_value(&[0x0001], RegisterFormat::Uint32, be, 1.0),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn non_finite_scaled_values_are_decode_errors() {
        let be = Endianness::default();
        // 3.0e38f32 = 0x7F61_B1E6
        assert!(matches!(
            decode_value(&[0x7F61, 0xB1E6], RegisterFormat::Float32, be, 10.0),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode_value(&[0x0001], RegisterFormat::Uint16, be, f64::NAN),
            Err(Error::Decode(_))
        ));
        assert!(matches!(
            decode_value(&[0, 0], RegisterFormat::Int32, be, f64::INFINITY),
            Err(Error::Decode(_))
        ));
    }

    struct Table {
        words: Vec<u16>,
        reads: usize,
        reject_from: Option<u16>,
    }

    impl RegisterReader for Table {
        fn read(
            &mut self,
            _unit_id: u8,
            _kind: RegisterKind,
            start: u16,
            count: u16,
        ) -> std::result::Result<Vec<u16>, ReadError> {
            self.reads += 1;
            if matches!(self.reject_from, Some(limit) if start >= limit) {
                return Err(ReadError::Rejected("illegal data address".into()));
            }
            let start = start as usize;
            Ok(self.words[start..start + count as usize].to_vec())
        }
    }

    #[test]
    fn read_table_returns_one_result_per_row() {
        let mut table = Table {
            words: (0..400).collect(),
            reads: 0,
            reject_from: Some(300),
        };
        let rows = vec![
            row(7, 5, RegisterFormat::Uint16),
            row(3, 6, RegisterFormat::Uint16),
            row(9, 200, RegisterFormat::Uint16),
            row(1, 300, RegisterFormat::Uint16),
        ];
        let readout = read_table(&mut table, &rows, Endianness::default()).unwrap();
        assert_eq!(table.reads, 3);
        assert_eq!(readout.values.len(), rows.len());
        assert_eq!(readout.values[&7].as_ref().unwrap(), &Value::Int(5));
        assert_eq!(readout.values[&3].as_ref().unwrap(), &Value::Int(6));
        assert_eq!(readout.values[&9].as_ref().unwrap(), &Value::Int(200));
        assert!(readout.values[&1].is_err());
    }
}
