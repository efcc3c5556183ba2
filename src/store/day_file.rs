//! Day-file container.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "TGVD"
//!      4     2  version (LE)
//!      6     1  datatype code
//!      7     1  reserved
//!      8     4  timezone offset seconds (LE, signed)
//!     12     4  point count (LE)
//!     16     4  crc32 of the compressed payload (LE)
//!     20     …  zstd payload: per point ts_ns i64 LE + value
//! ```
//!
//! Values are `u8` for bool, `i64` for int, `f64` for float and a `u32`
//! length-prefixed UTF-8 string for text.

use crate::core::{DataType, Error, Result, Value};
use crate::store::series::Point;

const MAGIC: &[u8; 4] = b"TGVD";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 20;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct DayFile {
    pub datatype: DataType,
    pub tz_offset_secs: i32,
    pub points: Vec<Point>,
}

pub fn encode(datatype: DataType, tz_offset_secs: i32, points: &[Point]) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(points.len() * 16);
    for point in points {
        payload.extend_from_slice(&point.ts_ns.to_le_bytes());
        match (datatype, &point.value) {
            (DataType::Bool, Value::Bool(b)) => payload.push(u8::from(*b)),
            (DataType::Int, Value::Int(i)) => payload.extend_from_slice(&i.to_le_bytes()),
            (DataType::Float, Value::Float(f)) => payload.extend_from_slice(&f.to_le_bytes()),
            (DataType::String, Value::Text(s)) => {
                let len = u32::try_from(s.len())
                    .map_err(|_| Error::Decode(format!("string of {} bytes too long", s.len())))?;
                payload.extend_from_slice(&len.to_le_bytes());
                payload.extend_from_slice(s.as_bytes());
            }
            (datatype, value) => {
                return Err(Error::Decode(format!(
                    "{value:?} stored in a {datatype} day file"
                )))
            }
        }
    }

    let compressed = zstd::stream::encode_all(payload.as_slice(), ZSTD_LEVEL)?;
    let count = u32::try_from(points.len())
        .map_err(|_| Error::Decode(format!("{} points exceed a day file", points.len())))?;

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(datatype.code());
    out.push(0);
    out.extend_from_slice(&tz_offset_secs.to_le_bytes());
    out.extend_from_slice(&count.to_le_bytes());
    out.extend_from_slice(&crc32(&compressed).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<DayFile> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::Corrupt("day file shorter than its header".to_string()));
    }
    if &bytes[0..4] != MAGIC {
        return Err(Error::Corrupt("bad day file magic".to_string()));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(Error::Corrupt(format!("unsupported day file version {version}")));
    }
    let datatype = DataType::from_code(bytes[6])?;
    let tz_offset_secs = i32::from_le_bytes(read4(bytes, 8));
    let count = u32::from_le_bytes(read4(bytes, 12)) as usize;
    let expected_crc = u32::from_le_bytes(read4(bytes, 16));

    let compressed = &bytes[HEADER_LEN..];
    if crc32(compressed) != expected_crc {
        return Err(Error::Corrupt("day file crc mismatch".to_string()));
    }
    let payload = zstd::stream::decode_all(compressed)?;

    let mut cursor = Cursor {
        buf: &payload,
        pos: 0,
    };
    let mut points = Vec::with_capacity(count);
    for _ in 0..count {
        let ts_ns = i64::from_le_bytes(cursor.take::<8>()?);
        let value = match datatype {
            DataType::Bool => Value::Bool(cursor.take::<1>()?[0] != 0),
            DataType::Int => Value::Int(i64::from_le_bytes(cursor.take::<8>()?)),
            DataType::Float => Value::Float(f64::from_le_bytes(cursor.take::<8>()?)),
            DataType::String => {
                let len = u32::from_le_bytes(cursor.take::<4>()?) as usize;
                let raw = cursor.slice(len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|_| Error::Corrupt("day file string is not utf-8".to_string()))?;
                Value::Text(text.to_string())
            }
        };
        points.push(Point { ts_ns, value });
    }
    if cursor.pos != payload.len() {
        return Err(Error::Corrupt("trailing bytes in day file payload".to_string()));
    }

    Ok(DayFile {
        datatype,
        tz_offset_secs,
        points,
    })
}

fn read4(bytes: &[u8], at: usize) -> [u8; 4] {
    [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]
}

fn crc32(payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::Corrupt("truncated day file payload".to_string()))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(N)?);
        Ok(out)
    }
}
