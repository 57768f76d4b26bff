//! State intervals and their on-disk encoding.

use tracehist_error::{HistoryError, Result};

use crate::value::StateValue;
use crate::Quark;

/// Value tags in the on-disk interval encoding.
const TAG_NULL: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_LONG: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BLOB: u8 = 5;

/// Fixed part of an interval's encoding: start, end, quark, value tag.
const FIXED_SIZE: usize = 8 + 8 + 4 + 1;

/// An immutable (attribute, time range, value) record — the atomic unit of
/// historical state. Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct Interval {
    start: i64,
    end: i64,
    quark: Quark,
    value: StateValue,
}

impl Interval {
    /// Construct an interval, enforcing `start <= end`.
    pub fn new(start: i64, end: i64, quark: Quark, value: StateValue) -> Result<Self> {
        if start > end {
            return Err(HistoryError::InvalidInterval { start, end });
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }

    #[must_use]
    pub const fn start(&self) -> i64 {
        self.start
    }

    #[must_use]
    pub const fn end(&self) -> i64 {
        self.end
    }

    #[must_use]
    pub const fn quark(&self) -> Quark {
        self.quark
    }

    #[must_use]
    pub const fn value(&self) -> &StateValue {
        &self.value
    }

    /// Whether this interval covers instant `t` (both bounds inclusive).
    #[must_use]
    pub const fn intersects(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }

    /// Whether this interval overlaps the closed range `[lo, hi]`.
    #[must_use]
    pub const fn overlaps(&self, lo: i64, hi: i64) -> bool {
        self.start <= hi && lo <= self.end
    }

    /// Total bytes this interval occupies in a node block.
    #[must_use]
    pub fn size_on_disk(&self) -> usize {
        FIXED_SIZE + self.value.payload_size()
    }

    /// Append the little-endian encoding of this interval to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.start.to_le_bytes());
        buf.extend_from_slice(&self.end.to_le_bytes());
        buf.extend_from_slice(&self.quark.get().to_le_bytes());
        match &self.value {
            StateValue::Null => buf.push(TAG_NULL),
            StateValue::Int(i) => {
                buf.push(TAG_INT);
                buf.extend_from_slice(&i.to_le_bytes());
            }
            StateValue::Long(l) => {
                buf.push(TAG_LONG);
                buf.extend_from_slice(&l.to_le_bytes());
            }
            StateValue::Float(f) => {
                buf.push(TAG_FLOAT);
                buf.extend_from_slice(&f.to_le_bytes());
            }
            StateValue::Text(s) => {
                buf.push(TAG_TEXT);
                #[allow(clippy::cast_possible_truncation)]
                buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
            StateValue::Blob(b) => {
                buf.push(TAG_BLOB);
                #[allow(clippy::cast_possible_truncation)]
                buf.extend_from_slice(&(b.len() as u32).to_le_bytes());
                buf.extend_from_slice(b);
            }
        }
    }

    /// Decode one interval from `buf` starting at `*pos`, advancing `*pos`
    /// past it. Fails with `Corrupt` on any structural inconsistency.
    pub fn read_from(buf: &[u8], pos: &mut usize) -> Result<Self> {
        let start = read_i64(buf, pos)?;
        let end = read_i64(buf, pos)?;
        let quark = Quark::new(read_u32(buf, pos)?);
        let tag = read_u8(buf, pos)?;
        let value = match tag {
            TAG_NULL => StateValue::Null,
            TAG_INT => StateValue::Int(read_i32(buf, pos)?),
            TAG_LONG => StateValue::Long(read_i64(buf, pos)?),
            TAG_FLOAT => StateValue::Float(f64::from_le_bytes(read_array::<8>(buf, pos)?)),
            TAG_TEXT => {
                let len = read_u32(buf, pos)? as usize;
                let bytes = read_slice(buf, pos, len)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| HistoryError::corrupt("interval text is not valid UTF-8"))?;
                StateValue::Text(s.to_owned())
            }
            TAG_BLOB => {
                let len = read_u32(buf, pos)? as usize;
                StateValue::Blob(read_slice(buf, pos, len)?.to_vec())
            }
            other => {
                return Err(HistoryError::corrupt(format!(
                    "unknown interval value tag {other}"
                )))
            }
        };
        Self::new(start, end, quark, value)
            .map_err(|_| HistoryError::corrupt(format!("interval with start {start} > end {end}")))
    }
}

fn read_slice<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = pos
        .checked_add(len)
        .ok_or_else(|| HistoryError::corrupt("interval length overflow"))?;
    if end > buf.len() {
        return Err(HistoryError::ShortRead {
            expected: len,
            actual: buf.len().saturating_sub(*pos),
        });
    }
    let out = &buf[*pos..end];
    *pos = end;
    Ok(out)
}

fn read_array<const N: usize>(buf: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    let slice = read_slice(buf, pos, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_u8(buf: &[u8], pos: &mut usize) -> Result<u8> {
    Ok(read_array::<1>(buf, pos)?[0])
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4>(buf, pos)?))
}

fn read_i32(buf: &[u8], pos: &mut usize) -> Result<i32> {
    Ok(i32::from_le_bytes(read_array::<4>(buf, pos)?))
}

fn read_i64(buf: &[u8], pos: &mut usize) -> Result<i64> {
    Ok(i64::from_le_bytes(read_array::<8>(buf, pos)?))
}
