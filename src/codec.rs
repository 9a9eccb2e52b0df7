//! The on-disk and in-flight record format.
//!
//! A record is a 4-byte big-endian total length, a fixed [`KEY_LEN`]-byte
//! key, and `length - KEY_LEN` bytes of value. Records are stored back to
//! back with no padding; a stream ends at end-of-file on a record boundary.

use std::cmp::Ordering;
use std::io::{self, Read, Write};

use bytes::Bytes;

use crate::error::{Result, SortError};
use crate::proto;

/// Width of every record key in bytes.
pub const KEY_LEN: usize = 10;

const LEN_PREFIX: usize = 4;

/// A single keyed record.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct Record {
    /// The key. Compared byte-wise, never interpreted.
    pub key: [u8; KEY_LEN],
    /// The value.
    pub value: Bytes,
}

impl Record {
    /// Construct a new record from the given key and value.
    pub fn new(key: [u8; KEY_LEN], value: impl Into<Bytes>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    /// The total length field of this record: key plus value.
    ///
    /// Saturates at `u32::MAX` for values the format cannot represent;
    /// [`write_record`] refuses to encode those.
    #[inline]
    pub fn length(&self) -> u32 {
        u32::try_from(KEY_LEN + self.value.len()).unwrap_or(u32::MAX)
    }

    /// Number of bytes this record occupies on disk.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        LEN_PREFIX + KEY_LEN + self.value.len()
    }

    /// Byte-wise key ordering.
    #[inline]
    pub fn cmp_key(&self, other: &Record) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Reads one record.
///
/// Returns `Ok(None)` when the reader is exhausted exactly on a record
/// boundary.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<Record>> {
    let mut prefix = [0u8; LEN_PREFIX];
    match read_full(reader, &mut prefix)? {
        0 => return Ok(None),
        LEN_PREFIX => {}
        found => {
            return Err(SortError::TruncatedStream {
                expected: LEN_PREFIX,
                found,
            })
        }
    }

    let length = u32::from_be_bytes(prefix);
    if (length as usize) < KEY_LEN {
        return Err(SortError::MalformedRecord(length));
    }

    let mut key = [0u8; KEY_LEN];
    let found = read_full(reader, &mut key)?;
    if found != KEY_LEN {
        return Err(SortError::TruncatedStream {
            expected: KEY_LEN,
            found,
        });
    }

    let value_len = length as usize - KEY_LEN;
    let mut value = vec![0u8; value_len];
    let found = read_full(reader, &mut value)?;
    if found != value_len {
        return Err(SortError::TruncatedStream {
            expected: value_len,
            found,
        });
    }

    Ok(Some(Record::new(key, value)))
}

/// Writes one record. Partial writes surface as errors from the writer.
pub fn write_record<W: Write>(writer: &mut W, record: &Record) -> io::Result<()> {
    let length = u32::try_from(KEY_LEN + record.value.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("record value of {} bytes is too large", record.value.len()),
        )
    })?;
    writer.write_all(&length.to_be_bytes())?;
    writer.write_all(&record.key)?;
    writer.write_all(&record.value)
}

/// Fills `buf` as far as the reader allows and returns how many bytes were
/// read. Anything short of `buf.len()` means end-of-input was reached.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Iterator over the records of a stream.
///
/// Stops after the first error; a malformed stream never yields records
/// past the point of corruption.
pub struct RecordReader<R> {
    reader: R,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        RecordReader {
            reader,
            done: false,
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match read_record(&mut self.reader) {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl From<Record> for proto::Record {
    fn from(record: Record) -> Self {
        proto::Record {
            len: record.length(),
            key: Bytes::copy_from_slice(&record.key),
            value: record.value,
        }
    }
}

impl TryFrom<proto::Record> for Record {
    type Error = SortError;

    fn try_from(record: proto::Record) -> Result<Self> {
        let key: [u8; KEY_LEN] = record.key.as_ref().try_into().map_err(|_| {
            SortError::Protocol(format!(
                "record key has {} bytes, expected {}",
                record.key.len(),
                KEY_LEN
            ))
        })?;
        let decoded = Record::new(key, record.value);
        if decoded.length() != record.len {
            return Err(SortError::Protocol(format!(
                "record declares length {} but carries {} bytes",
                record.len,
                decoded.length()
            )));
        }
        Ok(decoded)
    }
}
