//! Sorting and writing the local partition.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::codec::{write_record, Record};
use crate::error::{Result, SortError};

/// Stable byte-wise sort by key; records with equal keys keep their order.
pub fn sort_partition(records: &mut [Record]) {
    records.sort_by(Record::cmp_key);
}

/// Writes `records` to a new file at `path` in the record format and
/// returns how many were written.
pub fn write_partition(path: &Path, records: &[Record]) -> Result<u64> {
    let write_err = |source| SortError::Write {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    for record in records {
        write_record(&mut writer, record).map_err(write_err)?;
    }
    writer.flush().map_err(write_err)?;
    Ok(records.len() as u64)
}

/// Sorts the partition and writes it out on the blocking pool.
pub async fn sort_and_save(path: PathBuf, mut records: Vec<Record>) -> Result<u64> {
    let target = path.clone();
    tokio::task::spawn_blocking(move || {
        sort_partition(&mut records);
        write_partition(&target, &records)
    })
    .await
    .map_err(|err| SortError::Write {
        path,
        source: io::Error::other(err),
    })?
}
