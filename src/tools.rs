//! Helpers behind `globesort-ctl`: generating input and checking output.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::codec::{write_record, Record, RecordReader, KEY_LEN};
use crate::error::{Result, SortError};

/// Writes `count` random records with `value_len`-byte values to `path`.
pub fn generate(path: &Path, count: u64, value_len: usize, seed: Option<u64>) -> Result<u64> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let write_err = |source| SortError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut writer = BufWriter::new(File::create(path).map_err(write_err)?);
    let mut value = vec![0u8; value_len];
    for _ in 0..count {
        let key: [u8; KEY_LEN] = rng.gen();
        rng.fill(value.as_mut_slice());
        write_record(&mut writer, &Record::new(key, value.clone())).map_err(write_err)?;
    }
    writer.flush().map_err(write_err)?;
    Ok(count)
}

/// First place where the concatenated files go out of order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disorder {
    pub path: PathBuf,
    /// Index of the offending record within `path`.
    pub index: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Validation {
    /// Records read before stopping.
    pub records: u64,
    pub disorder: Option<Disorder>,
}

impl Validation {
    pub fn is_sorted(&self) -> bool {
        self.disorder.is_none()
    }
}

/// Reads `paths` in order and checks that their concatenation is sorted by
/// key. Stops at the first out-of-order record.
pub fn validate<P: AsRef<Path>>(paths: &[P]) -> Result<Validation> {
    let mut report = Validation::default();
    let mut previous: Option<[u8; KEY_LEN]> = None;

    for path in paths {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SortError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        for (index, record) in RecordReader::new(BufReader::new(file)).enumerate() {
            let record = record?;
            if previous.is_some_and(|key| key > record.key) {
                report.disorder = Some(Disorder {
                    path: path.to_path_buf(),
                    index: index as u64,
                });
                return Ok(report);
            }
            previous = Some(record.key);
            report.records += 1;
        }
    }
    Ok(report)
}
