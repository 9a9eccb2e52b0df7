//! Small helpers shared by the binaries and tests.

use std::path::{Path, PathBuf};

use log::LevelFilter;

use crate::NodeId;

/// Installs the process-wide logger. Later calls are ignored.
pub fn init_logger(level: LevelFilter) {
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_millis()
        .try_init();
}

/// Output file of node `id` inside `dir`.
#[inline]
pub fn part_path(dir: &Path, id: NodeId) -> PathBuf {
    dir.join(format!("part-{id}"))
}
