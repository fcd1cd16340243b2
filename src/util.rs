//! File helpers shared by storage and config. `write_file_atomic` fsyncs
//! the temp file before renaming it into place: a bare write-then-rename
//! doesn't guarantee the write survives a crash, since the rename can
//! land on disk before the dirty pages it points at do.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::Path;

use crate::error::Error;

pub fn read_file(path: &Path) -> Result<Vec<u8>, Error> {
    let mut file = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Write `bytes` to `path` so that a crash at any point leaves either the
/// old contents or the new contents, never a partial write: write to a
/// sibling `.tmp` file, `fsync` it, then `rename` over the target
/// (rename is atomic within one filesystem).
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}
