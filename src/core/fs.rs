use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::{Error, Result};

/// Replace `path` with `bytes` so readers see either the old or the new file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::Corrupt(format!("{} has no parent", path.display())))?;
    std::fs::create_dir_all(parent)?;

    let tmp = tmp_path_for(path)?;
    let _ = std::fs::remove_file(&tmp);
    let mut output = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    output.write_all(bytes)?;
    output.sync_all()?;
    drop(output);

    std::fs::rename(&tmp, path)?;
    fsync_dir(parent)?;
    Ok(())
}

pub fn tmp_path_for(path: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::Corrupt(format!("missing filename for {}", path.display())))?
        .to_string_lossy();
    Ok(path.with_file_name(format!("{name}.tmp")))
}

#[cfg(unix)]
fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn fsync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
