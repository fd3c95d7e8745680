//! Crash-consistent file replacement.
//!
//! Content is written to a uniquely named sibling temp file, fsynced, then
//! renamed over the target. Readers see either the previous file or the
//! complete new one, and concurrent writers never share a temp file.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use tally_core::error::{Result, TallyError};

/// Replace `path` with whatever `write` produces.
///
/// Any failure is reported as [`TallyError::Persistence`] and the temporary
/// file is removed; the previous content of `path` is left untouched.
pub fn write_atomic<F>(path: &Path, write: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let temp = temp_path(path);
    let result = replace_with(path, &temp, write);
    if let Err(e) = result {
        let _ = fs::remove_file(&temp);
        return Err(TallyError::Persistence(format!(
            "writing {}: {}",
            path.display(),
            e
        )));
    }
    Ok(())
}

fn replace_with<F>(path: &Path, temp: &Path, write: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let mut writer = BufWriter::new(File::create(temp)?);
    write(&mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp, path)?;
    sync_dir(parent)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}.tmp", Uuid::new_v4().simple()));
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
