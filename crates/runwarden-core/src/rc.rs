use crate::constants::files;
use crate::errors::ConfigError;
use std::io::Write;
use std::path::Path;

pub fn write_rc_atomic(execution_dir: &Path, code: &str) -> Result<(), ConfigError> {
    let mut tmp = tempfile::NamedTempFile::new_in(execution_dir).map_err(|source| {
        ConfigError::PathIo {
            path: execution_dir.to_path_buf(),
            source,
        }
    })?;
    writeln!(tmp, "{}", code)?;
    tmp.as_file().sync_all()?;
    let target = execution_dir.join(files::RC);
    tmp.persist(&target).map_err(|e| ConfigError::PathIo {
        path: target,
        source: e.error,
    })?;
    Ok(())
}

/// The first line of the `rc` file, if there is one.
pub fn read_rc(execution_dir: &Path) -> Result<Option<String>, ConfigError> {
    let path = execution_dir.join(files::RC);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs_err::read_to_string(&path)?;
    Ok(content.lines().next().map(|l| l.trim().to_string()))
}

/// Renames `rc.tmp` to `rc`. Returns false when there was no `rc.tmp`.
pub fn publish_rc(execution_dir: &Path) -> Result<bool, ConfigError> {
    let tmp = execution_dir.join(files::RC_TMP);
    if !tmp.exists() {
        return Ok(false);
    }
    fs_err::rename(&tmp, execution_dir.join(files::RC))?;
    Ok(true)
}

pub fn write_rc_if_missing(execution_dir: &Path, code: &str) -> Result<bool, ConfigError> {
    if execution_dir.join(files::RC).exists() {
        return Ok(false);
    }
    write_rc_atomic(execution_dir, code)?;
    Ok(true)
}
