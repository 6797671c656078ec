use crate::constants::files;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// `run_data_cache.json`: the current workflow run id of a working directory
/// and every id it replaced, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDataCache {
    pub run_id: String,
    #[serde(default)]
    pub old_run_ids: Vec<String>,
}

impl RunDataCache {
    pub fn path(working_dir: &Path) -> PathBuf {
        working_dir.join(files::RUN_DATA_CACHE)
    }

    pub fn load(working_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = Self::path(working_dir);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs_err::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn latest(working_dir: &Path) -> Result<Option<String>, ConfigError> {
        Ok(Self::load(working_dir)?
            .map(|cache| cache.run_id)
            .filter(|id| !id.is_empty()))
    }

    /// Records `run_id` as current, pushing the previous id onto the history.
    pub fn record(working_dir: &Path, run_id: &str) -> Result<Self, ConfigError> {
        let mut cache = Self::load(working_dir)?.unwrap_or_default();
        if cache.run_id != run_id {
            if !cache.run_id.is_empty() {
                let previous = std::mem::take(&mut cache.run_id);
                cache.old_run_ids.retain(|id| id != &previous);
                cache.old_run_ids.insert(0, previous);
            }
            cache.run_id = run_id.to_string();
        }
        cache.write(working_dir)?;
        Ok(cache)
    }

    pub fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.run_id.as_str()).chain(self.old_run_ids.iter().map(String::as_str))
    }

    fn write(&self, working_dir: &Path) -> Result<(), ConfigError> {
        let mut tmp = tempfile::NamedTempFile::new_in(working_dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(Self::path(working_dir))
            .map_err(|e| ConfigError::Io(e.error))?;
        Ok(())
    }
}
