//! Column family manifest persistence
//!
//! One JSON document per column family at `cf-<id>/MANIFEST`, rewritten
//! atomically whenever the level layout, name or config changes.

use crate::config::ColumnFamilyConfig;
use crate::{Result, SeqNo};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MANIFEST_FILE: &str = "MANIFEST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Immutable id; the directory is named after it.
    pub id: u32,
    pub name: String,
    pub config: ColumnFamilyConfig,
    /// File ids per level, level 0 first and newest first within it.
    pub levels: Vec<Vec<u64>>,
    pub next_file_id: u64,
    /// Every commit with seq <= this is in the SSTables above.
    pub flushed_seq: SeqNo,
}

impl Manifest {
    pub fn new(id: u32, name: impl Into<String>, config: ColumnFamilyConfig) -> Self {
        let levels = vec![Vec::new(); config.min_levels.max(2)];
        Manifest {
            id,
            name: name.into(),
            config,
            levels,
            next_file_id: 1,
            flushed_seq: 0,
        }
    }

    pub fn dir_name(id: u32) -> String {
        format!("cf-{}", id)
    }

    pub fn path(cf_dir: &Path) -> PathBuf {
        cf_dir.join(MANIFEST_FILE)
    }

    /// Load from `cf-<id>/MANIFEST`
    pub fn load(cf_dir: &Path) -> Result<Self> {
        let mut file = File::open(Self::path(cf_dir))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let manifest: Manifest = serde_json::from_str(&contents)?;
        debug!(
            cf = %manifest.name,
            files = manifest.levels.iter().map(Vec::len).sum::<usize>(),
            "loaded manifest"
        );
        Ok(manifest)
    }

    /// Save to `cf-<id>/MANIFEST` (atomic write)
    pub fn save(&self, cf_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(cf_dir)?;
        let path = Self::path(cf_dir);
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn file_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.levels.iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() -> Result<()> {
        let dir = tempdir()?;
        let cf_dir = dir.path().join(Manifest::dir_name(3));
        let mut manifest = Manifest::new(3, "users", ColumnFamilyConfig::default());
        assert_eq!(manifest.levels.len(), 5);
        manifest.levels[0] = vec![9, 8];
        manifest.levels[1] = vec![2];
        manifest.next_file_id = 10;
        manifest.flushed_seq = 42;
        manifest.save(&cf_dir)?;

        let loaded = Manifest::load(&cf_dir)?;
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.file_ids().collect::<Vec<_>>(), vec![9, 8, 2]);
        assert!(!cf_dir.join("MANIFEST.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_garbage_manifest_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(MANIFEST_FILE), b"{not json")?;
        let err = Manifest::load(dir.path()).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::Corruption);
        Ok(())
    }
}
