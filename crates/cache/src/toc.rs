//! Persisted table of contents
//!
//! A JSON snapshot of the directory written on shutdown and read on startup.
//! Entries are stored least recently used first so recency survives a restart.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, SegmentHandle};
use crate::error::{CacheError, CacheResult};
use crate::fingerprint::Fingerprint;
use crate::params::ValidationParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TocRecord {
    fingerprint: Fingerprint,
    params: ValidationParams,
    handle: SegmentHandle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableOfContents {
    cache_name: String,
    cache_version: String,
    entries: Vec<TocRecord>,
}

impl TableOfContents {
    pub(crate) fn new(config: &CacheConfig, entries: &[CacheEntry]) -> Self {
        Self {
            cache_name: config.cache_name.clone(),
            cache_version: config.cache_version.clone(),
            entries: entries
                .iter()
                .map(|entry| TocRecord {
                    fingerprint: entry.fingerprint,
                    params: entry.params,
                    handle: entry.backing,
                })
                .collect(),
        }
    }

    /// Writes the table atomically through a temporary file
    pub(crate) fn save(&self, path: &Path) -> CacheResult<()> {
        let json = serde_json::to_vec(self)?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Reads the table for `config`.
    ///
    /// Returns `Ok(None)` when no file exists and `CorruptTableOfContents` when
    /// the file cannot be parsed or was written by another cache or version.
    pub(crate) fn load(path: &Path, config: &CacheConfig) -> CacheResult<Option<Vec<CacheEntry>>> {
        if !path.exists() {
            return Ok(None);
        }

        let bytes = fs::read(path)?;
        let toc: TableOfContents = serde_json::from_slice(&bytes)?;

        if toc.cache_name != config.cache_name || toc.cache_version != config.cache_version {
            return Err(CacheError::CorruptTableOfContents(format!(
                "written by {} {}, expected {} {}",
                toc.cache_name, toc.cache_version, config.cache_name, config.cache_version
            )));
        }

        Ok(Some(
            toc.entries
                .into_iter()
                .map(|record| CacheEntry::new(record.fingerprint, record.params, record.handle))
                .collect(),
        ))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{BitDepth, Box2D, ChannelSet, Format};

    fn entry(fp: u64) -> CacheEntry {
        CacheEntry::new(
            fp,
            ValidationParams {
                tree_version: fp & 0xff,
                roi: Box2D::new(0, 0, 4, 4),
                format: Format::from_size(4, 4),
                channels: ChannelSet::RGB,
                byte_mode: BitDepth::Float,
                exposure: 0.1,
                lut_id: 2,
            },
            SegmentHandle {
                segment: 1,
                offset: 128 * (fp & 0xff),
                length: 192,
                generation: 5,
            },
        )
    }

    #[test]
    fn test_save_and_load() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_dir(temp.path());
        let path = config.toc_path();

        let entries = vec![entry(u64::MAX), entry(2)];
        let toc = TableOfContents::new(&config, &entries);
        assert_eq!(toc.len(), 2);
        toc.save(&path).unwrap();

        let loaded = TableOfContents::load(&path, &config).unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].fingerprint, u64::MAX);
        assert_eq!(loaded[0].params, entries[0].params);
        // Generations are process-local
        assert_eq!(loaded[1].backing.generation, 0);
        assert_eq!(loaded[1].backing.offset, 256);
    }

    #[test]
    fn test_missing_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_dir(temp.path());
        assert!(TableOfContents::load(&config.toc_path(), &config)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_version_mismatch() {
        let temp = tempfile::tempdir().unwrap();
        let old = CacheConfig::default()
            .with_cache_dir(temp.path())
            .with_cache_version("v0.1.0");
        TableOfContents::new(&old, &[entry(1)])
            .save(&old.toc_path())
            .unwrap();

        let current = old.clone().with_cache_version("v1.0.0");
        assert!(matches!(
            TableOfContents::load(&current.toc_path(), &current),
            Err(CacheError::CorruptTableOfContents(_))
        ));
    }

    #[test]
    fn test_garbage_file() {
        let temp = tempfile::tempdir().unwrap();
        let config = CacheConfig::default().with_cache_dir(temp.path());
        fs::write(config.toc_path(), b"{ not json").unwrap();

        assert!(matches!(
            TableOfContents::load(&config.toc_path(), &config),
            Err(CacheError::CorruptTableOfContents(_))
        ));
    }
}
