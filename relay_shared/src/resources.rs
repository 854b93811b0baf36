//! Mod archive index.
//!
//! `<resource>/Client/*.zip` is enumerated once at startup. The index
//! feeds the in-band resource listing (`SR`), validates download requests,
//! and supplies the discovery heartbeat's mod statistics.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ModEntry {
    /// Forward-slash path as sent on the wire.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ModIndex {
    entries: Vec<ModEntry>,
}

impl ModIndex {
    /// Walks `<resource_dir>/Client` for `.zip` archives, creating the
    /// directory tree when absent.
    pub fn scan(resource_dir: &Path) -> anyhow::Result<Self> {
        let client_dir = resource_dir.join("Client");
        std::fs::create_dir_all(&client_dir)
            .with_context(|| format!("create {}", client_dir.display()))?;

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&client_dir).context("list resource directory")? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("zip") {
                continue;
            }
            let size = entry.metadata()?.len();
            entries.push(ModEntry {
                path: wire_path(&path),
                size,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        if !entries.is_empty() {
            info!(mods = entries.len(), "loaded mod archives");
        }
        Ok(ModIndex { entries })
    }

    pub fn entries(&self) -> &[ModEntry] {
        &self.entries
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Resolves a wire path to the on-disk file, only for listed mods.
    pub fn resolve(&self, wire: &str) -> Option<PathBuf> {
        self.entries
            .iter()
            .find(|e| e.path == wire)
            .map(|e| PathBuf::from(&e.path))
    }

    /// `path1;path2;…;`, or the empty string when no mods are present.
    pub fn file_list(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{};", e.path))
            .collect()
    }

    /// `size1;size2;…;` matching [`Self::file_list`] order.
    pub fn size_list(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{};", e.size))
            .collect()
    }

    /// The `SR` reply: both lists concatenated, or `-` with nothing to send.
    pub fn listing(&self) -> String {
        let joined = format!("{}{}", self.file_list(), self.size_list());
        if joined.is_empty() {
            "-".to_string()
        } else {
            joined
        }
    }
}

fn wire_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_resource_dir(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("relay-res-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&p);
        p
    }

    #[test]
    fn empty_directory_lists_dash() -> anyhow::Result<()> {
        let dir = temp_resource_dir("empty");
        let index = ModIndex::scan(&dir)?;
        assert_eq!(index.count(), 0);
        assert_eq!(index.listing(), "-");
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn archives_enumerated_with_sizes() -> anyhow::Result<()> {
        let dir = temp_resource_dir("mods");
        std::fs::create_dir_all(dir.join("Client"))?;
        std::fs::write(dir.join("Client/track.zip"), vec![0u8; 128])?;
        std::fs::write(dir.join("Client/car.zip"), vec![0u8; 64])?;
        std::fs::write(dir.join("Client/readme.txt"), b"not a mod")?;

        let index = ModIndex::scan(&dir)?;
        assert_eq!(index.count(), 2);
        assert_eq!(index.total_size(), 192);
        assert!(index.file_list().ends_with("track.zip;"));
        assert_eq!(index.listing(), format!("{}{}", index.file_list(), index.size_list()));
        assert!(index.resolve(&index.entries()[0].path).is_some());
        assert!(index.resolve("Client/absent.zip").is_none());
        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
