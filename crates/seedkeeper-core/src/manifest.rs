use serde::{Deserialize, Serialize};

use seedkeeper_engine::Metainfo;

use crate::units::human_size;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the destination directory, `/`-separated.
    pub path: String,
    pub size: u64,
}

impl ManifestEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }

    /// Lowercased extension including the leading dot, if the file has one.
    pub fn extension(&self) -> Option<String> {
        let file_name = self.path.rsplit('/').next().unwrap_or(&self.path);
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() || ext.is_empty() {
            return None;
        }
        Some(format!(".{}", ext.to_ascii_lowercase()))
    }
}

/// Resolved file list for one piece of content.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentManifest {
    pub entries: Vec<ManifestEntry>,
    pub digest: String,
    pub total_size: u64,
    pub display_name: String,
}

impl ContentManifest {
    pub fn new(display_name: impl Into<String>, digest: impl Into<String>, entries: Vec<ManifestEntry>) -> Self {
        let total_size = entries.iter().map(|e| e.size).sum();
        Self {
            entries,
            digest: digest.into(),
            total_size,
            display_name: display_name.into(),
        }
    }

    pub fn largest(&self) -> Option<&ManifestEntry> {
        self.entries.iter().max_by_key(|e| e.size)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} ({} files, {})",
            self.display_name,
            self.entries.len(),
            human_size(self.total_size)
        )
    }
}

impl From<Metainfo> for ContentManifest {
    fn from(meta: Metainfo) -> Self {
        let entries = meta
            .files
            .into_iter()
            .map(|f| ManifestEntry::new(f.path, f.length))
            .collect();
        ContentManifest::new(meta.name, meta.info_hash, entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seedkeeper_engine::metainfo::encode_descriptor;

    #[test]
    fn extension_is_lowercased_with_dot() {
        assert_eq!(ManifestEntry::new("Show/E01.MKV", 1).extension().as_deref(), Some(".mkv"));
        assert_eq!(ManifestEntry::new("README", 1).extension(), None);
        assert_eq!(ManifestEntry::new("dir.v2/.hidden", 1).extension(), None);
        assert_eq!(ManifestEntry::new("trailing.", 1).extension(), None);
    }

    #[test]
    fn built_from_metainfo_sums_sizes() {
        let bytes = encode_descriptor(
            "Film",
            &[("movie.mkv", 5_000_000_000), ("sample.txt", 1000)],
            1 << 20,
        );
        let manifest = ContentManifest::from(Metainfo::from_bytes(&bytes).expect("parse"));
        assert_eq!(manifest.total_size, 5_000_001_000);
        assert_eq!(manifest.entries.len(), 2);
        assert_eq!(manifest.largest().map(|e| e.path.as_str()), Some("Film/movie.mkv"));
        assert_eq!(manifest.summary(), "Film (2 files, 5 GB)");
    }
}
