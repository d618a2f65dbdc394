//! Size and file-type policy over a resolved manifest.
//!
//! Everything here is pure. The type check is two-tiered: every substantial
//! entry must carry an allowed extension, and when nothing is substantial the
//! largest entry stands in for the whole item.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::manifest::{ContentManifest, ManifestEntry};
use crate::units::{human_size, MIB};

pub const DEFAULT_SUBSTANTIAL_FLOOR: u64 = 10 * MIB;
pub const DEFAULT_SUBSTANTIAL_PERCENT: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Rejection {
    TooLarge { total: u64, limit: u64 },
    Empty,
    DisallowedType { path: String, extension: Option<String> },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::TooLarge { total, limit } => write!(
                f,
                "content is {} which exceeds the {} limit",
                human_size(*total),
                human_size(*limit)
            ),
            Rejection::Empty => f.write_str("content lists no files"),
            Rejection::DisallowedType {
                path,
                extension: Some(ext),
            } => write!(f, "file type {ext} is not allowed ({path})"),
            Rejection::DisallowedType {
                path,
                extension: None,
            } => write!(f, "file without an extension is not allowed ({path})"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyValidator {
    max_total_bytes: u64,
    allowed_extensions: Vec<String>,
    substantial_floor: u64,
    substantial_percent: u8,
}

impl PolicyValidator {
    pub fn new<I, S>(max_total_bytes: u64, allowed_extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            max_total_bytes,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| normalize_extension(e.as_ref()))
                .filter(|e| e.len() > 1)
                .collect(),
            substantial_floor: DEFAULT_SUBSTANTIAL_FLOOR,
            substantial_percent: DEFAULT_SUBSTANTIAL_PERCENT,
        }
    }

    pub fn with_substantial(mut self, floor: u64, percent: u8) -> Self {
        self.substantial_floor = floor;
        self.substantial_percent = percent.min(100);
        self
    }

    pub fn max_total_bytes(&self) -> u64 {
        self.max_total_bytes
    }

    /// Entries strictly larger than this are held to the extension allowlist.
    pub fn substantial_threshold(&self) -> u64 {
        let share = (self.max_total_bytes as u128 * self.substantial_percent as u128 / 100) as u64;
        share.min(self.substantial_floor)
    }

    pub fn is_allowed(&self, entry: &ManifestEntry) -> bool {
        entry
            .extension()
            .is_some_and(|ext| self.allowed_extensions.iter().any(|a| *a == ext))
    }

    pub fn validate(&self, manifest: &ContentManifest) -> Option<Rejection> {
        if manifest.total_size > self.max_total_bytes {
            return Some(Rejection::TooLarge {
                total: manifest.total_size,
                limit: self.max_total_bytes,
            });
        }
        let Some(largest) = manifest.largest() else {
            return Some(Rejection::Empty);
        };
        let threshold = self.substantial_threshold();
        let mut substantial = manifest
            .entries
            .iter()
            .filter(|e| e.size > threshold)
            .peekable();
        if substantial.peek().is_none() {
            return (!self.is_allowed(largest)).then(|| disallowed(largest));
        }
        substantial.find(|e| !self.is_allowed(e)).map(disallowed)
    }

    pub fn check(&self, manifest: &ContentManifest) -> Result<(), Rejection> {
        match self.validate(manifest) {
            Some(rejection) => Err(rejection),
            None => Ok(()),
        }
    }
}

/// Single-call form with the default substantial-file threshold.
pub fn validate<S: AsRef<str>>(
    manifest: &ContentManifest,
    max_total_bytes: u64,
    allowed_extensions: &[S],
) -> Option<Rejection> {
    PolicyValidator::new(max_total_bytes, allowed_extensions).validate(manifest)
}

fn disallowed(entry: &ManifestEntry) -> Rejection {
    Rejection::DisallowedType {
        path: entry.path.clone(),
        extension: entry.extension(),
    }
}

fn normalize_extension(ext: &str) -> String {
    let trimmed = ext.trim().to_ascii_lowercase();
    if trimmed.starts_with('.') {
        trimmed
    } else {
        format!(".{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::GIB;
    use proptest::prelude::*;

    const MB: u64 = 1_000_000;

    fn manifest(entries: &[(&str, u64)]) -> ContentManifest {
        ContentManifest::new(
            "item",
            "digest",
            entries
                .iter()
                .map(|(p, s)| ManifestEntry::new(*p, *s))
                .collect(),
        )
    }

    fn video_only(max: u64) -> PolicyValidator {
        PolicyValidator::new(max, [".mkv", "MP4"])
    }

    #[test]
    fn small_extras_beside_a_large_payload_pass() {
        let m = manifest(&[("film.mkv", 600 * MB), ("extras.exe", 2 * MB)]);
        assert_eq!(video_only(10 * GIB).validate(&m), None);
    }

    #[test]
    fn every_substantial_entry_must_be_allowed() {
        let m = manifest(&[("film.mkv", 600 * MB), ("bonus.iso", 50 * MB)]);
        let rejection = video_only(10 * GIB).validate(&m).expect("rejected");
        assert_eq!(
            rejection,
            Rejection::DisallowedType {
                path: "bonus.iso".into(),
                extension: Some(".iso".into())
            }
        );
        assert!(rejection.to_string().contains(".iso"));
    }

    #[test]
    fn all_small_falls_back_to_largest_entry() {
        let ok = manifest(&[("clip.MP4", 3 * MB), ("notes.txt", 1000)]);
        assert_eq!(video_only(10 * GIB).validate(&ok), None);
        let bad = manifest(&[("clip.mp4", 1000), ("setup.exe", 3 * MB)]);
        assert!(matches!(
            video_only(10 * GIB).validate(&bad),
            Some(Rejection::DisallowedType { .. })
        ));
    }

    #[test]
    fn missing_extension_is_rejected() {
        let m = manifest(&[("payload", 600 * MB)]);
        let rejection = video_only(10 * GIB).validate(&m).expect("rejected");
        assert!(rejection.to_string().contains("without an extension"));
    }

    #[test]
    fn empty_manifest_is_rejected() {
        assert_eq!(
            validate(&manifest(&[]), 10 * GIB, &[".mkv"]),
            Some(Rejection::Empty)
        );
    }

    #[test]
    fn size_message_uses_human_units() {
        let m = manifest(&[("movie.mkv", 5_000_000_000), ("sample.txt", 1000)]);
        let rejection = validate(&m, GIB, &[".mkv", ".mp4"]).expect("too large");
        let text = rejection.to_string();
        assert!(text.contains("5 GB"), "{text}");
        assert!(text.contains("1 GB"), "{text}");
        assert_eq!(validate(&m, 10 * GIB, &[".mkv", ".mp4"]), None);
    }

    #[test]
    fn threshold_is_the_smaller_of_share_and_floor() {
        assert_eq!(video_only(10 * GIB).substantial_threshold(), 10 * MIB);
        assert_eq!(video_only(100 * MIB).substantial_threshold(), MIB);
        assert_eq!(
            video_only(100 * MIB)
                .with_substantial(10 * MIB, 50)
                .substantial_threshold(),
            10 * MIB
        );
    }

    proptest! {
        #[test]
        fn size_limit_is_inclusive(limit in 1u64..(1u64 << 50)) {
            let at = manifest(&[("a.mkv", limit)]);
            let over = manifest(&[("a.mkv", limit + 1)]);
            let validator = video_only(limit);
            prop_assert_eq!(validator.validate(&at), None);
            prop_assert_eq!(
                validator.validate(&over),
                Some(Rejection::TooLarge { total: limit + 1, limit })
            );
        }
    }
}
