use std::path::PathBuf;

use crate::collab::{Classification, ContentKind};
use crate::config::PathsConfig;

/// Chooses the directory a transfer writes into. The choice is made once, at
/// submission, and stays with the record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    download_dir: PathBuf,
    movies_dir: Option<PathBuf>,
    series_dir: Option<PathBuf>,
}

impl Placement {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            movies_dir: None,
            series_dir: None,
        }
    }

    pub fn from_paths(paths: &PathsConfig) -> Self {
        Self {
            download_dir: paths.download_dir.clone(),
            movies_dir: paths.movies_dir.clone(),
            series_dir: paths.series_dir.clone(),
        }
    }

    pub fn with_library_dirs(mut self, movies: Option<PathBuf>, series: Option<PathBuf>) -> Self {
        self.movies_dir = movies;
        self.series_dir = series;
        self
    }

    pub fn destination(&self, classification: &Classification) -> PathBuf {
        match classification.kind {
            ContentKind::Series => match &self.series_dir {
                Some(series) => {
                    let show = series.join(sanitize_component(&classification.title));
                    match classification.season {
                        Some(season) => show.join(format!("Season {season:02}")),
                        None => show,
                    }
                }
                None => self.download_dir.clone(),
            },
            ContentKind::Movie => self
                .movies_dir
                .clone()
                .unwrap_or_else(|| self.download_dir.clone()),
            ContentKind::Other => self.download_dir.clone(),
        }
    }
}

/// Make `name` usable as a single path component on common filesystems.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_matches(|c: char| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "Unknown".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(kind: ContentKind, title: &str, season: Option<u32>) -> Classification {
        Classification {
            kind,
            title: title.into(),
            season,
            episode: None,
        }
    }

    fn placement() -> Placement {
        Placement::new("/dl").with_library_dirs(Some("/lib/movies".into()), Some("/lib/tv".into()))
    }

    #[test]
    fn series_land_in_a_season_folder() {
        let dest = placement().destination(&classified(ContentKind::Series, "The Show", Some(3)));
        assert_eq!(dest, PathBuf::from("/lib/tv/The Show/Season 03"));
        let dest = placement().destination(&classified(ContentKind::Series, "The Show", None));
        assert_eq!(dest, PathBuf::from("/lib/tv/The Show"));
    }

    #[test]
    fn movies_and_others() {
        assert_eq!(
            placement().destination(&classified(ContentKind::Movie, "Film", None)),
            PathBuf::from("/lib/movies")
        );
        assert_eq!(
            placement().destination(&classified(ContentKind::Other, "x", None)),
            PathBuf::from("/dl")
        );
        assert_eq!(
            Placement::new("/dl").destination(&classified(ContentKind::Series, "S", Some(1))),
            PathBuf::from("/dl")
        );
    }

    #[test]
    fn sanitizer_strips_separators_and_dots() {
        assert_eq!(sanitize_component("../etc/passwd"), "etc passwd");
        assert_eq!(sanitize_component("What? Now: Part 2"), "What Now Part 2");
        assert_eq!(sanitize_component("..."), "Unknown");
    }
}
