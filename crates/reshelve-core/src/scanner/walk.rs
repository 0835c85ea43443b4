use glob::Pattern;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error};
use walkdir::WalkDir;

/// A regular file found by the walk, not yet hashed.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub enum WalkItem {
    File(Candidate),
    /// Entry that could not be read; carries the reason.
    Unreadable(PathBuf, String),
    /// Directory holding a guard marker; its subtree was not descended into.
    Guarded(PathBuf, String),
}

#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub ignore_patterns: Vec<Pattern>,
    /// Engine-managed areas (duplicates area, state directory) never scanned.
    pub excluded_dirs: Vec<PathBuf>,
    pub guard_markers: Vec<String>,
    /// Skip every file at or before this path (restart cursor).
    pub resume_after: Option<PathBuf>,
}

pub fn compile_patterns(globs: &[String]) -> Vec<Pattern> {
    globs
        .iter()
        .filter_map(|glob| match Pattern::new(glob) {
            Ok(p) => Some(p),
            Err(e) => {
                error!("Invalid glob pattern '{}': {}", glob, e);
                None
            }
        })
        .collect()
}

/// Lazy, deterministic traversal. Siblings are visited in file-name order, so
/// the yielded sequence matches `Path` ordering and can be resumed from a cursor.
/// Skips symlinks and 0-byte files.
pub struct CandidateWalk {
    inner: walkdir::IntoIter,
    options: WalkOptions,
}

impl CandidateWalk {
    pub fn new(root: &Path, options: WalkOptions) -> Self {
        let inner = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();
        Self { inner, options }
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.options
            .excluded_dirs
            .iter()
            .any(|dir| path.starts_with(dir))
            || self
                .options
                .ignore_patterns
                .iter()
                .any(|pattern| pattern.matches_path(path))
    }

    fn guard_marker(&self, dir: &Path) -> Option<&str> {
        self.options
            .guard_markers
            .iter()
            .find(|marker| dir.join(marker.as_str()).symlink_metadata().is_ok())
            .map(|marker| marker.as_str())
    }

    fn before_cursor(&self, path: &Path) -> bool {
        match &self.options.resume_after {
            Some(cursor) => path <= cursor.as_path(),
            None => false,
        }
    }
}

impl Iterator for CandidateWalk {
    type Item = WalkItem;

    fn next(&mut self) -> Option<WalkItem> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err.path().map(Path::to_path_buf).unwrap_or_default();
                    error!("Error walking {}: {}", path.display(), err);
                    return Some(WalkItem::Unreadable(path, err.to_string()));
                }
            };

            let path = entry.path();
            let file_type = entry.file_type();

            if entry.depth() > 0 && self.is_excluded(path) {
                if file_type.is_dir() {
                    self.inner.skip_current_dir();
                }
                continue;
            }

            if file_type.is_dir() {
                if let Some(marker) = self.guard_marker(path) {
                    let reason = format!("guard marker '{}'", marker);
                    let guarded = path.to_path_buf();
                    debug!("Not descending into guarded {} ({})", guarded.display(), reason);
                    self.inner.skip_current_dir();
                    return Some(WalkItem::Guarded(guarded, reason));
                }
                continue;
            }

            if !file_type.is_file() || self.before_cursor(path) {
                continue;
            }

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(err) => {
                    return Some(WalkItem::Unreadable(path.to_path_buf(), err.to_string()));
                }
            };
            if metadata.len() == 0 {
                continue;
            }
            let modified = match metadata.modified() {
                Ok(t) => t,
                Err(err) => {
                    return Some(WalkItem::Unreadable(path.to_path_buf(), err.to_string()));
                }
            };

            return Some(WalkItem::File(Candidate {
                path: path.to_path_buf(),
                size: metadata.len(),
                modified,
            }));
        }
    }
}
