use crate::config::AppConfig;
use crate::scanner::walk::compile_patterns;
use crate::Error;
use glob::Pattern;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Paths the engine must never touch, checked for both ends of every step.
#[derive(Debug, Clone)]
pub struct GuardSet {
    root: PathBuf,
    /// Areas outside `root` the engine owns (state directory).
    managed: Vec<PathBuf>,
    /// `root` and `managed` with symlinks resolved.
    real_root: PathBuf,
    real_managed: Vec<PathBuf>,
    guarded_roots: Vec<PathBuf>,
    markers: Vec<String>,
    protected: Vec<Pattern>,
}

impl GuardSet {
    pub fn new(root: &Path, config: &AppConfig) -> Self {
        let managed = vec![config.state_dir_for(root)];
        Self {
            root: root.to_path_buf(),
            real_root: real_dir(root),
            real_managed: managed.iter().map(|m| real_dir(m)).collect(),
            managed,
            guarded_roots: config.guarded_roots.iter().map(PathBuf::from).collect(),
            markers: config.guard_markers.clone(),
            protected: compile_patterns(&config.protected_patterns),
        }
    }

    /// Refuse `path` if it leaves the managed areas, sits under a guarded
    /// root or marker directory, or matches a protected pattern.
    ///
    /// Containment and markers are judged on the path with symlinks in its
    /// directories resolved, so a linked folder cannot lead outside the root
    /// or into a guarded tree.
    pub fn check(&self, path: &Path) -> Result<(), Error> {
        let real = self.check_contained(path)?;

        if let Some(guarded) = self
            .guarded_roots
            .iter()
            .find(|g| path.starts_with(g) || real.starts_with(g))
        {
            return Err(Error::GuardedPath {
                path: path.to_path_buf(),
                guard: format!("under guarded root {}", guarded.display()),
            });
        }

        if let Some(name) = path.file_name().map(|n| n.to_string_lossy()) {
            if let Some(pattern) = self.protected.iter().find(|p| p.matches(&name)) {
                return Err(Error::GuardedPath {
                    path: path.to_path_buf(),
                    guard: format!("protected pattern '{}'", pattern.as_str()),
                });
            }
        }

        if real.starts_with(&self.real_root) {
            for dir in real.ancestors().skip(1) {
                if let Some(marker) = self
                    .markers
                    .iter()
                    .find(|m| dir.join(m.as_str()).symlink_metadata().is_ok())
                {
                    return Err(Error::GuardedPath {
                        path: path.to_path_buf(),
                        guard: format!("marker '{}' in {}", marker, dir.display()),
                    });
                }
                if dir == self.real_root {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Returns `path` with its directories resolved.
    fn check_contained(&self, path: &Path) -> Result<PathBuf, Error> {
        let escapes = || Error::EscapesRoot {
            path: path.to_path_buf(),
            root: self.root.clone(),
        };
        let lexically_clean = path.is_absolute()
            && !path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::CurDir));
        let inside = path.starts_with(&self.root) || self.managed.iter().any(|m| path.starts_with(m));
        if !(lexically_clean && inside) {
            return Err(escapes());
        }

        let real = resolve_dirs(path);
        let really_inside =
            real.starts_with(&self.real_root) || self.real_managed.iter().any(|m| real.starts_with(m));
        if !really_inside {
            warn!("{} resolves to {}", path.display(), real.display());
            return Err(escapes());
        }
        Ok(real)
    }
}

fn real_dir(dir: &Path) -> PathBuf {
    fs::canonicalize(dir).unwrap_or_else(|_| resolve_dirs(dir))
}

/// Canonicalize the deepest existing ancestor directory of `path` and append
/// the rest. The final component is never followed.
fn resolve_dirs(path: &Path) -> PathBuf {
    let mut tail: Vec<OsString> = Vec::new();
    let mut current = path;
    loop {
        let (Some(parent), Some(name)) = (current.parent(), current.file_name()) else {
            return path.to_path_buf();
        };
        tail.push(name.to_os_string());
        current = parent;
        if let Ok(mut real) = fs::canonicalize(current) {
            for part in tail.iter().rev() {
                real.push(part);
            }
            return real;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_marker_in_any_ancestor_guards_path() {
        let dir = tempdir().unwrap();
        let project = dir.path().join("Code/project");
        fs::create_dir_all(project.join(".git")).unwrap();
        let guards = GuardSet::new(dir.path(), &AppConfig::default());

        let err = guards.check(&project.join("src/main.rs")).unwrap_err();
        assert!(matches!(err, Error::GuardedPath { .. }));
        assert!(guards.check(&dir.path().join("Code/other.rs")).is_ok());
    }

    #[test]
    fn test_protected_patterns_and_guarded_roots() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            guarded_roots: vec![dir.path().join("vault").to_string_lossy().into_owned()],
            ..AppConfig::default()
        };
        let guards = GuardSet::new(dir.path(), &config);
        assert!(guards.check(&dir.path().join("important_taxes.pdf")).is_err());
        assert!(guards.check(&dir.path().join("server.key")).is_err());
        assert!(guards.check(&dir.path().join("vault/a.txt")).is_err());
        assert!(guards.check(&dir.path().join("taxes.pdf")).is_ok());
    }

    #[test]
    fn test_paths_outside_root_escape() {
        let dir = tempdir().unwrap();
        let guards = GuardSet::new(dir.path(), &AppConfig::default());
        let sneaky = dir.path().join("Documents/../../etc/passwd");
        assert!(matches!(
            guards.check(&sneaky).unwrap_err(),
            Error::EscapesRoot { .. }
        ));
        assert!(guards.check(Path::new("/etc/passwd")).is_err());
        assert!(guards
            .check(&dir.path().join(".reshelve/graveyard/x"))
            .is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_folder_cannot_lead_outside_or_into_guarded_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside");
        let checkout = dir.path().join("checkout");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::create_dir_all(checkout.join(".git")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("Documents")).unwrap();
        std::os::unix::fs::symlink(&checkout, root.join("Code")).unwrap();
        let guards = GuardSet::new(&root, &AppConfig::default());

        assert!(matches!(
            guards.check(&root.join("Documents/a.pdf")).unwrap_err(),
            Error::EscapesRoot { .. }
        ));
        assert!(matches!(
            guards.check(&root.join("Documents/new/deeper/a.pdf")).unwrap_err(),
            Error::EscapesRoot { .. }
        ));
        assert!(matches!(
            guards.check(&root.join("Code/main.rs")).unwrap_err(),
            Error::EscapesRoot { .. }
        ));
        assert!(guards.check(&root.join("Images/a.jpg")).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_to_guarded_checkout_is_refused() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("Projects/app/.git")).unwrap();
        std::os::unix::fs::symlink(root.join("Projects/app"), root.join("Shortcut")).unwrap();
        let guards = GuardSet::new(&root, &AppConfig::default());

        assert!(matches!(
            guards.check(&root.join("Shortcut/notes.txt")).unwrap_err(),
            Error::GuardedPath { .. }
        ));
    }
}
