use crate::hasher::digest;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveMethod {
    Linked,
    Copied,
}

/// Ancestors of `path` that do not exist yet, outermost first.
pub fn missing_ancestors(path: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = path
        .ancestors()
        .skip(1)
        .take_while(|dir| !dir.as_os_str().is_empty() && dir.symlink_metadata().is_err())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

/// Create the parent directories of `path`; returns the ones this call created.
pub fn ensure_parent(path: &Path) -> io::Result<Vec<PathBuf>> {
    let missing = missing_ancestors(path);
    let mut created = Vec::with_capacity(missing.len());
    for dir in missing {
        match fs::create_dir(&dir) {
            Ok(()) => created.push(dir),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(created)
}

/// Move `from` to `to` without ever replacing an existing `to`.
///
/// A hard link plus unlink keeps the operation atomic with respect to the
/// destination name. Where linking is impossible (another filesystem), the
/// content is copied into a freshly created file, synced, verified and only
/// then is the source removed.
pub fn move_no_clobber(from: &Path, to: &Path) -> io::Result<MoveMethod> {
    match fs::hard_link(from, to) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(from) {
                let _ = fs::remove_file(to);
                return Err(e);
            }
            trace!("Linked {} -> {}", from.display(), to.display());
            Ok(MoveMethod::Linked)
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) if from.symlink_metadata().is_err() => Err(e),
        Err(link_err) => {
            debug!(
                "Hard link {} -> {} failed ({}), copying",
                from.display(),
                to.display(),
                link_err
            );
            copy_then_remove(from, to)?;
            Ok(MoveMethod::Copied)
        }
    }
}

fn copy_then_remove(from: &Path, to: &Path) -> io::Result<()> {
    let mut source = File::open(from)?;
    let modified = source.metadata()?.modified()?;
    let mut target = OpenOptions::new().write(true).create_new(true).open(to)?;

    let copied = io::copy(&mut source, &mut target)
        .and_then(|_| target.set_modified(modified))
        .and_then(|_| target.sync_all());
    drop(target);
    if let Err(e) = copied {
        let _ = fs::remove_file(to);
        return Err(e);
    }

    let threshold = crate::config::DEFAULT_STREAMING_THRESHOLD;
    if digest::hash_file(from, threshold)? != digest::hash_file(to, threshold)? {
        let _ = fs::remove_file(to);
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("copy of {} does not match its source", from.display()),
        ));
    }
    fs::remove_file(from)
}

/// Remove `dirs` innermost first, leaving any that are not empty.
pub fn remove_empty_dirs(dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for dir in dirs.iter().rev() {
        match fs::remove_dir(dir) {
            Ok(()) => removed.push(dir.clone()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => trace!("Keeping {}: {}", dir.display(), e),
        }
    }
    removed
}

/// Flush directory metadata so a rename or link survives a crash.
pub fn sync_dir(dir: &Path) {
    if !cfg!(unix) {
        return;
    }
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to sync directory {}: {}", dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_move_no_clobber_refuses_existing_destination() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        fs::write(&b, "beta").unwrap();

        assert!(move_no_clobber(&a, &b).is_err());
        assert_eq!(fs::read_to_string(&a).unwrap(), "alpha");
        assert_eq!(fs::read_to_string(&b).unwrap(), "beta");
    }

    #[test]
    fn test_move_no_clobber_moves() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "alpha").unwrap();
        move_no_clobber(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read_to_string(&b).unwrap(), "alpha");
    }

    #[test]
    fn test_copy_fallback_keeps_content_and_mtime() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        fs::write(&a, vec![7u8; 4096]).unwrap();
        let before = fs::metadata(&a).unwrap().modified().unwrap();
        copy_then_remove(&a, &b).unwrap();
        assert!(!a.exists());
        assert_eq!(fs::read(&b).unwrap(), vec![7u8; 4096]);
        assert_eq!(fs::metadata(&b).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_ensure_parent_reports_created_dirs_and_cleanup() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("x/y/z/file.txt");
        let created = ensure_parent(&target).unwrap();
        assert_eq!(
            created,
            vec![dir.path().join("x"), dir.path().join("x/y"), dir.path().join("x/y/z")]
        );
        assert!(ensure_parent(&target).unwrap().is_empty());

        let removed = remove_empty_dirs(&created);
        assert_eq!(removed.len(), 3);
        assert!(!dir.path().join("x").exists());
    }
}
