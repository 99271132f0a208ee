//! Library path safety checks
//!
//! The dedup engine never trusts a stored file path: files get moved by hand,
//! storage gets remounted, entries go stale. [`resolve_library_path`] decides
//! what a stored path is worth now. Deletion decisions hinge on the result,
//! so a path that cannot be confirmed to live inside an allowed storage root
//! is reported [`PathResolution::Ambiguous`] and must never be treated as
//! missing.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

/// Outcome of resolving a stored library path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathResolution {
    /// File exists under an allowed root; the real path may differ from the
    /// stored one (symlinks, renamed parents).
    Healed(PathBuf),
    /// File confirmed absent under the allowed root it should live in.
    Missing,
    /// Path cannot be verified to be inside an allowed root. Leave the entry
    /// alone.
    Ambiguous,
}

/// Resolve a stored path against the allowed storage roots.
pub fn resolve_library_path(stored: &Path, allowed_roots: &[PathBuf]) -> PathResolution {
    let roots: Vec<PathBuf> = allowed_roots
        .iter()
        .map(|r| r.canonicalize().unwrap_or_else(|_| r.clone()))
        .collect();

    if stored.exists() {
        let real = match stored.canonicalize() {
            Ok(p) => p,
            Err(e) => {
                debug!(path = %stored.display(), error = %e, "Failed to canonicalize existing path");
                return PathResolution::Ambiguous;
            }
        };
        if roots.iter().any(|root| real.starts_with(root)) {
            return PathResolution::Healed(real);
        }
        // Exists, but outside every allowed root
        return PathResolution::Ambiguous;
    }

    // The file is gone from its stored location. Only a path that lexically
    // belongs to an allowed root earns a search; anything else is ambiguous.
    let Some(owning_root) = roots
        .iter()
        .zip(allowed_roots.iter())
        .find(|(canonical, raw)| stored.starts_with(canonical) || stored.starts_with(raw))
        .map(|(canonical, _)| canonical)
    else {
        return PathResolution::Ambiguous;
    };

    let Some(file_name) = stored.file_name() else {
        return PathResolution::Ambiguous;
    };

    // The file may have been reorganized within the library. One filename
    // scan before declaring it missing.
    for entry in WalkDir::new(owning_root)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && entry.file_name() == file_name {
            let found = entry.into_path();
            debug!(
                stored = %stored.display(),
                found = %found.display(),
                "Healed stale library path by filename search"
            );
            return PathResolution::Healed(found);
        }
    }

    PathResolution::Missing
}

/// Express `path` relative to `root`, when it is inside it.
pub fn relative_to_root(path: &Path, root: &Path) -> Option<PathBuf> {
    let canonical_root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    path.strip_prefix(&canonical_root)
        .or_else(|_| path.strip_prefix(root))
        .ok()
        .map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_existing_path_heals_in_place() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("a.flac");
        std::fs::write(&file, b"x").unwrap();

        let resolution = resolve_library_path(&file, &[root.path().to_path_buf()]);
        assert_eq!(
            resolution,
            PathResolution::Healed(file.canonicalize().unwrap())
        );
    }

    #[test]
    fn test_moved_file_is_found_by_search() {
        let root = tempfile::tempdir().unwrap();
        let old_dir = root.path().join("Old Artist");
        let new_dir = root.path().join("New Artist");
        std::fs::create_dir_all(&new_dir).unwrap();
        std::fs::write(new_dir.join("song.flac"), b"x").unwrap();

        let stored = old_dir.join("song.flac");
        let resolution = resolve_library_path(&stored, &[root.path().to_path_buf()]);
        assert_matches!(resolution, PathResolution::Healed(p) if p.ends_with("New Artist/song.flac"));
    }

    #[test]
    fn test_absent_file_inside_root_is_missing() {
        let root = tempfile::tempdir().unwrap();
        let stored = root.path().join("gone/away.flac");

        let resolution = resolve_library_path(&stored, &[root.path().to_path_buf()]);
        assert_eq!(resolution, PathResolution::Missing);
    }

    #[test]
    fn test_path_outside_roots_is_ambiguous() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let stored = elsewhere.path().join("nope.flac");

        let resolution = resolve_library_path(&stored, &[root.path().to_path_buf()]);
        assert_eq!(resolution, PathResolution::Ambiguous);

        // Even when the file actually exists there
        std::fs::write(&stored, b"x").unwrap();
        let resolution = resolve_library_path(&stored, &[root.path().to_path_buf()]);
        assert_eq!(resolution, PathResolution::Ambiguous);
    }

    #[test]
    fn test_relative_to_root() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("Artist/album/track.flac");
        let rel = relative_to_root(&file, root.path()).unwrap();
        assert_eq!(rel, PathBuf::from("Artist/album/track.flac"));
    }
}
