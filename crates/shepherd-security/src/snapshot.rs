use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use shepherd_core::{ShepherdError, ShepherdResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Content hashes of every file under a working tree, keyed by relative path
/// with `/` separators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    files: BTreeMap<String, String>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeDiff {
    /// Files that did not exist before.
    pub added: Vec<String>,
    /// Files whose contents changed.
    pub changed: Vec<String>,
    /// Files that were removed.
    pub deleted: Vec<String>,
}

impl TreeDiff {
    /// No file was touched.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Every written path: added, changed and deleted.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.added
            .iter()
            .chain(&self.changed)
            .chain(&self.deleted)
            .map(String::as_str)
    }
}

/// Compile `patterns` into one matcher. An empty list matches nothing.
pub fn build_globset(patterns: &[String]) -> ShepherdResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| ShepherdError::Security(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| ShepherdError::Security(format!("invalid glob set: {e}")))
}

impl TreeSnapshot {
    /// Number of files captured.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Content hash recorded for `path`.
    pub fn hash_of(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    /// Walk `root` and hash every regular file not matched by `ignore`.
    pub async fn capture(root: &Path, ignore: &[String]) -> ShepherdResult<Self> {
        let root: PathBuf = root.to_path_buf();
        let ignore = build_globset(ignore)?;
        tokio::task::spawn_blocking(move || Self::capture_blocking(&root, &ignore))
            .await
            .map_err(|e| ShepherdError::Security(format!("snapshot task failed: {e}")))?
    }

    fn capture_blocking(root: &Path, ignore: &GlobSet) -> ShepherdResult<Self> {
        let mut files = BTreeMap::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter();
        let keep = |e: &walkdir::DirEntry| match e.path().strip_prefix(root) {
            Ok(rel) if rel.as_os_str().is_empty() => true,
            Ok(rel) => !is_ignored(ignore, rel, e.file_type().is_dir()),
            Err(_) => true,
        };
        for entry in walker.filter_entry(keep) {
            let entry = entry.map_err(|e| ShepherdError::Security(format!("walk failed: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(root) else {
                continue;
            };
            let bytes = match std::fs::read(entry.path()) {
                Ok(bytes) => bytes,
                // Removed between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            files.insert(relative_key(rel), hex::encode(Sha256::digest(&bytes)));
        }
        debug!(root = %root.display(), files = files.len(), "Working tree captured");
        Ok(Self { files })
    }

    /// Paths added, changed or deleted going from `self` to `after`.
    pub fn diff(&self, after: &TreeSnapshot) -> TreeDiff {
        let mut diff = TreeDiff::default();
        for (path, hash) in &after.files {
            match self.files.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != hash => diff.changed.push(path.clone()),
                Some(_) => {}
            }
        }
        for path in self.files.keys() {
            if !after.files.contains_key(path) {
                diff.deleted.push(path.clone());
            }
        }
        diff
    }
}

fn relative_key(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_ignored(ignore: &GlobSet, rel: &Path, is_dir: bool) -> bool {
    let key = relative_key(rel);
    // `dir/**` patterns should also prune the directory itself.
    ignore.is_match(&key) || (is_dir && ignore.is_match(format!("{key}/x")))
}
