//! Workspace store: the file primitives the session needs.
//!
//! Two implementations ship:
//! - [`FsWorkspace`]: a directory on disk (`tokio::fs`, `walkdir`, `glob`)
//! - [`MemoryWorkspace`]: in-memory, insertion-ordered, for tests and
//!   headless peers

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use tokio::sync::RwLock;

use crate::config::ShareConfig;
use crate::error::StoreError;
use crate::protocol::DocPath;

/// Pattern matching every file.
pub const ALL_FILES: &str = "**/*";

/// Primitive file operations on a workspace rooted somewhere.
///
/// Paths are always relative to the workspace root.
#[async_trait]
pub trait WorkspaceStore: Send + Sync {
    /// Absolute root directory; used to relativize editor paths.
    fn root(&self) -> &Path;

    /// Files whose `/`-separated relative path matches the glob `pattern`.
    async fn find_files(&self, pattern: &str) -> Result<Vec<DocPath>, StoreError>;

    /// Every file in the workspace.
    async fn list_all_files(&self) -> Result<Vec<DocPath>, StoreError> {
        self.find_files(ALL_FILES).await
    }

    /// Full text of a document, `None` if it does not exist.
    async fn open_document(&self, path: &DocPath) -> Result<Option<String>, StoreError>;

    /// Create a directory and any missing parents. Already existing is fine.
    async fn create_directory(&self, path: &DocPath) -> Result<(), StoreError>;

    /// Create an empty file unless one exists. Returns whether it was created.
    ///
    /// Never touches the content of an existing file.
    async fn create_file(&self, path: &DocPath) -> Result<bool, StoreError>;

    /// Replace a document's content, creating the file if needed.
    async fn write_document(&self, path: &DocPath, content: &str) -> Result<(), StoreError>;

    async fn exists(&self, path: &DocPath) -> Result<bool, StoreError>;
}

pub(crate) fn compile_pattern(pattern: &str) -> Result<Pattern, StoreError> {
    Pattern::new(pattern).map_err(|e| StoreError::Pattern {
        pattern: pattern.to_string(),
        reason: e.msg.to_string(),
    })
}

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// Glob-escaped form of a path, for exact lookups through `find_files`.
pub fn exact_pattern(path: &DocPath) -> String {
    Pattern::escape(&path.to_string())
}

/// Compiled exclude globs.
///
/// A pattern of the form `dir/**` also prunes the directory `dir` itself,
/// so excluded trees are never descended into.
#[derive(Debug, Default)]
struct Exclusions {
    files: Vec<Pattern>,
    dirs: Vec<Pattern>,
}

impl Exclusions {
    fn compile<I, S>(patterns: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exclusions = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            exclusions.files.push(compile_pattern(pattern)?);
            if let Some(dir) = pattern.strip_suffix("/**").filter(|d| !d.is_empty()) {
                exclusions.dirs.push(compile_pattern(dir)?);
            }
        }
        Ok(exclusions)
    }

    fn excludes_file(&self, rel: &str) -> bool {
        let opts = match_options();
        self.files.iter().any(|p| p.matches_with(rel, opts))
    }

    fn prunes_dir(&self, rel: &str) -> bool {
        let opts = match_options();
        self.dirs.iter().any(|p| p.matches_with(rel, opts)) || self.excludes_file(rel)
    }
}

/// Workspace backed by a directory on disk.
///
/// Listing follows symlinks. Entries that cannot be read are logged and
/// left out; only an unreadable root fails the listing.
pub struct FsWorkspace {
    root: PathBuf,
    exclude: Arc<Exclusions>,
}

impl FsWorkspace {
    /// Open a workspace at `root` with no exclusions.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exclude: Arc::new(Exclusions::default()),
        }
    }

    /// Open a workspace skipping files that match any of `exclude`.
    pub fn with_exclude<I, S>(root: impl Into<PathBuf>, exclude: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            root: root.into(),
            exclude: Arc::new(Exclusions::compile(exclude)?),
        })
    }

    /// Workspace described by a session config.
    pub fn from_config(config: &ShareConfig) -> Result<Self, StoreError> {
        Self::with_exclude(config.workspace_root.clone(), &config.exclude)
    }

    fn abs(&self, path: &DocPath) -> PathBuf {
        path.to_path(&self.root)
    }
}

/// Every non-excluded file under `root`, in file-name order per directory.
fn walk_files(root: &Path, exclude: &Exclusions) -> Result<Vec<DocPath>, StoreError> {
    let walker = walkdir::WalkDir::new(root)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            let Some(rel) = DocPath::relative_to(root, entry.path()) else {
                return true;
            };
            let rel = rel.to_string();
            if entry.file_type().is_dir() {
                !exclude.prunes_dir(&rel)
            } else {
                !exclude.excludes_file(&rel)
            }
        });

    let mut found = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                return Err(StoreError::io(path, std::io::Error::other(e.to_string())));
            }
            Err(e) => {
                log::warn!("Skipping unreadable workspace entry: {e}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = DocPath::relative_to(root, entry.path()) {
            found.push(rel);
        }
    }
    Ok(found)
}

#[async_trait]
impl WorkspaceStore for FsWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn find_files(&self, pattern: &str) -> Result<Vec<DocPath>, StoreError> {
        let pattern = compile_pattern(pattern)?;
        let root = self.root.clone();
        let exclude = self.exclude.clone();

        // walkdir is blocking
        let files = tokio::task::spawn_blocking(move || walk_files(&root, &exclude))
            .await
            .map_err(|e| StoreError::io(&self.root, std::io::Error::other(e.to_string())))??;

        let opts = match_options();
        Ok(files
            .into_iter()
            .filter(|path| pattern.matches_with(&path.to_string(), opts))
            .collect())
    }

    async fn open_document(&self, path: &DocPath) -> Result<Option<String>, StoreError> {
        let abs = self.abs(path);
        match tokio::fs::read_to_string(&abs).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(abs, e)),
        }
    }

    async fn create_directory(&self, path: &DocPath) -> Result<(), StoreError> {
        let abs = self.abs(path);
        tokio::fs::create_dir_all(&abs)
            .await
            .map_err(|e| StoreError::io(abs, e))
    }

    async fn create_file(&self, path: &DocPath) -> Result<bool, StoreError> {
        let abs = self.abs(path);
        let result = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&abs)
            .await;
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StoreError::io(abs, e)),
        }
    }

    async fn write_document(&self, path: &DocPath, content: &str) -> Result<(), StoreError> {
        let abs = self.abs(path);
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        tokio::fs::write(&abs, content)
            .await
            .map_err(|e| StoreError::io(abs, e))
    }

    async fn exists(&self, path: &DocPath) -> Result<bool, StoreError> {
        let abs = self.abs(path);
        tokio::fs::try_exists(&abs)
            .await
            .map_err(|e| StoreError::io(abs, e))
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Directory,
    File(String),
}

/// In-memory workspace. Listing returns files in creation order.
pub struct MemoryWorkspace {
    root: PathBuf,
    entries: RwLock<Vec<(DocPath, Entry)>>,
}

impl MemoryWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Seed a file (and its parent directories) with content.
    pub async fn insert(&self, path: &str, content: &str) -> Result<(), StoreError> {
        let path = DocPath::parse(path)?;
        self.write_document(&path, content).await
    }

    /// Number of directories, for assertions.
    pub async fn directory_count(&self) -> usize {
        self.entries
            .read()
            .await
            .iter()
            .filter(|(_, e)| matches!(e, Entry::Directory))
            .count()
    }

    fn position(entries: &[(DocPath, Entry)], path: &DocPath) -> Option<usize> {
        entries.iter().position(|(p, _)| p == path)
    }

    fn ensure_parents(entries: &mut Vec<(DocPath, Entry)>, path: &DocPath) -> Result<(), StoreError> {
        for ancestor in path.ancestors() {
            match Self::position(entries, &ancestor) {
                Some(idx) => {
                    if let Entry::File(_) = entries[idx].1 {
                        return Err(StoreError::io(
                            ancestor.to_string(),
                            std::io::Error::other("parent is a file"),
                        ));
                    }
                }
                None => entries.push((ancestor, Entry::Directory)),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl WorkspaceStore for MemoryWorkspace {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn find_files(&self, pattern: &str) -> Result<Vec<DocPath>, StoreError> {
        let pattern = compile_pattern(pattern)?;
        let opts = match_options();
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|(p, e)| matches!(e, Entry::File(_)) && pattern.matches_with(&p.to_string(), opts))
            .map(|(p, _)| p.clone())
            .collect())
    }

    async fn open_document(&self, path: &DocPath) -> Result<Option<String>, StoreError> {
        let entries = self.entries.read().await;
        match Self::position(&entries, path).map(|idx| &entries[idx].1) {
            Some(Entry::File(text)) => Ok(Some(text.clone())),
            Some(Entry::Directory) => Err(StoreError::io(
                path.to_string(),
                std::io::Error::other("is a directory"),
            )),
            None => Ok(None),
        }
    }

    async fn create_directory(&self, path: &DocPath) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        Self::ensure_parents(&mut entries, path)?;
        match Self::position(&entries, path).map(|idx| &entries[idx].1) {
            Some(Entry::Directory) => Ok(()),
            Some(Entry::File(_)) => Err(StoreError::io(
                path.to_string(),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            )),
            None => {
                entries.push((path.clone(), Entry::Directory));
                Ok(())
            }
        }
    }

    async fn create_file(&self, path: &DocPath) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        match Self::position(&entries, path).map(|idx| &entries[idx].1) {
            Some(Entry::File(_)) => return Ok(false),
            Some(Entry::Directory) => {
                return Err(StoreError::io(
                    path.to_string(),
                    std::io::Error::other("is a directory"),
                ))
            }
            None => {}
        }
        // Like the filesystem, the parent has to exist already.
        for ancestor in path.ancestors() {
            if !matches!(
                Self::position(&entries, &ancestor).map(|idx| &entries[idx].1),
                Some(Entry::Directory)
            ) {
                return Err(StoreError::io(
                    path.to_string(),
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
        }
        entries.push((path.clone(), Entry::File(String::new())));
        Ok(true)
    }

    async fn write_document(&self, path: &DocPath, content: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        Self::ensure_parents(&mut entries, path)?;
        match Self::position(&entries, path) {
            Some(idx) => match &mut entries[idx].1 {
                Entry::File(text) => {
                    *text = content.to_string();
                    Ok(())
                }
                Entry::Directory => Err(StoreError::io(
                    path.to_string(),
                    std::io::Error::other("is a directory"),
                )),
            },
            None => {
                entries.push((path.clone(), Entry::File(content.to_string())));
                Ok(())
            }
        }
    }

    async fn exists(&self, path: &DocPath) -> Result<bool, StoreError> {
        Ok(Self::position(&self.entries.read().await, path).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> DocPath {
        DocPath::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_memory_create_file_keeps_content() {
        let store = MemoryWorkspace::new("/ws");
        store.insert("a.txt", "hello").await.unwrap();

        assert!(!store.create_file(&p("a.txt")).await.unwrap());
        assert_eq!(store.open_document(&p("a.txt")).await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_memory_create_file_requires_parent() {
        let store = MemoryWorkspace::new("/ws");
        assert!(store.create_file(&p("dir/a.txt")).await.is_err());

        store.create_directory(&p("dir")).await.unwrap();
        assert!(store.create_file(&p("dir/a.txt")).await.unwrap());
        assert_eq!(store.open_document(&p("dir/a.txt")).await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_memory_create_directory_idempotent() {
        let store = MemoryWorkspace::new("/ws");
        store.create_directory(&p("a/b")).await.unwrap();
        store.create_directory(&p("a/b")).await.unwrap();
        assert_eq!(store.directory_count().await, 2);
    }

    #[tokio::test]
    async fn test_memory_find_files_pattern() {
        let store = MemoryWorkspace::new("/ws");
        store.insert("src/main.rs", "").await.unwrap();
        store.insert("src/lib.rs", "").await.unwrap();
        store.insert("README.md", "").await.unwrap();

        let rs: Vec<String> = store
            .find_files("**/*.rs")
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(rs, vec!["src/main.rs", "src/lib.rs"]);

        let all = store.list_all_files().await.unwrap();
        assert_eq!(all.len(), 3);

        let exact = store.find_files(&exact_pattern(&p("README.md"))).await.unwrap();
        assert_eq!(exact, vec![p("README.md")]);
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let store = MemoryWorkspace::new("/ws");
        assert!(matches!(
            store.find_files("[").await,
            Err(StoreError::Pattern { .. })
        ));
    }

    #[tokio::test]
    async fn test_fs_create_file_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::new(dir.path());
        std::fs::write(dir.path().join("keep.txt"), "original").unwrap();

        assert!(!store.create_file(&p("keep.txt")).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("keep.txt")).unwrap(),
            "original"
        );

        assert!(store.create_file(&p("new.txt")).await.unwrap());
        assert_eq!(store.open_document(&p("new.txt")).await.unwrap().as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_fs_missing_document_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::new(dir.path());
        assert!(store.open_document(&p("nope.txt")).await.unwrap().is_none());
        assert!(!store.exists(&p("nope.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_listing_respects_exclude() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::with_exclude(dir.path(), ["**/node_modules/**"]).unwrap();
        store.write_document(&p("src/a.ts"), "a").await.unwrap();
        store
            .write_document(&p("web/node_modules/dep/index.js"), "x")
            .await
            .unwrap();
        store.create_directory(&p("empty")).await.unwrap();

        let all: Vec<String> = store
            .list_all_files()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(all, vec!["src/a.ts"]);
    }

    #[tokio::test]
    async fn test_fs_write_document_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::new(dir.path());
        store.write_document(&p("deep/er/file.md"), "# hi").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("deep/er/file.md")).unwrap(),
            "# hi"
        );
    }

    #[tokio::test]
    async fn test_fs_from_config_uses_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::from_config(&ShareConfig::for_workspace(dir.path())).unwrap();
        store.write_document(&p("main.rs"), "fn main() {}").await.unwrap();
        store.write_document(&p(".git/HEAD"), "ref").await.unwrap();
        store.write_document(&p("target/debug/out"), "bin").await.unwrap();

        assert_eq!(store.list_all_files().await.unwrap(), vec![p("main.rs")]);
    }

    #[test]
    fn test_exclusions_prune_excluded_directories() {
        let exclude = Exclusions::compile(["**/node_modules/**", "**/*.log"]).unwrap();
        assert!(exclude.prunes_dir("node_modules"));
        assert!(exclude.prunes_dir("web/node_modules"));
        assert!(!exclude.prunes_dir("web/src"));
        assert!(exclude.excludes_file("web/node_modules/dep/index.js"));
        assert!(exclude.excludes_file("build.log"));
        assert!(!exclude.excludes_file("src/main.rs"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fs_listing_skips_unreadable_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::with_exclude(dir.path(), ["**/node_modules/**"]).unwrap();
        store.write_document(&p("src/a.ts"), "a").await.unwrap();
        store.write_document(&p("src/b.ts"), "b").await.unwrap();
        store
            .write_document(&p("node_modules/dep/index.js"), "x")
            .await
            .unwrap();
        // Dangling link: walking it yields an entry error.
        std::os::unix::fs::symlink(dir.path().join("gone"), dir.path().join("src/broken")).unwrap();

        let all: Vec<String> = store
            .list_all_files()
            .await
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(all, vec!["src/a.ts", "src/b.ts"]);

        let exact = store.find_files(&exact_pattern(&p("src/b.ts"))).await.unwrap();
        assert_eq!(exact, vec![p("src/b.ts")]);
    }

    #[tokio::test]
    async fn test_fs_missing_root_fails_listing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsWorkspace::new(dir.path().join("absent"));
        assert!(matches!(
            store.list_all_files().await,
            Err(StoreError::Io { .. })
        ));
    }
}
