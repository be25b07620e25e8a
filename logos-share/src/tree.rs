//! File tree codec: flat path lists ⇄ nested snapshots, and
//! non-destructive materialization of a snapshot into a store.
//!
//! ```text
//! ["src/main.rs", "src/ui/app.rs", "README.md"]
//!        │ encode
//!        ▼
//! src/            (directory)
//! ├── main.rs     (leaf, "rs")
//! └── ui/
//!     └── app.rs
//! README.md       (leaf, "md")
//!        │ materialize
//!        ▼
//! phase 1: create_directory × N   ──┐ join_all
//! phase 2: create_file      × M   ──┘ join_all (only if absent)
//! ```
//!
//! Materialization creates structure only. Content arrives separately as
//! `code change` events, so an existing file is never overwritten here.

use futures_util::future::join_all;

use crate::error::StoreError;
use crate::protocol::{DocPath, TreeNode, TreeSnapshot};
use crate::workspace::WorkspaceStore;

/// Build a snapshot from `/`-separated relative paths.
///
/// Order within each directory is first-appearance order. Empty segments
/// are ignored and duplicate paths collapse.
pub fn encode<I, S>(paths: I) -> TreeSnapshot
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut root: Vec<TreeNode> = Vec::new();
    for path in paths {
        let segments: Vec<&str> = path.as_ref().split('/').filter(|s| !s.is_empty()).collect();
        insert(&mut root, &segments);
    }
    TreeSnapshot::new(root)
}

/// Snapshot of the given document paths.
pub fn encode_paths(paths: &[DocPath]) -> TreeSnapshot {
    encode(paths.iter().map(ToString::to_string))
}

fn insert(level: &mut Vec<TreeNode>, segments: &[&str]) {
    let Some((name, rest)) = segments.split_first() else {
        return;
    };
    let idx = match level.iter().position(|n| n.filename == *name) {
        Some(idx) => idx,
        None => {
            level.push(if rest.is_empty() {
                TreeNode::file(*name)
            } else {
                TreeNode::directory(*name)
            });
            level.len() - 1
        }
    };
    if rest.is_empty() {
        return;
    }
    let node = &mut level[idx];
    if node.is_leaf() {
        // Something continues past it, so it is a directory after all.
        *node = TreeNode::directory(node.filename.clone());
    }
    insert(&mut node.children, rest);
}

/// Flatten a snapshot back into the file paths it describes, depth first.
pub fn leaf_paths(snapshot: &TreeSnapshot) -> Vec<String> {
    fn walk(nodes: &[TreeNode], prefix: &str, out: &mut Vec<String>) {
        for node in nodes {
            let path = if prefix.is_empty() {
                node.filename.clone()
            } else {
                format!("{prefix}/{}", node.filename)
            };
            if node.is_directory {
                walk(&node.children, &path, out);
            } else {
                out.push(path);
            }
        }
    }
    let mut out = Vec::new();
    walk(&snapshot.children, "", &mut out);
    out
}

/// Outcome of a materialization, one entry per attempted operation.
#[derive(Debug, Default)]
pub struct MaterializeReport {
    /// Directories ensured (new or already present).
    pub directories: usize,
    pub files_created: usize,
    /// Leaves left untouched because a file was already there.
    pub files_existing: usize,
    /// Leaves not attempted because a parent directory failed.
    pub skipped: Vec<DocPath>,
    pub failures: Vec<(DocPath, StoreError)>,
}

impl MaterializeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Default)]
struct Plan {
    directories: Vec<DocPath>,
    files: Vec<DocPath>,
    invalid: Vec<(String, StoreError)>,
}

fn plan(nodes: &[TreeNode], parent: Option<&DocPath>, out: &mut Plan) {
    for node in nodes {
        let path = match parent {
            Some(parent) => parent.join(node.filename.clone()),
            None => DocPath::new([node.filename.clone()]),
        };
        let path = match path {
            Ok(path) => path,
            Err(e) => {
                // Unusable name: the whole subtree goes with it.
                out.invalid.push((node.filename.clone(), e.into()));
                continue;
            }
        };
        if node.is_directory {
            out.directories.push(path.clone());
            plan(&node.children, Some(&path), out);
        } else {
            out.files.push(path);
        }
    }
}

/// Create every directory and missing file of `snapshot` in `store`.
///
/// All directory creations run concurrently and complete before any file
/// is created. A file whose parent directory failed is skipped rather than
/// attempted. Store errors are collected in the report, never swallowed.
pub async fn materialize<S>(snapshot: &TreeSnapshot, store: &S) -> MaterializeReport
where
    S: WorkspaceStore + ?Sized,
{
    let mut plan_out = Plan::default();
    plan(&snapshot.children, None, &mut plan_out);

    let mut report = MaterializeReport::default();
    for (name, err) in plan_out.invalid {
        log::warn!("Skipping snapshot entry {name:?}: {err}");
    }

    let dir_results = join_all(
        plan_out
            .directories
            .iter()
            .map(|dir| store.create_directory(dir)),
    )
    .await;

    let mut failed_dirs: Vec<DocPath> = Vec::new();
    for (dir, result) in plan_out.directories.into_iter().zip(dir_results) {
        match result {
            Ok(()) => report.directories += 1,
            Err(e) => {
                log::error!("Failed to create directory {dir}: {e}");
                failed_dirs.push(dir.clone());
                report.failures.push((dir, e));
            }
        }
    }

    let (files, skipped): (Vec<DocPath>, Vec<DocPath>) =
        plan_out.files.into_iter().partition(|file| {
            let ancestors = file.ancestors();
            !failed_dirs.iter().any(|dir| ancestors.contains(dir))
        });
    report.skipped = skipped;

    let file_results = join_all(files.iter().map(|file| store.create_file(file))).await;
    for (file, result) in files.into_iter().zip(file_results) {
        match result {
            Ok(true) => report.files_created += 1,
            Ok(false) => report.files_existing += 1,
            Err(e) => {
                log::error!("Failed to create file {file}: {e}");
                report.failures.push((file, e));
            }
        }
    }

    log::debug!(
        "Materialized snapshot: {} dirs, {} new files, {} kept, {} skipped, {} failures",
        report.directories,
        report.files_created,
        report.files_existing,
        report.skipped.len(),
        report.failures.len()
    );
    report
}

/// Make sure `path` exists as a file, creating parents and an empty file
/// if needed. Existing content is left alone.
pub async fn ensure_document<S>(path: &DocPath, store: &S) -> Result<(), StoreError>
where
    S: WorkspaceStore + ?Sized,
{
    if store.exists(path).await? {
        return Ok(());
    }
    let snapshot = encode([path.to_string()]);
    let mut report = materialize(&snapshot, store).await;
    match report.failures.pop() {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::MemoryWorkspace;
    use async_trait::async_trait;
    use std::path::Path;

    fn names(nodes: &[TreeNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.filename.as_str()).collect()
    }

    #[test]
    fn test_encode_groups_by_prefix() {
        let snapshot = encode(["src/main.rs", "src/ui/app.rs", "README.md", "src/lib.rs"]);

        assert_eq!(names(&snapshot.children), vec!["src", "README.md"]);
        let src = &snapshot.children[0];
        assert!(src.is_directory);
        assert_eq!(src.extension, None);
        assert_eq!(names(&src.children), vec!["main.rs", "ui", "lib.rs"]);

        let readme = &snapshot.children[1];
        assert!(readme.is_leaf());
        assert_eq!(readme.extension.as_deref(), Some("md"));
        assert!(readme.children.is_empty());
    }

    #[test]
    fn test_encode_preserves_insertion_order() {
        let snapshot = encode(["z.txt", "a.txt", "m/x", "b.txt"]);
        assert_eq!(names(&snapshot.children), vec!["z.txt", "a.txt", "m", "b.txt"]);
    }

    #[test]
    fn test_encode_leaf_promoted_to_directory() {
        let snapshot = encode(["docs", "docs/guide.md"]);
        assert_eq!(snapshot.children.len(), 1);
        assert!(snapshot.children[0].is_directory);
        assert_eq!(names(&snapshot.children[0].children), vec!["guide.md"]);
    }

    #[test]
    fn test_encode_skips_empty_segments_and_duplicates() {
        let snapshot = encode(["a//b.txt", "a/b.txt", "", "/c"]);
        assert_eq!(names(&snapshot.children), vec!["a", "c"]);
        assert_eq!(snapshot.children[0].children.len(), 1);
    }

    #[test]
    fn test_leaf_paths_depth_first() {
        let snapshot = encode(["a/b/c.txt", "a/d.txt", "e"]);
        assert_eq!(leaf_paths(&snapshot), vec!["a/b/c.txt", "a/d.txt", "e"]);
    }

    #[tokio::test]
    async fn test_materialize_into_empty_store() {
        let store = MemoryWorkspace::new("/peer");
        let snapshot = encode(["src/main.rs", "src/ui/app.rs", "README.md"]);

        let report = materialize(&snapshot, &store).await;
        assert!(report.is_clean());
        assert_eq!(report.directories, 2);
        assert_eq!(report.files_created, 3);
        assert_eq!(store.list_all_files().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_materialize_never_overwrites() {
        let store = MemoryWorkspace::new("/peer");
        store.insert("src/main.rs", "fn main() {}").await.unwrap();

        let snapshot = encode(["src/main.rs", "src/new.rs"]);
        let report = materialize(&snapshot, &store).await;

        assert_eq!(report.files_existing, 1);
        assert_eq!(report.files_created, 1);
        let main = DocPath::parse("src/main.rs").unwrap();
        assert_eq!(
            store.open_document(&main).await.unwrap().as_deref(),
            Some("fn main() {}")
        );
    }

    #[tokio::test]
    async fn test_round_trip_through_store() {
        let paths = ["lib/a.rs", "lib/deep/b.rs", "top.txt", "lib/c", "other/x.y.z"];
        let original = encode(paths);

        let store = MemoryWorkspace::new("/peer");
        materialize(&original, &store).await;

        let listed = store.list_all_files().await.unwrap();
        let again = encode_paths(&listed);
        assert_eq!(again.sorted(), original.sorted());
    }

    #[tokio::test]
    async fn test_ensure_document_creates_parents() {
        let store = MemoryWorkspace::new("/peer");
        let path = DocPath::parse("x/y/z.md").unwrap();

        ensure_document(&path, &store).await.unwrap();
        assert!(store.exists(&path).await.unwrap());
        assert_eq!(store.directory_count().await, 2);

        store.write_document(&path, "body").await.unwrap();
        ensure_document(&path, &store).await.unwrap();
        assert_eq!(store.open_document(&path).await.unwrap().as_deref(), Some("body"));
    }

    #[tokio::test]
    async fn test_materialize_deep_tree_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::workspace::FsWorkspace::new(dir.path());
        std::fs::create_dir_all(dir.path().join("a/b")).unwrap();
        std::fs::write(dir.path().join("a/b/kept.txt"), "mine").unwrap();

        let paths = [
            "a/b/c/d/e/f.txt",
            "a/b/c/d/g.rs",
            "a/b/kept.txt",
            "a/h/i/j.md",
            "k/l/m/n/o/p/q.json",
            "root.toml",
        ];
        let snapshot = encode(paths);
        let report = materialize(&snapshot, &store).await;

        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.files_created, 5);
        assert_eq!(report.files_existing, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a/b/kept.txt")).unwrap(),
            "mine"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("k/l/m/n/o/p/q.json")).unwrap(),
            ""
        );

        let listed = store.list_all_files().await.unwrap();
        assert_eq!(encode_paths(&listed).sorted(), snapshot.sorted());
    }

    /// Store that refuses to create one directory.
    struct FailingDir {
        inner: MemoryWorkspace,
        refuse: DocPath,
    }

    #[async_trait]
    impl WorkspaceStore for FailingDir {
        fn root(&self) -> &Path {
            self.inner.root()
        }
        async fn find_files(&self, pattern: &str) -> Result<Vec<DocPath>, StoreError> {
            self.inner.find_files(pattern).await
        }
        async fn open_document(&self, path: &DocPath) -> Result<Option<String>, StoreError> {
            self.inner.open_document(path).await
        }
        async fn create_directory(&self, path: &DocPath) -> Result<(), StoreError> {
            if *path == self.refuse {
                return Err(StoreError::io(
                    path.to_string(),
                    std::io::Error::from(std::io::ErrorKind::PermissionDenied),
                ));
            }
            self.inner.create_directory(path).await
        }
        async fn create_file(&self, path: &DocPath) -> Result<bool, StoreError> {
            self.inner.create_file(path).await
        }
        async fn write_document(&self, path: &DocPath, content: &str) -> Result<(), StoreError> {
            self.inner.write_document(path, content).await
        }
        async fn exists(&self, path: &DocPath) -> Result<bool, StoreError> {
            self.inner.exists(path).await
        }
    }

    #[tokio::test]
    async fn test_failed_directory_skips_subtree() {
        let store = FailingDir {
            inner: MemoryWorkspace::new("/peer"),
            refuse: DocPath::parse("locked").unwrap(),
        };
        let snapshot = encode(["locked/a.txt", "locked/sub/b.txt", "open/c.txt"]);

        let report = materialize(&snapshot, &store).await;
        assert!(!report.is_clean());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0.to_string(), "locked");
        let skipped: Vec<String> = report.skipped.iter().map(ToString::to_string).collect();
        assert_eq!(skipped, vec!["locked/a.txt", "locked/sub/b.txt"]);
        assert_eq!(report.files_created, 1);
    }

    #[tokio::test]
    async fn test_invalid_names_are_ignored() {
        let store = MemoryWorkspace::new("/peer");
        let snapshot = TreeSnapshot::new(vec![
            TreeNode::directory("..").with_children(vec![TreeNode::file("evil.sh")]),
            TreeNode::file("ok.txt"),
        ]);
        let report = materialize(&snapshot, &store).await;
        assert_eq!(report.files_created, 1);
        assert_eq!(store.list_all_files().await.unwrap().len(), 1);
    }
}
