use crate::oracle::{RepoSearch, SearchHit};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};

/// Files larger than this are skipped by search.
const MAX_FILE_BYTES: u64 = 1024 * 1024;

const DEFAULT_EXCLUDES: &[&str] = &[
    ".git/**",
    "**/.git/**",
    "target/**",
    "**/node_modules/**",
    ".mergeloop/**",
];

/// Repository search over a local checkout.
pub struct LocalRepoSearch {
    root: PathBuf,
    exclude: GlobSet,
}

impl LocalRepoSearch {
    /// `exclude` globs are matched against paths relative to `root`, on top of
    /// the built-in excludes (`.git`, `target`, `node_modules`, `.mergeloop`).
    pub fn new(root: impl Into<PathBuf>, exclude: &[String]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in DEFAULT_EXCLUDES {
            builder.add(Glob::new(pattern)?);
        }
        for pattern in exclude {
            builder.add(Glob::new(pattern)?);
        }
        Ok(Self {
            root: root.into(),
            exclude: builder.build()?,
        })
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(root)
        .ok()
        .map(|p| p.to_string_lossy().replace('\\', "/"))
}

fn collect_files(root: &Path, exclude: &GlobSet) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            let (Some(rel), Ok(ft)) = (relative(root, &path), entry.file_type()) else {
                continue;
            };
            if ft.is_dir() {
                // A directory is pruned when any path below it would be excluded.
                if !exclude.is_match(format!("{rel}/_")) {
                    stack.push(path);
                }
            } else if ft.is_file() && !exclude.is_match(&rel) {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

fn search_files(root: &Path, exclude: &GlobSet, pattern: &str, limit: usize) -> Vec<SearchHit> {
    let needle = pattern.trim();
    if needle.is_empty() || limit == 0 {
        return Vec::new();
    }
    let Ok(re) = regex::RegexBuilder::new(&regex::escape(needle))
        .case_insensitive(true)
        .build()
    else {
        return Vec::new();
    };

    let mut hits = Vec::new();
    for path in collect_files(root, exclude) {
        let too_big = std::fs::metadata(&path)
            .map(|m| m.len() > MAX_FILE_BYTES)
            .unwrap_or(true);
        if too_big {
            continue;
        }
        // Binary or non-UTF-8 files fail here and are skipped.
        let (Ok(text), Some(rel)) = (std::fs::read_to_string(&path), relative(root, &path)) else {
            continue;
        };
        for (i, line) in text.lines().enumerate() {
            if re.is_match(line) {
                hits.push(SearchHit {
                    path: rel.clone(),
                    line: i as u32 + 1,
                    text: line.trim().to_string(),
                });
                if hits.len() >= limit {
                    return hits;
                }
            }
        }
    }
    hits
}

/// Reject absolute paths and `..` so reads stay inside the checkout.
fn is_contained(path: &str) -> bool {
    let p = Path::new(path);
    !p.is_absolute()
        && p
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[async_trait::async_trait]
impl RepoSearch for LocalRepoSearch {
    async fn search(&self, pattern: &str, limit: usize) -> Vec<SearchHit> {
        let root = self.root.clone();
        let exclude = self.exclude.clone();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || search_files(&root, &exclude, &pattern, limit))
            .await
            .unwrap_or_default()
    }

    async fn read_file(&self, path: &str) -> Option<String> {
        if !is_contained(path) {
            return None;
        }
        tokio::fs::read_to_string(self.root.join(path)).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("target/debug")).unwrap();
        std::fs::write(
            dir.path().join("src/db.rs"),
            "fn query(id: &str) {\n    let sql = format!(\"SELECT {id}\");\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("target/debug/db.rs"), "format!(\"SELECT\")\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "Uses Format! macros\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn finds_case_insensitive_literal_hits() {
        let dir = fixture();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        let hits = search.search("format!(", 10).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "src/db.rs");
        assert_eq!(hits[0].line, 2);

        let hits = search.search("FORMAT!", 10).await;
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src/db.rs"]);
    }

    #[tokio::test]
    async fn excludes_target_and_custom_globs() {
        let dir = fixture();
        let search = LocalRepoSearch::new(dir.path(), &["*.md".to_string()]).unwrap();
        let hits = search.search("format", 10).await;
        assert!(hits.iter().all(|h| h.path == "src/db.rs"));
    }

    #[tokio::test]
    async fn limit_is_respected() {
        let dir = fixture();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        assert_eq!(search.search("f", 1).await.len(), 1);
        assert!(search.search("   ", 10).await.is_empty());
    }

    #[tokio::test]
    async fn read_file_stays_inside_root() {
        let dir = fixture();
        let search = LocalRepoSearch::new(dir.path(), &[]).unwrap();
        assert!(search.read_file("src/db.rs").await.unwrap().contains("query"));
        assert!(search.read_file("../etc/passwd").await.is_none());
        assert!(search.read_file("/etc/passwd").await.is_none());
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalRepoSearch::new(dir.path(), &["[".to_string()]).is_err());
    }
}
