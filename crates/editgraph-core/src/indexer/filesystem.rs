//! Filesystem helpers: language detection, glob matching, and source snapshots.
//!
//! Snapshots record `(mtime, content_hash, content)` for a bounded set of
//! source-like files so that side-effect edits made by executed code can be
//! detected by comparing two snapshots.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

const LANGUAGE_BY_EXTENSION: &[(&str, &str)] = &[
    (".py", "python"),
    (".pyw", "python"),
    (".js", "javascript"),
    (".mjs", "javascript"),
    (".cjs", "javascript"),
    (".jsx", "javascript"),
    (".ts", "typescript"),
    (".tsx", "typescript"),
    (".java", "java"),
    (".go", "go"),
    (".json", "json"),
    (".sh", "shell"),
    (".bash", "shell"),
    (".zsh", "shell"),
];

/// Extensions tracked by snapshots.
pub const SOURCE_EXTENSIONS: &[&str] = &[
    ".py", ".js", ".ts", ".jsx", ".tsx", ".json", ".yaml", ".yml", ".toml", ".md", ".rst", ".txt",
    ".html", ".css", ".scss", ".sql", ".sh", ".bash",
];

/// Directory names never descended into (glob patterns allowed).
pub const SKIP_DIRS: &[&str] = &[
    "venv",
    "env",
    ".venv",
    "node_modules",
    "__pycache__",
    ".git",
    ".svn",
    ".hg",
    "dist",
    "build",
    ".tox",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "eggs",
    ".eggs",
    "*.egg-info",
];

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Lowercased extension with its leading dot, e.g. `.py`.
pub fn dotted_extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
}

pub fn detect_language(path: &Path) -> Option<&'static str> {
    let ext = dotted_extension(path)?;
    LANGUAGE_BY_EXTENSION
        .iter()
        .find(|(e, _)| *e == ext.as_str())
        .map(|(_, lang)| *lang)
}

/// Glob match supporting `*` and `?`.
pub fn glob_match(text: &str, pattern: &str) -> bool {
    let t_chars: Vec<char> = text.chars().collect();
    let p_chars: Vec<char> = pattern.chars().collect();
    let (tl, pl) = (t_chars.len(), p_chars.len());
    let mut dp = vec![vec![false; pl + 1]; tl + 1];
    dp[0][0] = true;
    for j in 1..=pl {
        if p_chars[j - 1] == '*' {
            dp[0][j] = dp[0][j - 1];
        }
    }
    for i in 1..=tl {
        for j in 1..=pl {
            if p_chars[j - 1] == '*' {
                dp[i][j] = dp[i][j - 1] || dp[i - 1][j];
            } else if p_chars[j - 1] == '?' || t_chars[i - 1] == p_chars[j - 1] {
                dp[i][j] = dp[i - 1][j - 1];
            }
        }
    }
    dp[tl][pl]
}

pub fn matches_any(name: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| glob_match(name, p))
}

pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Path relative to `root` with forward slashes.
pub fn relative_slash_path(path: &Path, root: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Captured state of one source file.
#[derive(Clone, Debug, PartialEq)]
pub struct FileState {
    /// Seconds since the Unix epoch, when the platform reports it.
    pub mtime: Option<f64>,
    pub content_hash: String,
    pub content: String,
}

pub type FileStates = BTreeMap<PathBuf, FileState>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Content of a changed file before and after; an empty side means absent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub old_content: String,
    pub new_content: String,
    pub kind: ChangeKind,
}

fn is_skipped_name(name: &str) -> bool {
    name.starts_with('.') || matches_any(name, SKIP_DIRS)
}

fn is_source_file(path: &Path) -> bool {
    dotted_extension(path)
        .map(|ext| SOURCE_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn read_state(path: &Path) -> Option<FileState> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) => {
            debug!("Skipping unreadable file {}: {e}", path.display());
            return None;
        }
    };
    let mtime = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64());
    Some(FileState {
        mtime,
        content_hash: content_hash(&data),
        content: String::from_utf8_lossy(&data).into_owned(),
    })
}

/// Capture up to `max_files` source files under `root`.
///
/// Skips configured directories and any path component starting with a dot
/// below `root`. Unreadable files are left out.
pub fn capture_source_file_states(root: &Path, max_files: usize) -> FileStates {
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    let mut candidates: Vec<PathBuf> = Vec::new();
    let walker = WalkDir::new(&root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped_name(&e.file_name().to_string_lossy()));

    for entry in walker {
        if candidates.len() >= max_files {
            break;
        }
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!("Snapshot walk error under {}: {e}", root.display());
                continue;
            }
        };
        if entry.file_type().is_file() && is_source_file(entry.path()) {
            candidates.push(entry.into_path());
        }
    }

    candidates
        .into_par_iter()
        .filter_map(|path| read_state(&path).map(|state| (path, state)))
        .collect()
}

/// Compare two snapshots by content hash.
pub fn diff_file_states(before: &FileStates, after: &FileStates) -> BTreeMap<PathBuf, FileChange> {
    let mut changed = BTreeMap::new();

    for (path, new_state) in after {
        match before.get(path) {
            Some(old_state) => {
                if old_state.content_hash != new_state.content_hash {
                    changed.insert(
                        path.clone(),
                        FileChange {
                            old_content: old_state.content.clone(),
                            new_content: new_state.content.clone(),
                            kind: ChangeKind::Modified,
                        },
                    );
                }
            }
            None => {
                changed.insert(
                    path.clone(),
                    FileChange {
                        old_content: String::new(),
                        new_content: new_state.content.clone(),
                        kind: ChangeKind::Created,
                    },
                );
            }
        }
    }

    for (path, old_state) in before {
        if !after.contains_key(path) {
            changed.insert(
                path.clone(),
                FileChange {
                    old_content: old_state.content.clone(),
                    new_content: String::new(),
                    kind: ChangeKind::Deleted,
                },
            );
        }
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("pkg.egg-info", "*.egg-info"));
        assert!(glob_match("test_app.py", "test_*.py"));
        assert!(glob_match("a.py", "?.py"));
        assert!(!glob_match("app.py", "test_*.py"));
    }

    #[test]
    fn test_detect_language() {
        assert_eq!(detect_language(Path::new("a/b.PY")), Some("python"));
        assert_eq!(detect_language(Path::new("x.tsx")), Some("typescript"));
        assert_eq!(detect_language(Path::new("x.rs")), None);
        assert_eq!(detect_language(Path::new("Makefile")), None);
    }

    #[test]
    fn test_content_hash_hex() {
        let hash = content_hash(b"abc");
        assert_eq!(hash.len(), 64);
        assert!(hash.starts_with("ba7816bf"));
    }

    #[test]
    fn test_capture_filters_extensions_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("app.py"), "print(1)\n").unwrap();
        std::fs::write(root.join("image.png"), [0u8, 1, 2]).unwrap();
        std::fs::write(root.join(".hidden.py"), "x = 1\n").unwrap();
        for skipped in ["node_modules", ".git", "pkg.egg-info", "__pycache__"] {
            std::fs::create_dir_all(root.join(skipped)).unwrap();
            std::fs::write(root.join(skipped).join("mod.py"), "x = 1\n").unwrap();
        }
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/lib.py"), "y = 2\n").unwrap();

        let states = capture_source_file_states(root, 500);
        let canonical = root.canonicalize().unwrap();
        let mut keys: Vec<String> = states
            .keys()
            .map(|p| relative_slash_path(p, &canonical))
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["app.py", "src/lib.py"]);
        let app = &states[&canonical.join("app.py")];
        assert_eq!(app.content, "print(1)\n");
        assert!(app.mtime.is_some());
    }

    #[test]
    fn test_capture_respects_max_files() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..10 {
            std::fs::write(dir.path().join(format!("f{i}.py")), "pass\n").unwrap();
        }
        assert_eq!(capture_source_file_states(dir.path(), 3).len(), 3);
    }

    #[test]
    fn test_diff_detects_created_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("keep.py"), "a = 1\n").unwrap();
        let before = capture_source_file_states(dir.path(), 500);
        std::fs::write(dir.path().join("x.py"), "# new").unwrap();
        let after = capture_source_file_states(dir.path(), 500);

        let changes = diff_file_states(&before, &after);
        assert_eq!(changes.len(), 1);
        let (path, change) = changes.iter().next().unwrap();
        assert!(path.ends_with("x.py"));
        assert_eq!(change.old_content, "");
        assert_eq!(change.new_content, "# new");
        assert_eq!(change.kind, ChangeKind::Created);
    }

    #[test]
    fn test_diff_modified_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.py"), "a = 1\n").unwrap();
        std::fs::write(dir.path().join("b.py"), "b = 1\n").unwrap();
        let before = capture_source_file_states(dir.path(), 500);
        std::fs::write(dir.path().join("a.py"), "a = 2\n").unwrap();
        std::fs::remove_file(dir.path().join("b.py")).unwrap();
        let after = capture_source_file_states(dir.path(), 500);

        let changes = diff_file_states(&before, &after);
        assert_eq!(changes.len(), 2);
        for (path, change) in changes {
            if path.ends_with("a.py") {
                assert_eq!(change.kind, ChangeKind::Modified);
                assert_eq!(change.old_content, "a = 1\n");
                assert_eq!(change.new_content, "a = 2\n");
            } else {
                assert_eq!(change.kind, ChangeKind::Deleted);
                assert_eq!(change.new_content, "");
            }
        }
    }
}
