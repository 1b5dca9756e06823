//! Per-job temp directory allocation, client path rewriting, and cleanup-list bookkeeping.
//!
//! A [`JobTempTree`] is a scoped resource rooted at `$TMPDIR/distccd_<pid>_<random>`. Every
//! file, directory, and symlink the job server materializes from the client's request is
//! registered on its [`CleanupList`] and removed on every exit path — normal completion,
//! a protocol error, or (via the supervisor's self-pipe signal loop) a terminating signal.

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobTreeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path {0:?} escapes the job root (absolute path required, no '..' components)")]
    PathEscape(String),
}

/// Tracks every path materialized under a job root. Removal always runs from ordinary
/// (non-signal) control flow — the supervisor's self-pipe loop defers actual filesystem work
/// out of the raw signal handler — so this type itself needs no `unsafe` or async-signal-safe
/// tricks; it only needs to avoid losing track of a path once it is created.
#[derive(Debug, Default)]
pub struct CleanupList {
    paths: Vec<PathBuf>,
}

impl CleanupList {
    pub fn with_capacity(cap: usize) -> CleanupList {
        CleanupList {
            paths: Vec::with_capacity(cap),
        }
    }

    pub fn register(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Remove every registered path, most-recently-created first. Idempotent: a path that no
    /// longer exists (already removed, or removed as part of an ancestor directory) is not
    /// an error, and calling `run` twice in a row is a no-op the second time.
    pub fn run(&mut self) {
        for path in self.paths.drain(..).rev() {
            match fs::symlink_metadata(&path) {
                Ok(meta) if meta.is_dir() => {
                    let _ = fs::remove_dir_all(&path);
                }
                Ok(_) => {
                    let _ = fs::remove_file(&path);
                }
                Err(_) => {}
            }
        }
    }
}

impl Drop for CleanupList {
    fn drop(&mut self) {
        self.run();
    }
}

/// A scoped per-job directory tree. Dropping it (or calling [`JobTempTree::finish`]) removes
/// everything created beneath it.
pub struct JobTempTree {
    root: PathBuf,
    _dir: tempfile::TempDir,
    cleanup: CleanupList,
}

impl JobTempTree {
    /// Allocate a new job root under `tmp_root`, named `distccd_<pid>_<random>` as in §3.
    pub fn create(tmp_root: &Path, pid: u32) -> Result<JobTempTree, JobTreeError> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("distccd_{pid}_"))
            .tempdir_in(tmp_root)?;
        let root = dir.path().to_path_buf();
        Ok(JobTempTree {
            root,
            _dir: dir,
            cleanup: CleanupList::with_capacity(64),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Rewrite an absolute client-supplied path into this job's namespace: `R + P`. Rejects
    /// any path that is not absolute or that contains a `..` component, per the path
    /// confinement property — no NAME or rewritten LINK target may escape `R`.
    pub fn rewrite(&self, client_path: &str) -> Result<PathBuf, JobTreeError> {
        if !client_path.starts_with('/') {
            return Err(JobTreeError::PathEscape(client_path.to_owned()));
        }
        if client_path.split('/').any(|part| part == "..") {
            return Err(JobTreeError::PathEscape(client_path.to_owned()));
        }
        Ok(self.root.join(client_path.trim_start_matches('/')))
    }

    /// Create (and register for cleanup) any ancestor directories of `path` that don't yet
    /// exist under the job root.
    fn ensure_parent_dirs(&mut self, path: &Path) -> Result<(), JobTreeError> {
        let Some(parent) = path.parent() else { return Ok(()) };

        let mut missing = Vec::new();
        let mut cur = parent;
        while cur.starts_with(&self.root) && cur != self.root && !cur.exists() {
            missing.push(cur.to_path_buf());
            match cur.parent() {
                Some(p) => cur = p,
                None => break,
            }
        }
        for dir in missing.into_iter().rev() {
            fs::create_dir(&dir)?;
            self.cleanup.register(dir);
        }
        Ok(())
    }

    /// Materialize a `NAME` + `FILE` pair: write `bytes` to the rewritten path, creating
    /// parent directories as needed, and register it for cleanup.
    pub fn write_regular_file(&mut self, client_path: &str, bytes: &[u8]) -> Result<PathBuf, JobTreeError> {
        let path = self.rewrite(client_path)?;
        self.ensure_parent_dirs(&path)?;
        fs::write(&path, bytes)?;
        self.cleanup.register(path.clone());
        Ok(path)
    }

    /// Materialize a `NAME` + `LINK` pair: create a symlink at the rewritten path pointing at
    /// `target`, rewriting `target` too if it begins with `/`.
    pub fn write_symlink(&mut self, client_path: &str, target: &str) -> Result<PathBuf, JobTreeError> {
        let path = self.rewrite(client_path)?;
        let target_path = if target.starts_with('/') {
            self.rewrite(target)?
        } else {
            PathBuf::from(target)
        };
        self.ensure_parent_dirs(&path)?;
        std::os::unix::fs::symlink(&target_path, &path)?;
        self.cleanup.register(path.clone());
        Ok(path)
    }

    /// Rewrite and materialize the request's working directory (`CDIR`).
    pub fn cwd(&mut self, client_cwd: &str) -> Result<PathBuf, JobTreeError> {
        let path = self.rewrite(client_cwd)?;
        fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Run cleanup now rather than waiting for `Drop`; used at the end of a successful job so
    /// failures are visible to the job server instead of being silently swallowed by `Drop`.
    pub fn finish(mut self) {
        self.cleanup.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> JobTempTree {
        JobTempTree::create(std::env::temp_dir().as_path(), std::process::id()).unwrap()
    }

    #[test]
    fn rewrite_prefixes_job_root() {
        let t = tree();
        let rewritten = t.rewrite("/a.c").unwrap();
        assert_eq!(rewritten, t.root().join("a.c"));
    }

    #[test]
    fn rewrite_rejects_relative_paths() {
        let t = tree();
        assert!(t.rewrite("a.c").is_err());
    }

    #[test]
    fn rewrite_rejects_dotdot_components() {
        let t = tree();
        assert!(t.rewrite("/../etc/passwd").is_err());
        assert!(t.rewrite("/a/../../etc/passwd").is_err());
    }

    #[test]
    fn write_regular_file_creates_missing_parents() {
        let mut t = tree();
        let path = t.write_regular_file("/sub/dir/a.c", b"int a;").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"int a;");
        assert!(path.starts_with(t.root()));
    }

    #[test]
    fn symlink_target_rewritten_only_when_absolute() {
        let mut t = tree();
        let rel = t.write_symlink("/rel_link", "relative/target").unwrap();
        let link_target = fs::read_link(&rel).unwrap();
        assert_eq!(link_target, Path::new("relative/target"));

        let abs = t.write_symlink("/abs_link", "/abs/target").unwrap();
        let link_target = fs::read_link(&abs).unwrap();
        assert_eq!(link_target, t.root().join("abs/target"));
    }

    #[test]
    fn cleanup_idempotence() {
        let mut list = CleanupList::with_capacity(4);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        fs::write(&path, b"x").unwrap();
        list.register(path.clone());

        list.run();
        assert!(!path.exists());

        // re-invoking is a no-op, not an error
        list.run();
        assert!(list.is_empty());
    }

    #[test]
    fn dropping_job_tree_removes_everything_beneath_it() {
        let path;
        {
            let mut t = tree();
            path = t.write_regular_file("/a.c", b"int a;").unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn finish_removes_registered_paths() {
        let mut t = tree();
        let path = t.write_regular_file("/a.c", b"int a;").unwrap();
        t.finish();
        assert!(!path.exists());
    }
}
