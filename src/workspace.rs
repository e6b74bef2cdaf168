#![forbid(unsafe_code)]

//! Per-request scratch directories.
//!
//! A [`Workspace`] owns one freshly created directory. It is removed exactly
//! once: either explicitly through [`Workspace::cleanup`] or when the value is
//! dropped, whichever happens first. Dropping covers every early return and
//! every panic between creation and the end of the response body.

use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;
use tokio::runtime::Handle;
use tracing::{debug, warn};

const PREFIX: &str = "tubefetch-";

#[derive(Debug)]
pub struct Workspace {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl Workspace {
    /// Creates a uniquely named directory under `root`.
    pub fn create(root: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix(PREFIX).tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        debug!(path = %path.display(), "workspace created");
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_cleaned(&self) -> bool {
        self.dir.is_none()
    }

    /// Removes the directory and everything in it. Calling this again, or
    /// after the directory vanished on its own, is a no-op.
    pub fn cleanup(&mut self) {
        if let Some(dir) = self.dir.take() {
            remove(dir, &self.path);
        }
    }

    /// Like [`Workspace::cleanup`], but inside a tokio runtime the removal runs
    /// on the blocking pool so async workers never walk a large directory.
    pub fn cleanup_in_background(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let path = self.path.clone();
                handle.spawn_blocking(move || remove(dir, &path));
            }
            Err(_) => remove(dir, &self.path),
        }
    }
}

fn remove(dir: TempDir, path: &Path) {
    match dir.close() {
        Ok(()) => debug!(path = %path.display(), "workspace removed"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), "failed to remove workspace: {err}"),
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::wait_for_removal;

    #[test]
    fn create_makes_prefixed_directory_under_root() {
        let root = tempfile::tempdir().unwrap();
        let workspace = Workspace::create(root.path()).unwrap();
        assert!(workspace.path().is_dir());
        assert!(workspace.path().starts_with(root.path()));
        let name = workspace.path().file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(PREFIX));
    }

    #[test]
    fn cleanup_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        std::fs::write(workspace.path().join("video.mp4"), b"data").unwrap();
        let path = workspace.path().to_path_buf();

        workspace.cleanup();
        assert!(!path.exists());
        assert!(workspace.is_cleaned());
        workspace.cleanup();
    }

    #[test]
    fn cleanup_tolerates_missing_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        std::fs::remove_dir_all(workspace.path()).unwrap();
        workspace.cleanup();
        assert!(workspace.is_cleaned());
    }

    #[test]
    fn drop_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let workspace = Workspace::create(root.path()).unwrap();
            std::fs::create_dir(workspace.path().join("nested")).unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_are_distinct() {
        let root = tempfile::tempdir().unwrap();
        let a = Workspace::create(root.path()).unwrap();
        let b = Workspace::create(root.path()).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn background_cleanup_without_runtime_is_inline() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        workspace.cleanup_in_background();
        assert!(workspace.is_cleaned());
        assert!(!workspace.path().exists());
    }

    #[tokio::test]
    async fn background_cleanup_uses_blocking_pool() {
        let root = tempfile::tempdir().unwrap();
        let mut workspace = Workspace::create(root.path()).unwrap();
        for index in 0..32 {
            std::fs::write(workspace.path().join(format!("{index:02}.mp4")), b"x").unwrap();
        }
        workspace.cleanup_in_background();
        assert!(workspace.is_cleaned());
        assert!(wait_for_removal(workspace.path()));
        workspace.cleanup_in_background();
    }
}
