//! Scratch directory for rendered intermediate files.
//!
//! Everything written here (repo file, rendered templates, Dockerfile,
//! lorax wrapper script, kickstart) exists for inspection after a run and
//! as the `docker build` context. Nothing reads it back programmatically
//! except the container build.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::info;

use crate::error::{ComposeError, Result};

#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    _temp: Option<TempDir>,
}

impl WorkDir {
    /// Use `dir` (created if needed) and keep it after the run.
    pub fn persistent(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ComposeError::io(dir, e))?;
        Ok(Self {
            path: dir.to_path_buf(),
            _temp: None,
        })
    }

    /// A fresh temporary directory removed when this value is dropped.
    pub fn temporary() -> Result<Self> {
        let temp = tempfile::Builder::new()
            .prefix("installer-composer.")
            .tempdir()
            .map_err(|e| ComposeError::io(std::env::temp_dir(), e))?;
        Ok(Self {
            path: temp.path().to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// `persistent` when a directory is configured, `temporary` otherwise.
    pub fn open(configured: Option<&Path>) -> Result<Self> {
        match configured {
            Some(dir) => Self::persistent(dir),
            None => Self::temporary(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: impl AsRef<Path>) -> PathBuf {
        self.path.join(name)
    }

    /// Write `content` to `name` inside the work directory.
    pub fn write(&self, name: impl AsRef<Path>, content: &str) -> Result<PathBuf> {
        let path = self.path.join(name);
        fs::write(&path, content).map_err(|e| ComposeError::io(&path, e))?;
        info!("wrote {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_is_removed_on_drop() {
        let path = {
            let work = WorkDir::temporary().unwrap();
            work.write("lorax.repo", "[a]\n").unwrap();
            assert!(work.join("lorax.repo").is_file());
            work.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_persistent_is_kept() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("work");
        {
            let work = WorkDir::open(Some(&dir)).unwrap();
            let written = work.write("Dockerfile", "FROM fedora\n").unwrap();
            assert_eq!(written, dir.join("Dockerfile"));
        }
        assert_eq!(
            fs::read_to_string(dir.join("Dockerfile")).unwrap(),
            "FROM fedora\n"
        );
    }
}
