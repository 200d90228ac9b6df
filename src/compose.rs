//! Shared state and steps of a compose run.
//!
//! A [`Composer`] bundles the resolved configuration, per-run options, the
//! work directory and the repository server. The two build paths are
//! implemented on it in [`crate::container`] and [`crate::virt`].

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ComposeConfig;
use crate::error::{ComposeError, Result};
use crate::repos;
use crate::server::{RepoServer, RepoServerGuard};
use crate::template::Substitutions;
use crate::workdir::WorkDir;
use crate::workflow::ComposeStage;

/// Template rendered into the lorax container build.
pub const HTTP_REPO_TEMPLATE: &str = "lorax-http-repo.tmpl";

/// Customization document for the image-factory indirection build.
pub const INDIRECTION_TEMPLATE: &str = "lorax-indirection-repo.tmpl";

/// Subtask name that skips building the lorax container image.
pub const SUBTASK_DOCKER_LORAX: &str = "docker-lorax";

/// Per-invocation options that do not come from the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Subtasks to skip (`--skip-subtask`).
    pub skip_subtasks: Vec<String>,
    /// Existing utility image to reuse instead of building one.
    pub util_uuid: Option<String>,
    /// libvirt network for the image-factory guests.
    pub virtnetwork: Option<String>,
    /// Extra `%post` script appended to the utility image kickstart.
    pub post: Option<PathBuf>,
    /// Proxy handed to lorax inside the container.
    pub http_proxy: Option<String>,
}

impl RunOptions {
    pub fn skips(&self, subtask: &str) -> bool {
        self.skip_subtasks.iter().any(|s| s == subtask)
    }
}

/// What a finished compose run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeReport {
    pub outputdir: PathBuf,
    /// The renamed installer ISO, when the build path produces one directly.
    pub installer_iso: Option<PathBuf>,
    pub stages: Vec<ComposeStage>,
}

pub struct Composer<'a> {
    pub(crate) cfg: &'a ComposeConfig,
    pub(crate) opts: &'a RunOptions,
    pub(crate) work: &'a WorkDir,
    pub(crate) server: &'a dyn RepoServer,
}

impl<'a> Composer<'a> {
    pub fn new(
        cfg: &'a ComposeConfig,
        opts: &'a RunOptions,
        work: &'a WorkDir,
        server: &'a dyn RepoServer,
    ) -> Self {
        Self {
            cfg,
            opts,
            work,
            server,
        }
    }

    pub(crate) fn assemble_repos(&self) -> Result<String> {
        repos::assemble_repo_config(&self.cfg.tree_file, &self.cfg.configdir)
    }

    pub(crate) fn start_repo_server(&self) -> Result<RepoServerGuard<'a>> {
        RepoServerGuard::start(self.server, &self.cfg.ostree_repo)
    }

    /// Read a template from the package data directory.
    pub(crate) fn load_template(&self, name: &str) -> Result<String> {
        let path = self.cfg.pkgdatadir.join(name);
        fs::read_to_string(&path).map_err(|e| {
            ComposeError::config(format!("reading template '{}': {e}", path.display()))
        })
    }

    /// Placeholders common to both build paths.
    pub(crate) fn base_substitutions(&self, port: u16) -> Substitutions {
        let mut subs = Substitutions::new();
        subs.set("OSTREE_PORT", port.to_string())
            .set("OSTREE_REF", &self.cfg.ostree_ref)
            .set("OSTREE_OSNAME", &self.cfg.os_name)
            .set("OS_PRETTY", &self.cfg.os_pretty_name)
            .set("OS_VER", &self.cfg.release);
        subs
    }

    /// Create the output directory and return its absolute path.
    pub(crate) fn prepare_outputdir(&self) -> Result<PathBuf> {
        prepare_dir(&self.cfg.outputdir)
    }
}

fn prepare_dir(dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(dir).map_err(|e| ComposeError::io(dir, e))?;
    fs::canonicalize(dir).map_err(|e| ComposeError::io(dir, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lorax::testing::config;
    use crate::server::testing::RecordingServer;

    #[test]
    fn test_base_substitutions_order() {
        let cfg = config();
        let opts = RunOptions::default();
        let work = WorkDir::temporary().unwrap();
        let server = RecordingServer::default();
        let composer = Composer::new(&cfg, &opts, &work, &server);

        let subs = composer.base_substitutions(8123);
        let keys: Vec<&str> = subs.iter().map(|(k, _)| k).collect();
        assert_eq!(
            keys,
            vec!["OSTREE_PORT", "OSTREE_REF", "OSTREE_OSNAME", "OS_PRETTY", "OS_VER"]
        );
        assert_eq!(subs.get("OSTREE_PORT"), Some("8123"));
    }

    #[test]
    fn test_skips() {
        let opts = RunOptions {
            skip_subtasks: vec![SUBTASK_DOCKER_LORAX.into()],
            ..Default::default()
        };
        assert!(opts.skips("docker-lorax"));
        assert!(!opts.skips("other"));
    }

    #[test]
    fn test_missing_template_is_config_error() {
        let cfg = config();
        let opts = RunOptions::default();
        let work = WorkDir::temporary().unwrap();
        let server = RecordingServer::default();
        let composer = Composer::new(&cfg, &opts, &work, &server);
        assert!(matches!(
            composer.load_template("no-such.tmpl").unwrap_err(),
            ComposeError::Config { .. }
        ));
    }
}
