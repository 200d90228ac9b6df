//! Compose configuration file.
//!
//! A TOML file carries a `[defaults]` table and any number of
//! `[profile.<NAME>]` tables. The selected profile's keys override the
//! defaults; command-line values override both. Relative paths in the file
//! resolve against the directory holding it.
//!
//! ```toml
//! [defaults]
//! ostree_repo = "repo"
//! ref = "fedora-atomic/rawhide/x86_64/docker-host"
//! os_name = "fedora-atomic"
//! os_pretty_name = "Fedora Atomic Host"
//! release = "rawhide"
//! tree_file = "fedora-atomic-docker-host.json"
//! docker_os_name = "fedora"
//! yum_baseurl = "http://dl.fedoraproject.org/pub/fedora/linux/development/rawhide/x86_64/os/"
//!
//! [profile.f21]
//! release = "21"
//! ref = "fedora-atomic/f21/x86_64/docker-host"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{ComposeError, Result};

/// Profile selected when none is named.
pub const DEFAULT_PROFILE: &str = "DEFAULT";

const DEFAULT_IMAGEFACTORY_STORAGE: &str = "/var/lib/imagefactory/storage";
const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 4 * 60 * 60;
const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 4 * 60 * 60;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    defaults: Option<ProfileToml>,
    #[serde(default)]
    profile: BTreeMap<String, ProfileToml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProfileToml {
    ostree_repo: Option<PathBuf>,
    #[serde(rename = "ref")]
    ostree_ref: Option<String>,
    os_name: Option<String>,
    os_pretty_name: Option<String>,
    release: Option<String>,
    docker_os_name: Option<String>,
    yum_baseurl: Option<String>,
    lorax_additional_repos: Option<String>,
    lorax_exclude_packages: Option<String>,
    workdir: Option<PathBuf>,
    configdir: Option<PathBuf>,
    pkgdatadir: Option<PathBuf>,
    tree_file: Option<PathBuf>,
    util_tdl: Option<PathBuf>,
    oz_auto_dir: Option<PathBuf>,
    imagefactory_storage: Option<PathBuf>,
    build_timeout_secs: Option<u64>,
    command_timeout_secs: Option<u64>,
}

impl ProfileToml {
    fn overlay(self, over: ProfileToml) -> ProfileToml {
        ProfileToml {
            ostree_repo: over.ostree_repo.or(self.ostree_repo),
            ostree_ref: over.ostree_ref.or(self.ostree_ref),
            os_name: over.os_name.or(self.os_name),
            os_pretty_name: over.os_pretty_name.or(self.os_pretty_name),
            release: over.release.or(self.release),
            docker_os_name: over.docker_os_name.or(self.docker_os_name),
            yum_baseurl: over.yum_baseurl.or(self.yum_baseurl),
            lorax_additional_repos: over.lorax_additional_repos.or(self.lorax_additional_repos),
            lorax_exclude_packages: over.lorax_exclude_packages.or(self.lorax_exclude_packages),
            workdir: over.workdir.or(self.workdir),
            configdir: over.configdir.or(self.configdir),
            pkgdatadir: over.pkgdatadir.or(self.pkgdatadir),
            tree_file: over.tree_file.or(self.tree_file),
            util_tdl: over.util_tdl.or(self.util_tdl),
            oz_auto_dir: over.oz_auto_dir.or(self.oz_auto_dir),
            imagefactory_storage: over.imagefactory_storage.or(self.imagefactory_storage),
            build_timeout_secs: over.build_timeout_secs.or(self.build_timeout_secs),
            command_timeout_secs: over.command_timeout_secs.or(self.command_timeout_secs),
        }
    }
}

/// Values supplied on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub yum_baseurl: Option<String>,
    pub util_tdl: Option<PathBuf>,
    /// Only settable here; the file has no `outputdir` key.
    pub outputdir: Option<PathBuf>,
}

/// Fully resolved settings for one compose run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposeConfig {
    pub profile: String,
    pub ostree_repo: PathBuf,
    pub ostree_ref: String,
    pub os_name: String,
    pub os_pretty_name: String,
    pub release: String,
    pub docker_os_name: Option<String>,
    pub yum_baseurl: Option<String>,
    pub lorax_additional_repos: Option<String>,
    pub lorax_exclude_packages: Option<String>,
    /// Kept after the run when set; otherwise a temporary directory is used.
    pub workdir: Option<PathBuf>,
    pub outputdir: PathBuf,
    /// Directory holding the `<name>.repo` files.
    pub configdir: PathBuf,
    /// Directory holding the lorax templates.
    pub pkgdatadir: PathBuf,
    pub tree_file: PathBuf,
    pub util_tdl: Option<PathBuf>,
    pub oz_auto_dir: Option<PathBuf>,
    pub imagefactory_storage: PathBuf,
    pub build_timeout: Duration,
    /// `None` when the file sets `command_timeout_secs = 0`.
    pub command_timeout: Option<Duration>,
}

impl ComposeConfig {
    /// Load `path`, select `profile`, and apply `overrides`.
    pub fn load(path: &Path, profile: &str, overrides: ConfigOverrides) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ComposeError::config(format!("reading config '{}': {e}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir, profile, overrides).map_err(|e| match e {
            ComposeError::Config { message } => {
                ComposeError::config(format!("{message} ({})", path.display()))
            }
            other => other,
        })
    }

    /// Parse config text; relative paths resolve against `base_dir`.
    pub fn from_toml_str(
        text: &str,
        base_dir: &Path,
        profile: &str,
        overrides: ConfigOverrides,
    ) -> Result<Self> {
        let mut parsed: ConfigToml = toml::from_str(text)
            .map_err(|e| ComposeError::config(format!("parsing config: {e}")))?;

        let defaults = parsed.defaults.take().unwrap_or_default();
        let merged = match parsed.profile.remove(profile) {
            Some(selected) => defaults.overlay(selected),
            None if profile == DEFAULT_PROFILE => defaults,
            None => {
                let known = parsed.profile.keys().cloned().collect::<Vec<_>>();
                return Err(ComposeError::config(format!(
                    "unknown profile '{profile}'; available: {}",
                    if known.is_empty() {
                        DEFAULT_PROFILE.to_string()
                    } else {
                        known.join(", ")
                    }
                )));
            }
        };

        let resolve = |p: PathBuf| -> PathBuf {
            if p.is_absolute() {
                p
            } else {
                base_dir.join(p)
            }
        };
        let required = |value: Option<String>, key: &str| -> Result<String> {
            value.ok_or_else(|| ComposeError::config(format!("missing required key '{key}'")))
        };

        let configdir = merged
            .configdir
            .map(&resolve)
            .unwrap_or_else(|| base_dir.to_path_buf());
        let pkgdatadir = merged
            .pkgdatadir
            .map(&resolve)
            .unwrap_or_else(|| configdir.clone());

        Ok(Self {
            profile: profile.to_string(),
            ostree_repo: resolve(merged.ostree_repo.ok_or_else(|| {
                ComposeError::config("missing required key 'ostree_repo'")
            })?),
            ostree_ref: required(merged.ostree_ref, "ref")?,
            os_name: required(merged.os_name, "os_name")?,
            os_pretty_name: required(merged.os_pretty_name, "os_pretty_name")?,
            release: required(merged.release, "release")?,
            docker_os_name: merged.docker_os_name,
            yum_baseurl: overrides.yum_baseurl.or(merged.yum_baseurl),
            lorax_additional_repos: merged.lorax_additional_repos,
            lorax_exclude_packages: merged.lorax_exclude_packages,
            workdir: merged.workdir.map(&resolve),
            outputdir: overrides
                .outputdir
                .ok_or_else(|| ComposeError::config("missing output directory (--outputdir)"))?,
            tree_file: merged
                .tree_file
                .map(|p| resolve_in(&configdir, p))
                .ok_or_else(|| ComposeError::config("missing required key 'tree_file'"))?,
            configdir,
            pkgdatadir,
            util_tdl: overrides.util_tdl.or_else(|| merged.util_tdl.map(&resolve)),
            oz_auto_dir: merged.oz_auto_dir.map(&resolve),
            imagefactory_storage: merged
                .imagefactory_storage
                .map(&resolve)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_IMAGEFACTORY_STORAGE)),
            build_timeout: Duration::from_secs(
                merged
                    .build_timeout_secs
                    .unwrap_or(DEFAULT_BUILD_TIMEOUT_SECS),
            ),
            command_timeout: match merged
                .command_timeout_secs
                .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)
            {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        })
    }

    /// `docker_os_name`, which only the container path needs.
    pub fn require_docker_os_name(&self) -> Result<&str> {
        self.docker_os_name
            .as_deref()
            .ok_or_else(|| ComposeError::config("missing required key 'docker_os_name'"))
    }

    /// `yum_baseurl`, needed to build the lorax repo arguments.
    pub fn require_yum_baseurl(&self) -> Result<&str> {
        self.yum_baseurl.as_deref().ok_or_else(|| {
            ComposeError::config("missing 'yum_baseurl' (config key or --yum_baseurl)")
        })
    }

    /// Log the resolved configuration.
    pub fn show(&self) {
        info!(
            profile = %self.profile,
            ostree_repo = %self.ostree_repo.display(),
            ostree_ref = %self.ostree_ref,
            os_name = %self.os_name,
            os_pretty_name = %self.os_pretty_name,
            release = %self.release,
            outputdir = %self.outputdir.display(),
            tree_file = %self.tree_file.display(),
            "compose configuration"
        );
    }
}

fn resolve_in(dir: &Path, p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        dir.join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const CONFIG: &str = r#"
[defaults]
ostree_repo = "repo"
ref = "fedora-atomic/rawhide/x86_64/docker-host"
os_name = "fedora-atomic"
os_pretty_name = "Fedora Atomic Host"
release = "rawhide"
tree_file = "tree.json"
docker_os_name = "fedora"

[profile.f21]
release = "21"
yum_baseurl = "http://mirror/f21/"
"#;

    fn overrides(outputdir: &str) -> ConfigOverrides {
        ConfigOverrides {
            outputdir: Some(PathBuf::from(outputdir)),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_profile_uses_defaults() {
        let cfg = ComposeConfig::from_toml_str(
            CONFIG,
            Path::new("/srv/compose"),
            DEFAULT_PROFILE,
            overrides("/out"),
        )
        .unwrap();
        assert_eq!(cfg.release, "rawhide");
        assert_eq!(cfg.ostree_repo, PathBuf::from("/srv/compose/repo"));
        assert_eq!(cfg.tree_file, PathBuf::from("/srv/compose/tree.json"));
        assert_eq!(cfg.pkgdatadir, PathBuf::from("/srv/compose"));
        assert_eq!(cfg.outputdir, PathBuf::from("/out"));
        assert_eq!(cfg.yum_baseurl, None);
        assert_eq!(
            cfg.command_timeout,
            Some(Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS))
        );
    }

    #[test]
    fn test_profile_overrides_defaults_and_cli_overrides_profile() {
        let cfg = ComposeConfig::from_toml_str(
            CONFIG,
            Path::new("/srv/compose"),
            "f21",
            ConfigOverrides {
                yum_baseurl: Some("http://local/".into()),
                outputdir: Some(PathBuf::from("out")),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(cfg.release, "21");
        assert_eq!(cfg.yum_baseurl.as_deref(), Some("http://local/"));
        // command-line paths are relative to the caller, not the config file
        assert_eq!(cfg.outputdir, PathBuf::from("out"));
    }

    #[test]
    fn test_unknown_profile_is_error() {
        let err = ComposeConfig::from_toml_str(
            CONFIG,
            Path::new("/"),
            "f99",
            overrides("/out"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown profile 'f99'"));
    }

    #[test]
    fn test_missing_required_key() {
        let err = ComposeConfig::from_toml_str(
            "[defaults]\nostree_repo = \"/r\"\n",
            Path::new("/"),
            DEFAULT_PROFILE,
            overrides("/out"),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'ref'"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = ComposeConfig::from_toml_str(
            "[defaults]\nbogus = 1\n",
            Path::new("/"),
            DEFAULT_PROFILE,
            overrides("/out"),
        )
        .unwrap_err();
        assert!(matches!(err, ComposeError::Config { .. }));
    }

    #[test]
    fn test_zero_command_timeout_disables_bound() {
        let text = format!("{CONFIG}\n[profile.unbounded]\ncommand_timeout_secs = 0\n");
        let cfg = ComposeConfig::from_toml_str(
            &text,
            Path::new("/"),
            "unbounded",
            overrides("/out"),
        )
        .unwrap();
        assert_eq!(cfg.command_timeout, None);
    }

    #[test]
    fn test_imagefactory_storage_resolves_against_config_dir() {
        let cfg = ComposeConfig::from_toml_str(
            CONFIG,
            Path::new("/srv/compose"),
            DEFAULT_PROFILE,
            overrides("/out"),
        )
        .unwrap();
        assert_eq!(
            cfg.imagefactory_storage,
            PathBuf::from("/var/lib/imagefactory/storage")
        );

        let text = format!("{CONFIG}\n[profile.local]\nimagefactory_storage = \"storage\"\n");
        let cfg = ComposeConfig::from_toml_str(
            &text,
            Path::new("/srv/compose"),
            "local",
            overrides("/out"),
        )
        .unwrap();
        assert_eq!(
            cfg.imagefactory_storage,
            PathBuf::from("/srv/compose/storage")
        );
    }

    #[test]
    fn test_outputdir_comes_only_from_command_line() {
        let err = ComposeConfig::from_toml_str(
            CONFIG,
            Path::new("/"),
            DEFAULT_PROFILE,
            ConfigOverrides::default(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("--outputdir"));

        let text = format!("{CONFIG}\n[profile.out]\noutputdir = \"/srv/out\"\n");
        let err = ComposeConfig::from_toml_str(&text, Path::new("/"), "out", overrides("/out"))
            .unwrap_err();
        assert!(matches!(err, ComposeError::Config { .. }));
    }

    #[test]
    fn test_load_resolves_against_config_dir() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("compose.toml");
        fs::write(&path, CONFIG).unwrap();
        let cfg = ComposeConfig::load(&path, DEFAULT_PROFILE, overrides("/out")).unwrap();
        assert_eq!(cfg.configdir, temp.path());
        assert_eq!(cfg.ostree_repo, temp.path().join("repo"));
    }
}
