use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use installer_composer::config::DEFAULT_PROFILE;
use installer_composer::container::DockerCli;
use installer_composer::imagefactory::ImageFactoryCli;
use installer_composer::preflight::{check_required_tools, CONTAINER_TOOLS, VIRT_TOOLS};
use installer_composer::server::TrivialHttpd;
use installer_composer::workdir::WorkDir;
use installer_composer::{ComposeConfig, Composer, ConfigOverrides, RunOptions};

/// Create an installer image.
#[derive(Debug, Parser)]
#[command(name = "installer-composer", version)]
struct Cli {
    /// Compose configuration file
    #[arg(short, long, default_value = "compose.toml")]
    config: PathBuf,

    /// Full URL for the yum repository
    #[arg(short = 'b', long = "yum_baseurl")]
    yum_baseurl: Option<String>,

    /// Profile to compose (a [profile.NAME] table in the config file)
    #[arg(short, long, default_value = DEFAULT_PROFILE)]
    profile: String,

    /// UUID of an existing utility image to reuse
    #[arg(long = "util_uuid")]
    util_uuid: Option<String>,

    /// TDL describing the utility image
    #[arg(long = "util_tdl")]
    util_tdl: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,

    /// Skip a subtask (currently: docker-lorax)
    #[arg(long = "skip-subtask")]
    skip_subtask: Vec<String>,

    /// Name of the libvirt network for image-factory guests
    #[arg(long)]
    virtnetwork: Option<String>,

    /// Build through the image factory instead of a container
    #[arg(long)]
    virt: bool,

    /// %post script appended to the utility image kickstart
    #[arg(long)]
    post: Option<PathBuf>,

    /// Path to image output directory
    #[arg(short, long, required = true)]
    outputdir: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let overrides = ConfigOverrides {
        yum_baseurl: cli.yum_baseurl,
        util_tdl: cli.util_tdl,
        outputdir: Some(cli.outputdir),
    };
    let cfg = ComposeConfig::load(&cli.config, &cli.profile, overrides)
        .with_context(|| format!("loading '{}'", cli.config.display()))?;
    cfg.show();

    check_required_tools(if cli.virt { VIRT_TOOLS } else { CONTAINER_TOOLS })?;

    let work = WorkDir::open(cfg.workdir.as_deref()).context("preparing work directory")?;
    let server = TrivialHttpd::new(work.join("repo-port"));
    let opts = RunOptions {
        skip_subtasks: cli.skip_subtask,
        util_uuid: cli.util_uuid,
        virtnetwork: cli.virtnetwork,
        post: cli.post,
        http_proxy: std::env::var("http_proxy").ok(),
    };
    let composer = Composer::new(&cfg, &opts, &work, &server);

    let report = if cli.virt {
        let factory =
            ImageFactoryCli::new(cfg.imagefactory_storage.clone(), work.path().to_path_buf());
        composer.create_virt(&factory).context("virt compose failed")?
    } else {
        let docker = DockerCli::new(cfg.command_timeout);
        composer
            .create_container(&docker)
            .context("container compose failed")?
    };

    match &report.installer_iso {
        Some(iso) => info!(iso = %iso.display(), "compose finished"),
        None => info!(outputdir = %report.outputdir.display(), "compose finished"),
    }
    Ok(())
}
