//! Containerized lorax build.
//!
//! lorax runs in a privileged container on the host network so it can pull
//! the OSTree commit from the repository server on loopback. Its output is
//! written straight into the bind-mounted output directory.

use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::artifacts;
use crate::compose::{ComposeReport, Composer, HTTP_REPO_TEMPLATE, SUBTASK_DOCKER_LORAX};
use crate::error::{ComposeError, Result};
use crate::lorax;
use crate::process::Cmd;
use crate::template;
use crate::workflow::{BuildPath, ComposeProgress, ComposeStage};

/// Host address templates use to reach the repository server from the container.
const LOOPBACK_IP: &str = "127.0.0.1";

/// Container working directory; also where the output directory is mounted.
pub const CONTAINER_OUT: &str = "/out";

/// Work directory file docker writes the container id to.
pub const CONTAINER_ID_FILE: &str = "containerid";

/// Bound on the `docker rm -f` issued after a timed-out run.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(60);

/// A `docker run` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub workdir: String,
    /// (host path, container path) bind mounts.
    pub volumes: Vec<(PathBuf, String)>,
    pub privileged: bool,
    pub host_network: bool,
    pub remove: bool,
    /// Allocate a TTY and keep stdin open.
    pub interactive: bool,
    /// Where docker records the container id, so a timed-out run can be removed.
    pub cidfile: Option<PathBuf>,
}

/// The container CLI operations the build uses.
pub trait ContainerRuntime {
    /// Build and tag an image from `context_dir`.
    fn build(&self, tag: &str, context_dir: &Path) -> Result<()>;

    /// Run a container to completion.
    fn run(&self, spec: &RunSpec) -> Result<()>;
}

/// The `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: PathBuf,
    timeout: Option<Duration>,
}

impl DockerCli {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            program: PathBuf::from("docker"),
            timeout,
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    pub fn build_command(&self, tag: &str, context_dir: &Path) -> Cmd {
        Cmd::new(&self.program)
            .args(["build", "-t", tag])
            .arg_path(context_dir)
            .timeout(self.timeout)
            .inherit_output()
    }

    pub fn run_command(&self, spec: &RunSpec) -> Cmd {
        let mut cmd = Cmd::new(&self.program)
            .arg("run")
            .args(["--workdir", &spec.workdir]);
        if spec.remove {
            cmd = cmd.arg("--rm");
        }
        if spec.interactive {
            cmd = cmd.arg("-it");
        }
        if spec.host_network {
            cmd = cmd.arg("--net=host");
        }
        if spec.privileged {
            cmd = cmd.arg("--privileged=true");
        }
        if let Some(cidfile) = &spec.cidfile {
            cmd = cmd.arg(format!("--cidfile={}", cidfile.display()));
        }
        for (host, container) in &spec.volumes {
            cmd = cmd.args(["-v".to_string(), format!("{}:{}", host.display(), container)]);
        }
        cmd.arg(&spec.image).timeout(self.timeout).inherit_output()
    }

    /// Force-remove the container recorded in `cidfile`.
    fn remove_container(&self, cidfile: &Path) {
        let id = match fs::read_to_string(cidfile) {
            Ok(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                warn!(cidfile = %cidfile.display(), "no container id recorded");
                return;
            }
        };
        warn!(container = %id, "removing container after timeout");
        let removed = Cmd::new(&self.program)
            .args(["rm", "-f", &id])
            .timeout(Some(REMOVE_TIMEOUT))
            .error_msg("docker rm failed")
            .run();
        if let Err(e) = removed {
            warn!(container = %id, "container may still be running: {e}");
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn build(&self, tag: &str, context_dir: &Path) -> Result<()> {
        self.build_command(tag, context_dir)
            .error_msg("docker build failed")
            .run()
            .map(drop)
    }

    fn run(&self, spec: &RunSpec) -> Result<()> {
        // docker refuses to start when the cidfile already exists
        if let Some(cidfile) = spec.cidfile.as_deref().filter(|p| p.exists()) {
            fs::remove_file(cidfile).map_err(|e| ComposeError::io(cidfile, e))?;
        }
        let result = self
            .run_command(spec)
            .error_msg("docker run failed")
            .run()
            .map(drop);
        if let (Err(ComposeError::BuildTimeout { .. }), Some(cidfile)) = (&result, &spec.cidfile) {
            self.remove_container(cidfile);
        }
        result
    }
}

impl Composer<'_> {
    /// Build the installer ISO with lorax inside a container.
    pub fn create_container(&self, runtime: &dyn ContainerRuntime) -> Result<ComposeReport> {
        let mut progress = ComposeProgress::new(BuildPath::Container);
        self.container_steps(runtime, &mut progress)
            .map_err(|e| progress.fail(e))
    }

    fn container_steps(
        &self,
        runtime: &dyn ContainerRuntime,
        progress: &mut ComposeProgress,
    ) -> Result<ComposeReport> {
        let docker_os = self.cfg.require_docker_os_name()?;

        let repos = self.assemble_repos()?;
        self.work.write("lorax.repo", &repos)?;
        progress.advance(ComposeStage::RepoAssembled);

        let lorax_tmpl = self.load_template(HTTP_REPO_TEMPLATE)?;
        let server = self.start_repo_server()?;
        progress.advance(ComposeStage::ServerStarted);

        let mut subs = self.base_substitutions(server.port());
        if template::requests(&lorax_tmpl, "OSTREE_HOSTIP") {
            subs.set("OSTREE_HOSTIP", LOOPBACK_IP);
        }
        let rendered = template::render(&lorax_tmpl, &subs)?;
        self.work.write("lorax.tmpl", &rendered)?;
        progress.advance(ComposeStage::TemplateRendered);

        let image = lorax::image_name(docker_os);
        if self.opts.skips(SUBTASK_DOCKER_LORAX) {
            info!("skipping subtask {SUBTASK_DOCKER_LORAX}");
        } else {
            let lorax_cmd = lorax::lorax_command(self.cfg, self.opts.http_proxy.as_deref())?;
            self.work.write("lorax.sh", &lorax::lorax_shell(&lorax_cmd))?;
            self.work.write("Dockerfile", &lorax::dockerfile(docker_os)?)?;
            runtime.build(&image, self.work.path())?;
        }
        progress.advance(ComposeStage::ImageBuilt);

        let outputdir = self.prepare_outputdir()?;
        runtime.run(&RunSpec {
            image,
            workdir: CONTAINER_OUT.to_string(),
            volumes: vec![(outputdir.clone(), CONTAINER_OUT.to_string())],
            privileged: true,
            host_network: true,
            remove: true,
            interactive: std::io::stdin().is_terminal(),
            cidfile: Some(self.work.join(CONTAINER_ID_FILE)),
        })?;
        progress.advance(ComposeStage::ArtifactExtracted);

        server.stop()?;
        progress.advance(ComposeStage::ServerStopped);

        let installer_iso = artifacts::publish_installer_iso(&outputdir)?;
        info!(iso = %installer_iso.display(), "installer image ready");

        Ok(ComposeReport {
            outputdir,
            installer_iso: Some(installer_iso),
            stages: progress.reached().to_vec(),
        })
    }
}
