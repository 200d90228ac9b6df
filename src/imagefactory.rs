//! Image-factory build dispatch.
//!
//! The factory builds virtual machine images asynchronously. A submitted
//! build is represented by a [`PendingBuild`], which is waited on with an
//! explicit bound: when the bound expires the build is cancelled and
//! [`ComposeError::BuildTimeout`] is returned instead of blocking forever.

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{ComposeError, Result};
use crate::process::shell_quote;

/// Parameters passed to a factory build, keyed by name.
pub type BuildParameters = BTreeMap<String, String>;

/// An image known to the factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactoryImage {
    pub identifier: String,
    /// Path of the image body (for the indirection target, the results tarball).
    pub data: PathBuf,
}

type CancelFn = Box<dyn FnOnce() + Send>;

/// A submitted build whose result has not been collected yet.
pub struct PendingBuild {
    target: String,
    rx: Receiver<Result<FactoryImage>>,
    cancel: Option<CancelFn>,
}

impl PendingBuild {
    /// `rx` yields the build result; `cancel` aborts the build if it is still running.
    pub fn new(
        target: impl Into<String>,
        rx: Receiver<Result<FactoryImage>>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            target: target.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A build that already finished.
    pub fn ready(target: impl Into<String>, result: Result<FactoryImage>) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(result);
        Self {
            target: target.into(),
            rx,
            cancel: None,
        }
    }

    /// Block until the build finishes or `timeout` expires.
    pub fn wait(mut self, timeout: Duration) -> Result<FactoryImage> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(target = %self.target, "build timed out, cancelling");
                if let Some(cancel) = self.cancel.take() {
                    cancel();
                }
                Err(ComposeError::BuildTimeout {
                    target: format!("{} build", self.target),
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(ComposeError::Image {
                message: format!("{} build worker exited without a result", self.target),
            }),
        }
    }
}

/// Operations the virt path needs from the image factory.
pub trait ImageFactory {
    /// Submit a base image build of the TDL `template`.
    fn submit_base_image(&self, template: &str, params: &BuildParameters) -> Result<PendingBuild>;

    /// Look up an existing image by identifier.
    fn image_with_id(&self, identifier: &str) -> Result<FactoryImage>;

    /// Submit a `target` build derived from image `image_id`.
    fn submit_target_image(
        &self,
        target: &str,
        image_id: &str,
        params: &BuildParameters,
    ) -> Result<PendingBuild>;
}

#[derive(Debug, Deserialize)]
struct ImageJson {
    identifier: String,
    data: Option<PathBuf>,
    status: Option<String>,
    status_detail: Option<serde_json::Value>,
}

impl ImageJson {
    fn into_image(self, storage: &Path) -> Result<FactoryImage> {
        if let Some(status) = &self.status {
            if status.eq_ignore_ascii_case("failed") {
                return Err(ComposeError::Image {
                    message: format!(
                        "image {} failed: {}",
                        self.identifier,
                        self.status_detail
                            .map(|d| d.to_string())
                            .unwrap_or_else(|| "no detail".into())
                    ),
                });
            }
        }
        let data = self
            .data
            .unwrap_or_else(|| storage.join(format!("{}.body", self.identifier)));
        Ok(FactoryImage {
            identifier: self.identifier,
            data,
        })
    }
}

/// Parse the JSON document `imagefactory --output json` prints for an image.
fn parse_image_json(text: &str, storage: &Path) -> Result<FactoryImage> {
    let parsed: ImageJson = serde_json::from_str(text.trim()).map_err(|e| ComposeError::Image {
        message: format!("unparseable image description: {e}"),
    })?;
    parsed.into_image(storage)
}

/// Drives the `imagefactory` command line tool.
///
/// Multi-line or long parameter values are written to files under
/// `param_dir` and passed with `--file-parameter`.
#[derive(Debug, Clone)]
pub struct ImageFactoryCli {
    program: PathBuf,
    storage: PathBuf,
    param_dir: PathBuf,
}

const INLINE_PARAMETER_MAX: usize = 256;

impl ImageFactoryCli {
    pub fn new(storage: PathBuf, param_dir: PathBuf) -> Self {
        Self {
            program: PathBuf::from("imagefactory"),
            storage,
            param_dir,
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    fn parameter_args(&self, prefix: &str, params: &BuildParameters) -> Result<Vec<String>> {
        let mut args = Vec::new();
        for (key, value) in params {
            if value.contains('\n') || value.len() > INLINE_PARAMETER_MAX {
                let path = self.param_dir.join(format!("{prefix}-{key}.param"));
                fs::write(&path, value).map_err(|e| ComposeError::io(&path, e))?;
                args.extend([
                    "--file-parameter".to_string(),
                    key.clone(),
                    path.display().to_string(),
                ]);
            } else {
                args.extend(["--parameter".to_string(), key.clone(), value.clone()]);
            }
        }
        Ok(args)
    }

    /// Spawn `imagefactory --output json <args>` and collect its result on a worker thread.
    fn spawn(&self, target: &str, args: Vec<String>) -> Result<PendingBuild> {
        let cmdline = [self.program.display().to_string(), "--output".into(), "json".into()]
            .into_iter()
            .chain(args.iter().cloned())
            .map(|a| shell_quote(&a))
            .collect::<Vec<_>>()
            .join(" ");
        info!(command = %cmdline, "submitting build");

        let mut child = Command::new(&self.program)
            .args(["--output", "json"])
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ComposeError::Subprocess {
                command: cmdline.clone(),
                status: "failed to start".into(),
                output: e.to_string(),
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let (tx, rx) = mpsc::channel();

        let worker_child = Arc::clone(&child);
        let storage = self.storage.clone();
        thread::spawn(move || {
            let out = read_pipe(stdout);
            let err = read_pipe(stderr);
            let status = wait_shared(&worker_child);
            let out = out.join().unwrap_or_default();
            let err = err.join().unwrap_or_default();
            let result = match status {
                Ok(status) if status.success() => parse_image_json(&out, &storage),
                Ok(status) => Err(ComposeError::exit_status(
                    cmdline,
                    status,
                    format!("{}\n{}", out.trim(), err.trim()),
                )),
                Err(e) => Err(ComposeError::Subprocess {
                    command: cmdline,
                    status: "wait failed".into(),
                    output: e.to_string(),
                }),
            };
            let _ = tx.send(result);
        });

        Ok(PendingBuild::new(target, rx, move || {
            if let Ok(mut child) = child.lock() {
                let _ = child.kill();
            }
        }))
    }
}

fn read_pipe<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Poll a child shared with a canceller until it exits.
fn wait_shared(child: &Mutex<Child>) -> std::io::Result<std::process::ExitStatus> {
    loop {
        {
            let mut guard = child
                .lock()
                .map_err(|_| std::io::Error::other("child lock poisoned"))?;
            if let Some(status) = guard.try_wait()? {
                return Ok(status);
            }
        }
        thread::sleep(Duration::from_millis(200));
    }
}

impl ImageFactory for ImageFactoryCli {
    fn submit_base_image(&self, template: &str, params: &BuildParameters) -> Result<PendingBuild> {
        let tdl = self.param_dir.join("base_image.tdl");
        fs::write(&tdl, template).map_err(|e| ComposeError::io(&tdl, e))?;

        let mut args = vec!["base_image".to_string()];
        args.extend(self.parameter_args("base", params)?);
        args.push(tdl.display().to_string());
        self.spawn("base_image", args)
    }

    fn image_with_id(&self, identifier: &str) -> Result<FactoryImage> {
        let meta = self.storage.join(format!("{identifier}.meta"));
        let text = fs::read_to_string(&meta).map_err(|e| {
            ComposeError::config(format!(
                "no image '{identifier}' in factory storage ({}): {e}",
                meta.display()
            ))
        })?;
        let image = parse_image_json(&text, &self.storage)?;
        if image.identifier != identifier {
            return Err(ComposeError::Image {
                message: format!(
                    "metadata '{}' describes image '{}'",
                    meta.display(),
                    image.identifier
                ),
            });
        }
        debug!(identifier, data = %image.data.display(), "found image");
        Ok(image)
    }

    fn submit_target_image(
        &self,
        target: &str,
        image_id: &str,
        params: &BuildParameters,
    ) -> Result<PendingBuild> {
        let mut args = vec![
            "target_image".to_string(),
            "--id".to_string(),
            image_id.to_string(),
        ];
        args.extend(self.parameter_args(target, params)?);
        args.push(target.to_string());
        self.spawn(target, args)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory factory recording every request.
    #[derive(Default)]
    pub(crate) struct RecordingFactory {
        pub(crate) base_builds: RefCell<Vec<(String, BuildParameters)>>,
        pub(crate) lookups: RefCell<Vec<String>>,
        pub(crate) target_builds: RefCell<Vec<(String, String, BuildParameters)>>,
        pub(crate) results_tarball: PathBuf,
        pub(crate) hang_target: bool,
        pub(crate) cancelled: Arc<AtomicBool>,
        pub(crate) next_id: Cell<u32>,
    }

    impl RecordingFactory {
        fn fresh_id(&self) -> String {
            let id = self.next_id.get() + 1;
            self.next_id.set(id);
            format!("00000000-0000-0000-0000-{id:012}")
        }

        pub(crate) fn was_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }
    }

    impl ImageFactory for RecordingFactory {
        fn submit_base_image(
            &self,
            template: &str,
            params: &BuildParameters,
        ) -> Result<PendingBuild> {
            self.base_builds
                .borrow_mut()
                .push((template.to_string(), params.clone()));
            let identifier = self.fresh_id();
            Ok(PendingBuild::ready(
                "base_image",
                Ok(FactoryImage {
                    data: PathBuf::from(format!("/storage/{identifier}.body")),
                    identifier,
                }),
            ))
        }

        fn image_with_id(&self, identifier: &str) -> Result<FactoryImage> {
            self.lookups.borrow_mut().push(identifier.to_string());
            Ok(FactoryImage {
                identifier: identifier.to_string(),
                data: PathBuf::from(format!("/storage/{identifier}.body")),
            })
        }

        fn submit_target_image(
            &self,
            target: &str,
            image_id: &str,
            params: &BuildParameters,
        ) -> Result<PendingBuild> {
            self.target_builds.borrow_mut().push((
                target.to_string(),
                image_id.to_string(),
                params.clone(),
            ));
            if self.hang_target {
                let (tx, rx) = mpsc::channel();
                let cancelled = Arc::clone(&self.cancelled);
                return Ok(PendingBuild::new(target, rx, move || {
                    cancelled.store(true, Ordering::SeqCst);
                    drop(tx);
                }));
            }
            Ok(PendingBuild::ready(
                target,
                Ok(FactoryImage {
                    identifier: self.fresh_id(),
                    data: self.results_tarball.clone(),
                }),
            ))
        }
    }
}
