//! Transient HTTP server exposing the OSTree repository to the build.
//!
//! The build pulls the OSTree commit over HTTP from the host while lorax
//! runs, so the server must outlive the build step and must never outlive
//! the compose run. [`RepoServerGuard`] owns a started server and stops it
//! exactly once, either explicitly or when dropped on an error path.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::{ComposeError, Result};

/// A running repository server.
#[derive(Debug)]
pub struct ServedRepo {
    pub port: u16,
    pub pid: u32,
    child: Option<Child>,
}

impl ServedRepo {
    /// A served repo with no child process attached, for servers managed elsewhere.
    pub fn detached(port: u16, pid: u32) -> Self {
        Self {
            port,
            pid,
            child: None,
        }
    }
}

/// Start/stop pair for a static file server rooted at a repository.
pub trait RepoServer {
    /// Start serving `root` on an OS-assigned port.
    fn start(&self, root: &Path) -> Result<ServedRepo>;

    /// Stop a server previously returned by [`RepoServer::start`].
    fn stop(&self, served: &mut ServedRepo) -> Result<()>;
}

/// Scoped ownership of a started repository server.
pub struct RepoServerGuard<'a> {
    server: &'a dyn RepoServer,
    served: Option<ServedRepo>,
}

impl<'a> RepoServerGuard<'a> {
    /// Start `server` on `root` and take ownership of the result.
    pub fn start(server: &'a dyn RepoServer, root: &Path) -> Result<Self> {
        let served = server.start(root)?;
        info!(port = served.port, pid = served.pid, root = %root.display(), "repo server started");
        Ok(Self {
            server,
            served: Some(served),
        })
    }

    pub fn port(&self) -> u16 {
        self.served.as_ref().map(|s| s.port).unwrap_or_default()
    }

    /// Stop the server now, reporting any failure.
    pub fn stop(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut served) = self.served.take() else {
            return Ok(());
        };
        let result = self.server.stop(&mut served);
        info!(port = served.port, pid = served.pid, "repo server stopped");
        result
    }
}

impl Drop for RepoServerGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("stopping repo server during unwind: {e}");
        }
    }
}

/// `ostree trivial-httpd` as a foreground child process.
///
/// The daemon binds port 0 and reports the chosen port through a port file,
/// which is polled until it appears or `startup_timeout` expires.
#[derive(Debug, Clone)]
pub struct TrivialHttpd {
    program: PathBuf,
    port_file: PathBuf,
    startup_timeout: Duration,
}

impl TrivialHttpd {
    pub fn new(port_file: PathBuf) -> Self {
        Self {
            program: PathBuf::from("ostree"),
            port_file,
            startup_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_program(mut self, program: PathBuf) -> Self {
        self.program = program;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    fn wait_for_port(&self, child: &mut Child) -> Result<u16> {
        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Ok(text) = fs::read_to_string(&self.port_file) {
                let text = text.trim();
                if !text.is_empty() {
                    return text.parse::<u16>().map_err(|e| {
                        ComposeError::config(format!(
                            "invalid port '{text}' in '{}': {e}",
                            self.port_file.display()
                        ))
                    });
                }
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(ComposeError::exit_status(
                    format!("{} trivial-httpd", self.program.display()),
                    status,
                    String::new(),
                ));
            }
            if Instant::now() >= deadline {
                return Err(ComposeError::BuildTimeout {
                    target: "trivial-httpd startup".into(),
                    timeout: self.startup_timeout,
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl RepoServer for TrivialHttpd {
    fn start(&self, root: &Path) -> Result<ServedRepo> {
        if self.port_file.exists() {
            fs::remove_file(&self.port_file).map_err(|e| ComposeError::io(&self.port_file, e))?;
        }

        let mut child = Command::new(&self.program)
            .arg("trivial-httpd")
            .arg("--port=0")
            .arg(format!("--port-file={}", self.port_file.display()))
            .arg(root)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|e| ComposeError::Subprocess {
                command: format!("{} trivial-httpd", self.program.display()),
                status: "failed to start".into(),
                output: e.to_string(),
            })?;

        match self.wait_for_port(&mut child) {
            Ok(port) => Ok(ServedRepo {
                port,
                pid: child.id(),
                child: Some(child),
            }),
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn stop(&self, served: &mut ServedRepo) -> Result<()> {
        let Some(mut child) = served.child.take() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                let _ = child.kill();
            }
        }
        child.wait().map_err(|e| ComposeError::Subprocess {
            command: format!("{} trivial-httpd", self.program.display()),
            status: "wait failed".into(),
            output: e.to_string(),
        })?;
        let _ = fs::remove_file(&self.port_file);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// Records start/stop calls without spawning anything.
    #[derive(Default)]
    pub(crate) struct RecordingServer {
        pub(crate) starts: RefCell<Vec<PathBuf>>,
        pub(crate) stops: Cell<usize>,
        pub(crate) fail_start: bool,
    }

    impl RecordingServer {
        pub(crate) fn running(&self) -> usize {
            self.starts.borrow().len() - self.stops.get()
        }
    }

    impl RepoServer for RecordingServer {
        fn start(&self, root: &Path) -> Result<ServedRepo> {
            if self.fail_start {
                return Err(ComposeError::config("server refused to start"));
            }
            self.starts.borrow_mut().push(root.to_path_buf());
            Ok(ServedRepo::detached(8080, 4242))
        }

        fn stop(&self, _served: &mut ServedRepo) -> Result<()> {
            self.stops.set(self.stops.get() + 1);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingServer;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_guard_stops_once_on_explicit_stop() {
        let server = RecordingServer::default();
        let guard = RepoServerGuard::start(&server, Path::new("/repo")).unwrap();
        assert_eq!(guard.port(), 8080);
        guard.stop().unwrap();
        assert_eq!(server.stops.get(), 1);
        assert_eq!(server.running(), 0);
    }

    #[test]
    fn test_guard_stops_once_on_error_path() {
        fn failing_build(server: &RecordingServer) -> Result<()> {
            let _guard = RepoServerGuard::start(server, Path::new("/repo"))?;
            Err(ComposeError::config("build exploded"))
        }

        let server = RecordingServer::default();
        assert!(failing_build(&server).is_err());
        assert_eq!(server.stops.get(), 1);
        assert_eq!(server.running(), 0);
    }

    #[test]
    fn test_failed_start_has_nothing_to_stop() {
        let server = RecordingServer {
            fail_start: true,
            ..Default::default()
        };
        assert!(RepoServerGuard::start(&server, Path::new("/repo")).is_err());
        assert_eq!(server.stops.get(), 0);
    }

    #[test]
    fn test_trivial_httpd_reads_port_and_kills_child() {
        let temp = TempDir::new().unwrap();
        let port_file = temp.path().join("repo-port");
        // Stand-in for `ostree`: writes the port file, then serves forever.
        let fake = temp.path().join("fake-ostree");
        fs::write(
            &fake,
            "#!/bin/sh\n\
             for a in \"$@\"; do case \"$a\" in --port-file=*) pf=\"${a#--port-file=}\";; esac; done\n\
             echo 31337 > \"$pf\"\n\
             exec sleep 300\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&fake, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let server = TrivialHttpd::new(port_file.clone()).with_program(fake);
        let mut served = server.start(temp.path()).unwrap();
        assert_eq!(served.port, 31337);
        assert!(served.pid > 0);

        server.stop(&mut served).unwrap();
        assert!(served.child.is_none());
        assert!(!port_file.exists());
    }

    #[test]
    fn test_trivial_httpd_early_exit_is_error() {
        let temp = TempDir::new().unwrap();
        let server = TrivialHttpd::new(temp.path().join("repo-port"))
            .with_program(PathBuf::from("false"))
            .with_startup_timeout(Duration::from_secs(5));
        let err = server.start(temp.path()).unwrap_err();
        assert!(matches!(err, ComposeError::Subprocess { .. }));
    }
}
