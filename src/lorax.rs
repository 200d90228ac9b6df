//! Lorax invocation and the container image that runs it.
//!
//! lorax itself runs inside a container built from the target OS image. The
//! container's entry point is a small shell wrapper that works around missing
//! loop devices in containers before exec'ing lorax.

use crate::config::ComposeConfig;
use crate::error::Result;
use crate::process::shell_quote;
use crate::template::{self, Substitutions};

/// Where the rendered lorax template lands inside the container.
pub const CONTAINER_TEMPLATE_PATH: &str = "/root/lorax.tmpl";

/// Lorax output directory inside the container (bind-mounted from the host).
pub const CONTAINER_OUTPUT_DIR: &str = "/out/lorax";

const DOCKERFILE_TEMPLATE: &str = r#"
FROM @DOCKER_OS@
ADD lorax.repo /etc/yum.repos.d/
ADD lorax.tmpl /root/
ADD lorax.sh /root/
RUN mkdir /out
RUN chmod u+x /root/lorax.sh
RUN yum -y update
RUN yum -y swap fakesystemd systemd
RUN yum -y install ostree lorax
RUN yum -y clean all
CMD ["/bin/sh", "/root/lorax.sh"]
"#;

/// Loop devices created before lorax runs; containers start without them.
const LOOP_DEVICES: u32 = 7;

/// `-s <url>` source arguments for lorax.
///
/// `lorax_additional_repos` is a comma-separated list; `yum_baseurl` is
/// appended unless already listed. Without additional repos, only
/// `yum_baseurl` is used.
pub fn repo_args(cfg: &ComposeConfig) -> Result<Vec<String>> {
    let baseurl = cfg.require_yum_baseurl()?;
    let mut urls: Vec<&str> = cfg
        .lorax_additional_repos
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .collect();
    if !urls.contains(&baseurl) {
        urls.push(baseurl);
    }

    Ok(urls
        .into_iter()
        .flat_map(|url| ["-s".to_string(), url.to_string()])
        .collect())
}

/// Full lorax command line run inside the container.
pub fn lorax_command(cfg: &ComposeConfig, http_proxy: Option<&str>) -> Result<Vec<String>> {
    let mut cmd: Vec<String> = vec![
        "lorax".into(),
        "--nomacboot".into(),
        format!("--add-template={CONTAINER_TEMPLATE_PATH}"),
    ];
    for pkg in ["fakesystemd", "systemd-container"] {
        cmd.extend(["-e".to_string(), pkg.to_string()]);
    }
    cmd.push("-p".into());
    cmd.push(cfg.os_pretty_name.clone());
    cmd.extend(["-v".to_string(), cfg.release.clone()]);
    cmd.extend(["-r".to_string(), cfg.release.clone()]);

    if let Some(proxy) = http_proxy.filter(|p| !p.is_empty()) {
        cmd.extend(["--proxy".to_string(), proxy.to_string()]);
    }

    cmd.extend(repo_args(cfg)?);

    if let Some(excludes) = &cfg.lorax_exclude_packages {
        for exclude in excludes.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            cmd.extend(["-e".to_string(), exclude.to_string()]);
        }
    }

    cmd.push(CONTAINER_OUTPUT_DIR.to_string());
    Ok(cmd)
}

/// Container entry point: create loop devices, then exec `lorax_cmd`.
pub fn lorax_shell(lorax_cmd: &[String]) -> String {
    let quoted = lorax_cmd
        .iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ");

    let mut script = String::from("#!/bin/sh\n\n");
    for n in 0..LOOP_DEVICES {
        script.push_str(&format!("mknod -m660 /dev/loop{n} b 7 {n}\n"));
    }
    script.push_str(&format!("echo Running: {quoted}\n"));
    script.push_str(&format!("exec {quoted}\n"));
    script
}

/// Dockerfile for the lorax build image based on `docker_os`.
pub fn dockerfile(docker_os: &str) -> Result<String> {
    let subs: Substitutions = [("DOCKER_OS", docker_os)].into_iter().collect();
    Ok(template::render(DOCKERFILE_TEMPLATE, &subs)?)
}

/// Tag of the container image that runs lorax.
pub fn image_name(docker_os: &str) -> String {
    format!("{docker_os}/rpmostree-toolbox-lorax")
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    pub(crate) fn config() -> ComposeConfig {
        ComposeConfig {
            profile: "DEFAULT".into(),
            ostree_repo: PathBuf::from("/srv/repo"),
            ostree_ref: "fedora-atomic/rawhide/x86_64/docker-host".into(),
            os_name: "fedora-atomic".into(),
            os_pretty_name: "Fedora Atomic".into(),
            release: "rawhide".into(),
            docker_os_name: Some("fedora".into()),
            yum_baseurl: Some("http://mirror/rawhide/".into()),
            lorax_additional_repos: None,
            lorax_exclude_packages: None,
            workdir: None,
            outputdir: PathBuf::from("/out"),
            configdir: PathBuf::from("/srv"),
            pkgdatadir: PathBuf::from("/srv"),
            tree_file: PathBuf::from("/srv/tree.json"),
            util_tdl: None,
            oz_auto_dir: None,
            imagefactory_storage: PathBuf::from("/var/lib/imagefactory/storage"),
            build_timeout: Duration::from_secs(60),
            command_timeout: Some(Duration::from_secs(60)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::config;
    use super::*;

    #[test]
    fn test_repo_args_baseurl_only() {
        assert_eq!(
            repo_args(&config()).unwrap(),
            vec!["-s", "http://mirror/rawhide/"]
        );
    }

    #[test]
    fn test_repo_args_appends_baseurl_once() {
        let mut cfg = config();
        cfg.lorax_additional_repos = Some("http://a/, http://b/,".into());
        assert_eq!(
            repo_args(&cfg).unwrap(),
            vec!["-s", "http://a/", "-s", "http://b/", "-s", "http://mirror/rawhide/"]
        );

        cfg.lorax_additional_repos = Some("http://mirror/rawhide/, http://b/".into());
        assert_eq!(
            repo_args(&cfg).unwrap(),
            vec!["-s", "http://mirror/rawhide/", "-s", "http://b/"]
        );
    }

    #[test]
    fn test_repo_args_require_baseurl() {
        let mut cfg = config();
        cfg.yum_baseurl = None;
        assert!(repo_args(&cfg).is_err());
    }

    #[test]
    fn test_lorax_command() {
        let mut cfg = config();
        cfg.lorax_exclude_packages = Some("docker, ,cloud-init".into());
        let cmd = lorax_command(&cfg, Some("http://proxy:3128")).unwrap();
        assert_eq!(
            cmd,
            vec![
                "lorax",
                "--nomacboot",
                "--add-template=/root/lorax.tmpl",
                "-e",
                "fakesystemd",
                "-e",
                "systemd-container",
                "-p",
                "Fedora Atomic",
                "-v",
                "rawhide",
                "-r",
                "rawhide",
                "--proxy",
                "http://proxy:3128",
                "-s",
                "http://mirror/rawhide/",
                "-e",
                "docker",
                "-e",
                "cloud-init",
                "/out/lorax",
            ]
        );
    }

    #[test]
    fn test_lorax_shell() {
        let script = lorax_shell(&["lorax".into(), "-p".into(), "Fedora Atomic".into()]);
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("mknod -m660 /dev/loop0 b 7 0\n"));
        assert!(script.contains("mknod -m660 /dev/loop6 b 7 6\n"));
        assert!(!script.contains("/dev/loop7"));
        assert!(script.ends_with("exec lorax -p 'Fedora Atomic'\n"));
    }

    #[test]
    fn test_dockerfile() {
        let df = dockerfile("fedora").unwrap();
        assert!(df.contains("\nFROM fedora\n"));
        assert!(df.contains("CMD [\"/bin/sh\", \"/root/lorax.sh\"]"));
    }

    #[test]
    fn test_image_name() {
        assert_eq!(image_name("centos"), "centos/rpmostree-toolbox-lorax");
    }
}
