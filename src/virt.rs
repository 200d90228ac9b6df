//! Image-factory build path.
//!
//! A utility VM image is built from a kickstart (or reused by UUID), then an
//! `indirection` target build runs lorax inside it against the customization
//! document rendered here. The results tarball is unpacked into the output
//! directory.

use std::fs;
use std::net::UdpSocket;
use std::path::Path;

use serde_json::json;
use tracing::info;

use crate::artifacts;
use crate::compose::{ComposeReport, Composer, INDIRECTION_TEMPLATE};
use crate::error::{ComposeError, Result};
use crate::imagefactory::{BuildParameters, FactoryImage, ImageFactory};
use crate::lorax;
use crate::template;
use crate::workflow::{BuildPath, ComposeProgress, ComposeStage};

/// Where the indirection build leaves its output inside the utility guest.
pub const RESULTS_LOCATION: &str = "/lorout/output.tar";

/// Target name of the lorax build in the image factory.
pub const INDIRECTION_TARGET: &str = "indirection";

const UTIL_POST: &str = r#"
%post
# For cloud images, 'eth0' _is_ the predictable device name, since
# we don't want to be tied to specific virtual (!) hardware
rm -f /etc/udev/rules.d/70*
ln -s /dev/null /etc/udev/rules.d/80-net-setup-link.rules

# simple eth0 config, again not hard-coded to the build hardware
cat > /etc/sysconfig/network-scripts/ifcfg-eth0 << EOF
DEVICE="eth0"
BOOTPROTO="dhcp"
ONBOOT="yes"
TYPE="Ethernet"
PERSISTENT_DHCLIENT="yes"
EOF
%end
"#;

/// OS name and version of a TDL document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TdlOs {
    pub name: String,
    pub version: String,
}

impl TdlOs {
    /// File stem oz uses for the OS's auto-install file.
    pub fn auto_stem(&self) -> String {
        format!("{}{}", self.name, self.version)
    }
}

/// Read `<os><name>` and `<os><version>` from a TDL.
pub fn parse_tdl_os(tdl: &str) -> Result<TdlOs> {
    let os = element_text(tdl, "os")
        .ok_or_else(|| ComposeError::config("TDL has no <os> element"))?;
    let field = |tag: &str| {
        element_text(os, tag)
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ComposeError::config(format!("TDL <os> has no <{tag}>")))
    };
    Ok(TdlOs {
        name: field("name")?,
        version: field("version")?,
    })
}

fn element_text<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}

/// oz overrides passed to every factory build.
pub fn oz_overrides(virtnetwork: Option<&str>) -> String {
    match virtnetwork {
        Some(network) => json!({ "libvirt": { "network": network } }).to_string(),
        None => json!({}).to_string(),
    }
}

/// Local address of the interface the default route goes out of.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn default_host_ip() -> Result<String> {
    let detect = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:53")?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    detect().map_err(|e| ComposeError::config(format!("detecting host address: {e}")))
}

impl Composer<'_> {
    /// Build the installer tree through the image factory.
    pub fn create_virt(&self, factory: &dyn ImageFactory) -> Result<ComposeReport> {
        let mut progress = ComposeProgress::new(BuildPath::Virt);
        self.virt_steps(factory, &mut progress, default_host_ip)
            .map_err(|e| progress.fail(e))
    }

    fn virt_steps(
        &self,
        factory: &dyn ImageFactory,
        progress: &mut ComposeProgress,
        host_ip: fn() -> Result<String>,
    ) -> Result<ComposeReport> {
        let repos = self.assemble_repos()?;
        let lorax_repos = lorax::repo_args(self.cfg)?.join(" ");
        let util_tmpl = self.load_template(INDIRECTION_TEMPLATE)?;
        progress.advance(ComposeStage::RepoAssembled);

        let server = self.start_repo_server()?;
        progress.advance(ComposeStage::ServerStarted);

        let mut subs = self.base_substitutions(server.port());
        subs.set("LORAX_REPOS", lorax_repos);
        if template::requests(&util_tmpl, "OSTREE_HOSTIP") {
            subs.set("OSTREE_HOSTIP", host_ip()?);
        }
        // repo files are inserted verbatim, after placeholders are resolved
        let rendered = template::render(&util_tmpl, &subs)?;
        let util_xml = template::inject_repo_file(&rendered, &repos)?;
        self.work.write("lorax.xml", &util_xml)?;
        progress.advance(ComposeStage::TemplateRendered);

        let overrides = oz_overrides(self.opts.virtnetwork.as_deref());
        let util_image = self.utility_image(factory, &overrides)?;

        let params: BuildParameters = [
            ("results_location", RESULTS_LOCATION.to_string()),
            ("utility_image", util_image.identifier.clone()),
            ("utility_customizations", util_xml),
            ("oz_overrides", overrides),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        info!("building the lorax image");
        let lorax_image = factory
            .submit_target_image(INDIRECTION_TARGET, &util_image.identifier, &params)?
            .wait(self.cfg.build_timeout)?;
        progress.advance(ComposeStage::ImageBuilt);

        let outputdir = self.prepare_outputdir()?;
        artifacts::extract_results(&lorax_image.data, &outputdir)?;
        progress.advance(ComposeStage::ArtifactExtracted);

        server.stop()?;
        progress.advance(ComposeStage::ServerStopped);

        Ok(ComposeReport {
            outputdir,
            installer_iso: None,
            stages: progress.reached().to_vec(),
        })
    }

    /// Reuse the image named by `--util_uuid`, or build one from the utility TDL.
    fn utility_image(&self, factory: &dyn ImageFactory, overrides: &str) -> Result<FactoryImage> {
        if let Some(uuid) = &self.opts.util_uuid {
            let image = factory.image_with_id(uuid)?;
            info!(identifier = %image.identifier, "re-using utility image");
            return Ok(image);
        }

        let tdl_path = self.cfg.util_tdl.as_deref().ok_or_else(|| {
            ComposeError::config("building a utility image needs 'util_tdl' (or --util_tdl)")
        })?;
        let tdl = read(tdl_path)?;
        let kickstart = self.utility_kickstart(&tdl)?;

        let params: BuildParameters = [
            ("install_script", kickstart),
            ("generate_icicle", "false".to_string()),
            ("oz_overrides", overrides.to_string()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        info!("starting utility image build");
        let image = factory
            .submit_base_image(&tdl, &params)?
            .wait(self.cfg.build_timeout)?;
        info!(data = %image.data.display(), "created utility image");
        Ok(image)
    }

    /// oz's auto-install file for the TDL's OS plus the network `%post`.
    ///
    /// A `--post` script, when given, is appended as a further `%post`
    /// section. The result is also written to `<Name><Version>.ks`.
    pub(crate) fn utility_kickstart(&self, tdl: &str) -> Result<String> {
        let os = parse_tdl_os(tdl)?;
        let auto_dir = self.cfg.oz_auto_dir.as_deref().ok_or_else(|| {
            ComposeError::config("building a utility image needs 'oz_auto_dir'")
        })?;
        let mut ks = read(&auto_dir.join(format!("{}.auto", os.auto_stem())))?;
        ks.push_str(UTIL_POST);

        if let Some(post) = &self.opts.post {
            let script = read(post)?;
            ks.push_str("\n%post\n");
            ks.push_str(&script);
            if !script.ends_with('\n') {
                ks.push('\n');
            }
            ks.push_str("%end\n");
        }

        self.work.write(format!("{}.ks", os.auto_stem()), &ks)?;
        Ok(ks)
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ComposeError::io(path, e))
}
