//! Post-processing of lorax output.
//!
//! The container build injects the OSTree payload into lorax's `boot.iso`,
//! so the image is published as `installer.iso` and the tree manifest is
//! rewritten to match. The virt build instead returns a tarball that is
//! unpacked into the output directory.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{ComposeError, Result};

pub const LORAX_OUTPUT_DIR: &str = "lorax";
pub const BOOT_ISO: &str = "boot.iso";
pub const INSTALLER_ISO: &str = "installer.iso";
pub const TREEINFO: &str = ".treeinfo";

/// Rename `lorax/images/boot.iso` and fix up `lorax/.treeinfo`.
///
/// Returns the path of the renamed ISO.
pub fn publish_installer_iso(outputdir: &Path) -> Result<PathBuf> {
    let lorax_output = outputdir.join(LORAX_OUTPUT_DIR);
    let images = lorax_output.join("images");
    let boot_iso = images.join(BOOT_ISO);
    let installer_iso = images.join(INSTALLER_ISO);

    fs::rename(&boot_iso, &installer_iso).map_err(|e| ComposeError::io(&boot_iso, e))?;
    info!(from = %boot_iso.display(), to = %installer_iso.display(), "renamed");

    rewrite_treeinfo(&lorax_output.join(TREEINFO))?;
    Ok(installer_iso)
}

/// Point every `boot.iso` line of a treeinfo manifest at `installer.iso`.
///
/// The new content is written to `<path>.tmp` and renamed over the original,
/// so an interrupted rewrite leaves the original untouched. Lines not
/// starting with `boot.iso` are copied byte for byte.
pub fn rewrite_treeinfo(path: &Path) -> Result<()> {
    let input = File::open(path).map_err(|e| ComposeError::io(path, e))?;
    replace_file(path, |out| copy_rewritten(BufReader::new(input), out))?;
    info!(path = %path.display(), "rewrote treeinfo");
    Ok(())
}

/// Write `path` through `<path>.tmp`, renaming only after `fill` succeeded
/// and the data is synced. The temp file is removed on any failure.
fn replace_file<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> std::io::Result<()>,
{
    let tmp = tmp_path(path);
    let output = File::create(&tmp).map_err(|e| ComposeError::io(&tmp, e))?;
    let mut writer = BufWriter::new(output);

    let written = fill(&mut writer)
        .and_then(|_| writer.into_inner().map_err(|e| e.into_error()))
        .and_then(|f| f.sync_all());

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(ComposeError::io(&tmp, e));
    }

    fs::rename(&tmp, path).map_err(|e| ComposeError::io(path, e))
}

fn copy_rewritten<R: BufRead, W: Write>(mut reader: R, writer: &mut W) -> std::io::Result<()> {
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if line.starts_with(BOOT_ISO.as_bytes()) {
            let text = String::from_utf8_lossy(&line);
            writer.write_all(text.replace(BOOT_ISO, INSTALLER_ISO).as_bytes())?;
        } else {
            writer.write_all(&line)?;
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Unpack a build result tarball into `outputdir`.
pub fn extract_results(tarball: &Path, outputdir: &Path) -> Result<()> {
    info!(
        tarball = %tarball.display(),
        "extracting images to {}/images",
        outputdir.display()
    );
    fs::create_dir_all(outputdir).map_err(|e| ComposeError::io(outputdir, e))?;
    let file = File::open(tarball).map_err(|e| ComposeError::io(tarball, e))?;
    let mut archive = tar::Archive::new(file);
    archive
        .unpack(outputdir)
        .map_err(|e| ComposeError::io(tarball, e))?;
    Ok(())
}
