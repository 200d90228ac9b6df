//! Preflight checks for build validation.
//!
//! Validates that the host has the external tools a build path drives
//! before anything is written or started.
//!
//! # Example
//!
//! ```rust
//! use installer_composer::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("docker") {
//!     println!("docker not installed");
//! }
//!
//! let tools = &[("ostree", "ostree"), ("docker", "docker")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{ComposeError, Result};

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools the containerized build needs, as (command, package).
pub const CONTAINER_TOOLS: &[(&str, &str)] = &[("ostree", "ostree"), ("docker", "docker")];

/// Tools the image-factory build needs, as (command, package).
pub const VIRT_TOOLS: &[(&str, &str)] = &[
    ("ostree", "ostree"),
    ("imagefactory", "imagefactory"),
];

/// Check that specific tools are available.
///
/// # Arguments
///
/// * `tools` - Slice of (command, package) tuples
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect::<Vec<_>>();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ComposeError::config(format!(
            "Missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}
