//! Yum repository configuration assembly.
//!
//! The compose tree file is a JSON document whose `repos` field lists repo
//! names. Each name maps to `<configdir>/<name>.repo`; the installer build
//! receives all of them concatenated, each one explicitly enabled.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{ComposeError, Result};

#[derive(Debug, Deserialize)]
struct TreeFile {
    repos: Vec<String>,
}

/// Read the repo names listed in `tree_file`, in file order.
pub fn repo_names(tree_file: &Path) -> Result<Vec<String>> {
    let bytes = fs::read(tree_file).map_err(|e| {
        ComposeError::config(format!(
            "reading repo list '{}': {e}",
            tree_file.display()
        ))
    })?;
    let parsed: TreeFile = serde_json::from_slice(&bytes).map_err(|e| {
        ComposeError::config(format!(
            "parsing repo list '{}': {e}",
            tree_file.display()
        ))
    })?;
    Ok(parsed.repos)
}

/// Concatenate the `.repo` files named in `tree_file`, each followed by `enabled=1`.
pub fn assemble_repo_config(tree_file: &Path, configdir: &Path) -> Result<String> {
    let mut repos = String::new();
    for name in repo_names(tree_file)? {
        let repo_file = configdir.join(format!("{name}.repo"));
        let content = fs::read_to_string(&repo_file).map_err(|e| {
            ComposeError::config(format!(
                "reading repo file '{}' for '{name}': {e}",
                repo_file.display()
            ))
        })?;
        repos.push_str(&content);
        repos.push_str("enabled=1\n");
    }
    Ok(repos)
}
