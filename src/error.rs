//! Error taxonomy for compose runs.
//!
//! Library code returns [`ComposeError`]; the binary wraps it in `anyhow`
//! with call-site context.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

/// Failure of a placeholder substitution pass.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    /// A substitution value contains the token of another key in the same set.
    #[error("value for '{key}' contains placeholder token '@{other}@'")]
    Collision {
        /// Key whose value carries the token.
        key: String,
        /// Key whose token appears in the value.
        other: String,
    },

    /// Tokens were still present after every substitution was applied.
    #[error("unresolved placeholders after rendering: {}", .tokens.join(", "))]
    Unresolved {
        /// Distinct leftover tokens, in order of first appearance.
        tokens: Vec<String>,
    },

    /// The document lacks an element the renderer has to extend.
    #[error("template has no <{element}> element")]
    MissingElement {
        /// Element name.
        element: &'static str,
    },
}

/// Top-level error type for the composer.
#[derive(Debug, Error)]
pub enum ComposeError {
    /// Bad or missing input file, or an invalid configuration value.
    #[error("configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },

    /// An external command could not be started or exited non-zero.
    #[error("command `{command}` failed ({status}){}", format_output(.output))]
    Subprocess {
        /// Rendered command line.
        command: String,
        /// Exit status, or a short description if the process never ran to completion.
        status: String,
        /// Captured stdout and stderr, if any was collected.
        output: String,
    },

    /// A bounded wait on an external process or build expired.
    #[error("{target} did not finish within {timeout:?}")]
    BuildTimeout {
        /// What was being waited on.
        target: String,
        /// The bound that was exceeded.
        timeout: Duration,
    },

    /// Placeholder rendering failed.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The image factory reported an unusable image.
    #[error("image factory error: {message}")]
    Image {
        /// Description of the problem.
        message: String,
    },

    /// An I/O operation on a specific path failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

fn format_output(output: &str) -> String {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(":\n{trimmed}")
    }
}

impl ComposeError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn exit_status(command: String, status: ExitStatus, output: String) -> Self {
        Self::Subprocess {
            command,
            status: status.to_string(),
            output,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ComposeError>;
