//! Compose OS installer images from an OSTree repository.
//!
//! A compose run serves the OSTree repository over a short-lived local HTTP
//! server, renders the lorax templates against it, and drives one of two
//! build paths:
//!
//! - **container**: lorax runs in a privileged container built from the
//!   target OS image; the resulting `boot.iso` is published as
//!   `installer.iso`.
//! - **virt**: the image factory builds (or reuses) a utility VM image and
//!   runs lorax inside it as an `indirection` build; the results tarball is
//!   unpacked into the output directory.
//!
//! ```text
//! repos ──> template ──> server ──┬─> container (docker + lorax)
//!                                 └─> virt (imagefactory + lorax)
//!                                          │
//!                                   artifacts (iso, .treeinfo)
//! ```

pub mod artifacts;
pub mod compose;
pub mod config;
pub mod container;
pub mod error;
pub mod imagefactory;
pub mod lorax;
pub mod preflight;
pub mod process;
pub mod repos;
pub mod server;
pub mod template;
pub mod virt;
pub mod workdir;
pub mod workflow;

pub use compose::{ComposeReport, Composer, RunOptions};
pub use config::{ComposeConfig, ConfigOverrides};
pub use error::{ComposeError, Result};
