//! Linear progress tracking for a compose run.
//!
//! Both build paths move through the same stages in the same order. Each
//! stage is recorded as it is reached so a failure can be reported against
//! the last stage that completed; the resources acquired up to that point
//! are owned by guards and released as the error propagates.

use std::fmt;

use tracing::{error, info};

use crate::error::ComposeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComposeStage {
    RepoAssembled,
    ServerStarted,
    TemplateRendered,
    ImageBuilt,
    ArtifactExtracted,
    ServerStopped,
}

impl fmt::Display for ComposeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RepoAssembled => "repo-assembled",
            Self::ServerStarted => "server-started",
            Self::TemplateRendered => "template-rendered",
            Self::ImageBuilt => "image-built",
            Self::ArtifactExtracted => "artifact-extracted",
            Self::ServerStopped => "server-stopped",
        };
        f.write_str(name)
    }
}

/// Build path a compose run takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPath {
    Container,
    Virt,
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Container => "container",
            Self::Virt => "virt",
        })
    }
}

/// Stages reached so far, in order.
#[derive(Debug, Clone)]
pub struct ComposeProgress {
    path: BuildPath,
    reached: Vec<ComposeStage>,
}

impl ComposeProgress {
    pub fn new(path: BuildPath) -> Self {
        Self {
            path,
            reached: Vec::new(),
        }
    }

    /// Record `stage`; stages only move forward.
    pub fn advance(&mut self, stage: ComposeStage) {
        debug_assert!(
            self.current().map_or(true, |last| stage > last),
            "compose stage {stage} reached out of order"
        );
        info!(path = %self.path, %stage, "compose stage reached");
        self.reached.push(stage);
    }

    pub fn current(&self) -> Option<ComposeStage> {
        self.reached.last().copied()
    }

    pub fn reached(&self) -> &[ComposeStage] {
        &self.reached
    }

    /// Log `err` against the last completed stage and pass it through.
    pub fn fail(&self, err: ComposeError) -> ComposeError {
        match self.current() {
            Some(stage) => error!(path = %self.path, after = %stage, "compose failed: {err}"),
            None => error!(path = %self.path, "compose failed before any stage: {err}"),
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_are_recorded_in_order() {
        let mut progress = ComposeProgress::new(BuildPath::Container);
        assert_eq!(progress.current(), None);
        progress.advance(ComposeStage::RepoAssembled);
        progress.advance(ComposeStage::ServerStarted);
        progress.advance(ComposeStage::ServerStopped);
        assert_eq!(
            progress.reached(),
            &[
                ComposeStage::RepoAssembled,
                ComposeStage::ServerStarted,
                ComposeStage::ServerStopped
            ]
        );
    }

    #[test]
    #[should_panic(expected = "out of order")]
    #[cfg(debug_assertions)]
    fn test_backwards_stage_panics_in_debug() {
        let mut progress = ComposeProgress::new(BuildPath::Virt);
        progress.advance(ComposeStage::TemplateRendered);
        progress.advance(ComposeStage::RepoAssembled);
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(ComposeStage::ArtifactExtracted.to_string(), "artifact-extracted");
        assert_eq!(BuildPath::Virt.to_string(), "virt");
    }
}
