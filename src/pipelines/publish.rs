//! Copies declared stage outputs into the results tree.

use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::config::defs::PipelineError;
use crate::pipelines::executor::TaskInstance;
use crate::pipelines::graph::{BoundStage, PublishSource};

/// What one publish call placed, and what it could not.
#[derive(Debug, Default)]
pub struct PublishOutcome {
    pub published: Vec<PathBuf>,
    /// PipelineError::Publish entries. Never fatal to the stage.
    pub errors: Vec<PipelineError>,
}

#[derive(Debug, Clone)]
pub struct OutputOrganizer {
    out_root: PathBuf,
}

impl OutputOrganizer {
    pub fn new(out_root: impl Into<PathBuf>) -> Self {
        OutputOrganizer { out_root: out_root.into() }
    }

    /// Destination of `src` under `subdir`.
    pub fn destination(&self, subdir: &str, src: &Path) -> Option<PathBuf> {
        src.file_name().map(|name| self.out_root.join(subdir).join(name))
    }

    /// Copies each output named by the stage's publish rules to
    /// `<out_root>/<subdir>/<file name>`. The working copy stays in place and
    /// an existing destination is overwritten.
    ///
    /// # Arguments
    ///
    /// * `stage` - The bound stage whose rules are applied.
    /// * `task` - Its finished TaskInstance. Nothing is published unless it succeeded.
    pub async fn publish(&self, stage: &BoundStage, task: &TaskInstance) -> PublishOutcome {
        let mut outcome = PublishOutcome::default();
        if !task.succeeded() {
            debug!("{} [{}]: not published, task {:?}", task.sample_id, task.stage_name, task.status);
            return outcome;
        }

        for rule in &stage.spec.publish_rules {
            let src = match rule.source {
                PublishSource::Output(slot) => stage.output(slot).map(Path::to_path_buf),
                PublishSource::AttemptLog => task.last_log().map(Path::to_path_buf),
            };
            let Some(src) = src else {
                continue;
            };
            match self.copy_one(&src, rule.subdir).await {
                Ok(dest) => {
                    debug!("Published {} -> {}", src.display(), dest.display());
                    outcome.published.push(dest);
                }
                Err(e) => {
                    warn!("{} [{}]: {}", task.sample_id, task.stage_name, e);
                    outcome.errors.push(e);
                }
            }
        }
        outcome
    }

    async fn copy_one(&self, src: &Path, subdir: &str) -> Result<PathBuf, PipelineError> {
        let dest = self.destination(subdir, src).ok_or_else(|| PipelineError::Publish {
            src: src.to_path_buf(),
            dest: self.out_root.join(subdir),
            error: "source has no file name".to_string(),
        })?;
        let publish_error = |e: std::io::Error| PipelineError::Publish {
            src: src.to_path_buf(),
            dest: dest.clone(),
            error: e.to_string(),
        };

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(publish_error)?;
        }
        tokio::fs::copy(src, &dest).await.map_err(publish_error)?;
        Ok(dest)
    }
}
