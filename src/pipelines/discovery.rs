//! Sample discovery: turns a directory of raw read files into per-sample units.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::defs::{PipelineError, ReadMode, COMPRESSED_READ_EXTS, READ_EXTS};
use crate::utils::fastx::{derive_sample_id, has_mate_tag, has_read_extension, read_mate, strip_read_extension, Mate};

/// One sequencing unit. Created once during discovery and shared by every
/// stage of its chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub sample_id: String,
    pub read_mode: ReadMode,
    /// R1 only, or R1 then R2.
    pub raw_files: Vec<PathBuf>,
}

/// Scans `reads_dir` and groups its read files into samples, ordered by sample id.
///
/// # Arguments
///
/// * `reads_dir` - Directory holding the raw reads (not searched recursively).
/// * `mode` - Paired-end files are grouped by their `_R1`/`_R2` tags;
///   single-end treats every compressed read file as its own sample.
///
/// # Returns
/// Samples, or PipelineError::Discovery when nothing usable is found or a
/// pair is incomplete.
pub fn discover_samples(reads_dir: &Path, mode: ReadMode) -> Result<Vec<Arc<Sample>>, PipelineError> {
    let file_names = list_file_names(reads_dir)?;
    let samples = match mode {
        ReadMode::PairedEnd => group_paired(reads_dir, &file_names)?,
        ReadMode::SingleEnd => group_single(reads_dir, &file_names)?,
    };

    if samples.is_empty() {
        return Err(PipelineError::Discovery(format!(
            "No {} read files found in {}",
            match mode {
                ReadMode::PairedEnd => "paired-end (*_R1*/*_R2*)",
                ReadMode::SingleEnd => "compressed (*.fastq.gz, *.fq.gz)",
            },
            reads_dir.display()
        )));
    }

    info!("Discovered {} samples in {}", samples.len(), reads_dir.display());
    Ok(samples.into_iter().map(Arc::new).collect())
}

fn list_file_names(reads_dir: &Path) -> Result<Vec<String>, PipelineError> {
    let entries = fs::read_dir(reads_dir).map_err(|e| {
        PipelineError::Discovery(format!("Cannot read directory {}: {}", reads_dir.display(), e))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.path().is_file() {
            continue;
        }
        match entry.file_name().into_string() {
            Ok(name) => names.push(name),
            Err(name) => warn!("Skipping non UTF-8 file name {:?}", name),
        }
    }
    names.sort();
    Ok(names)
}

fn group_paired(reads_dir: &Path, file_names: &[String]) -> Result<Vec<Sample>, PipelineError> {
    let mut groups: BTreeMap<String, (Vec<PathBuf>, Vec<PathBuf>)> = BTreeMap::new();

    for name in file_names {
        if !has_read_extension(name, READ_EXTS) || !has_mate_tag(name) {
            debug!("Ignoring {} in paired-end mode", name);
            continue;
        }
        let mate = read_mate(name).ok_or_else(|| {
            PipelineError::Discovery(format!(
                "{} carries an R1/R2 tag but does not follow the <sample>[_S<n>][_L<nnn>]_R<1|2>[_<nnn>].fastq[.gz] naming pattern",
                name
            ))
        })?;
        let (r1, r2) = groups.entry(derive_sample_id(name)).or_default();
        match mate {
            Mate::R1 => r1.push(reads_dir.join(name)),
            Mate::R2 => r2.push(reads_dir.join(name)),
        }
    }

    let mut samples = Vec::with_capacity(groups.len());
    for (sample_id, (mut r1, mut r2)) in groups {
        if r1.len() != 1 || r2.len() != 1 {
            return Err(PipelineError::Discovery(format!(
                "Sample '{}' needs exactly one R1 and one R2 file, found {} R1 and {} R2",
                sample_id,
                r1.len(),
                r2.len()
            )));
        }
        samples.push(Sample {
            sample_id,
            read_mode: ReadMode::PairedEnd,
            raw_files: vec![r1.remove(0), r2.remove(0)],
        });
    }
    Ok(samples)
}

fn group_single(reads_dir: &Path, file_names: &[String]) -> Result<Vec<Sample>, PipelineError> {
    let mut samples: BTreeMap<String, PathBuf> = BTreeMap::new();

    for name in file_names {
        if !has_read_extension(name, COMPRESSED_READ_EXTS) {
            debug!("Ignoring {} in single-end mode", name);
            continue;
        }
        let sample_id = strip_read_extension(name);
        if let Some(previous) = samples.insert(sample_id.clone(), reads_dir.join(name)) {
            return Err(PipelineError::Discovery(format!(
                "Sample '{}' is claimed by both {} and {}",
                sample_id,
                previous.display(),
                name
            )));
        }
    }

    Ok(samples
        .into_iter()
        .map(|(sample_id, path)| Sample {
            sample_id,
            read_mode: ReadMode::SingleEnd,
            raw_files: vec![path],
        })
        .collect())
}
