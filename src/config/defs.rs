use std::ffi::OsString;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cli::Arguments;
use crate::utils::file::absolute_path;

// External software
pub const TRIMMOMATIC_TAG: &str = "trimmomatic";
pub const BOWTIE2_TAG: &str = "bowtie2";
pub const SAMTOOLS_TAG: &str = "samtools";
pub const BCFTOOLS_TAG: &str = "bcftools";
pub const FASTQC_TAG: &str = "fastqc";

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamtoolsSubcommand {
    Sort,
    Index,
    Flagstat,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcftoolsSubcommand {
    Mpileup,
    Call,
    Filter,
    Index,
}

// Static Filenames
pub const RUN_SUMMARY_FILE: &str = "pipeline_summary.tsv";
pub const WORK_DIR_NAME: &str = "work";

// Publish subdirectories under the output root
pub const TRIMMED_DIR: &str = "trimmed";
pub const TRIM_LOG_DIR: &str = "trim_logs";
pub const TRIM_SUMMARY_DIR: &str = "trim_summary";
pub const HOST_REMOVAL_LOG_DIR: &str = "host_removal_logs";
pub const ALIGNMENT_DIR: &str = "alignments";
pub const ALIGNMENT_LOG_DIR: &str = "alignment_logs";
pub const SORTED_BAM_DIR: &str = "sorted_bam";
pub const ALIGNMENT_STATS_DIR: &str = "alignment_stats";
pub const VARIANTS_DIR: &str = "variants";
pub const FILTERED_VARIANTS_DIR: &str = "filtered_variants";
pub const CONSENSUS_DIR: &str = "consensus";
pub const MASKED_CONSENSUS_DIR: &str = "masked_consensus";
pub const QC_DIR: &str = "qc";

// Static Parameters
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const BOWTIE2_INDEX_SUFFIXES: &[&str] = &["1", "2", "3", "4", "rev.1", "rev.2"];
pub const BOWTIE2_INDEX_EXTS: &[&str] = &["bt2", "bt2l"];
pub const COMPRESSED_READ_EXTS: &[&str] = &["fastq.gz", "fq.gz"];
pub const READ_EXTS: &[&str] = &["fastq.gz", "fq.gz", "fastq", "fq"];


#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("{tool} failed in stage '{stage}' (attempt {attempt}): {status}")]
    ToolInvocation {
        stage: String,
        tool: String,
        attempt: u32,
        status: String,
    },

    #[error("Stage '{stage}' produced a missing or empty output: {}", path.display())]
    ToolOutput { stage: String, path: PathBuf },

    #[error("Stage '{stage}' input is missing: {}", path.display())]
    MissingInput { stage: String, path: PathBuf },

    #[error("Stage '{stage}' failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        stage: String,
        attempts: u32,
        last: Box<PipelineError>,
    },

    #[error("Failed to publish {} to {}: {error}", src.display(), dest.display())]
    Publish {
        src: PathBuf,
        dest: PathBuf,
        error: String,
    },

    #[error("IO error: {0}")]
    IOError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Per-task failures that the executor retries locally.
    pub fn is_retriable(&self) -> bool {
        matches!(self, PipelineError::ToolInvocation { .. } | PipelineError::ToolOutput { .. })
    }

    /// Errors that invalidate the whole run, not only one sample.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PipelineError::Configuration(_) | PipelineError::Discovery(_))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadMode {
    SingleEnd,
    PairedEnd,
}

impl ReadMode {
    pub fn file_count(&self) -> usize {
        match self {
            ReadMode::SingleEnd => 1,
            ReadMode::PairedEnd => 2,
        }
    }
}


/// A genome FASTA plus its pre-built bowtie2 index bundle.
/// Verified once when the run is configured and shared read-only by every chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceSet {
    pub name: String,
    pub fasta: PathBuf,
    pub index_prefix: PathBuf,
    pub index_files: Vec<PathBuf>,
}

impl ReferenceSet {
    /// Resolves a reference, checking that the FASTA is readable and that the
    /// complete six-file index bundle exists under `index_prefix`.
    ///
    /// # Arguments
    ///
    /// * `name` - Label used in messages (e.g. "virus", "host").
    /// * `fasta` - Path to the reference sequence.
    /// * `index_prefix` - bowtie2 index basename, as passed to `bowtie2 -x`.
    ///
    /// # Returns
    /// ReferenceSet or PipelineError::Configuration
    pub fn resolve(name: &str, fasta: &Path, index_prefix: &Path) -> Result<Self, PipelineError> {
        File::open(fasta).map_err(|e| {
            PipelineError::Configuration(format!(
                "Cannot read {} reference FASTA {}: {}",
                name,
                fasta.display(),
                e
            ))
        })?;

        let index_files = BOWTIE2_INDEX_EXTS
            .iter()
            .map(|ext| bowtie2_bundle(index_prefix, ext))
            .find(|bundle| bundle.iter().all(|f| f.is_file()))
            .ok_or_else(|| {
                let missing: Vec<String> = bowtie2_bundle(index_prefix, BOWTIE2_INDEX_EXTS[0])
                    .into_iter()
                    .filter(|f| !f.is_file())
                    .map(|f| f.display().to_string())
                    .collect();
                PipelineError::Configuration(format!(
                    "Incomplete {} bowtie2 index at {}; missing: {}",
                    name,
                    index_prefix.display(),
                    missing.join(", ")
                ))
            })?;

        Ok(ReferenceSet {
            name: name.to_string(),
            fasta: fasta.to_path_buf(),
            index_prefix: index_prefix.to_path_buf(),
            index_files,
        })
    }

    /// Re-checks that every file of the reference is still on disk.
    pub fn verify(&self) -> Result<(), PipelineError> {
        for path in std::iter::once(&self.fasta).chain(self.index_files.iter()) {
            if !path.is_file() {
                return Err(PipelineError::Configuration(format!(
                    "{} reference file disappeared: {}",
                    self.name,
                    path.display()
                )));
            }
        }
        Ok(())
    }
}

fn bowtie2_bundle(prefix: &Path, ext: &str) -> Vec<PathBuf> {
    BOWTIE2_INDEX_SUFFIXES
        .iter()
        .map(|suffix| {
            let mut name: OsString = prefix.as_os_str().to_owned();
            name.push(format!(".{}.{}", suffix, ext));
            PathBuf::from(name)
        })
        .collect()
}


#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Duration::ZERO,
            timeout: None,
        }
    }
}

/// Trimmomatic thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct TrimParams {
    pub adapters: Option<PathBuf>,
    pub seed_mismatches: u32,
    pub palindrome_clip: u32,
    pub simple_clip: u32,
    pub window_size: u32,
    pub window_quality: u32,
    pub min_len: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariantParams {
    pub min_qual: u32,
    pub min_depth: u32,
    pub call_theta: f64,
}

/// Executable names or paths for each external tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolPaths {
    pub trimmomatic: String,
    pub bowtie2: String,
    pub samtools: String,
    pub bcftools: String,
    pub fastqc: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            trimmomatic: TRIMMOMATIC_TAG.to_string(),
            bowtie2: BOWTIE2_TAG.to_string(),
            samtools: SAMTOOLS_TAG.to_string(),
            bcftools: BCFTOOLS_TAG.to_string(),
            fastqc: FASTQC_TAG.to_string(),
        }
    }
}


/// Run-wide settings. Built once at startup, then shared behind an `Arc`
/// and never mutated.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub reads_dir: PathBuf,
    pub out_dir: PathBuf,
    pub work_dir: PathBuf,
    pub read_mode: ReadMode,
    pub virus: ReferenceSet,
    pub host: Option<ReferenceSet>,
    pub skip_trim: bool,
    pub with_host_removal: bool,
    pub with_qc: bool,
    pub save_trimmed: bool,
    pub mask_low_coverage: bool,
    pub trim: TrimParams,
    pub variants: VariantParams,
    pub tools: ToolPaths,
    pub threads: usize,
    pub max_parallel: usize,
    pub retry: RetryPolicy,
    pub skip_tool_check: bool,
}

impl RunConfig {
    /// Validates the parsed command line and freezes it into a RunConfig.
    /// Nothing is written to disk here.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command-line arguments.
    /// * `cwd` - Directory relative paths are resolved against.
    /// * `default_parallel` - Worker slots used when `--max-parallel` is absent.
    ///
    /// # Returns
    /// RunConfig or PipelineError::Configuration
    pub fn from_args(args: &Arguments, cwd: &Path, default_parallel: usize) -> Result<Self, PipelineError> {
        let reads_dir = absolute_path(&args.reads, cwd);
        if !reads_dir.is_dir() {
            return Err(PipelineError::Configuration(format!(
                "Reads directory does not exist: {}",
                reads_dir.display()
            )));
        }

        let out_dir = absolute_path(&args.out_dir, cwd);
        let work_dir = match &args.work_dir {
            Some(dir) => absolute_path(dir, cwd),
            None => out_dir.join(WORK_DIR_NAME),
        };

        let virus = ReferenceSet::resolve(
            "virus",
            &absolute_path(&args.virus_fasta, cwd),
            &absolute_path(&args.virus_index, cwd),
        )?;

        let host = match (&args.host_fasta, &args.host_index) {
            (Some(fasta), Some(index)) => Some(ReferenceSet::resolve(
                "host",
                &absolute_path(fasta, cwd),
                &absolute_path(index, cwd),
            )?),
            (None, None) => None,
            _ => {
                return Err(PipelineError::Configuration(
                    "--host-fasta and --host-index must be given together".to_string(),
                ));
            }
        };

        let adapters = match &args.adapters {
            Some(path) => {
                let path = absolute_path(path, cwd);
                if !path.is_file() {
                    return Err(PipelineError::Configuration(format!(
                        "Adapter file does not exist: {}",
                        path.display()
                    )));
                }
                Some(path)
            }
            None => None,
        };

        if args.max_attempts == 0 {
            return Err(PipelineError::Configuration("--max-attempts must be at least 1".to_string()));
        }
        if args.threads == 0 {
            return Err(PipelineError::Configuration("--threads must be at least 1".to_string()));
        }
        let max_parallel = args.max_parallel.unwrap_or(default_parallel);
        if max_parallel == 0 {
            return Err(PipelineError::Configuration("--max-parallel must be at least 1".to_string()));
        }

        Ok(RunConfig {
            cwd: cwd.to_path_buf(),
            reads_dir,
            out_dir,
            work_dir,
            read_mode: if args.single_end { ReadMode::SingleEnd } else { ReadMode::PairedEnd },
            virus,
            with_host_removal: args.remove_host || host.is_some(),
            host,
            skip_trim: args.no_trim,
            with_qc: args.with_qc,
            save_trimmed: args.save_trimmed,
            mask_low_coverage: !args.no_mask,
            trim: TrimParams {
                adapters,
                seed_mismatches: args.seed_mismatches,
                palindrome_clip: args.palindrome_clip,
                simple_clip: args.simple_clip,
                window_size: args.window_size,
                window_quality: args.window_quality,
                min_len: args.min_read_len,
            },
            variants: VariantParams {
                min_qual: args.min_qual,
                min_depth: args.min_depth,
                call_theta: args.call_theta,
            },
            tools: ToolPaths {
                trimmomatic: args.trimmomatic.clone(),
                bowtie2: args.bowtie2.clone(),
                samtools: args.samtools.clone(),
                bcftools: args.bcftools.clone(),
                fastqc: args.fastqc.clone(),
            },
            threads: args.threads,
            max_parallel,
            retry: RetryPolicy {
                max_attempts: args.max_attempts,
                backoff: Duration::from_secs(args.retry_backoff_secs),
                timeout: args.stage_timeout_secs.map(Duration::from_secs),
            },
            skip_tool_check: args.skip_tool_check,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn write_reference(dir: &Path, name: &str, ext: &str) -> anyhow::Result<(PathBuf, PathBuf)> {
        let fasta = dir.join(format!("{}.fasta", name));
        fs::write(&fasta, ">ref\nACGT\n")?;
        let prefix = dir.join(name);
        for path in bowtie2_bundle(&prefix, ext) {
            fs::write(path, b"idx")?;
        }
        Ok((fasta, prefix))
    }

    #[test]
    fn test_reference_set_resolves_complete_bundle() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let (fasta, prefix) = write_reference(tmp.path(), "sars2", "bt2")?;
        let reference = ReferenceSet::resolve("virus", &fasta, &prefix)?;
        assert_eq!(reference.index_files.len(), 6);
        assert!(reference.index_files[5].to_string_lossy().ends_with("sars2.rev.2.bt2"));
        reference.verify()?;
        Ok(())
    }

    #[test]
    fn test_reference_set_accepts_large_index() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let (fasta, prefix) = write_reference(tmp.path(), "human", "bt2l")?;
        let reference = ReferenceSet::resolve("host", &fasta, &prefix)?;
        assert!(reference.index_files[0].to_string_lossy().ends_with("human.1.bt2l"));
        Ok(())
    }

    #[test]
    fn test_reference_set_rejects_partial_bundle() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let (fasta, prefix) = write_reference(tmp.path(), "sars2", "bt2")?;
        fs::remove_file(tmp.path().join("sars2.rev.1.bt2"))?;
        let err = ReferenceSet::resolve("virus", &fasta, &prefix).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(ref msg) if msg.contains("sars2.rev.1.bt2")));
        Ok(())
    }

    #[test]
    fn test_reference_verify_detects_removed_file() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        let (fasta, prefix) = write_reference(tmp.path(), "sars2", "bt2")?;
        let reference = ReferenceSet::resolve("virus", &fasta, &prefix)?;
        fs::remove_file(&fasta)?;
        assert!(reference.verify().unwrap_err().is_fatal());
        Ok(())
    }

    #[test]
    fn test_run_config_from_args() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        fs::create_dir(tmp.path().join("reads"))?;
        write_reference(tmp.path(), "sars2", "bt2")?;
        write_reference(tmp.path(), "human", "bt2")?;

        let args = Arguments::try_parse_from([
            "viral-consensus",
            "--reads", "reads",
            "--outdir", "results",
            "--virus-fasta", "sars2.fasta",
            "--virus-index", "sars2",
            "--host-fasta", "human.fasta",
            "--host-index", "human",
            "--single-end",
            "--max-parallel", "3",
        ])?;
        let config = RunConfig::from_args(&args, tmp.path(), 8)?;
        assert_eq!(config.read_mode, ReadMode::SingleEnd);
        assert!(config.with_host_removal);
        assert!(config.host.is_some());
        assert_eq!(config.work_dir, tmp.path().join("results").join(WORK_DIR_NAME));
        assert_eq!(config.max_parallel, 3);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff, Duration::ZERO);
        Ok(())
    }

    #[test]
    fn test_run_config_missing_reads_dir() -> anyhow::Result<()> {
        let tmp = TempDir::new()?;
        write_reference(tmp.path(), "sars2", "bt2")?;
        let args = Arguments::try_parse_from([
            "viral-consensus",
            "--reads", "nowhere",
            "--outdir", "results",
            "--virus-fasta", "sars2.fasta",
            "--virus-index", "sars2",
        ])?;
        let err = RunConfig::from_args(&args, tmp.path(), 8).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
        Ok(())
    }

    #[test]
    fn test_required_flags_enforced_by_parser() {
        let parsed = Arguments::try_parse_from(["viral-consensus", "--reads", "reads"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_error_classification() {
        let invocation = PipelineError::ToolInvocation {
            stage: "align".to_string(),
            tool: "bowtie2".to_string(),
            attempt: 1,
            status: "exit status: 1".to_string(),
        };
        assert!(invocation.is_retriable());
        assert!(!invocation.is_fatal());
        assert!(PipelineError::Discovery("none".to_string()).is_fatal());
        let publish = PipelineError::Publish {
            src: PathBuf::from("a"),
            dest: PathBuf::from("b"),
            error: "denied".to_string(),
        };
        assert!(!publish.is_retriable());
        assert!(!publish.is_fatal());
    }
}
