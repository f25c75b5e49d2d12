/// Functions for building external tool command lines and checking that the
/// tools are installed.

use anyhow::{anyhow, Result};
use futures::future::join_all;
use log::{info, warn};
use tokio::process::Command;

use crate::config::defs::{PipelineError, TRIMMOMATIC_TAG};
use crate::pipelines::graph::CommandArg;


fn lit(s: impl Into<String>) -> CommandArg {
    CommandArg::Lit(s.into())
}


pub mod trimmomatic {
    use super::lit;
    use crate::config::defs::{ReadMode, RunConfig};
    use crate::pipelines::graph::CommandArg::{self, Input, Output};
    use crate::pipelines::graph::{READS_R1, READS_R2, UNPAIRED_R1, UNPAIRED_R2};

    pub fn arg_generator(config: &RunConfig, mode: ReadMode) -> Vec<CommandArg> {
        let trim = &config.trim;
        let mut args_vec: Vec<CommandArg> = Vec::new();

        match mode {
            ReadMode::PairedEnd => {
                args_vec.push(lit("PE"));
                args_vec.push(lit("-threads"));
                args_vec.push(lit(config.threads.to_string()));
                args_vec.push(lit("-phred33"));
                args_vec.push(Input(READS_R1));
                args_vec.push(Input(READS_R2));
                args_vec.push(Output(READS_R1));
                args_vec.push(Output(UNPAIRED_R1));
                args_vec.push(Output(READS_R2));
                args_vec.push(Output(UNPAIRED_R2));
            }
            ReadMode::SingleEnd => {
                args_vec.push(lit("SE"));
                args_vec.push(lit("-threads"));
                args_vec.push(lit(config.threads.to_string()));
                args_vec.push(lit("-phred33"));
                args_vec.push(Input(READS_R1));
                args_vec.push(Output(READS_R1));
            }
        }

        if let Some(adapters) = &trim.adapters {
            args_vec.push(lit(format!(
                "ILLUMINACLIP:{}:{}:{}:{}",
                adapters.display(),
                trim.seed_mismatches,
                trim.palindrome_clip,
                trim.simple_clip
            )));
        }
        args_vec.push(lit(format!("SLIDINGWINDOW:{}:{}", trim.window_size, trim.window_quality)));
        args_vec.push(lit(format!("MINLEN:{}", trim.min_len)));
        args_vec
    }
}

pub mod bowtie2 {
    use super::lit;
    use crate::config::defs::{ReadMode, RunConfig};
    use crate::pipelines::graph::CommandArg::{self, Input, Output, OutputPattern};
    use crate::pipelines::graph::{READS_R1, READS_R2, REF_INDEX, SAM};

    fn common_args(config: &RunConfig, mode: ReadMode) -> Vec<CommandArg> {
        let mut args_vec = vec![
            lit("-p"),
            lit(config.threads.to_string()),
            lit("-x"),
            Input(REF_INDEX),
        ];
        match mode {
            ReadMode::PairedEnd => {
                args_vec.push(lit("-1"));
                args_vec.push(Input(READS_R1));
                args_vec.push(lit("-2"));
                args_vec.push(Input(READS_R2));
            }
            ReadMode::SingleEnd => {
                args_vec.push(lit("-U"));
                args_vec.push(Input(READS_R1));
            }
        }
        args_vec
    }

    /// Keeps the reads that do not align to the host. Paired mode keeps pairs
    /// that fail to align concordantly; bowtie2 writes both mates from the `%`
    /// pattern.
    pub fn host_removal_args(config: &RunConfig, mode: ReadMode) -> Vec<CommandArg> {
        let mut args_vec = common_args(config, mode);
        match mode {
            ReadMode::PairedEnd => {
                args_vec.push(lit("--un-conc-gz"));
                args_vec.push(OutputPattern("{sample_id}_host_removed_R%.fastq.gz".to_string()));
            }
            ReadMode::SingleEnd => {
                args_vec.push(lit("--un-gz"));
                args_vec.push(Output(READS_R1));
            }
        }
        args_vec.push(lit("-S"));
        args_vec.push(lit("/dev/null"));
        args_vec
    }

    pub fn align_args(config: &RunConfig, mode: ReadMode) -> Vec<CommandArg> {
        let mut args_vec = common_args(config, mode);
        args_vec.push(lit("-S"));
        args_vec.push(Output(SAM));
        args_vec
    }
}

pub mod samtools {
    use super::lit;
    use crate::config::defs::{RunConfig, SamtoolsSubcommand};
    use crate::pipelines::graph::CommandArg::{self, Input, Output};
    use crate::pipelines::graph::{BAI, BAM, DEPTH, SAM};

    /// Sort, index and depth read what the previous step of the sort_index
    /// stage wrote, so BAM is referenced as an output slot throughout.
    pub fn arg_generator(config: &RunConfig, subcommand: SamtoolsSubcommand) -> Vec<CommandArg> {
        match subcommand {
            SamtoolsSubcommand::Sort => vec![
                lit("sort"),
                lit("-@"),
                lit(config.threads.to_string()),
                lit("-o"),
                Output(BAM),
                Input(SAM),
            ],
            SamtoolsSubcommand::Index => vec![lit("index"), lit("-o"), Output(BAI), Output(BAM)],
            SamtoolsSubcommand::Flagstat => vec![lit("flagstat"), Output(BAM)],
            SamtoolsSubcommand::Depth => vec![lit("depth"), lit("-a"), lit("-o"), Output(DEPTH), Output(BAM)],
        }
    }
}

pub mod bcftools {
    use super::lit;
    use crate::config::defs::{BcftoolsSubcommand, RunConfig};
    use crate::pipelines::graph::CommandArg::{self, Input, Output};
    use crate::pipelines::graph::{BAM, FILTERED_VCF, FILTERED_VCF_INDEX, PILEUP, REF_FASTA, VCF};

    pub fn arg_generator(config: &RunConfig, subcommand: BcftoolsSubcommand) -> Vec<CommandArg> {
        let variants = &config.variants;
        match subcommand {
            BcftoolsSubcommand::Mpileup => vec![
                lit("mpileup"),
                lit("--threads"),
                lit(config.threads.to_string()),
                lit("-Ou"),
                lit("-f"),
                Input(REF_FASTA),
                lit("-o"),
                Output(PILEUP),
                Input(BAM),
            ],
            BcftoolsSubcommand::Call => vec![
                lit("call"),
                lit("--ploidy"),
                lit("1"),
                lit("-m"),
                lit("-v"),
                lit("-P"),
                lit(variants.call_theta.to_string()),
                lit("-Oz"),
                lit("-o"),
                Output(VCF),
                Output(PILEUP),
            ],
            BcftoolsSubcommand::Filter => vec![
                lit("filter"),
                lit("-i"),
                lit(format!("QUAL>={}", variants.min_qual)),
                lit("-Oz"),
                lit("-o"),
                Output(FILTERED_VCF),
                Input(VCF),
            ],
            BcftoolsSubcommand::Index => vec![
                lit("index"),
                lit("-o"),
                Output(FILTERED_VCF_INDEX),
                Output(FILTERED_VCF),
            ],
        }
    }

    /// Applies the filtered variants to the reference. With `mask`, positions
    /// in that BED slot are written as N.
    pub fn consensus_args(out_slot: &'static str, mask: Option<&'static str>) -> Vec<CommandArg> {
        let mut args_vec = vec![lit("consensus"), lit("-f"), Input(REF_FASTA)];
        if let Some(bed) = mask {
            args_vec.push(lit("-m"));
            args_vec.push(Output(bed));
        }
        args_vec.push(lit("-o"));
        args_vec.push(Output(out_slot));
        args_vec.push(Input(FILTERED_VCF));
        args_vec
    }
}

pub mod fastqc {
    use super::lit;
    use crate::config::defs::{ReadMode, RunConfig};
    use crate::pipelines::graph::CommandArg::{self, Input, WorkDir};
    use crate::pipelines::graph::{READS_R1, READS_R2};

    pub fn arg_generator(config: &RunConfig, mode: ReadMode) -> Vec<CommandArg> {
        let mut args_vec = vec![
            lit("--quiet"),
            lit("--threads"),
            lit(config.threads.to_string()),
            lit("--outdir"),
            WorkDir,
            Input(READS_R1),
        ];
        if mode == ReadMode::PairedEnd {
            args_vec.push(Input(READS_R2));
        }
        args_vec
    }
}


/// Pulls the first version-looking token (`2.5.1`, `v0.12.1`) out of a
/// tool's version banner.
fn parse_version(output: &str) -> Option<String> {
    output
        .split_whitespace()
        .map(|token| token.trim_start_matches('v'))
        .find(|token| {
            token.chars().next().is_some_and(|c| c.is_ascii_digit())
                && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
        })
        .map(str::to_string)
}

/// Runs `program`'s version flag.
///
/// # Arguments
///
/// * `tool` - Tool tag, selects the flag.
/// * `program` - Executable to run.
///
/// # Returns
/// The version string, or "unknown" when the banner cannot be parsed. Errors
/// only when the program cannot be spawned.
pub async fn check_version(tool: &str, program: &str) -> Result<String> {
    let flag = match tool {
        TRIMMOMATIC_TAG => "-version",
        _ => "--version",
    };

    let output = Command::new(program)
        .arg(flag)
        .stdin(std::process::Stdio::null())
        .output()
        .await
        .map_err(|e| anyhow!("Failed to spawn {} ({}): {}. Is {} installed?", program, tool, e, tool))?;

    let banner = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    match parse_version(&banner) {
        Some(version) => Ok(version),
        None => {
            warn!("Could not parse a version from `{} {}`", program, flag);
            Ok("unknown".to_string())
        }
    }
}

/// Checks every (tool tag, program) pair concurrently.
///
/// # Returns
/// Ok, or PipelineError::Configuration naming every tool that could not be run.
pub async fn check_versions(programs: &[(&'static str, String)]) -> Result<(), PipelineError> {
    let checks = programs.iter().map(|(tool, program)| async move {
        (tool, program, check_version(tool, program).await)
    });

    let mut missing = Vec::new();
    for (tool, program, result) in join_all(checks).await {
        match result {
            Ok(version) => info!("{} ({}) version: {}", tool, program, version),
            Err(e) => missing.push(e.to_string()),
        }
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Configuration(missing.join("; ")))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::{
        BcftoolsSubcommand, ReadMode, ReferenceSet, RetryPolicy, RunConfig, SamtoolsSubcommand, ToolPaths,
        TrimParams, VariantParams,
    };
    use crate::pipelines::graph::{BAI, BAM, FILTERED_VCF, LOWCOV_BED, MASKED_CONSENSUS_FASTA, READS_R2, REF_FASTA};
    use std::path::PathBuf;
    use std::time::Duration;

    fn config(adapters: Option<&str>) -> RunConfig {
        let reference = ReferenceSet {
            name: "virus".to_string(),
            fasta: PathBuf::from("/refs/virus.fasta"),
            index_prefix: PathBuf::from("/refs/virus"),
            index_files: vec![],
        };
        RunConfig {
            cwd: PathBuf::from("/run"),
            reads_dir: PathBuf::from("/run/reads"),
            out_dir: PathBuf::from("/run/out"),
            work_dir: PathBuf::from("/run/out/work"),
            read_mode: ReadMode::PairedEnd,
            virus: reference,
            host: None,
            skip_trim: false,
            with_host_removal: false,
            with_qc: false,
            save_trimmed: false,
            mask_low_coverage: true,
            trim: TrimParams {
                adapters: adapters.map(PathBuf::from),
                seed_mismatches: 2,
                palindrome_clip: 30,
                simple_clip: 10,
                window_size: 4,
                window_quality: 20,
                min_len: 50,
            },
            variants: VariantParams { min_qual: 30, min_depth: 10, call_theta: 0.0006 },
            tools: ToolPaths::default(),
            threads: 8,
            max_parallel: 1,
            retry: RetryPolicy { max_attempts: 3, backoff: Duration::ZERO, timeout: None },
            skip_tool_check: true,
        }
    }

    fn literals(args: &[CommandArg]) -> Vec<String> {
        args.iter()
            .filter_map(|a| match a {
                CommandArg::Lit(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_trimmomatic_paired_args() {
        let args = trimmomatic::arg_generator(&config(Some("/refs/TruSeq3-PE.fa")), ReadMode::PairedEnd);
        let lits = literals(&args);
        assert_eq!(lits[0], "PE");
        assert!(lits.contains(&"ILLUMINACLIP:/refs/TruSeq3-PE.fa:2:30:10".to_string()));
        assert!(lits.contains(&"SLIDINGWINDOW:4:20".to_string()));
        assert_eq!(lits.last().map(String::as_str), Some("MINLEN:50"));
        assert_eq!(args.iter().filter(|a| matches!(a, CommandArg::Output(_))).count(), 4);
    }

    #[test]
    fn test_trimmomatic_without_adapters() {
        let args = trimmomatic::arg_generator(&config(None), ReadMode::SingleEnd);
        let lits = literals(&args);
        assert_eq!(lits[0], "SE");
        assert!(lits.iter().all(|l| !l.starts_with("ILLUMINACLIP")));
        assert!(!args.contains(&CommandArg::Input(READS_R2)));
    }

    #[test]
    fn test_bowtie2_host_removal_pattern() {
        let args = bowtie2::host_removal_args(&config(None), ReadMode::PairedEnd);
        assert!(args.contains(&CommandArg::Lit("--un-conc-gz".to_string())));
        assert!(args.iter().any(|a| matches!(a, CommandArg::OutputPattern(p) if p.contains("R%"))));

        let single = bowtie2::host_removal_args(&config(None), ReadMode::SingleEnd);
        assert!(single.contains(&CommandArg::Lit("--un-gz".to_string())));
        assert!(single.contains(&CommandArg::Lit("-U".to_string())));
    }

    #[test]
    fn test_samtools_index_reads_sorted_bam() {
        let args = samtools::arg_generator(&config(None), SamtoolsSubcommand::Index);
        assert_eq!(args[2], CommandArg::Output(BAI));
        assert_eq!(args[3], CommandArg::Output(BAM));
    }

    #[test]
    fn test_bcftools_filter_uses_min_qual() {
        let args = bcftools::arg_generator(&config(None), BcftoolsSubcommand::Filter);
        assert!(literals(&args).contains(&"QUAL>=30".to_string()));
        assert!(args.contains(&CommandArg::Output(FILTERED_VCF)));
    }

    #[test]
    fn test_bcftools_masked_consensus() {
        let args = bcftools::consensus_args(MASKED_CONSENSUS_FASTA, Some(LOWCOV_BED));
        assert_eq!(
            args,
            vec![
                CommandArg::Lit("consensus".to_string()),
                CommandArg::Lit("-f".to_string()),
                CommandArg::Input(REF_FASTA),
                CommandArg::Lit("-m".to_string()),
                CommandArg::Output(LOWCOV_BED),
                CommandArg::Lit("-o".to_string()),
                CommandArg::Output(MASKED_CONSENSUS_FASTA),
                CommandArg::Input(FILTERED_VCF),
            ]
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("samtools 1.17\nUsing htslib 1.17"), Some("1.17".to_string()));
        assert_eq!(parse_version("FastQC v0.12.1"), Some("0.12.1".to_string()));
        assert_eq!(
            parse_version("/usr/bin/bowtie2-align-s version 2.5.1\n64-bit"),
            Some("2.5.1".to_string())
        );
        assert_eq!(parse_version("0.39\n"), Some("0.39".to_string()));
        assert_eq!(parse_version("no version here"), None);
    }

    #[tokio::test]
    async fn test_check_versions_reports_missing_tools() {
        let programs = vec![(TRIMMOMATIC_TAG, "definitely-not-an-installed-tool-xyz".to_string())];
        let result = check_versions(&programs).await;
        assert!(matches!(result, Err(PipelineError::Configuration(ref msg)) if msg.contains("definitely-not")));
    }
}
