//! Task graph: the stage contracts of the consensus pipeline and their
//! per-sample bindings.
//!
//! Branch toggles are resolved once in [`TaskGraph::build`]. The result is an
//! ordered list of [`StageSpec`]s whose inputs point either at raw reads, at
//! static files (references, adapters) or at an output slot of an earlier
//! stage. [`TaskGraph::plan_for`] binds that list to one sample's paths.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::defs::{
    BcftoolsSubcommand, PipelineError, ReadMode, ReferenceSet, RetryPolicy, RunConfig,
    SamtoolsSubcommand, ALIGNMENT_DIR, ALIGNMENT_LOG_DIR, ALIGNMENT_STATS_DIR, BCFTOOLS_TAG,
    BOWTIE2_TAG, CONSENSUS_DIR, FASTQC_TAG, FILTERED_VARIANTS_DIR, HOST_REMOVAL_LOG_DIR,
    MASKED_CONSENSUS_DIR, QC_DIR, SAMTOOLS_TAG, SORTED_BAM_DIR, TRIMMED_DIR, TRIMMOMATIC_TAG,
    TRIM_LOG_DIR, TRIM_SUMMARY_DIR, VARIANTS_DIR,
};
use crate::pipelines::discovery::Sample;
use crate::utils::command::{bcftools, bowtie2, fastqc, samtools, trimmomatic};
use crate::utils::fastx::strip_read_extension;

// Stage names
pub const TRIM: &str = "trim";
pub const TRIM_SUMMARY: &str = "trim_summary";
pub const QC_RAW: &str = "qc_raw";
pub const QC_TRIMMED: &str = "qc_trimmed";
pub const HOST_REMOVAL: &str = "host_removal";
pub const ALIGN: &str = "align";
pub const SORT_INDEX: &str = "sort_index";
pub const VARIANT_CALL: &str = "variant_call";
pub const FILTER: &str = "filter";
pub const CONSENSUS: &str = "consensus";

// Slot names
pub const READS_R1: &str = "reads_r1";
pub const READS_R2: &str = "reads_r2";
pub const UNPAIRED_R1: &str = "unpaired_r1";
pub const UNPAIRED_R2: &str = "unpaired_r2";
pub const ADAPTERS: &str = "adapters";
pub const REF_FASTA: &str = "reference_fasta";
pub const REF_INDEX: &str = "reference_index";
pub const SAM: &str = "sam";
pub const BAM: &str = "bam";
pub const BAI: &str = "bai";
pub const FLAGSTAT: &str = "flagstat";
pub const DEPTH: &str = "depth";
pub const PILEUP: &str = "pileup";
pub const VCF: &str = "vcf";
pub const FILTERED_VCF: &str = "filtered_vcf";
pub const FILTERED_VCF_INDEX: &str = "filtered_vcf_index";
pub const LOWCOV_BED: &str = "lowcov_bed";
pub const CONSENSUS_FASTA: &str = "consensus";
pub const MASKED_CONSENSUS_FASTA: &str = "masked_consensus";
pub const UNTRIMMED: &str = "untrimmed";
pub const TRIMMED: &str = "trimmed";
pub const SUMMARY: &str = "summary";
pub const R1_HTML: &str = "r1_html";
pub const R1_ZIP: &str = "r1_zip";
pub const R2_HTML: &str = "r2_html";
pub const R2_ZIP: &str = "r2_zip";

/// Placeholder substituted in output file name templates.
pub const SAMPLE_ID_VAR: &str = "{sample_id}";

/// Where an input slot gets its file from.
#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    /// Index into the sample's raw read files.
    Raw(usize),
    /// An output slot of an earlier stage of the same chain.
    Upstream { stage: &'static str, slot: &'static str },
    /// A file fixed for the whole run. `files` lists what must exist on disk,
    /// which for an index prefix is its bundle rather than `path` itself.
    Static { path: PathBuf, files: Vec<PathBuf> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputSlot {
    pub name: &'static str,
    pub source: InputSource,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputNaming {
    /// File name with [`SAMPLE_ID_VAR`] placeholders.
    Template(String),
    /// Read-file name of an input slot with its extension swapped for `suffix`
    /// (the naming fastqc uses for its reports).
    FromInput { slot: &'static str, suffix: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputSlot {
    pub name: &'static str,
    pub naming: OutputNaming,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandArg {
    Lit(String),
    Input(&'static str),
    Output(&'static str),
    /// A path in the task directory that the tool expands itself,
    /// e.g. bowtie2's `R%` mate placeholder.
    OutputPattern(String),
    WorkDir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCommand {
    /// Tool tag, used in messages and version checks.
    pub tool: &'static str,
    /// Executable to spawn.
    pub program: String,
    pub args: Vec<CommandArg>,
    /// Output slot that receives the tool's stdout.
    pub stdout_to: Option<&'static str>,
}

/// Work done in-process instead of by an external tool.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeStep {
    LowCoverageMask {
        depth: &'static str,
        bed: &'static str,
        min_depth: u32,
    },
    TrimSummary {
        untrimmed: &'static str,
        trimmed: &'static str,
        report: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Tool(ToolCommand),
    Native(NativeStep),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PublishSource {
    Output(&'static str),
    /// The log of the final attempt.
    AttemptLog,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PublishRule {
    pub source: PublishSource,
    pub subdir: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchRole {
    /// Part of the sample chain; its failure fails the sample.
    Main,
    /// Best-effort report (QC, trim summary). Never feeds another stage and
    /// never changes the chain's outcome.
    SideReport,
}

/// One pipeline stage as a contract. Identical for every sample.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub name: &'static str,
    pub role: BranchRole,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<OutputSlot>,
    pub steps: Vec<Step>,
    pub retry_policy: RetryPolicy,
    pub publish_rules: Vec<PublishRule>,
}

impl StageSpec {
    pub fn new(name: &'static str, role: BranchRole, retry_policy: &RetryPolicy) -> Self {
        StageSpec {
            name,
            role,
            inputs: Vec::new(),
            outputs: Vec::new(),
            steps: Vec::new(),
            retry_policy: retry_policy.clone(),
            publish_rules: Vec::new(),
        }
    }

    pub fn input(mut self, name: &'static str, source: InputSource) -> Self {
        self.inputs.push(InputSlot { name, source });
        self
    }

    pub fn output(mut self, name: &'static str, template: &str) -> Self {
        self.outputs.push(OutputSlot { name, naming: OutputNaming::Template(template.to_string()) });
        self
    }

    pub fn output_from_input(mut self, name: &'static str, slot: &'static str, suffix: &'static str) -> Self {
        self.outputs.push(OutputSlot { name, naming: OutputNaming::FromInput { slot, suffix } });
        self
    }

    pub fn tool(mut self, tool: &'static str, program: &str, args: Vec<CommandArg>) -> Self {
        self.steps.push(Step::Tool(ToolCommand { tool, program: program.to_string(), args, stdout_to: None }));
        self
    }

    pub fn tool_to_stdout(mut self, tool: &'static str, program: &str, args: Vec<CommandArg>, slot: &'static str) -> Self {
        self.steps.push(Step::Tool(ToolCommand { tool, program: program.to_string(), args, stdout_to: Some(slot) }));
        self
    }

    pub fn native(mut self, step: NativeStep) -> Self {
        self.steps.push(Step::Native(step));
        self
    }

    pub fn publish(mut self, slot: &'static str, subdir: &'static str) -> Self {
        self.publish_rules.push(PublishRule { source: PublishSource::Output(slot), subdir });
        self
    }

    pub fn publish_log(mut self, subdir: &'static str) -> Self {
        self.publish_rules.push(PublishRule { source: PublishSource::AttemptLog, subdir });
        self
    }

    pub fn has_output(&self, slot: &str) -> bool {
        self.outputs.iter().any(|o| o.name == slot)
    }

    pub fn has_input(&self, slot: &str) -> bool {
        self.inputs.iter().any(|i| i.name == slot)
    }

    /// Stages whose outputs this stage consumes.
    pub fn upstream_stages(&self) -> Vec<&'static str> {
        let mut upstream = Vec::new();
        for input in &self.inputs {
            if let InputSource::Upstream { stage, .. } = input.source {
                if !upstream.contains(&stage) {
                    upstream.push(stage);
                }
            }
        }
        upstream
    }

    /// Programs this stage spawns, as (tool tag, program).
    pub fn programs(&self) -> Vec<(&'static str, &str)> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                Step::Tool(cmd) => Some((cmd.tool, cmd.program.as_str())),
                Step::Native(_) => None,
            })
            .collect()
    }
}


/// Reads flowing down the chain: one source per mate.
#[derive(Debug, Clone)]
struct ReadsBinding {
    mates: Vec<InputSource>,
}

impl ReadsBinding {
    fn raw(mode: ReadMode) -> Self {
        ReadsBinding { mates: (0..mode.file_count()).map(InputSource::Raw).collect() }
    }

    fn from_stage(stage: &'static str, mode: ReadMode) -> Self {
        let slots = [READS_R1, READS_R2];
        ReadsBinding {
            mates: slots[..mode.file_count()]
                .iter()
                .map(|slot| InputSource::Upstream { stage, slot: *slot })
                .collect(),
        }
    }

    fn bind(&self, mut spec: StageSpec) -> StageSpec {
        for (slot, source) in [READS_R1, READS_R2].into_iter().zip(self.mates.iter()) {
            spec = spec.input(slot, source.clone());
        }
        spec
    }
}

fn reference_fasta(reference: &ReferenceSet) -> InputSource {
    InputSource::Static { path: reference.fasta.clone(), files: vec![reference.fasta.clone()] }
}

fn reference_index(reference: &ReferenceSet) -> InputSource {
    InputSource::Static { path: reference.index_prefix.clone(), files: reference.index_files.clone() }
}


/// The resolved stage list for a run.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    read_mode: ReadMode,
    work_root: PathBuf,
    stages: Vec<Arc<StageSpec>>,
}

impl TaskGraph {
    /// Resolves the branch toggles of `config` into the stage list.
    ///
    /// # Returns
    /// TaskGraph, or PipelineError::Configuration when a toggle needs a
    /// reference that was not supplied.
    pub fn build(config: &RunConfig) -> Result<Self, PipelineError> {
        let mode = config.read_mode;
        let retry = &config.retry;
        let tools = &config.tools;
        let mut stages: Vec<StageSpec> = Vec::new();

        let host = match (config.with_host_removal, &config.host) {
            (true, Some(host)) => Some(host),
            (true, None) => {
                return Err(PipelineError::Configuration(
                    "Host removal requested but no host reference (--host-fasta/--host-index) was configured".to_string(),
                ));
            }
            (false, _) => None,
        };

        let mut reads = ReadsBinding::raw(mode);

        if config.with_qc {
            stages.push(qc_stage(QC_RAW, &reads, config));
        }

        if !config.skip_trim {
            let mut trim = reads.bind(StageSpec::new(TRIM, BranchRole::Main, retry));
            if let Some(adapters) = &config.trim.adapters {
                trim = trim.input(
                    ADAPTERS,
                    InputSource::Static { path: adapters.clone(), files: vec![adapters.clone()] },
                );
            }
            trim = match mode {
                ReadMode::PairedEnd => trim
                    .output(READS_R1, "{sample_id}_trimmed_R1.fastq.gz")
                    .output(UNPAIRED_R1, "{sample_id}_unpaired_R1.fastq.gz")
                    .output(READS_R2, "{sample_id}_trimmed_R2.fastq.gz")
                    .output(UNPAIRED_R2, "{sample_id}_unpaired_R2.fastq.gz"),
                ReadMode::SingleEnd => trim.output(READS_R1, "{sample_id}_trimmed.fastq.gz"),
            };
            trim = trim.tool(TRIMMOMATIC_TAG, &tools.trimmomatic, trimmomatic::arg_generator(config, mode));
            if config.save_trimmed {
                trim = trim.publish(READS_R1, TRIMMED_DIR);
                if mode == ReadMode::PairedEnd {
                    trim = trim.publish(READS_R2, TRIMMED_DIR);
                }
            }
            stages.push(trim.publish_log(TRIM_LOG_DIR));

            stages.push(
                StageSpec::new(TRIM_SUMMARY, BranchRole::SideReport, retry)
                    .input(UNTRIMMED, InputSource::Raw(0))
                    .input(TRIMMED, InputSource::Upstream { stage: TRIM, slot: READS_R1 })
                    .output(SUMMARY, "{sample_id}_trim_summary.tsv")
                    .native(NativeStep::TrimSummary { untrimmed: UNTRIMMED, trimmed: TRIMMED, report: SUMMARY })
                    .publish(SUMMARY, TRIM_SUMMARY_DIR),
            );

            reads = ReadsBinding::from_stage(TRIM, mode);
            if config.with_qc {
                stages.push(qc_stage(QC_TRIMMED, &reads, config));
            }
        }

        if let Some(host) = host {
            let mut host_removal = reads
                .bind(StageSpec::new(HOST_REMOVAL, BranchRole::Main, retry))
                .input(REF_INDEX, reference_index(host));
            host_removal = match mode {
                ReadMode::PairedEnd => host_removal
                    .output(READS_R1, "{sample_id}_host_removed_R1.fastq.gz")
                    .output(READS_R2, "{sample_id}_host_removed_R2.fastq.gz"),
                ReadMode::SingleEnd => host_removal.output(READS_R1, "{sample_id}_host_removed.fastq.gz"),
            };
            stages.push(
                host_removal
                    .tool(BOWTIE2_TAG, &tools.bowtie2, bowtie2::host_removal_args(config, mode))
                    .publish_log(HOST_REMOVAL_LOG_DIR),
            );
            reads = ReadsBinding::from_stage(HOST_REMOVAL, mode);
        }

        stages.push(
            reads
                .bind(StageSpec::new(ALIGN, BranchRole::Main, retry))
                .input(REF_INDEX, reference_index(&config.virus))
                .output(SAM, "{sample_id}.sam")
                .tool(BOWTIE2_TAG, &tools.bowtie2, bowtie2::align_args(config, mode))
                .publish(SAM, ALIGNMENT_DIR)
                .publish_log(ALIGNMENT_LOG_DIR),
        );

        let mut sort_index = StageSpec::new(SORT_INDEX, BranchRole::Main, retry)
            .input(SAM, InputSource::Upstream { stage: ALIGN, slot: SAM })
            .output(BAM, "{sample_id}.sorted.bam")
            .output(BAI, "{sample_id}.sorted.bam.bai")
            .output(FLAGSTAT, "{sample_id}.flagstat.txt")
            .tool(SAMTOOLS_TAG, &tools.samtools, samtools::arg_generator(config, SamtoolsSubcommand::Sort))
            .tool(SAMTOOLS_TAG, &tools.samtools, samtools::arg_generator(config, SamtoolsSubcommand::Index))
            .tool_to_stdout(
                SAMTOOLS_TAG,
                &tools.samtools,
                samtools::arg_generator(config, SamtoolsSubcommand::Flagstat),
                FLAGSTAT,
            )
            .publish(BAM, SORTED_BAM_DIR)
            .publish(BAI, SORTED_BAM_DIR)
            .publish(FLAGSTAT, ALIGNMENT_STATS_DIR);
        if config.mask_low_coverage {
            sort_index = sort_index
                .output(DEPTH, "{sample_id}.depth.tsv")
                .tool(SAMTOOLS_TAG, &tools.samtools, samtools::arg_generator(config, SamtoolsSubcommand::Depth))
                .publish(DEPTH, ALIGNMENT_STATS_DIR);
        }
        stages.push(sort_index);

        stages.push(
            StageSpec::new(VARIANT_CALL, BranchRole::Main, retry)
                .input(REF_FASTA, reference_fasta(&config.virus))
                .input(BAM, InputSource::Upstream { stage: SORT_INDEX, slot: BAM })
                .input(BAI, InputSource::Upstream { stage: SORT_INDEX, slot: BAI })
                .output(PILEUP, "{sample_id}.pileup.bcf")
                .output(VCF, "{sample_id}.vcf.gz")
                .tool(BCFTOOLS_TAG, &tools.bcftools, bcftools::arg_generator(config, BcftoolsSubcommand::Mpileup))
                .tool(BCFTOOLS_TAG, &tools.bcftools, bcftools::arg_generator(config, BcftoolsSubcommand::Call))
                .publish(VCF, VARIANTS_DIR),
        );

        stages.push(
            StageSpec::new(FILTER, BranchRole::Main, retry)
                .input(VCF, InputSource::Upstream { stage: VARIANT_CALL, slot: VCF })
                .output(FILTERED_VCF, "{sample_id}.filtered.vcf.gz")
                .output(FILTERED_VCF_INDEX, "{sample_id}.filtered.vcf.gz.csi")
                .tool(BCFTOOLS_TAG, &tools.bcftools, bcftools::arg_generator(config, BcftoolsSubcommand::Filter))
                .tool(BCFTOOLS_TAG, &tools.bcftools, bcftools::arg_generator(config, BcftoolsSubcommand::Index))
                .publish(FILTERED_VCF, FILTERED_VARIANTS_DIR)
                .publish(FILTERED_VCF_INDEX, FILTERED_VARIANTS_DIR),
        );

        let mut consensus = StageSpec::new(CONSENSUS, BranchRole::Main, retry)
            .input(REF_FASTA, reference_fasta(&config.virus))
            .input(FILTERED_VCF, InputSource::Upstream { stage: FILTER, slot: FILTERED_VCF })
            .input(FILTERED_VCF_INDEX, InputSource::Upstream { stage: FILTER, slot: FILTERED_VCF_INDEX })
            .output(CONSENSUS_FASTA, "{sample_id}_consensus.fasta")
            .tool(BCFTOOLS_TAG, &tools.bcftools, bcftools::consensus_args(CONSENSUS_FASTA, None))
            .publish(CONSENSUS_FASTA, CONSENSUS_DIR);
        if config.mask_low_coverage {
            consensus = consensus
                .input(DEPTH, InputSource::Upstream { stage: SORT_INDEX, slot: DEPTH })
                .output(LOWCOV_BED, "{sample_id}.lowcov.bed")
                .output(MASKED_CONSENSUS_FASTA, "{sample_id}_masked_consensus.fasta")
                .native(NativeStep::LowCoverageMask {
                    depth: DEPTH,
                    bed: LOWCOV_BED,
                    min_depth: config.variants.min_depth,
                })
                .tool(
                    BCFTOOLS_TAG,
                    &tools.bcftools,
                    bcftools::consensus_args(MASKED_CONSENSUS_FASTA, Some(LOWCOV_BED)),
                )
                .publish(MASKED_CONSENSUS_FASTA, MASKED_CONSENSUS_DIR);
        }
        stages.push(consensus);

        TaskGraph::from_stages(mode, config.work_dir.clone(), stages)
    }

    /// Wraps an explicit stage list after checking that every binding points
    /// backwards at an existing slot.
    pub fn from_stages(read_mode: ReadMode, work_root: PathBuf, stages: Vec<StageSpec>) -> Result<Self, PipelineError> {
        validate(&stages, read_mode)?;
        Ok(TaskGraph {
            read_mode,
            work_root,
            stages: stages.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn stages(&self) -> &[Arc<StageSpec>] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&Arc<StageSpec>> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name).collect()
    }

    /// Distinct (tool tag, program) pairs used by the graph.
    pub fn programs(&self) -> Vec<(&'static str, String)> {
        let mut seen = HashSet::new();
        let mut programs = Vec::new();
        for stage in &self.stages {
            for (tool, program) in stage.programs() {
                if seen.insert((tool, program.to_string())) {
                    programs.push((tool, program.to_string()));
                }
            }
        }
        programs
    }

    /// Binds every stage to `sample`'s concrete paths.
    pub fn plan_for(&self, sample: &Arc<Sample>) -> Result<SamplePlan, PipelineError> {
        if sample.read_mode != self.read_mode || sample.raw_files.len() != self.read_mode.file_count() {
            return Err(PipelineError::Configuration(format!(
                "Sample '{}' has {} raw files ({:?}); the pipeline expects {:?}",
                sample.sample_id,
                sample.raw_files.len(),
                sample.read_mode,
                self.read_mode
            )));
        }

        let sample_dir = self.work_root.join(&sample.sample_id);
        let mut bound: Vec<BoundStage> = Vec::with_capacity(self.stages.len());

        for spec in &self.stages {
            let work_dir = sample_dir.join(spec.name);

            let mut inputs = Vec::with_capacity(spec.inputs.len());
            for slot in &spec.inputs {
                let input = match &slot.source {
                    InputSource::Raw(i) => BoundInput {
                        name: slot.name,
                        path: sample.raw_files[*i].clone(),
                        upstream: None,
                        is_static: false,
                        required_files: vec![sample.raw_files[*i].clone()],
                    },
                    InputSource::Upstream { stage, slot: out_slot } => {
                        let path = bound
                            .iter()
                            .find(|b| b.spec.name == *stage)
                            .and_then(|b| b.output(out_slot))
                            .map(Path::to_path_buf)
                            .ok_or_else(|| {
                                PipelineError::Configuration(format!(
                                    "Stage '{}' input '{}' refers to unknown output {}.{}",
                                    spec.name, slot.name, stage, out_slot
                                ))
                            })?;
                        BoundInput {
                            name: slot.name,
                            required_files: vec![path.clone()],
                            path,
                            upstream: Some(*stage),
                            is_static: false,
                        }
                    }
                    InputSource::Static { path, files } => BoundInput {
                        name: slot.name,
                        path: path.clone(),
                        upstream: None,
                        is_static: true,
                        required_files: files.clone(),
                    },
                };
                inputs.push(input);
            }

            let mut outputs = Vec::with_capacity(spec.outputs.len());
            for slot in &spec.outputs {
                let file_name = match &slot.naming {
                    OutputNaming::Template(template) => template.replace(SAMPLE_ID_VAR, &sample.sample_id),
                    OutputNaming::FromInput { slot: input_slot, suffix } => {
                        let input = inputs.iter().find(|i| i.name == *input_slot).ok_or_else(|| {
                            PipelineError::Configuration(format!(
                                "Stage '{}' output '{}' is named after unknown input '{}'",
                                spec.name, slot.name, input_slot
                            ))
                        })?;
                        let input_name = input
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        format!("{}{}", strip_read_extension(&input_name), suffix)
                    }
                };
                outputs.push(BoundOutput { name: slot.name, path: work_dir.join(file_name) });
            }

            bound.push(BoundStage {
                spec: spec.clone(),
                sample_id: sample.sample_id.clone(),
                work_dir,
                inputs,
                outputs,
            });
        }

        Ok(SamplePlan { sample: sample.clone(), stages: bound })
    }
}

fn qc_stage(name: &'static str, reads: &ReadsBinding, config: &RunConfig) -> StageSpec {
    let mut qc = reads
        .bind(StageSpec::new(name, BranchRole::SideReport, &config.retry))
        .output_from_input(R1_HTML, READS_R1, "_fastqc.html")
        .output_from_input(R1_ZIP, READS_R1, "_fastqc.zip")
        .publish(R1_HTML, QC_DIR)
        .publish(R1_ZIP, QC_DIR);
    if config.read_mode == ReadMode::PairedEnd {
        qc = qc
            .output_from_input(R2_HTML, READS_R2, "_fastqc.html")
            .output_from_input(R2_ZIP, READS_R2, "_fastqc.zip")
            .publish(R2_HTML, QC_DIR)
            .publish(R2_ZIP, QC_DIR);
    }
    qc.tool(FASTQC_TAG, &config.tools.fastqc, fastqc::arg_generator(config, config.read_mode))
}

fn validate(stages: &[StageSpec], read_mode: ReadMode) -> Result<(), PipelineError> {
    let invalid = |msg: String| -> Result<(), PipelineError> { Err(PipelineError::Configuration(msg)) };
    let mut seen: Vec<&StageSpec> = Vec::new();

    for spec in stages {
        if seen.iter().any(|s| s.name == spec.name) {
            return invalid(format!("Duplicate stage '{}'", spec.name));
        }
        if spec.retry_policy.max_attempts == 0 {
            return invalid(format!("Stage '{}' allows zero attempts", spec.name));
        }

        let mut slot_names = HashSet::new();
        for name in spec.inputs.iter().map(|i| i.name).chain(spec.outputs.iter().map(|o| o.name)) {
            if !slot_names.insert(name) {
                return invalid(format!("Stage '{}' declares slot '{}' twice", spec.name, name));
            }
        }

        for input in &spec.inputs {
            match &input.source {
                InputSource::Raw(i) if *i >= read_mode.file_count() => {
                    return invalid(format!(
                        "Stage '{}' input '{}' reads raw file {} in {:?} mode",
                        spec.name, input.name, i, read_mode
                    ));
                }
                InputSource::Upstream { stage, slot } => match seen.iter().find(|s| s.name == *stage) {
                    None => {
                        return invalid(format!(
                            "Stage '{}' input '{}' depends on '{}', which is not an earlier stage",
                            spec.name, input.name, stage
                        ));
                    }
                    Some(upstream) if upstream.role == BranchRole::SideReport => {
                        return invalid(format!(
                            "Stage '{}' depends on side report '{}'",
                            spec.name, stage
                        ));
                    }
                    Some(upstream) if !upstream.has_output(slot) => {
                        return invalid(format!(
                            "Stage '{}' input '{}' refers to missing output {}.{}",
                            spec.name, input.name, stage, slot
                        ));
                    }
                    Some(_) => {}
                },
                _ => {}
            }
        }

        for output in &spec.outputs {
            if let OutputNaming::FromInput { slot, .. } = &output.naming {
                if !spec.has_input(slot) {
                    return invalid(format!("Stage '{}' output '{}' names unknown input '{}'", spec.name, output.name, slot));
                }
            }
        }

        for step in &spec.steps {
            let (ins, outs): (Vec<&str>, Vec<&str>) = match step {
                Step::Tool(cmd) => {
                    let mut ins = Vec::new();
                    let mut outs: Vec<&str> = cmd.stdout_to.into_iter().collect();
                    for arg in &cmd.args {
                        match arg {
                            CommandArg::Input(slot) => ins.push(*slot),
                            CommandArg::Output(slot) => outs.push(*slot),
                            _ => {}
                        }
                    }
                    (ins, outs)
                }
                Step::Native(NativeStep::LowCoverageMask { depth, bed, .. }) => (vec![*depth], vec![*bed]),
                Step::Native(NativeStep::TrimSummary { untrimmed, trimmed, report }) => {
                    (vec![*untrimmed, *trimmed], vec![*report])
                }
            };
            if let Some(slot) = ins.into_iter().find(|s| !spec.has_input(s)) {
                return invalid(format!("Stage '{}' command uses undeclared input '{}'", spec.name, slot));
            }
            if let Some(slot) = outs.into_iter().find(|s| !spec.has_output(s)) {
                return invalid(format!("Stage '{}' command uses undeclared output '{}'", spec.name, slot));
            }
        }

        for rule in &spec.publish_rules {
            if let PublishSource::Output(slot) = rule.source {
                if !spec.has_output(slot) {
                    return invalid(format!("Stage '{}' publishes undeclared output '{}'", spec.name, slot));
                }
            }
        }

        seen.push(spec);
    }
    Ok(())
}


#[derive(Debug, Clone, PartialEq)]
pub struct BoundInput {
    pub name: &'static str,
    pub path: PathBuf,
    /// Producing stage within the chain, if any.
    pub upstream: Option<&'static str>,
    pub is_static: bool,
    /// Files that must exist before the stage may run.
    pub required_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundOutput {
    pub name: &'static str,
    pub path: PathBuf,
}

/// A StageSpec bound to one sample's paths.
#[derive(Debug, Clone)]
pub struct BoundStage {
    pub spec: Arc<StageSpec>,
    pub sample_id: String,
    pub work_dir: PathBuf,
    pub inputs: Vec<BoundInput>,
    pub outputs: Vec<BoundOutput>,
}

impl BoundStage {
    pub fn name(&self) -> &'static str {
        self.spec.name
    }

    pub fn input(&self, slot: &str) -> Option<&Path> {
        self.inputs.iter().find(|i| i.name == slot).map(|i| i.path.as_path())
    }

    pub fn output(&self, slot: &str) -> Option<&Path> {
        self.outputs.iter().find(|o| o.name == slot).map(|o| o.path.as_path())
    }

    pub fn input_paths(&self) -> Vec<PathBuf> {
        self.inputs.iter().map(|i| i.path.clone()).collect()
    }

    pub fn output_paths(&self) -> Vec<PathBuf> {
        self.outputs.iter().map(|o| o.path.clone()).collect()
    }

    fn slot_path(&self, slot: &str, output: bool) -> Result<&Path, PipelineError> {
        let path = if output { self.output(slot) } else { self.input(slot) };
        path.ok_or_else(|| {
            PipelineError::Configuration(format!("Stage '{}' has no slot '{}'", self.name(), slot))
        })
    }

    pub fn input_path(&self, slot: &str) -> Result<&Path, PipelineError> {
        self.slot_path(slot, false)
    }

    pub fn output_path(&self, slot: &str) -> Result<&Path, PipelineError> {
        self.slot_path(slot, true)
    }

    /// Substitutes slot paths into a command's argument template.
    pub fn render_args(&self, cmd: &ToolCommand) -> Result<Vec<String>, PipelineError> {
        cmd.args
            .iter()
            .map(|arg| {
                Ok(match arg {
                    CommandArg::Lit(s) => s.clone(),
                    CommandArg::Input(slot) => self.input_path(slot)?.to_string_lossy().into_owned(),
                    CommandArg::Output(slot) => self.output_path(slot)?.to_string_lossy().into_owned(),
                    CommandArg::OutputPattern(template) => self
                        .work_dir
                        .join(template.replace(SAMPLE_ID_VAR, &self.sample_id))
                        .to_string_lossy()
                        .into_owned(),
                    CommandArg::WorkDir => self.work_dir.to_string_lossy().into_owned(),
                })
            })
            .collect()
    }
}

/// The ordered, bound stages of one sample's chain.
#[derive(Debug, Clone)]
pub struct SamplePlan {
    pub sample: Arc<Sample>,
    pub stages: Vec<BoundStage>,
}

impl SamplePlan {
    pub fn stage(&self, name: &str) -> Option<&BoundStage> {
        self.stages.iter().find(|s| s.name() == name)
    }

    pub fn main_chain(&self) -> impl Iterator<Item = &BoundStage> {
        self.stages.iter().filter(|s| s.spec.role == BranchRole::Main)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defs::{ToolPaths, TrimParams, VariantParams};
    use std::time::Duration;

    fn reference(name: &str) -> ReferenceSet {
        let prefix = PathBuf::from(format!("/refs/{}", name));
        ReferenceSet {
            name: name.to_string(),
            fasta: PathBuf::from(format!("/refs/{}.fasta", name)),
            index_files: ["1", "2", "3", "4", "rev.1", "rev.2"]
                .iter()
                .map(|s| PathBuf::from(format!("/refs/{}.{}.bt2", name, s)))
                .collect(),
            index_prefix: prefix,
        }
    }

    fn test_config(read_mode: ReadMode) -> RunConfig {
        RunConfig {
            cwd: PathBuf::from("/run"),
            reads_dir: PathBuf::from("/run/reads"),
            out_dir: PathBuf::from("/run/results"),
            work_dir: PathBuf::from("/run/results/work"),
            read_mode,
            virus: reference("sars2"),
            host: None,
            skip_trim: false,
            with_host_removal: false,
            with_qc: false,
            save_trimmed: false,
            mask_low_coverage: true,
            trim: TrimParams {
                adapters: None,
                seed_mismatches: 2,
                palindrome_clip: 30,
                simple_clip: 10,
                window_size: 4,
                window_quality: 20,
                min_len: 50,
            },
            variants: VariantParams { min_qual: 20, min_depth: 10, call_theta: 0.0006 },
            tools: ToolPaths::default(),
            threads: 2,
            max_parallel: 2,
            retry: RetryPolicy { max_attempts: 3, backoff: Duration::ZERO, timeout: None },
            skip_tool_check: true,
        }
    }

    fn paired_sample(id: &str) -> Arc<Sample> {
        Arc::new(Sample {
            sample_id: id.to_string(),
            read_mode: ReadMode::PairedEnd,
            raw_files: vec![
                PathBuf::from(format!("/run/reads/{}_R1.fastq.gz", id)),
                PathBuf::from(format!("/run/reads/{}_R2.fastq.gz", id)),
            ],
        })
    }

    fn single_sample(id: &str) -> Arc<Sample> {
        Arc::new(Sample {
            sample_id: id.to_string(),
            read_mode: ReadMode::SingleEnd,
            raw_files: vec![PathBuf::from(format!("/run/reads/{}.fastq.gz", id))],
        })
    }

    fn main_names(plan: &SamplePlan) -> Vec<&'static str> {
        plan.main_chain().map(|s| s.name()).collect()
    }

    #[test]
    fn test_default_paired_chain() -> anyhow::Result<()> {
        let config = test_config(ReadMode::PairedEnd);
        let graph = TaskGraph::build(&config)?;
        let plan = graph.plan_for(&paired_sample("sampleA"))?;

        assert_eq!(main_names(&plan), vec![TRIM, ALIGN, SORT_INDEX, VARIANT_CALL, FILTER, CONSENSUS]);
        let consensus = plan.stage(CONSENSUS).ok_or_else(|| anyhow::anyhow!("no consensus stage"))?;
        assert_eq!(
            consensus.output(CONSENSUS_FASTA),
            Some(Path::new("/run/results/work/sampleA/consensus/sampleA_consensus.fasta"))
        );
        assert!(consensus
            .spec
            .publish_rules
            .contains(&PublishRule { source: PublishSource::Output(CONSENSUS_FASTA), subdir: CONSENSUS_DIR }));

        let align = plan.stage(ALIGN).ok_or_else(|| anyhow::anyhow!("no align stage"))?;
        assert_eq!(
            align.input(READS_R1),
            Some(Path::new("/run/results/work/sampleA/trim/sampleA_trimmed_R1.fastq.gz"))
        );
        assert_eq!(align.input(REF_INDEX), Some(Path::new("/refs/sars2")));
        Ok(())
    }

    #[test]
    fn test_no_trim_binds_alignment_to_raw_reads() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.skip_trim = true;
        config.with_qc = true;
        let graph = TaskGraph::build(&config)?;
        assert!(graph.stage(TRIM).is_none());
        assert!(graph.stage(TRIM_SUMMARY).is_none());
        assert!(graph.stage(QC_TRIMMED).is_none());

        let plan = graph.plan_for(&paired_sample("s1"))?;
        let align = plan.stage(ALIGN).ok_or_else(|| anyhow::anyhow!("no align stage"))?;
        assert_eq!(align.input(READS_R1), Some(Path::new("/run/reads/s1_R1.fastq.gz")));
        assert_eq!(align.input(READS_R2), Some(Path::new("/run/reads/s1_R2.fastq.gz")));
        assert!(align.inputs.iter().filter(|i| i.name != REF_INDEX).all(|i| i.upstream.is_none()));
        Ok(())
    }

    #[test]
    fn test_host_removal_inserted_before_alignment() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.host = Some(reference("human"));
        config.with_host_removal = true;
        let graph = TaskGraph::build(&config)?;
        let plan = graph.plan_for(&paired_sample("sampleC"))?;

        assert_eq!(
            main_names(&plan),
            vec![TRIM, HOST_REMOVAL, ALIGN, SORT_INDEX, VARIANT_CALL, FILTER, CONSENSUS]
        );
        let host = plan.stage(HOST_REMOVAL).ok_or_else(|| anyhow::anyhow!("no host stage"))?;
        assert_eq!(host.inputs[0].upstream, Some(TRIM));
        assert_eq!(host.input(REF_INDEX), Some(Path::new("/refs/human")));

        let align = plan.stage(ALIGN).ok_or_else(|| anyhow::anyhow!("no align stage"))?;
        assert_eq!(align.inputs[0].upstream, Some(HOST_REMOVAL));
        assert_eq!(align.input(READS_R2), host.output(READS_R2));
        assert_eq!(align.input(REF_INDEX), Some(Path::new("/refs/sars2")));
        Ok(())
    }

    #[test]
    fn test_host_removal_without_reference_fails_fast() {
        let mut config = test_config(ReadMode::PairedEnd);
        config.with_host_removal = true;
        assert!(matches!(TaskGraph::build(&config), Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_single_end_chain_has_trim_summary() -> anyhow::Result<()> {
        let config = test_config(ReadMode::SingleEnd);
        let graph = TaskGraph::build(&config)?;
        let plan = graph.plan_for(&single_sample("sampleB"))?;

        let trim = plan.stage(TRIM).ok_or_else(|| anyhow::anyhow!("no trim stage"))?;
        assert_eq!(trim.outputs.len(), 1);
        assert!(trim.input(READS_R2).is_none());

        let summary = plan.stage(TRIM_SUMMARY).ok_or_else(|| anyhow::anyhow!("no summary stage"))?;
        assert_eq!(summary.spec.role, BranchRole::SideReport);
        assert_eq!(summary.input(UNTRIMMED), Some(Path::new("/run/reads/sampleB.fastq.gz")));
        assert_eq!(summary.input(TRIMMED), trim.output(READS_R1));
        assert!(summary.output(SUMMARY).is_some_and(|p| p.ends_with("sampleB_trim_summary.tsv")));
        Ok(())
    }

    #[test]
    fn test_qc_stages_are_side_reports_named_after_reads() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.with_qc = true;
        let graph = TaskGraph::build(&config)?;
        let plan = graph.plan_for(&paired_sample("s"))?;

        let qc_raw = plan.stage(QC_RAW).ok_or_else(|| anyhow::anyhow!("no qc stage"))?;
        assert_eq!(qc_raw.spec.role, BranchRole::SideReport);
        assert!(qc_raw.output(R2_HTML).is_some_and(|p| p.ends_with("s_R2_fastqc.html")));

        let qc_trimmed = plan.stage(QC_TRIMMED).ok_or_else(|| anyhow::anyhow!("no qc stage"))?;
        assert_eq!(qc_trimmed.spec.upstream_stages(), vec![TRIM]);
        assert!(qc_trimmed.output(R1_ZIP).is_some_and(|p| p.ends_with("s_trimmed_R1_fastqc.zip")));

        // Nothing consumes a side report.
        for stage in graph.stages() {
            for upstream in stage.upstream_stages() {
                assert_ne!(graph.stage(upstream).map(|s| s.role), Some(BranchRole::SideReport));
            }
        }
        Ok(())
    }

    #[test]
    fn test_no_mask_drops_depth_and_masked_consensus() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.mask_low_coverage = false;
        let graph = TaskGraph::build(&config)?;
        let sort_index = graph.stage(SORT_INDEX).ok_or_else(|| anyhow::anyhow!("no sort stage"))?;
        assert!(!sort_index.has_output(DEPTH));
        let consensus = graph.stage(CONSENSUS).ok_or_else(|| anyhow::anyhow!("no consensus stage"))?;
        assert!(!consensus.has_output(MASKED_CONSENSUS_FASTA));
        assert_eq!(consensus.steps.len(), 1);
        Ok(())
    }

    #[test]
    fn test_save_trimmed_controls_publication() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        let graph = TaskGraph::build(&config)?;
        let trim = graph.stage(TRIM).ok_or_else(|| anyhow::anyhow!("no trim stage"))?;
        assert!(trim.publish_rules.iter().all(|r| r.subdir != TRIMMED_DIR));

        config.save_trimmed = true;
        let graph = TaskGraph::build(&config)?;
        let trim = graph.stage(TRIM).ok_or_else(|| anyhow::anyhow!("no trim stage"))?;
        assert_eq!(trim.publish_rules.iter().filter(|r| r.subdir == TRIMMED_DIR).count(), 2);
        Ok(())
    }

    #[test]
    fn test_validate_rejects_forward_reference() {
        let retry = RetryPolicy::default();
        let stages = vec![
            StageSpec::new("first", BranchRole::Main, &retry)
                .input("x", InputSource::Upstream { stage: "second", slot: "out" })
                .output("out", "{sample_id}.a"),
            StageSpec::new("second", BranchRole::Main, &retry).output("out", "{sample_id}.b"),
        ];
        let result = TaskGraph::from_stages(ReadMode::SingleEnd, PathBuf::from("/w"), stages);
        assert!(matches!(result, Err(PipelineError::Configuration(ref msg)) if msg.contains("not an earlier stage")));
    }

    #[test]
    fn test_validate_rejects_dependency_on_side_report() {
        let retry = RetryPolicy::default();
        let stages = vec![
            StageSpec::new("report", BranchRole::SideReport, &retry).output("out", "{sample_id}.txt"),
            StageSpec::new("main", BranchRole::Main, &retry)
                .input("x", InputSource::Upstream { stage: "report", slot: "out" }),
        ];
        assert!(TaskGraph::from_stages(ReadMode::SingleEnd, PathBuf::from("/w"), stages).is_err());
    }

    #[test]
    fn test_validate_rejects_undeclared_command_slot() {
        let retry = RetryPolicy::default();
        let stages = vec![StageSpec::new("s", BranchRole::Main, &retry)
            .output("out", "{sample_id}.txt")
            .tool("sh", "sh", vec![CommandArg::Input("missing")])];
        assert!(TaskGraph::from_stages(ReadMode::SingleEnd, PathBuf::from("/w"), stages).is_err());
    }

    #[test]
    fn test_programs_keep_each_tool_sharing_a_wrapper() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.tools.samtools = "/opt/wrap".to_string();
        config.tools.bcftools = "/opt/wrap".to_string();
        let programs = TaskGraph::build(&config)?.programs();

        assert!(programs.contains(&("samtools", "/opt/wrap".to_string())));
        assert!(programs.contains(&("bcftools", "/opt/wrap".to_string())));
        assert_eq!(programs.iter().filter(|(tool, _)| *tool == "samtools").count(), 1);
        Ok(())
    }

    #[test]
    fn test_plan_rejects_mode_mismatch() -> anyhow::Result<()> {
        let graph = TaskGraph::build(&test_config(ReadMode::PairedEnd))?;
        assert!(graph.plan_for(&single_sample("x")).is_err());
        Ok(())
    }

    #[test]
    fn test_render_args() -> anyhow::Result<()> {
        let mut config = test_config(ReadMode::PairedEnd);
        config.host = Some(reference("human"));
        config.with_host_removal = true;
        let graph = TaskGraph::build(&config)?;
        let plan = graph.plan_for(&paired_sample("s"))?;
        let host = plan.stage(HOST_REMOVAL).ok_or_else(|| anyhow::anyhow!("no host stage"))?;
        let Step::Tool(cmd) = &host.spec.steps[0] else {
            anyhow::bail!("host removal should run a tool");
        };
        let args = host.render_args(cmd)?;
        assert!(args.contains(&"/refs/human".to_string()));
        assert!(args.contains(&"/run/results/work/s/host_removal/s_host_removed_R%.fastq.gz".to_string()));
        assert!(args.contains(&"/run/results/work/s/trim/s_trimmed_R2.fastq.gz".to_string()));
        Ok(())
    }
}
