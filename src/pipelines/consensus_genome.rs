use std::path::Path;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::config::defs::{PipelineError, RunConfig, RUN_SUMMARY_FILE};
use crate::pipelines::discovery::discover_samples;
use crate::pipelines::graph::{
    SamplePlan, TaskGraph, CONSENSUS, CONSENSUS_FASTA, FILTER, FILTERED_VCF, MASKED_CONSENSUS_FASTA,
};
use crate::pipelines::publish::OutputOrganizer;
use crate::pipelines::scheduler::{ChainReport, ChainStatus, RunReport, Scheduler};
use crate::utils::command::check_versions;
use crate::utils::metrics::{compute_consensus_metrics, ConsensusMetrics};
use crate::utils::vcf::{count_vcf_variants, VariantCounts};

/// Runs the consensus genome pipeline over every sample in the reads directory.
///
/// References, graph and samples are all resolved before the first stage is
/// dispatched, so configuration and discovery errors stop the run early.
///
/// # Arguments
///
/// * `config` - Frozen run configuration.
///
/// # Returns
/// RunReport with each sample's terminal status, or the fatal error that
/// prevented the run from starting.
pub async fn run(config: Arc<RunConfig>) -> Result<RunReport, PipelineError> {
    println!("\n-------------\n Consensus Genome\n-------------\n");

    config.virus.verify()?;
    if let Some(host) = &config.host {
        host.verify()?;
    }

    let graph = TaskGraph::build(&config)?;
    info!("Stages: {}", graph.stage_names().join(" -> "));

    let samples = discover_samples(&config.reads_dir, config.read_mode)?;
    let plans = samples
        .iter()
        .map(|sample| graph.plan_for(sample))
        .collect::<Result<Vec<SamplePlan>, PipelineError>>()?;

    if config.skip_tool_check {
        debug!("Skipping tool version checks");
    } else {
        check_versions(&graph.programs()).await?;
    }

    for dir in [&config.out_dir, &config.work_dir] {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            PipelineError::Configuration(format!("Cannot create {}: {}", dir.display(), e))
        })?;
    }
    info!("Output directory: {}", config.out_dir.display());
    debug!("Working directory: {}", config.work_dir.display());

    let scheduler = Scheduler::new(config.max_parallel, OutputOrganizer::new(&config.out_dir));
    let report = scheduler.run(&plans).await;

    let summary_path = config.out_dir.join(RUN_SUMMARY_FILE);
    match write_run_summary(&summary_path, &plans, &report).await {
        Ok(()) => info!("Run summary written to {}", summary_path.display()),
        Err(e) => warn!("Failed to write run summary {}: {}", summary_path.display(), e),
    }

    for line in report.status_table().lines() {
        info!("{}", line);
    }
    for chain in &report.chains {
        for e in &chain.publish_errors {
            warn!("{}: {}", chain.sample_id, e);
        }
    }

    Ok(report)
}


/// Per-sample row of the run summary.
#[derive(Debug, Default)]
struct SummaryRow {
    variants: Option<VariantCounts>,
    consensus: Option<ConsensusMetrics>,
}

fn collect_row(plan: &SamplePlan, chain: &ChainReport) -> SummaryRow {
    if chain.status != ChainStatus::Succeeded {
        return SummaryRow::default();
    }

    let variants = plan
        .stage(FILTER)
        .and_then(|s| s.output(FILTERED_VCF))
        .and_then(|path| match count_vcf_variants(path) {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!("{}: cannot count variants in {}: {}", chain.sample_id, path.display(), e);
                None
            }
        });

    let consensus_path = plan
        .stage(CONSENSUS)
        .and_then(|s| s.output(MASKED_CONSENSUS_FASTA).or_else(|| s.output(CONSENSUS_FASTA)));
    let consensus = consensus_path.and_then(|path| match compute_consensus_metrics(path) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!("{}: cannot read consensus {}: {}", chain.sample_id, path.display(), e);
            None
        }
    });

    SummaryRow { variants, consensus }
}

fn render_summary(plans: &[SamplePlan], report: &RunReport) -> String {
    let mut out = String::from(
        "sample_id\tstatus\tfailed_stage\tattempts\tsnps\tmnps\tindels\tconsensus_length\tconsensus_n\tcalled_percent\tdiagnostics\n",
    );
    let dash = || "-".to_string();

    for (plan, chain) in plans.iter().zip(report.chains.iter()) {
        let row = collect_row(plan, chain);
        let attempts: u32 = chain.tasks.iter().map(|t| t.attempt_count).sum();
        let (snps, mnps, indels) = match &row.variants {
            Some(v) => (v.snps.to_string(), v.mnps.to_string(), v.indels.to_string()),
            None => (dash(), dash(), dash()),
        };
        let (length, n_count, called) = match &row.consensus {
            Some(m) => (
                m.total_length.to_string(),
                m.n_count.to_string(),
                format!("{:.2}", m.called_percent()),
            ),
            None => (dash(), dash(), dash()),
        };
        out.push_str(&format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\n",
            chain.sample_id,
            chain.status,
            chain.failed_stage.unwrap_or("-"),
            attempts,
            snps,
            mnps,
            indels,
            length,
            n_count,
            called,
            chain.diagnostics.as_deref().unwrap_or("-").replace(['\t', '\n'], " ")
        ));
    }
    out
}

/// Writes `pipeline_summary.tsv`, one row per sample in discovery order.
async fn write_run_summary(path: &Path, plans: &[SamplePlan], report: &RunReport) -> Result<(), PipelineError> {
    let table = render_summary(plans, report);
    tokio::fs::write(path, table)
        .await
        .map_err(|e| PipelineError::IOError(format!("{}: {}", path.display(), e)))
}
