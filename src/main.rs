use std::env;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use env_logger::Builder;
use log::{debug, error, info, LevelFilter};

use viral_consensus::cli::parse;
use viral_consensus::config::defs::RunConfig;
use viral_consensus::pipelines::consensus_genome;
use viral_consensus::utils::system::{default_worker_slots, detect_cores_and_load};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n Viral Consensus\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}", dir);

    let (physical_cores, cpu_load) = detect_cores_and_load().await;
    let default_parallel = default_worker_slots(physical_cores, args.threads);
    debug!(
        "Detected {} physical cores; CPU load {:.1}%; default worker slots {}",
        physical_cores, cpu_load, default_parallel
    );

    let run_config = match RunConfig::from_args(&args, &dir, default_parallel) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    match consensus_genome::run(run_config).await {
        Ok(report) if report.succeeded() => {
            println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
            Ok(())
        }
        Ok(report) => {
            error!(
                "{} of {} samples did not complete: {}",
                report.failed_samples().len(),
                report.chains.len(),
                report.failed_samples().join(", ")
            );
            println!("Run finished with failures: {} milliseconds.", run_start.elapsed().as_millis());
            std::process::exit(1);
        }
        Err(e) => {
            error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
            std::process::exit(1);
        }
    }
}
