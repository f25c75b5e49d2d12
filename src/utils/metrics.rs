use std::path::Path;

use anyhow::{anyhow, Result};

use crate::utils::fastx::fasta_reader;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsensusMetrics {
    pub num_sequences: usize,
    pub total_length: usize,
    pub n_count: usize,
}

impl ConsensusMetrics {
    /// Fraction of called (non-N) bases, as a percentage.
    pub fn called_percent(&self) -> f64 {
        if self.total_length == 0 {
            0.0
        } else {
            ((self.total_length - self.n_count) as f64 / self.total_length as f64) * 100.0
        }
    }
}

/// Length and ambiguous-base content of a consensus FASTA.
pub fn compute_consensus_metrics(path: &Path) -> Result<ConsensusMetrics> {
    let mut reader = fasta_reader(path)?;
    let mut metrics = ConsensusMetrics::default();
    for result in reader.records() {
        let record = result.map_err(|e| anyhow!("Error reading consensus FASTA {}: {}", path.display(), e))?;
        metrics.num_sequences += 1;
        for base in record.seq.iter().map(|b| b.to_ascii_uppercase()) {
            match base {
                b'\n' | b'\r' => continue,
                b'N' => metrics.n_count += 1,
                _ => {}
            }
            metrics.total_length += 1;
        }
    }
    if metrics.num_sequences == 0 {
        return Err(anyhow!("No FASTA records in {}", path.display()));
    }
    Ok(metrics)
}
