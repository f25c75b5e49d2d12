use std::collections::HashSet;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::anyhow;

use crate::utils::file::open_maybe_gzipped;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VariantCounts {
    pub snps: u64,
    pub mnps: u64,
    pub indels: u64,
}

/// Compute allele counts from VCF lines
///
/// # Arguments
///
/// * `reader` - Plain-text VCF lines.
///
/// # Returns
///
/// result: counts of SNPs, MNPs and indels
pub fn count_variants<R: BufRead>(reader: R) -> anyhow::Result<VariantCounts> {
    let mut counts = VariantCounts::default();

    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            return Err(anyhow!(
                "Invalid VCF line format: expected at least 5 fields, found {} in line: '{}'",
                fields.len(),
                line
            ));
        }
        let ref_allele = fields[3];
        let allele_lens: HashSet<usize> = std::iter::once(ref_allele.len())
            .chain(fields[4].split(',').map(|a| a.len()))
            .collect();
        if allele_lens.len() > 1 {
            counts.indels += 1;
        } else if allele_lens.contains(&1) {
            counts.snps += 1;
        } else {
            counts.mnps += 1;
        }
    }
    Ok(counts)
}

/// Counts variants in a plain, gzip or bgzip compressed VCF.
pub fn count_vcf_variants(path: &Path) -> anyhow::Result<VariantCounts> {
    let reader = BufReader::new(open_maybe_gzipped(path)?);
    count_variants(reader)
}
