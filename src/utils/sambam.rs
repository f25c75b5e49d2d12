use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{anyhow, Result};

/// Zero-based, half-open interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedInterval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

/// Collapses a `samtools depth -a` table into runs of positions covered by
/// fewer than `min_depth` reads.
///
/// # Arguments
///
/// * `reader` - Tab separated `chrom  pos(1-based)  depth` lines.
/// * `min_depth` - Positions strictly below this depth are masked.
///
/// # Returns
/// Intervals in input order.
pub fn low_coverage_intervals<R: BufRead>(reader: R, min_depth: u32) -> Result<Vec<BedInterval>> {
    let mut intervals: Vec<BedInterval> = Vec::new();

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = trimmed.split('\t').collect();
        if fields.len() < 3 {
            return Err(anyhow!(
                "Invalid depth line {}: expected 3 fields, found {}: '{}'",
                line_no + 1,
                fields.len(),
                line
            ));
        }
        let pos: u64 = fields[1]
            .parse()
            .map_err(|e| anyhow!("Invalid position on depth line {}: {}", line_no + 1, e))?;
        let depth: u64 = fields[2]
            .parse()
            .map_err(|e| anyhow!("Invalid depth on depth line {}: {}", line_no + 1, e))?;
        if pos == 0 {
            return Err(anyhow!("Depth positions are 1-based; found 0 on line {}", line_no + 1));
        }
        if depth >= u64::from(min_depth) {
            continue;
        }

        let start = pos - 1;
        match intervals.last_mut() {
            Some(last) if last.chrom == fields[0] && last.end == start => last.end = pos,
            _ => intervals.push(BedInterval {
                chrom: fields[0].to_string(),
                start,
                end: pos,
            }),
        }
    }
    Ok(intervals)
}

/// Writes the low-coverage mask for `depth_path` as BED.
/// A comment header is always written so the file is never empty.
///
/// # Returns
/// Number of masked intervals.
pub fn write_low_coverage_mask(depth_path: &Path, bed_path: &Path, min_depth: u32) -> Result<usize> {
    let reader = BufReader::new(File::open(depth_path)?);
    let intervals = low_coverage_intervals(reader, min_depth)?;

    let mut writer = BufWriter::new(File::create(bed_path)?);
    writeln!(writer, "# positions with depth < {}", min_depth)?;
    for interval in &intervals {
        writeln!(writer, "{}\t{}\t{}", interval.chrom, interval.start, interval.end)?;
    }
    writer.flush()?;
    Ok(intervals.len())
}
