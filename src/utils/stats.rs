//! Read-count arithmetic for the trimming report.

/// Percent of reads removed by trimming, as the integer
/// `100 - (100 * trimmed / untrimmed)` (truncating).
///
/// # Arguments
///
/// - `untrimmed`: Read count before trimming.
/// - `trimmed`: Read count surviving trimming.
///
/// # Returns
///
/// Percentage in 0..=100; 0 when there were no input reads.
pub fn percent_trimmed(untrimmed: u64, trimmed: u64) -> u64 {
    if untrimmed == 0 {
        return 0;
    }
    let kept = (100 * trimmed.min(untrimmed)) / untrimmed;
    100 - kept
}
