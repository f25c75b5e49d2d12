use std::io;
use std::path::Path;

use seq_io::fastq::Reader;

use crate::utils::file::{open_maybe_gzipped, FileReader};

pub fn fastq_reader(path: &Path) -> io::Result<Reader<FileReader>> {
    Ok(Reader::new(open_maybe_gzipped(path)?))
}

/// Counts the records of a (optionally gzipped) FASTQ.
///
/// # Arguments
///
/// * `path` - Valid path to a fastq file.
///
/// # Returns
/// u64: Number of records in the FASTQ.
///
pub fn count_fastq_records(path: &Path) -> io::Result<u64> {
    let mut reader = fastq_reader(path)?;
    let mut counter = 0;
    while let Some(record) = reader.next() {
        record.map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Malformed FASTQ {}: {}", path.display(), e),
            )
        })?;
        counter += 1;
    }
    Ok(counter)
}
