use std::io;
use std::path::Path;

use lazy_static::lazy_static;
use regex::Regex;
use seq_io::fasta::Reader as FastaReader;

use crate::config::defs::READ_EXTS;
use crate::utils::file::{open_maybe_gzipped, FileReader};

lazy_static! {
    /// Illumina-style paired read file names:
    ///
    /// `<sample>[_S<n>][_L<nnn>]_R<1|2>[_<nnn>].(fastq|fq)[.gz]`
    ///
    /// e.g. `sampleA_R1.fastq.gz`, `sampleA_S3_L001_R2_001.fastq.gz`.
    /// The sample sheet index (`_S<n>`), lane (`_L<nnn>`), mate tag and chunk
    /// number (`_<nnn>`) are stripped to give the sample id.
    static ref PAIRED_READ_NAME: Regex = Regex::new(
        r"^(?P<sample>.+?)(?:_S\d+)?(?:_L\d{3})?_R(?P<mate>[12])(?:_\d{3})?\.(?:fastq|fq)(?:\.gz)?$"
    ).expect("paired read name pattern is valid");

    /// Anything carrying an `_R1`/`_R2` tag, i.e. the paired-end glob `*_R{1,2}*`.
    static ref MATE_TAG: Regex = Regex::new(r"_R[12]").expect("mate tag pattern is valid");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Mate {
    R1,
    R2,
}

/// Derives the sample id from a read file name.
///
/// Names following [`PAIRED_READ_NAME`] lose the mate, lane and index
/// suffixes; anything else only loses its read-file extension.
pub fn derive_sample_id(file_name: &str) -> String {
    match PAIRED_READ_NAME.captures(file_name) {
        Some(caps) => caps["sample"].to_string(),
        None => strip_read_extension(file_name),
    }
}

/// Which mate a paired read file holds, if its name follows the paired pattern.
pub fn read_mate(file_name: &str) -> Option<Mate> {
    PAIRED_READ_NAME
        .captures(file_name)
        .map(|caps| if &caps["mate"] == "1" { Mate::R1 } else { Mate::R2 })
}

/// True for names matching the paired-end glob, whether or not they parse.
pub fn has_mate_tag(file_name: &str) -> bool {
    MATE_TAG.is_match(file_name)
}

pub fn has_read_extension(file_name: &str, exts: &[&str]) -> bool {
    exts.iter().any(|ext| file_name.ends_with(&format!(".{}", ext)))
}

/// `sampleB.fastq.gz` -> `sampleB`. Unknown extensions are left alone.
pub fn strip_read_extension(file_name: &str) -> String {
    READ_EXTS
        .iter()
        .find_map(|ext| file_name.strip_suffix(&format!(".{}", ext)))
        .unwrap_or(file_name)
        .to_string()
}

pub fn fasta_reader(path: &Path) -> io::Result<FastaReader<FileReader>> {
    Ok(FastaReader::new(open_maybe_gzipped(path)?))
}
