pub mod command;
pub mod fastq;
pub mod fastx;
pub mod file;
pub mod metrics;
pub mod sambam;
pub mod stats;
pub mod system;
pub mod vcf;
