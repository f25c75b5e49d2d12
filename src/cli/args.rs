use clap::Parser;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "viral-consensus",
    version,
    about = "Builds per-sample virus consensus genomes from raw sequencing reads"
)]
pub struct Arguments {

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,

    #[arg(short = 'r', long = "reads", help = "Directory containing the raw read files")]
    pub reads: String,

    #[arg(short = 'o', long = "outdir", help = "Output root for all published results")]
    pub out_dir: String,

    #[arg(long, help = "Working directory for intermediate files. Defaults to '<outdir>/work'.")]
    pub work_dir: Option<String>,

    #[arg(long = "virus-fasta")] // For target aligning
    pub virus_fasta: String,

    #[arg(long = "virus-index", help = "Prefix of the pre-built bowtie2 index for the virus reference")]
    pub virus_index: String,

    #[arg(long = "host-fasta", requires = "host_index")] // For host removal
    pub host_fasta: Option<String>,

    #[arg(long = "host-index", requires = "host_fasta", help = "Prefix of the pre-built bowtie2 index for the host reference")]
    pub host_index: Option<String>,

    #[arg(long, default_value_t = false, help = "Require the host-removal branch; fails unless --host-fasta/--host-index are given")]
    pub remove_host: bool,

    #[arg(long, default_value_t = false)]
    pub single_end: bool,

    #[arg(long, default_value_t = false)]
    pub no_trim: bool,

    #[arg(long, default_value_t = false)]
    pub with_qc: bool,

    #[arg(long, default_value_t = false, help = "Publish trimmed reads instead of keeping them only as intermediates")]
    pub save_trimmed: bool,

    #[arg(long, default_value_t = false, help = "Skip low-coverage masking and the masked consensus")]
    pub no_mask: bool,

    #[arg(long, help = "Adapter FASTA for ILLUMINACLIP; adapter clipping is skipped when absent")]
    pub adapters: Option<String>,

    #[arg(long, default_value_t = 2)]
    pub seed_mismatches: u32,

    #[arg(long, default_value_t = 30)]
    pub palindrome_clip: u32,

    #[arg(long, default_value_t = 10)]
    pub simple_clip: u32,

    #[arg(long, default_value_t = 4)]
    pub window_size: u32,

    #[arg(long, default_value_t = 20)]
    pub window_quality: u32,

    #[arg(long = "min-len", default_value_t = 50)]
    pub min_read_len: u32,

    #[arg(long, default_value_t = 10)]
    pub min_depth: u32,

    #[arg(short = 'q', long = "min-qual", default_value_t = 20)]
    pub min_qual: u32,

    #[arg(long, default_value_t = 0.0006)] // assumes about 20 mutations between 2 random samples
    pub call_theta: f64,

    #[arg(long, default_value_t = 4, help = "Threads handed to each external tool invocation")]
    pub threads: usize,

    #[arg(long, help = "Maximum number of concurrently running stages. Defaults to physical cores divided by --threads.")]
    pub max_parallel: Option<usize>,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, default_value_t = 0)]
    pub retry_backoff_secs: u64,

    #[arg(long)]
    pub stage_timeout_secs: Option<u64>,

    #[arg(long, default_value = "trimmomatic")]
    pub trimmomatic: String,

    #[arg(long, default_value = "bowtie2")]
    pub bowtie2: String,

    #[arg(long, default_value = "samtools")]
    pub samtools: String,

    #[arg(long, default_value = "bcftools")]
    pub bcftools: String,

    #[arg(long, default_value = "fastqc")]
    pub fastqc: String,

    #[arg(long, default_value_t = false)]
    pub skip_tool_check: bool,
}
