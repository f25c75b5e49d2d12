pub mod consensus_genome;
pub mod discovery;
pub mod executor;
pub mod graph;
pub mod publish;
pub mod scheduler;
