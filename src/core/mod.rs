pub mod deadline;
pub mod embedding;
pub mod fingerprint;
pub mod funnel;
pub mod image;
pub mod scanner;
pub mod sieve;
pub mod snapshot;
pub mod vector_index;
pub mod verdict;
