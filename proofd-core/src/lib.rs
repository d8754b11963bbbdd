//! proofd-core: proof-session manager library.
//!
//! Provides the [`Dispatcher`] type which resolves circuits through a bounded
//! cache, allocates per-session scratch space, runs proofs on a recycled
//! worker pool and enforces admission and response deadlines.

pub mod circuit_store;
pub mod config;
pub mod deadline;
pub mod dispatcher;
pub mod prover;
pub mod response;
pub mod scratch;
pub mod stats;
pub mod types;
pub mod worker_pool;

pub use circuit_store::{CircuitSource, CircuitStore, FsCircuitSource};
pub use config::Config;
pub use dispatcher::{Dispatcher, DispatcherStatus};
pub use prover::{CommandProver, ProverFactory, ProvingBackend};
pub use response::ProofResponse;
pub use types::*;
