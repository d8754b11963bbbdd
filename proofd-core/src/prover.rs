//! The opaque proving capability and its subprocess backend.
//!
//! The worker pool only sees [`ProverFactory`] and [`ProvingBackend`]. Each
//! worker owns one backend instance for its whole generation; recycling a
//! worker drops the instance and asks the factory for a fresh one.
//!
//! [`CommandProver`] is the production backend: it runs an external prover
//! binary as a child process inside the session's scratch directory, so a
//! crash in the native prover only takes down the child.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ProverConfig;
use crate::scratch::{INPUT_FILENAME, PROOF_FILENAME, WITNESS_FILENAME};
use crate::types::{CircuitDescriptor, InputTensor};

/// Everything a backend needs to produce one proof.
#[derive(Debug, Clone)]
pub struct ProofJob {
    pub circuit: Arc<CircuitDescriptor>,
    pub input: InputTensor,
    /// Session-private directory for intermediates.
    pub scratch_dir: PathBuf,
}

/// Output of a proving call.
#[derive(Debug, Clone, PartialEq)]
pub struct Proof {
    pub bytes: Vec<u8>,
    pub public_outputs: Vec<f64>,
}

/// A proving backend instance, owned by a single worker.
pub trait ProvingBackend: Send {
    fn prove(&mut self, job: &ProofJob) -> Result<Proof>;
}

/// Creates backend instances for workers.
pub trait ProverFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn ProvingBackend>;
}

/// Input file layout expected by the prover binary.
#[derive(Debug, Serialize)]
struct InputFile<'a> {
    input_data: &'a InputTensor,
}

/// `proof.json` as written by the prover binary.
#[derive(Debug, Deserialize)]
pub struct ProofFile {
    /// Hex-encoded proof, with or without `0x` prefix.
    pub proof: String,
    #[serde(default)]
    pub public_outputs: Vec<f64>,
}

impl ProofFile {
    pub fn into_proof(self) -> Result<Proof> {
        let hex_str = self.proof.strip_prefix("0x").unwrap_or(&self.proof);
        let bytes = hex::decode(hex_str).context("proof is not valid hex")?;
        Ok(Proof {
            bytes,
            public_outputs: self.public_outputs,
        })
    }
}

/// Raise a child's OOM score so the kernel kills provers before the daemon.
#[cfg(target_os = "linux")]
pub fn set_oom_score_adj(pid: u32, score: i16) -> std::io::Result<()> {
    let path = format!("/proc/{}/oom_score_adj", pid);
    std::fs::write(Path::new(&path), score.to_string())
}

#[cfg(not(target_os = "linux"))]
pub fn set_oom_score_adj(_pid: u32, _score: i16) -> std::io::Result<()> {
    Ok(())
}

/// Runs an external prover binary (`gen-witness` then `prove`) per proof.
#[derive(Debug, Clone)]
pub struct CommandProver {
    command: PathBuf,
    leading_args: Vec<String>,
    oom_score_adj: i16,
}

impl CommandProver {
    pub fn new(config: &ProverConfig) -> Self {
        Self {
            command: config.command.clone(),
            leading_args: config.leading_args.clone(),
            oom_score_adj: config.oom_score_adj,
        }
    }

    fn run_step(&self, step: &str, args: &[&str], cwd: &Path) -> Result<()> {
        let child = Command::new(&self.command)
            .args(&self.leading_args)
            .arg(step)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn {} {}", self.command.display(), step))?;

        if let Err(e) = set_oom_score_adj(child.id(), self.oom_score_adj) {
            warn!(pid = child.id(), error = %e, "failed to set OOM score adjustment");
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("failed to wait for prover step {}", step))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lines: Vec<&str> = stderr.lines().collect();
            let tail = lines[lines.len().saturating_sub(5)..].join("\n");
            anyhow::bail!("prover step {} exited with {}: {}", step, output.status, tail);
        }
        debug!(step, "prover step finished");
        Ok(())
    }
}

impl ProvingBackend for CommandProver {
    fn prove(&mut self, job: &ProofJob) -> Result<Proof> {
        let dir = &job.scratch_dir;
        let input = serde_json::to_vec(&InputFile {
            input_data: &job.input,
        })?;
        std::fs::write(dir.join(INPUT_FILENAME), input).context("failed to write input file")?;

        let compiled = job.circuit.compiled_path.to_string_lossy().into_owned();
        let pk = job.circuit.proving_key_path.to_string_lossy().into_owned();
        debug!(circuit_id = %job.circuit.id, compiled = %compiled, "running prover");

        self.run_step(
            "gen-witness",
            &[
                "--data",
                INPUT_FILENAME,
                "--compiled-circuit",
                &compiled,
                "--output",
                WITNESS_FILENAME,
            ],
            dir,
        )?;
        self.run_step(
            "prove",
            &[
                "--witness",
                WITNESS_FILENAME,
                "--compiled-circuit",
                &compiled,
                "--pk-path",
                &pk,
                "--proof-path",
                PROOF_FILENAME,
            ],
            dir,
        )?;

        let raw = std::fs::read(dir.join(PROOF_FILENAME)).context("prover produced no proof file")?;
        let file: ProofFile = serde_json::from_slice(&raw).context("failed to parse proof file")?;
        file.into_proof()
    }
}

impl ProverFactory for CommandProver {
    fn create(&self) -> Box<dyn ProvingBackend> {
        Box::new(self.clone())
    }
}
