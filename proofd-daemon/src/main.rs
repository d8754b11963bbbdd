//! proofd: standalone proof-session daemon.
//!
//! Loads configuration, starts the dispatcher, then serves line-delimited
//! JSON requests from stdin and writes one response line per request to
//! stdout. Logs go to stderr.

mod protocol;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use proofd_core::config::Config;
use proofd_core::{CommandProver, Dispatcher, FsCircuitSource, ProofRequest};
use protocol::{Command, Line};

#[derive(Parser, Debug)]
#[command(name = "proofd", about = "proof-session manager daemon")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "/etc/proofd/proofd.toml")]
    config: PathBuf,

    /// Override the circuits directory.
    #[arg(long)]
    circuits_dir: Option<PathBuf>,

    /// Override log level.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    if config.logging.format.as_deref() == Some("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[cfg(unix)]
fn reload_on_sighup(dispatcher: Arc<Dispatcher>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("received SIGHUP, clearing circuit cache");
            dispatcher.reload_circuits().await;
        }
    });
    Ok(())
}

async fn run_command(
    dispatcher: &Dispatcher,
    command: Command,
    name: Option<String>,
    version: Option<String>,
) -> Result<String> {
    let line = match command {
        Command::Status => serde_json::to_string(&dispatcher.status().await)?,
        Command::ListCircuits => serde_json::to_string(&dispatcher.list_circuits().await)?,
        Command::Reload => {
            dispatcher.reload_circuits().await;
            serde_json::to_string(&serde_json::json!({ "reloaded": true }))?
        }
        Command::FindCircuit => {
            let name = name.context("find_circuit needs a name")?;
            match dispatcher.find_circuit(&name, version.as_deref()).await {
                Ok(summary) => serde_json::to_string(&summary)?,
                Err(e) => serde_json::to_string(&serde_json::json!({
                    "status": e.status(),
                    "error": e.to_string(),
                }))?,
            }
        }
    };
    Ok(line)
}

/// Run one proof session in the background.
///
/// The concurrency slot is awaited inside the task so a full daemon still
/// reads control lines and signals. Waiting counts against the request's own
/// deadlines.
fn spawn_session(
    sessions: &mut JoinSet<()>,
    limiter: &Arc<Semaphore>,
    dispatcher: &Arc<Dispatcher>,
    request: ProofRequest,
    out: &mpsc::UnboundedSender<String>,
) {
    let limiter = Arc::clone(limiter);
    let dispatcher = Arc::clone(dispatcher);
    let out = out.clone();
    sessions.spawn(async move {
        let Ok(_permit) = limiter.acquire_owned().await else {
            return;
        };
        let response = dispatcher.handle(request).await;
        match response.to_json() {
            Ok(json) => {
                let _ = out.send(json);
            }
            Err(e) => error!(session_id = %response.session_id, error = %e, "failed to encode response"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_found = cli.config.exists();
    let mut config = if config_found {
        Config::from_file(&cli.config)
            .with_context(|| format!("failed to load config from {:?}", cli.config))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = &cli.circuits_dir {
        config.circuits.dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    init_logging(&config);
    info!("proofd starting");
    if !config_found {
        info!("config file not found at {:?}, using defaults", cli.config);
    }
    info!(circuits_dir = %config.circuits.dir.display(), "configuration loaded");

    let source = Arc::new(FsCircuitSource::new(
        config.circuits.dir.clone(),
        config.circuits.ignored.iter().cloned(),
    ));
    let prover = Arc::new(CommandProver::new(&config.prover));
    let dispatcher = Arc::new(Dispatcher::init(&config, source, prover).await?);

    #[cfg(unix)]
    reload_on_sighup(dispatcher.clone())?;

    // Single writer so response lines never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            let written = async {
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await
            };
            if let Err(e) = written.await {
                error!(error = %e, "failed to write response");
                break;
            }
        }
    });

    let limiter = Arc::new(Semaphore::new(config.daemon.max_concurrent_requests.max(1)));
    let mut sessions = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("proofd ready, reading requests from stdin");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                dispatcher.shutdown().await;
                break;
            }
        };
        let Some(line) = line else {
            info!("stdin closed, draining in-flight sessions");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        match protocol::parse_line(&line) {
            Ok(Line::Proof(req)) => {
                spawn_session(&mut sessions, &limiter, &dispatcher, req.into_request(), &out_tx);
            }
            Ok(Line::Control { command, name, version }) => match run_command(&dispatcher, command, name, version).await {
                Ok(json) => {
                    let _ = out_tx.send(json);
                }
                Err(e) => warn!(command = ?command, error = %e, "control command failed"),
            },
            Err(response) => {
                warn!(error = ?response.error, "rejected malformed request line");
                if let Ok(json) = response.to_json() {
                    let _ = out_tx.send(json);
                }
            }
        }

        // Reap finished sessions so the set doesn't grow unbounded.
        while let Some(joined) = sessions.try_join_next() {
            if let Err(e) = joined {
                error!(error = %e, "session task failed");
            }
        }
    }

    while let Some(joined) = sessions.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "session task failed");
        }
    }
    dispatcher.shutdown().await;
    drop(out_tx);
    writer.await.context("response writer failed")?;

    info!("proofd stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proofd_core::{InputTensor, ProofResponse, ProofStatus};
    use std::time::Duration;

    async fn dispatcher(circuits: &tempfile::TempDir, scratch: &tempfile::TempDir) -> Arc<Dispatcher> {
        let mut config = Config::default();
        config.circuits.dir = circuits.path().to_path_buf();
        config.scratch.scratch_root_path = Some(scratch.path().to_path_buf());
        config.workers.worker_pool_size = 1;
        let source = Arc::new(FsCircuitSource::new(config.circuits.dir.clone(), Vec::new()));
        let prover = Arc::new(CommandProver::new(&config.prover));
        Arc::new(Dispatcher::init(&config, source, prover).await.unwrap())
    }

    #[tokio::test]
    async fn test_full_limiter_does_not_block_the_reader() {
        let circuits = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let d = dispatcher(&circuits, &scratch).await;
        let limiter = Arc::new(Semaphore::new(0));
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let mut sessions = JoinSet::new();

        // returns at once even though no slot is free
        let request = ProofRequest::new("missing", InputTensor(vec![vec![1.0]]));
        spawn_session(&mut sessions, &limiter, &d, request, &out_tx);

        // control commands are still served meanwhile
        let status = run_command(&d, Command::Status, None, None).await.unwrap();
        assert!(status.contains("\"in_flight\":0"), "{}", status);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), out_rx.recv())
                .await
                .is_err()
        );

        limiter.add_permits(1);
        let line = out_rx.recv().await.unwrap();
        let response: ProofResponse = serde_json::from_str(&line).unwrap();
        assert_eq!(response.status, ProofStatus::CircuitNotFound);
        assert!(sessions.join_next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_find_circuit_command() {
        let circuits = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let dir = circuits.path().join("model_age_v1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("settings.json"),
            r#"{"logrows": 17, "input_shapes": [[1, 2]], "name": "age", "version": "1.0.0"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("model.compiled"), b"compiled").unwrap();
        let d = dispatcher(&circuits, &scratch).await;

        let found = run_command(&d, Command::FindCircuit, Some("age".to_string()), None)
            .await
            .unwrap();
        let found: serde_json::Value = serde_json::from_str(&found).unwrap();
        assert_eq!(found["id"], "age_v1");

        let missing = run_command(&d, Command::FindCircuit, Some("nope".to_string()), None)
            .await
            .unwrap();
        let missing: serde_json::Value = serde_json::from_str(&missing).unwrap();
        assert_eq!(missing["status"], "CircuitNotFound");

        assert!(run_command(&d, Command::FindCircuit, None, None).await.is_err());
    }
}
