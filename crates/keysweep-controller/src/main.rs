#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, info_span, Instrument};

use keysweep_controller::server::{Controller, ControllerConfig};
use keysweep_core::enumerate::{ByteEnumerator, Enumerator};
use keysweep_core::fingerprint::TargetFingerprint;

#[derive(Debug, Parser)]
#[command(name = "keysweep-controller")]
struct Args {
    /// Address to bind the controller listener.
    #[arg(long, env = "KEYSWEEP_BIND_ADDR", default_value = "[::]:4680")]
    addr: SocketAddr,

    /// Target fingerprint (crypt-style hash string, e.g. `$b3$salt$digest`).
    #[arg(long, env = "KEYSWEEP_FINGERPRINT")]
    fingerprint: String,

    /// Candidates per fresh range allocation.
    #[arg(long, env = "KEYSWEEP_WORK_SIZE", default_value_t = 100_000)]
    work_size: i64,

    /// Candidates a node tests between checkpoints.
    #[arg(long, env = "KEYSWEEP_CHECKPOINT_INTERVAL", default_value_t = 10_000)]
    checkpoint_interval: i64,

    /// Seconds of session silence before its range is reclaimed.
    #[arg(long, env = "KEYSWEEP_LIVENESS_TIMEOUT_SECS", default_value_t = 10)]
    liveness_timeout_secs: u64,

    /// Optional: periodically emit a metrics snapshot to logs.
    #[arg(long, env = "KEYSWEEP_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 0)]
    metrics_snapshot_interval_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    keysweep_observe::logging::init_tracing();

    let args = Args::parse();
    anyhow::ensure!(args.work_size > 0, "--work-size must be > 0");
    anyhow::ensure!(
        args.checkpoint_interval > 0,
        "--checkpoint-interval must be > 0"
    );
    anyhow::ensure!(
        args.liveness_timeout_secs > 0,
        "--liveness-timeout-secs must be > 0"
    );

    let target =
        TargetFingerprint::parse(&args.fingerprint).context("invalid --fingerprint")?;

    let span = info_span!(
        "keysweep-controller",
        addr = %args.addr,
        scheme = target.kind().name(),
        work_size = args.work_size
    );
    async move {
        info!("starting controller");
        let listener = TcpListener::bind(args.addr)
            .await
            .with_context(|| format!("failed to bind {}", args.addr))?;

        let controller = Controller::new(
            ControllerConfig {
                work_size: args.work_size,
                checkpoint_interval: args.checkpoint_interval,
                liveness_timeout: Duration::from_secs(args.liveness_timeout_secs),
                metrics_snapshot_interval: Duration::from_millis(
                    args.metrics_snapshot_interval_ms,
                ),
            },
            target,
        );

        tokio::select! {
            served = controller.clone().serve(listener) => match served? {
                Some(record) => {
                    let candidate = ByteEnumerator.candidate(record.index);
                    info!(
                        node_id = %record.node,
                        index = record.index,
                        candidate = %String::from_utf8_lossy(&candidate),
                        "keyspace search complete"
                    );
                }
                None => info!("controller stopped without a match"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; stopping nodes");
                controller.shutdown();
            }
        }
        Ok(())
    }
    .instrument(span)
    .await
}
