#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{info, info_span, Instrument};

use keysweep_core::enumerate::{ByteEnumerator, Enumerator};
use keysweepd_node::client::{NodeClient, NodeConfig, RunOutcome};

#[derive(Debug, Parser)]
#[command(name = "keysweepd-node")]
struct Args {
    /// Controller address, e.g. 127.0.0.1:4680
    #[arg(long, env = "KEYSWEEP_CONTROLLER_ADDR", default_value = "127.0.0.1:4680")]
    controller: String,

    /// Parallel search threads.
    #[arg(long, env = "KEYSWEEP_THREADS", default_value_t = 4)]
    threads: usize,

    /// Connection attempts before giving up.
    #[arg(long, env = "KEYSWEEP_CONNECT_RETRIES", default_value_t = 5)]
    connect_retries: usize,

    /// Seconds to wait for any controller reply.
    #[arg(long, env = "KEYSWEEP_REPLY_TIMEOUT_SECS", default_value_t = 30)]
    reply_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    keysweep_observe::logging::init_tracing();

    let args = Args::parse();
    anyhow::ensure!(args.threads >= 1, "--threads must be at least 1");
    anyhow::ensure!(args.reply_timeout_secs > 0, "--reply-timeout-secs must be > 0");

    let span = info_span!(
        "keysweepd-node",
        controller = %args.controller,
        threads = args.threads
    );
    async move {
        info!("starting node");
        let client = NodeClient::new(
            NodeConfig {
                controller_addr: args.controller,
                threads: args.threads,
                connect_retries: args.connect_retries,
                reply_timeout: Duration::from_secs(args.reply_timeout_secs),
            },
            Arc::new(ByteEnumerator),
        );

        match client.run().await? {
            RunOutcome::Found(index) => {
                let candidate = ByteEnumerator.candidate(index);
                info!(
                    index,
                    candidate = %String::from_utf8_lossy(&candidate),
                    "this node found the target"
                );
            }
            RunOutcome::Stopped => info!("stopped by controller"),
        }
        Ok(())
    }
    .instrument(span)
    .await
}
