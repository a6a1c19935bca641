use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `KEYSWEEP_LOG` first, then
/// `RUST_LOG`, then a default.
///
/// Log field contract for keysweep daemons:
/// - Always include `node_id` once a session identity exists.
/// - Include `start`/`end` on any assignment/checkpoint/reclaim event.
/// - Coordination-significant events log under `target: "keysweep_proof"`
///   with an `event` field.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("KEYSWEEP_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
