use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use tracing::info;
use tracing_subscriber::EnvFilter;

static HASHED_LOGS: Lazy<Mutex<Vec<u64>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
/// Later calls are no-ops.
pub fn initialize_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Log `msg` at info level the first time it is seen.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let hash = hasher.finish();

    let mut log = HASHED_LOGS.lock().expect("Poisoned Lock");
    if !log.contains(&hash) {
        info!("{msg}");
        log.push(hash);
    }
}
