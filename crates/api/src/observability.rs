//! Process observability for a coterie node.
//!
//! One JSON log stream per node. The default filter keeps steady-state at
//! `info` but silences sqlx statement logging, since every envelope-handler
//! invocation is its own transaction and the spam would drown the pipeline's
//! drop/park/rewake lines. Envelope post-mortems are one
//! `RUST_LOG=coterie_handlers=debug` away: the handlers log every silent
//! drop (MAC failures, dedup, membership) at `debug`.

use tracing_subscriber::EnvFilter;

use coterie_app::Config;

/// Applied when `RUST_LOG` is unset.
const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

/// Initialize logging for the process and record the node's ambient
/// configuration as the first event.
///
/// Safe to call multiple times; only the first call installs a subscriber.
pub fn init(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .with_current_span(false)
        .try_init()
        .is_ok();

    if installed {
        let db = config
            .db_path
            .as_deref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string());
        tracing::info!(
            crypto_mode = ?config.crypto_mode,
            retry_cap = config.retry_cap,
            db,
            "observability initialized"
        );
    }
}
