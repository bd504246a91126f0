//! Node configuration from the environment.

use std::path::PathBuf;

use coterie_crypto::CryptoMode;
use coterie_pipeline::DEFAULT_RETRY_CAP;

#[derive(Debug, Clone)]
pub struct Config {
    /// Database file; `None` runs in memory.
    pub db_path: Option<PathBuf>,
    pub crypto_mode: CryptoMode,
    /// Bound on re-emissions of one envelope before fatal drop.
    pub retry_cap: u32,
    /// HTTP bind address.
    pub bind_addr: String,
}

impl Config {
    /// Knobs: `TEST_DB_PATH` (wins) or `COTERIE_DB_PATH`, `CRYPTO_MODE`,
    /// `COTERIE_RETRY_CAP`, `COTERIE_BIND`.
    pub fn from_env() -> Self {
        let db_path = std::env::var("TEST_DB_PATH")
            .or_else(|_| std::env::var("COTERIE_DB_PATH"))
            .ok()
            .map(PathBuf::from);

        let retry_cap = std::env::var("COTERIE_RETRY_CAP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_RETRY_CAP);

        let bind_addr =
            std::env::var("COTERIE_BIND").unwrap_or_else(|_| "0.0.0.0:7411".to_string());

        Self {
            db_path,
            crypto_mode: CryptoMode::from_env(),
            retry_cap,
            bind_addr,
        }
    }

    /// In-memory node with deterministic crypto; the test default.
    pub fn for_testing() -> Self {
        Self {
            db_path: None,
            crypto_mode: CryptoMode::Dummy,
            retry_cap: DEFAULT_RETRY_CAP,
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
