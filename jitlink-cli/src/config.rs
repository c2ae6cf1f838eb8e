//! CLI configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Device bridge settings.
    pub bridge: BridgeConfig,
    /// Pairing credential discovery.
    pub pairing: PairingConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Device bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bridge address (IP:port for the control handshake).
    pub address: String,
}

/// Pairing credential discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Paths searched for the credential file, first match wins.
    pub search_paths: Vec<String>,
}

/// Logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter when RUST_LOG is unset.
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            pairing: PairingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:27015".into(),
        }
    }
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            search_paths: vec!["pairing.json".into()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl CliConfig {
    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
