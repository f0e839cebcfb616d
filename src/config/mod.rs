use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::labels::{string_enum, ParseError};
use crate::ledger::{AccountId, Amount, MICRO_PER_TOKEN};
use crate::registry::ReleasePolicy;

pub const NETWORK_ENV: &str = "MICROSPONSOR_NETWORK";

/// Upper bound accepted for `max_rejections`.
pub const MAX_REJECTIONS_CAP: u32 = 1_000;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error(transparent)]
    UnknownValue(#[from] ParseError),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Ledger network the engine is bound to. Decides which addresses are
/// accepted.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    #[default]
    Testnet,
    /// Local simulation: any non-blank identifier is an address.
    Devnet,
}

string_enum!(Network, "network", {
    Mainnet => "mainnet",
    Testnet => "testnet",
    Devnet => "devnet",
});

impl Network {
    fn address_prefixes(&self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => &["SP", "SM"],
            Network::Testnet => &["ST", "SN"],
            Network::Devnet => &[],
        }
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        if address.trim().is_empty() || address.chars().any(char::is_whitespace) {
            return false;
        }
        match self {
            Network::Devnet => true,
            _ => {
                address.len() == 41
                    && self.address_prefixes().iter().any(|p| address.starts_with(p))
                    && address.chars().all(|c| c.is_ascii_alphanumeric())
            }
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct EscrowConfig {
    pub network: Network,
    pub max_milestones: usize,
    /// Reject verdicts a milestone may absorb; the next one is fatal.
    pub max_rejections: u32,
    pub release_policy: ReleasePolicy,
    pub verifiers: BTreeSet<AccountId>,
    pub default_term_secs: Option<u64>,
    pub min_total_amount: Amount,
    pub max_total_amount: Amount,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            max_milestones: 20,
            max_rejections: 3,
            release_policy: ReleasePolicy::Sequential,
            verifiers: BTreeSet::new(),
            default_term_secs: None,
            min_total_amount: 1,
            max_total_amount: 1_000_000 * MICRO_PER_TOKEN,
        }
    }
}

impl EscrowConfig {
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let bytes = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: EscrowConfig = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides the network from `MICROSPONSOR_NETWORK` when set.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(NETWORK_ENV) {
            self.network = value.parse()?;
        }
        Ok(())
    }

    pub fn with_verifier(mut self, verifier: impl Into<AccountId>) -> Self {
        self.verifiers.insert(verifier.into());
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_milestones == 0 {
            return Err(ConfigError::Invalid("max_milestones must be at least 1".into()));
        }
        if self.max_rejections > MAX_REJECTIONS_CAP {
            return Err(ConfigError::Invalid(format!(
                "max_rejections {} exceeds {MAX_REJECTIONS_CAP}",
                self.max_rejections
            )));
        }
        if self.min_total_amount == 0 {
            return Err(ConfigError::Invalid("min_total_amount must be positive".into()));
        }
        if self.min_total_amount > self.max_total_amount {
            return Err(ConfigError::Invalid(format!(
                "min_total_amount {} exceeds max_total_amount {}",
                self.min_total_amount, self.max_total_amount
            )));
        }
        if self.default_term_secs == Some(0) {
            return Err(ConfigError::Invalid("default_term_secs must be positive".into()));
        }
        if let Some(bad) = self.verifiers.iter().find(|v| !self.network.is_valid_address(v)) {
            return Err(ConfigError::Invalid(format!(
                "verifier {bad:?} is not a {} address",
                self.network
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TESTNET_ADDR: &str = "ST1PQHQKV0RJXZFY1DGX8MNSNYVE3VGZJSRTPGZGM";

    #[test]
    fn addresses_are_checked_against_the_network() {
        assert_eq!(TESTNET_ADDR.len(), 41);
        assert!(Network::Testnet.is_valid_address(TESTNET_ADDR));
        assert!(!Network::Mainnet.is_valid_address(TESTNET_ADDR));
        assert!(!Network::Testnet.is_valid_address("ST123"));
        assert!(Network::Devnet.is_valid_address("alice"));
        assert!(!Network::Devnet.is_valid_address("  "));
        assert!(!Network::Devnet.is_valid_address("al ice"));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EscrowConfig =
            serde_json::from_str(r#"{"network":"devnet","max_rejections":5,"verifiers":["registrar"]}"#).unwrap();
        assert_eq!(config.network, Network::Devnet);
        assert_eq!(config.max_rejections, 5);
        assert_eq!(config.max_milestones, 20);
        assert!(config.verifiers.contains("registrar"));
        config.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_refused() {
        assert!(serde_json::from_str::<EscrowConfig>(r#"{"netwrk":"devnet"}"#).is_err());
    }

    #[test]
    fn validation_rejects_inconsistent_bounds() {
        let config = EscrowConfig {
            min_total_amount: 10,
            max_total_amount: 5,
            ..EscrowConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = EscrowConfig::default().with_verifier("not-an-address");
        assert!(config.validate().is_err());

        let config = EscrowConfig {
            max_rejections: u32::MAX,
            ..EscrowConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        let config = EscrowConfig {
            max_rejections: MAX_REJECTIONS_CAP,
            ..EscrowConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn reads_config_file() {
        let path = std::env::temp_dir().join(format!("microsponsor-config-{}.json", std::process::id()));
        std::fs::write(&path, br#"{"network":"devnet","max_milestones":4}"#).unwrap();
        let config = EscrowConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(config.max_milestones, 4);

        let missing = EscrowConfig::from_json_file(Path::new("/nonexistent/microsponsor.json"));
        assert!(matches!(missing, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn network_parses_from_flag_values() {
        assert_eq!("MainNet".parse::<Network>().unwrap(), Network::Mainnet);
        assert_eq!(Network::Devnet.to_string(), "devnet");
        let err = "moon".parse::<Network>().unwrap_err();
        assert_eq!(err.expected, "mainnet testnet devnet ");
    }
}
