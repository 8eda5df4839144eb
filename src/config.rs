//! Wallet configuration, passed explicitly into [WalletState::new][crate::dispatcher::WalletState::new].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Address;

/// Default value for `challenge_duration` in [`WalletConfig`], in seconds.
const DEFAULT_CHALLENGE_DURATION: u64 = 5 * 60;

/// Default value for `finished_capacity` in [`WalletConfig`].
const DEFAULT_FINISHED_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid wallet config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Channel type (app definition) used for ledger, joint and guarantor
    /// channels.
    #[serde(default)]
    pub consensus_library: Address,

    /// Used to estimate a challenge's expiry before the `ChallengeCreated`
    /// event for it has been observed.
    #[serde(default = "default_challenge_duration")]
    pub challenge_duration: u64,

    /// How many outcomes of finished processes are remembered. The oldest
    /// are forgotten first.
    #[serde(default = "default_finished_capacity")]
    pub finished_capacity: usize,
}

fn default_challenge_duration() -> u64 {
    DEFAULT_CHALLENGE_DURATION
}

fn default_finished_capacity() -> usize {
    DEFAULT_FINISHED_CAPACITY
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            consensus_library: Address::default(),
            challenge_duration: DEFAULT_CHALLENGE_DURATION,
            finished_capacity: DEFAULT_FINISHED_CAPACITY,
        }
    }
}

impl WalletConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }
}
