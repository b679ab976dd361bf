use core::num::NonZeroU64;
use std::borrow::Cow;

use anyhow::Result;
use hex_literal::hex;
use nonzero_ext::nonzero;
use parse_display::{Display, FromStr};
use serde::{Deserialize, Serialize};

use crate::{
    consts::{FAR_FUTURE_EPOCH, GENESIS_EPOCH},
    primitives::{Epoch, Gwei, Version, H32},
};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug, Display, FromStr, Deserialize, Serialize)]
#[display(style = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PresetName {
    #[default]
    Mainnet,
    Minimal,
}

/// Configuration variables customizable at runtime.
///
/// Unlike in `consensus-specs`, preset variables that do not affect the shape of containers are
/// included here as well. Variables that do are constants in [`crate::consts`].
#[derive(Clone, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Config {
    // Meta
    pub config_name: Cow<'static, str>,
    pub preset_base: PresetName,

    // Forking
    pub genesis_fork_version: Version,
    pub altair_fork_epoch: Epoch,
    pub altair_fork_version: Version,
    pub bellatrix_fork_epoch: Epoch,
    pub bellatrix_fork_version: Version,

    // Time parameters
    pub seconds_per_slot: NonZeroU64,
    pub slots_per_epoch: NonZeroU64,
    pub min_attestation_inclusion_delay: NonZeroU64,
    pub min_seed_lookahead: u64,
    pub max_seed_lookahead: u64,
    pub shard_committee_period: u64,
    pub min_validator_withdrawability_delay: u64,
    pub epochs_per_sync_committee_period: NonZeroU64,
    pub maximum_gossip_clock_disparity_millis: u64,

    // State list lengths
    pub slots_per_historical_root: NonZeroU64,
    pub epochs_per_historical_vector: NonZeroU64,
    pub epochs_per_slashings_vector: NonZeroU64,

    // Misc
    pub target_committee_size: NonZeroU64,
    pub max_committees_per_slot: NonZeroU64,
    pub shuffle_round_count: u8,
    pub min_per_epoch_churn_limit: u64,
    pub churn_limit_quotient: NonZeroU64,
    pub hysteresis_quotient: NonZeroU64,
    pub hysteresis_downward_multiplier: u64,
    pub hysteresis_upward_multiplier: u64,

    // Gwei values
    pub max_effective_balance: Gwei,
    pub effective_balance_increment: NonZeroU64,

    // Rewards and penalties
    pub base_reward_factor: u64,
    pub min_slashing_penalty_quotient: NonZeroU64,
    pub proportional_slashing_multiplier: u64,
    pub whistleblower_reward_quotient: NonZeroU64,

    // Optimistic sync
    pub safe_slots_to_import_optimistically: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl Config {
    #[must_use]
    pub fn mainnet() -> Self {
        Self {
            // Meta
            config_name: Cow::Borrowed("mainnet"),
            preset_base: PresetName::Mainnet,

            // Forking
            genesis_fork_version: H32(hex!("00000000")),
            altair_fork_epoch: 74240,
            altair_fork_version: H32(hex!("01000000")),
            bellatrix_fork_epoch: 144_896,
            bellatrix_fork_version: H32(hex!("02000000")),

            // Time parameters
            seconds_per_slot: nonzero!(12_u64),
            slots_per_epoch: nonzero!(32_u64),
            min_attestation_inclusion_delay: nonzero!(1_u64),
            min_seed_lookahead: 1,
            max_seed_lookahead: 4,
            shard_committee_period: 256,
            min_validator_withdrawability_delay: 256,
            epochs_per_sync_committee_period: nonzero!(256_u64),
            maximum_gossip_clock_disparity_millis: 500,

            // State list lengths
            slots_per_historical_root: nonzero!(8192_u64),
            epochs_per_historical_vector: nonzero!(65536_u64),
            epochs_per_slashings_vector: nonzero!(8192_u64),

            // Misc
            target_committee_size: nonzero!(128_u64),
            max_committees_per_slot: nonzero!(64_u64),
            shuffle_round_count: 90,
            min_per_epoch_churn_limit: 4,
            churn_limit_quotient: nonzero!(65536_u64),
            hysteresis_quotient: nonzero!(4_u64),
            hysteresis_downward_multiplier: 1,
            hysteresis_upward_multiplier: 5,

            // Gwei values
            max_effective_balance: 32_000_000_000,
            effective_balance_increment: nonzero!(1_000_000_000_u64),

            // Rewards and penalties
            base_reward_factor: 64,
            min_slashing_penalty_quotient: nonzero!(64_u64),
            proportional_slashing_multiplier: 2,
            whistleblower_reward_quotient: nonzero!(512_u64),

            // Optimistic sync
            safe_slots_to_import_optimistically: 128,
        }
    }

    /// Minimal preset with every supported fork active from genesis.
    #[must_use]
    pub fn minimal() -> Self {
        Self {
            // Meta
            config_name: Cow::Borrowed("minimal"),
            preset_base: PresetName::Minimal,

            // Forking
            genesis_fork_version: H32(hex!("00000001")),
            altair_fork_epoch: GENESIS_EPOCH,
            altair_fork_version: H32(hex!("01000001")),
            bellatrix_fork_epoch: GENESIS_EPOCH,
            bellatrix_fork_version: H32(hex!("02000001")),

            // Time parameters
            seconds_per_slot: nonzero!(6_u64),
            slots_per_epoch: nonzero!(8_u64),
            shard_committee_period: 64,
            epochs_per_sync_committee_period: nonzero!(8_u64),

            // State list lengths
            slots_per_historical_root: nonzero!(64_u64),
            epochs_per_historical_vector: nonzero!(64_u64),
            epochs_per_slashings_vector: nonzero!(64_u64),

            // Misc
            target_committee_size: nonzero!(4_u64),
            max_committees_per_slot: nonzero!(4_u64),
            shuffle_round_count: 10,
            min_per_epoch_churn_limit: 2,
            churn_limit_quotient: nonzero!(32_u64),

            ..Self::mainnet()
        }
    }

    /// Parses a configuration file. Missing variables are taken from the mainnet configuration.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Into::into)
    }

    #[must_use]
    pub const fn is_altair_enabled(&self, epoch: Epoch) -> bool {
        self.altair_fork_epoch != FAR_FUTURE_EPOCH && epoch >= self.altair_fork_epoch
    }

    #[must_use]
    pub const fn is_bellatrix_enabled(&self, epoch: Epoch) -> bool {
        self.bellatrix_fork_epoch != FAR_FUTURE_EPOCH && epoch >= self.bellatrix_fork_epoch
    }

    /// Fork version active at `epoch`.
    #[must_use]
    pub const fn version_at(&self, epoch: Epoch) -> Version {
        if self.is_bellatrix_enabled(epoch) {
            self.bellatrix_fork_version
        } else if self.is_altair_enabled(epoch) {
            self.altair_fork_version
        } else {
            self.genesis_fork_version
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_overrides_are_applied_on_top_of_mainnet() -> Result<()> {
        let config = Config::from_yaml(
            "CONFIG_NAME: custom\n\
             SLOTS_PER_EPOCH: 4\n\
             ALTAIR_FORK_EPOCH: 10\n\
             ALTAIR_FORK_VERSION: '0x01000099'\n",
        )?;

        assert_eq!(config.config_name, "custom");
        assert_eq!(config.slots_per_epoch.get(), 4);
        assert_eq!(config.altair_fork_version, H32(hex!("01000099")));
        assert_eq!(config.seconds_per_slot, Config::mainnet().seconds_per_slot);

        Ok(())
    }

    #[test]
    fn zero_slots_per_epoch_is_rejected() {
        assert!(Config::from_yaml("SLOTS_PER_EPOCH: 0").is_err());
    }

    #[test]
    fn version_follows_fork_schedule() {
        let config = Config::mainnet();

        assert_eq!(config.version_at(0), config.genesis_fork_version);
        assert_eq!(config.version_at(74240), config.altair_fork_version);
        assert_eq!(config.version_at(144_896), config.bellatrix_fork_version);
    }

    #[test]
    fn preset_names_are_lowercase() {
        assert_eq!(PresetName::Minimal.to_string(), "minimal");
        assert_eq!("mainnet".parse().ok(), Some(PresetName::Mainnet));
    }
}
