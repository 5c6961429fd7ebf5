//! Provider configuration and the device's declared properties.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::PausePolicy;
use crate::payload::{SplitRule, default_rules};
use crate::protocol::{DEFAULT_BLOCK_SIZE, ParamDescriptor};

/// Timing and sizing policy for a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Default exchange timeout.
    pub command_timeout_ms: u64,
    /// Per-page timeout when paging the parameter table.
    pub paged_params_timeout_ms: u64,
    /// Timeout of the single whole-table request.
    pub bulk_params_timeout_ms: u64,
    /// Save-to-flash and reset-to-defaults.
    pub save_timeout_ms: u64,
    /// Caller-built raw commands.
    pub send_command_timeout_ms: u64,
    /// Upgrade block size in bytes.
    pub block_size: usize,
    pub block_ack_timeout_ms: u64,
    /// Bootloader settle after the first block, main core over Ethernet.
    pub main_settle_ms: u64,
    /// Same, main core over UART.
    pub uart_settle_ms: u64,
    /// Same, IMU sub-core.
    pub imu_settle_ms: u64,
    /// Wait before sending the select-core command.
    pub pre_select_delay_ms: u64,
    pub select_core_timeout_ms: u64,
    /// Wait after a bootloader/application jump.
    pub jump_settle_ms: u64,
    pub jump_timeout_ms: u64,
    pub sdk_finish_timeout_ms: u64,
    pub pause_policy: PausePolicy,
    pub split_rules: Vec<SplitRule>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1000,
            paged_params_timeout_ms: 2000,
            bulk_params_timeout_ms: 3000,
            save_timeout_ms: 2000,
            send_command_timeout_ms: 5000,
            block_size: DEFAULT_BLOCK_SIZE,
            block_ack_timeout_ms: 3000,
            main_settle_ms: 12_000,
            uart_settle_ms: 8000,
            imu_settle_ms: 5000,
            pre_select_delay_ms: 3000,
            select_core_timeout_ms: 3000,
            jump_settle_ms: 3000,
            jump_timeout_ms: 3000,
            sdk_finish_timeout_ms: 10_000,
            pause_policy: PausePolicy::default(),
            split_rules: default_rules(),
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ProviderConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Configuration with every wait zeroed, for driving hardware-free runs.
    pub fn without_delays() -> Self {
        Self {
            main_settle_ms: 0,
            uart_settle_ms: 0,
            imu_settle_ms: 0,
            pre_select_delay_ms: 0,
            jump_settle_ms: 0,
            ..Self::default()
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Millisecond field as a `Duration`.
pub(crate) fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// One `{paramId, value}` pair from `initial.userParameters` or a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSetting {
    #[serde(rename = "paramId")]
    pub param_id: u32,
    pub value: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialSettings {
    #[serde(default)]
    pub user_parameters: Vec<ParamSetting>,
    /// Relay (NTRIP) settings, handed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ntrip: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessages {
    #[serde(default)]
    pub output_packets: Vec<Value>,
}

/// The device's JSON configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperties {
    #[serde(default)]
    pub user_configuration: Vec<ParamDescriptor>,
    #[serde(default)]
    pub initial: InitialSettings,
    #[serde(default)]
    pub user_messages: UserMessages,
}

impl DeviceProperties {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn descriptor(&self, param_id: u32) -> Option<&ParamDescriptor> {
        self.user_configuration.iter().find(|p| p.param_id == param_id)
    }
}
