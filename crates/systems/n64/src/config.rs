//! Cartridge configuration, loadable from JSON.

use crate::bridge::BridgeConfig;
use crate::cartridge::DEFAULT_HEADER;
use crate::cic::CicConfig;
use crate::sdram::SdramConfig;
use crate::tap::CaptureConfig;
use crate::CartError;
use kart_core::signal::MAX_SYNC_STAGES;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CartConfig {
    pub bridge: BridgeConfig,
    pub sdram: SdramConfig,
    pub cic: CicConfig,
    /// Record a diagnostics capture when set
    pub capture: Option<CaptureConfig>,
    /// Replace the ROM's first header word after loading. `null` keeps
    /// the image's own word.
    pub header_override: Option<u32>,
}

impl Default for CartConfig {
    fn default() -> Self {
        Self {
            bridge: BridgeConfig::default(),
            sdram: SdramConfig::default(),
            cic: CicConfig::default(),
            capture: None,
            header_override: Some(DEFAULT_HEADER),
        }
    }
}

impl CartConfig {
    pub fn from_json(text: &str) -> Result<Self, CartError> {
        let config: CartConfig =
            serde_json::from_str(text).map_err(|e| CartError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, CartError> {
        serde_json::to_string_pretty(self).map_err(|e| CartError::InvalidConfig(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), CartError> {
        let invalid = CartError::InvalidConfig;
        for (name, depth) in [
            ("bridge.sync_stages", self.bridge.sync_stages),
            ("cic.sync_stages", self.cic.sync_stages),
        ] {
            if depth == 0 || depth > MAX_SYNC_STAGES {
                return Err(invalid(format!(
                    "{} must be between 1 and {}, got {}",
                    name, MAX_SYNC_STAGES, depth
                )));
            }
        }
        if self.bridge.access_budget == 0 {
            return Err(invalid("bridge.access_budget must be non-zero".to_string()));
        }
        self.bridge.regions.validate().map_err(invalid)?;
        self.sdram.validate().map_err(invalid)?;
        Ok(())
    }
}
