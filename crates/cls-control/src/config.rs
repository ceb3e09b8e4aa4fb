//! Closed-loop and protocol configuration

use crate::controller::ClosedLoopController;
use crate::peak::PeakConfig;
use crate::protocol::ProtocolConfig;
use crate::spectrum::SpectrumConfig;
use crate::stimulus::StimulusConfig;
use crate::strategy::{FrequencyRange, StrategyConfig};
use cls_core::{ClsError, ClsResult};
use cls_processing::SharedSpectrum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Spectral analysis stage the controller reads
    pub spectrum_source: String,
    pub range: FrequencyRange,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub peak: PeakConfig,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub stimulus: StimulusConfig,
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub trial_log: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            spectrum_source: "psd".to_string(),
            range: FrequencyRange { min: 5.0, max: 60.0 },
            spectrum: SpectrumConfig::default(),
            peak: PeakConfig::default(),
            strategy: StrategyConfig::PeakFollowerDelta { delta: 2.0 },
            stimulus: StimulusConfig::default(),
            protocol: ProtocolConfig::default(),
            trial_log: None,
        }
    }
}

impl ControlConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if self.spectrum_source.is_empty() {
            return Err(cls_core::config_error!("spectrum source must be named"));
        }
        self.range.validate()?;
        self.spectrum.validate()?;
        self.peak.validate()?;
        self.strategy.validate(&self.range)?;
        self.stimulus.validate()?;
        self.protocol.validate()?;
        if !self.range.contains(self.protocol.initial_frequency) {
            return Err(cls_core::config_error!(
                "initial frequency {} Hz outside [{}, {}]",
                self.protocol.initial_frequency,
                self.range.min,
                self.range.max
            ));
        }
        Ok(())
    }

    pub fn build_controller(&self, source: SharedSpectrum) -> ClsResult<ClosedLoopController> {
        ClosedLoopController::from_config(source, self.spectrum.clone(), &self.strategy, self.range, &self.peak)
    }

    pub fn to_json(&self) -> ClsResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ClsError::InvalidConfig {
            reason: format!("JSON serialization failed: {}", e),
        })
    }

    pub fn from_json(json: &str) -> ClsResult<Self> {
        let config: Self = serde_json::from_str(json).map_err(|e| ClsError::InvalidConfig {
            reason: format!("JSON deserialization failed: {}", e),
        })?;
        config.validate()?;
        Ok(config)
    }
}
