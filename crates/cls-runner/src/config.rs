//! Experiment configuration: data source, processing and closed loop

use anyhow::{ensure, Context};
use cls_control::{ControlConfig, ProtocolConfig, StrategyConfig};
use cls_processing::ProcessingConfig;
use cls_simulation::{EntrainmentConfig, LfpConfig, NoiseConfig, Oscillation, StreamConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub stream: StreamConfig,
    pub processing: ProcessingConfig,
    pub control: ControlConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        let simulator = LfpConfig {
            sampling_rate: 1000.0,
            channel_count: 4,
            samples_per_block: 500,
            oscillations: vec![Oscillation {
                frequency: 10.0,
                amplitude: 0.5,
                pattern: Default::default(),
            }],
            noise: NoiseConfig::default(),
            powerline_freq: Some(50.0),
            entrainment: Some(EntrainmentConfig {
                preferred_frequency: 24.0,
                bandwidth: 6.0,
                gain: 2.0,
            }),
            seed: None,
        };
        let processing =
            ProcessingConfig::lfp_tracking(simulator.channel_count, simulator.sampling_rate, simulator.samples_per_block);
        let control = ControlConfig {
            strategy: StrategyConfig::DichotomicExplorator { delta: 2.0 },
            protocol: ProtocolConfig {
                block_period_ms: simulator.block_period_ms(),
                initial_frequency: 18.0,
                ..ProtocolConfig::default()
            },
            ..ControlConfig::default()
        };

        Self {
            stream: StreamConfig { simulator, buffer_size: 16 },
            processing,
            control,
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&text).with_context(|| format!("parsing experiment config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Cross-section checks on top of each section's own validation
    pub fn validate(&self) -> anyhow::Result<()> {
        self.stream.simulator.validate()?;
        self.processing.validate()?;
        self.control.validate()?;

        let source = &self.stream.simulator;
        let input = &self.processing.input;
        ensure!(
            source.channel_count == input.labels.len()
                && source.samples_per_block == input.samples_per_block
                && source.sampling_rate == input.sampling_rate,
            "data source delivers {}x{} at {} Hz but the pipeline expects {}x{} at {} Hz",
            source.channel_count,
            source.samples_per_block,
            source.sampling_rate,
            input.labels.len(),
            input.samples_per_block,
            input.sampling_rate
        );
        ensure!(
            self.processing.analysis.iter().any(|s| s.name() == self.control.spectrum_source),
            "no analysis stage named '{}' feeds the controller",
            self.control.spectrum_source
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_consistent() {
        let config = ExperimentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.control.protocol.block_period_ms, 500);
    }

    #[test]
    fn test_json_round_trip() {
        let config = ExperimentConfig::default();
        let json = config.to_json().unwrap();
        let parsed: ExperimentConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.processing, config.processing);
        assert_eq!(parsed.control, config.control);
    }

    #[test]
    fn test_shape_disagreement() {
        let mut config = ExperimentConfig::default();
        config.stream.simulator.channel_count = 2;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::default();
        config.control.spectrum_source = "superlet".to_string();
        assert!(config.validate().is_err());
    }
}
