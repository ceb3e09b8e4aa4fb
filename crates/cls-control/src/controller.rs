//! Closed-loop controller: spectrum reduction, baseline and strategy

use crate::peak::PeakConfig;
use crate::spectrum::{get_1d_power_spectrum, Baseline, PowerSpectrum, SpectrumConfig};
use crate::strategy::{
    build_strategy, BlockType, FrequencyRange, FrequencyStrategy, ResultTag, StrategyConfig,
};
use cls_core::ClsResult;
use cls_processing::SharedSpectrum;
use std::sync::PoisonError;

/// One frequency recomputation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerUpdate {
    pub old_frequency: f64,
    pub new_frequency: f64,
    pub block_type: BlockType,
    pub tag: ResultTag,
}

impl ControllerUpdate {
    pub fn changed(&self) -> bool {
        (self.old_frequency - self.new_frequency).abs() > f64::EPSILON
    }
}

pub struct ClosedLoopController {
    source: SharedSpectrum,
    config: SpectrumConfig,
    baseline: Baseline,
    strategy: Box<dyn FrequencyStrategy>,
    range: FrequencyRange,
    updates: u64,
}

impl ClosedLoopController {
    pub fn new(
        source: SharedSpectrum,
        config: SpectrumConfig,
        strategy: Box<dyn FrequencyStrategy>,
        range: FrequencyRange,
    ) -> ClsResult<Self> {
        config.validate()?;
        range.validate()?;
        Ok(Self {
            source,
            config,
            baseline: Baseline::new(),
            strategy,
            range,
            updates: 0,
        })
    }

    /// Build the strategy from configuration and wrap it
    pub fn from_config(
        source: SharedSpectrum,
        config: SpectrumConfig,
        strategy: &StrategyConfig,
        range: FrequencyRange,
        peak: &PeakConfig,
    ) -> ClsResult<Self> {
        let strategy = build_strategy(strategy, range, peak)?;
        Self::new(source, config, strategy, range)
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn range(&self) -> FrequencyRange {
        self.range
    }

    pub fn baseline(&self) -> &Baseline {
        &self.baseline
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }

    fn raw_spectrum(&self) -> ClsResult<Option<PowerSpectrum>> {
        let history = self.source.read().unwrap_or_else(PoisonError::into_inner);
        get_1d_power_spectrum(&history, &self.config.channels, self.config.periods, self.config.log_scale)
    }

    /// Current 1-D spectrum, z-scored when configured
    pub fn current_spectrum(&self) -> ClsResult<Option<PowerSpectrum>> {
        let Some(mut spectrum) = self.raw_spectrum()? else {
            return Ok(None);
        };
        if self.config.zscore {
            self.baseline.zscore(&mut spectrum)?;
        }
        Ok(Some(spectrum))
    }

    /// Feed the current spectrum into the baseline until enough blocks are held
    pub fn accumulate_baseline(&mut self) -> ClsResult<()> {
        if self.baseline.count() >= self.config.baseline_blocks {
            return Ok(());
        }
        if let Some(spectrum) = self.raw_spectrum()? {
            self.baseline.accumulate(&spectrum)?;
        }
        Ok(())
    }

    pub fn reset_baseline(&mut self) {
        self.baseline.clear();
    }

    /// Recompute the stimulation frequency
    ///
    /// Before any spectrum exists the strategy still runs, on an empty
    /// spectrum, so its miss counting and exploration state keep advancing.
    pub fn update(&mut self, current: f64, block_count: u64) -> ClsResult<ControllerUpdate> {
        self.updates += 1;
        let spectrum = match self.current_spectrum()? {
            Some(spectrum) => spectrum,
            None => {
                tracing::debug!(strategy = self.strategy.name(), "no spectrum available yet");
                PowerSpectrum::empty()
            }
        };
        let decision = self.strategy.compute_next_frequency(&spectrum, current, block_count)?;

        let update = ControllerUpdate {
            old_frequency: current,
            new_frequency: self.range.clamp(decision.frequency),
            block_type: decision.block_type,
            tag: decision.tag,
        };
        tracing::debug!(
            strategy = self.strategy.name(),
            old = update.old_frequency,
            new = update.new_frequency,
            tag = %update.tag,
            block_type = %update.block_type,
            "frequency update"
        );
        Ok(update)
    }

    /// Clear strategy state and the baseline
    pub fn reset(&mut self) {
        self.strategy.reset();
        self.baseline.clear();
        self.updates = 0;
    }
}
