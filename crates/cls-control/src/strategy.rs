//! Closed-loop frequency strategies
//!
//! Every strategy turns the latest power spectrum and the frequency currently
//! being delivered into the next frequency plus a result tag. The concrete
//! strategy is picked from configuration through [`build_strategy`].

use crate::peak::{find_peak, PeakConfig};
use crate::spectrum::PowerSpectrum;
use cls_core::{ClsResult, StateMachine};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of one update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultTag {
    /// Stimulation (re)started at a fixed frequency
    Start,
    Update,
    NoUpdate,
    NoPeak,
    Explore,
    Commit,
    Fallback,
    Washout,
    Static,
}

impl ResultTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultTag::Start => "start",
            ResultTag::Update => "update",
            ResultTag::NoUpdate => "noupdate",
            ResultTag::NoPeak => "nopeak",
            ResultTag::Explore => "explore",
            ResultTag::Commit => "commit",
            ResultTag::Fallback => "fallback",
            ResultTag::Washout => "washout",
            ResultTag::Static => "static",
        }
    }
}

impl fmt::Display for ResultTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of stimulation block the next frequency is delivered in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Tracking,
    ExploreLow,
    ExploreHigh,
    Washout,
    Static,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Tracking => "tracking",
            BlockType::ExploreLow => "explore_low",
            BlockType::ExploreHigh => "explore_high",
            BlockType::Washout => "washout",
            BlockType::Static => "static",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrategyDecision {
    pub frequency: f64,
    pub tag: ResultTag,
    pub block_type: BlockType,
}

impl StrategyDecision {
    pub fn new(frequency: f64, tag: ResultTag, block_type: BlockType) -> Self {
        Self { frequency, tag, block_type }
    }

    fn tracking(frequency: f64, tag: ResultTag) -> Self {
        Self::new(frequency, tag, BlockType::Tracking)
    }
}

/// Allowed stimulation frequencies in Hz
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRange {
    pub min: f64,
    pub max: f64,
}

impl FrequencyRange {
    pub fn new(min: f64, max: f64) -> ClsResult<Self> {
        let range = Self { min, max };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> ClsResult<()> {
        if !(self.min > 0.0) || !(self.max >= self.min) {
            return Err(cls_core::config_error!(
                "frequency range [{}, {}] must be positive and ordered",
                self.min,
                self.max
            ));
        }
        Ok(())
    }

    pub fn clamp(&self, frequency: f64) -> f64 {
        frequency.clamp(self.min, self.max)
    }

    pub fn contains(&self, frequency: f64) -> bool {
        frequency >= self.min && frequency <= self.max
    }

    /// `[center - delta, center + delta]` intersected with the range
    ///
    /// Falls back to the whole range when the window misses it entirely.
    pub fn window(&self, center: f64, delta: f64) -> (f64, f64) {
        let lo = (center - delta).max(self.min);
        let hi = (center + delta).min(self.max);
        if lo > hi {
            (self.min, self.max)
        } else {
            (lo, hi)
        }
    }
}

/// Next-frequency policy
pub trait FrequencyStrategy: Send {
    fn compute_next_frequency(
        &mut self,
        spectrum: &PowerSpectrum,
        current: f64,
        block_count: u64,
    ) -> ClsResult<StrategyDecision>;

    fn name(&self) -> &'static str;

    /// Forget any state carried between updates
    fn reset(&mut self) {}
}

fn changed_tag(old: f64, new: f64) -> ResultTag {
    if (old - new).abs() > f64::EPSILON {
        ResultTag::Update
    } else {
        ResultTag::NoUpdate
    }
}

/// Follows the loudest bin without any peak gating
pub struct ArgMaxFollower {
    range: FrequencyRange,
}

impl ArgMaxFollower {
    pub fn new(range: FrequencyRange) -> Self {
        Self { range }
    }
}

impl FrequencyStrategy for ArgMaxFollower {
    fn compute_next_frequency(&mut self, spectrum: &PowerSpectrum, current: f64, _: u64) -> ClsResult<StrategyDecision> {
        let Some(bin) = spectrum.argmax() else {
            return Ok(StrategyDecision::tracking(current, ResultTag::NoPeak));
        };
        let next = self.range.clamp(spectrum.frequencies[bin]);
        Ok(StrategyDecision::tracking(next, changed_tag(current, next)))
    }

    fn name(&self) -> &'static str {
        "arg_max_follower"
    }
}

/// Moves toward the best qualifying peak by at most `delta` per update
pub struct PeakFollowerDelta {
    range: FrequencyRange,
    peak: PeakConfig,
    delta: f64,
}

impl PeakFollowerDelta {
    pub fn new(range: FrequencyRange, peak: PeakConfig, delta: f64) -> Self {
        Self { range, peak, delta }
    }

    fn follow(&self, spectrum: &PowerSpectrum, current: f64) -> (f64, ResultTag) {
        match find_peak(spectrum, &self.peak) {
            Some(peak) => {
                let (lo, hi) = self.range.window(current, self.delta);
                let next = peak.frequency.clamp(lo, hi);
                (next, changed_tag(current, next))
            }
            None => (current, ResultTag::NoPeak),
        }
    }
}

impl FrequencyStrategy for PeakFollowerDelta {
    fn compute_next_frequency(&mut self, spectrum: &PowerSpectrum, current: f64, _: u64) -> ClsResult<StrategyDecision> {
        let (next, tag) = self.follow(spectrum, current);
        Ok(StrategyDecision::tracking(next, tag))
    }

    fn name(&self) -> &'static str {
        "peak_follower_delta"
    }
}

/// Adaptation disabled
#[derive(Default)]
pub struct StaticFrequency;

impl FrequencyStrategy for StaticFrequency {
    fn compute_next_frequency(&mut self, _: &PowerSpectrum, current: f64, _: u64) -> ClsResult<StrategyDecision> {
        Ok(StrategyDecision::new(current, ResultTag::Static, BlockType::Static))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExplorePhase {
    Tracking,
    ExploreLow,
    ExploreHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ExploreEvent {
    PeakFound,
    Measured,
}

#[derive(Debug, Default)]
struct ExploreContext {
    base: f64,
    low_power: Option<f64>,
    high_power: Option<f64>,
}

/// Explores `base - delta` and `base + delta` after each detected peak
///
/// The spectrum handed in while a sub-block is being explored is the one
/// measured at that sub-block's frequency. After both sides the frequency
/// whose spectrum had the stronger qualifying peak wins, the lower side on a
/// tie, and the base frequency is kept when neither side qualified.
pub struct DichotomicExplorator {
    range: FrequencyRange,
    peak: PeakConfig,
    delta: f64,
    machine: StateMachine<ExplorePhase, ExploreEvent, ExploreContext>,
    ctx: ExploreContext,
}

impl DichotomicExplorator {
    pub fn new(range: FrequencyRange, peak: PeakConfig, delta: f64) -> Self {
        let machine = StateMachine::builder(ExplorePhase::Tracking)
            .transition(ExplorePhase::Tracking, ExploreEvent::PeakFound, ExplorePhase::ExploreLow)
            .transition(ExplorePhase::ExploreLow, ExploreEvent::Measured, ExplorePhase::ExploreHigh)
            .transition(ExplorePhase::ExploreHigh, ExploreEvent::Measured, ExplorePhase::Tracking)
            .on_enter(ExplorePhase::Tracking, |ctx: &mut ExploreContext| {
                ctx.low_power = None;
                ctx.high_power = None;
                Ok(())
            })
            .build();

        Self {
            range,
            peak,
            delta,
            machine,
            ctx: ExploreContext::default(),
        }
    }

    pub fn phase(&self) -> ExplorePhase {
        self.machine.current()
    }

    fn low(&self) -> f64 {
        self.range.clamp(self.ctx.base - self.delta)
    }

    fn high(&self) -> f64 {
        self.range.clamp(self.ctx.base + self.delta)
    }

    fn qualifying_power(&self, spectrum: &PowerSpectrum) -> Option<f64> {
        find_peak(spectrum, &self.peak).map(|p| p.power)
    }
}

impl FrequencyStrategy for DichotomicExplorator {
    fn compute_next_frequency(&mut self, spectrum: &PowerSpectrum, current: f64, _: u64) -> ClsResult<StrategyDecision> {
        match self.machine.current() {
            ExplorePhase::Tracking => {
                if find_peak(spectrum, &self.peak).is_none() {
                    return Ok(StrategyDecision::tracking(current, ResultTag::NoPeak));
                }
                self.ctx.base = current;
                self.machine.process_event(ExploreEvent::PeakFound, &mut self.ctx)?;
                Ok(StrategyDecision::new(self.low(), ResultTag::Explore, BlockType::ExploreLow))
            }
            ExplorePhase::ExploreLow => {
                self.ctx.low_power = self.qualifying_power(spectrum);
                self.machine.process_event(ExploreEvent::Measured, &mut self.ctx)?;
                Ok(StrategyDecision::new(self.high(), ResultTag::Explore, BlockType::ExploreHigh))
            }
            ExplorePhase::ExploreHigh => {
                self.ctx.high_power = self.qualifying_power(spectrum);
                let decision = match (self.ctx.low_power, self.ctx.high_power) {
                    (Some(low), Some(high)) if high > low => {
                        StrategyDecision::tracking(self.high(), ResultTag::Commit)
                    }
                    (Some(_), _) => StrategyDecision::tracking(self.low(), ResultTag::Commit),
                    (None, Some(_)) => StrategyDecision::tracking(self.high(), ResultTag::Commit),
                    (None, None) => StrategyDecision::tracking(self.ctx.base, ResultTag::Fallback),
                };
                tracing::debug!(
                    low_power = ?self.ctx.low_power,
                    high_power = ?self.ctx.high_power,
                    frequency = decision.frequency,
                    tag = %decision.tag,
                    "exploration resolved"
                );
                self.machine.process_event(ExploreEvent::Measured, &mut self.ctx)?;
                Ok(decision)
            }
        }
    }

    fn name(&self) -> &'static str {
        "dichotomic_explorator"
    }

    fn reset(&mut self) {
        self.machine.reset();
        self.ctx = ExploreContext::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WashoutPhase {
    Tracking,
    Washout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WashoutEvent {
    Stalled,
    Expired,
}

#[derive(Debug, Default)]
struct WashoutContext {
    missed: u32,
    remaining: u32,
    timeout: u32,
    /// Frequency tracking resumes from after a washout
    resume: Option<f64>,
}

/// Peak tracking that breaks out of stalls with a fixed washout frequency
///
/// The `trigger`-th consecutive update without a peak still keeps the current
/// frequency. The following `timeout` updates return the washout frequency,
/// after which tracking resumes from the frequency held before the washout.
pub struct Washout {
    follower: PeakFollowerDelta,
    trigger: u32,
    frequency: f64,
    machine: StateMachine<WashoutPhase, WashoutEvent, WashoutContext>,
    ctx: WashoutContext,
}

impl Washout {
    pub fn new(
        range: FrequencyRange,
        peak: PeakConfig,
        delta: f64,
        trigger: u32,
        timeout: u32,
        frequency: f64,
    ) -> Self {
        let machine = StateMachine::builder(WashoutPhase::Tracking)
            .transition(WashoutPhase::Tracking, WashoutEvent::Stalled, WashoutPhase::Washout)
            .transition(WashoutPhase::Washout, WashoutEvent::Expired, WashoutPhase::Tracking)
            .on_enter(WashoutPhase::Washout, |ctx: &mut WashoutContext| {
                ctx.remaining = ctx.timeout;
                ctx.missed = 0;
                Ok(())
            })
            .build();

        Self {
            follower: PeakFollowerDelta::new(range, peak, delta),
            trigger,
            frequency: range.clamp(frequency),
            machine,
            ctx: WashoutContext { timeout, ..WashoutContext::default() },
        }
    }

    pub fn phase(&self) -> WashoutPhase {
        self.machine.current()
    }

    pub fn missed_updates(&self) -> u32 {
        self.ctx.missed
    }
}

impl FrequencyStrategy for Washout {
    fn compute_next_frequency(&mut self, spectrum: &PowerSpectrum, current: f64, _: u64) -> ClsResult<StrategyDecision> {
        match self.machine.current() {
            WashoutPhase::Tracking => {
                let base = self.ctx.resume.take().unwrap_or(current);
                let (next, tag) = self.follower.follow(spectrum, base);
                if tag == ResultTag::NoPeak {
                    self.ctx.missed += 1;
                    if self.ctx.missed >= self.trigger {
                        tracing::info!(missed = self.ctx.missed, "no peak for too long, starting washout");
                        self.ctx.resume = Some(base);
                        self.machine.process_event(WashoutEvent::Stalled, &mut self.ctx)?;
                        if self.ctx.remaining == 0 {
                            self.machine.process_event(WashoutEvent::Expired, &mut self.ctx)?;
                        }
                    }
                } else {
                    self.ctx.missed = 0;
                }
                // tag against the frequency actually delivered
                let tag = match tag {
                    ResultTag::NoPeak => ResultTag::NoPeak,
                    _ => changed_tag(current, next),
                };
                Ok(StrategyDecision::tracking(next, tag))
            }
            WashoutPhase::Washout => {
                self.ctx.remaining = self.ctx.remaining.saturating_sub(1);
                if self.ctx.remaining == 0 {
                    self.machine.process_event(WashoutEvent::Expired, &mut self.ctx)?;
                }
                Ok(StrategyDecision::new(self.frequency, ResultTag::Washout, BlockType::Washout))
            }
        }
    }

    fn name(&self) -> &'static str {
        "washout"
    }

    fn reset(&mut self) {
        self.machine.reset();
        self.ctx = WashoutContext { timeout: self.ctx.timeout, ..WashoutContext::default() };
    }
}

/// Strategy selection as read from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyConfig {
    ArgMaxFollower,
    PeakFollowerDelta {
        delta: f64,
    },
    DichotomicExplorator {
        delta: f64,
    },
    Washout {
        delta: f64,
        trigger_updates: u32,
        timeout_updates: u32,
        washout_frequency: f64,
    },
    Static,
}

impl StrategyConfig {
    pub fn validate(&self, range: &FrequencyRange) -> ClsResult<()> {
        match self {
            StrategyConfig::PeakFollowerDelta { delta } | StrategyConfig::DichotomicExplorator { delta } => {
                check_delta(*delta)
            }
            StrategyConfig::Washout { delta, trigger_updates, washout_frequency, .. } => {
                check_delta(*delta)?;
                if *trigger_updates == 0 {
                    return Err(cls_core::config_error!("washout trigger count must be positive"));
                }
                if !range.contains(*washout_frequency) {
                    return Err(cls_core::config_error!(
                        "washout frequency {} Hz outside [{}, {}]",
                        washout_frequency,
                        range.min,
                        range.max
                    ));
                }
                Ok(())
            }
            StrategyConfig::ArgMaxFollower | StrategyConfig::Static => Ok(()),
        }
    }
}

fn check_delta(delta: f64) -> ClsResult<()> {
    if !(delta > 0.0) {
        return Err(cls_core::config_error!("frequency delta must be positive, got {}", delta));
    }
    Ok(())
}

/// Construct the configured strategy
pub fn build_strategy(
    config: &StrategyConfig,
    range: FrequencyRange,
    peak: &PeakConfig,
) -> ClsResult<Box<dyn FrequencyStrategy>> {
    range.validate()?;
    peak.validate()?;
    config.validate(&range)?;

    let strategy: Box<dyn FrequencyStrategy> = match config {
        StrategyConfig::ArgMaxFollower => Box::new(ArgMaxFollower::new(range)),
        StrategyConfig::PeakFollowerDelta { delta } => {
            Box::new(PeakFollowerDelta::new(range, peak.clone(), *delta))
        }
        StrategyConfig::DichotomicExplorator { delta } => {
            Box::new(DichotomicExplorator::new(range, peak.clone(), *delta))
        }
        StrategyConfig::Washout { delta, trigger_updates, timeout_updates, washout_frequency } => Box::new(Washout::new(
            range,
            peak.clone(),
            *delta,
            *trigger_updates,
            *timeout_updates,
            *washout_frequency,
        )),
        StrategyConfig::Static => Box::new(StaticFrequency),
    };
    Ok(strategy)
}
