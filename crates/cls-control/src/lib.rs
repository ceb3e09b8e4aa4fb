//! CLS-Control: closed-loop frequency control and the trial protocol
//!
//! Spectra produced by the analysis pipeline are reduced to one power
//! vector, searched for a qualifying peak and handed to a configurable
//! frequency strategy. The trial protocol sequences phases block by block,
//! drives the stimulus device and writes the trial log.

pub mod config;
pub mod controller;
pub mod peak;
pub mod protocol;
pub mod spectrum;
pub mod stimulus;
pub mod strategy;
pub mod trial_log;

pub use config::ControlConfig;
pub use controller::{ClosedLoopController, ControllerUpdate};
pub use peak::{find_peak, Peak, PeakConfig, PeakSelection};
pub use protocol::{Phase, PhaseTimeouts, PhaseTriggers, Protocol, ProtocolConfig, ProtocolEvent};
pub use spectrum::{get_1d_power_spectrum, Baseline, PowerSpectrum, SpectrumConfig};
pub use stimulus::{StimulusConfig, StimulusController};
pub use strategy::{
    build_strategy, ArgMaxFollower, BlockType, DichotomicExplorator, FrequencyRange, FrequencyStrategy,
    PeakFollowerDelta, ResultTag, StaticFrequency, StrategyConfig, StrategyDecision, Washout,
};
pub use trial_log::{TrialLog, TrialLogRow, TrialSink};
