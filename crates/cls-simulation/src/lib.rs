//! CLS-Simulation: synthetic data source and stimulus device
//!
//! A multichannel LFP generator streamed in real time at the polling
//! period, and an in-process stimulator that executes instruction programs.
//! The generator can be coupled to the stimulator so that the flicker
//! frequency entrains the simulated signal.

pub mod lfp_simulator;
pub mod real_time_stream;
pub mod signal_patterns;
pub mod stimulator;

pub use lfp_simulator::*;
pub use real_time_stream::*;
pub use signal_patterns::*;
pub use stimulator::*;
