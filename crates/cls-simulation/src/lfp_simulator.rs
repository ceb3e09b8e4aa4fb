//! Synthetic LFP source with optional entrainment to a simulated stimulator

use crate::signal_patterns::AmplitudePattern;
use crate::stimulator::StimulatorHandle;
use cls_core::{default_labels, ClsError, ClsResult, MultichannelBuffer};
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// One intrinsic rhythm present on every channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Oscillation {
    pub frequency: f64,
    pub amplitude: f64,
    #[serde(default)]
    pub pattern: AmplitudePattern,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoiseConfig {
    /// Gaussian noise standard deviation (0.0 = no noise)
    pub gaussian_std: f64,
    /// Slow drift amplitude
    pub baseline_wander: f64,
    /// Mean multiunit spikes per second and channel
    pub spike_rate: f64,
    pub spike_amplitude: f64,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            gaussian_std: 0.1,
            baseline_wander: 0.05,
            spike_rate: 0.0,
            spike_amplitude: 3.0,
        }
    }
}

/// Resonance of the simulated tissue to flicker stimulation
///
/// The driven response at the flicker frequency has a Gaussian tuning curve
/// around `preferred_frequency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrainmentConfig {
    pub preferred_frequency: f64,
    pub bandwidth: f64,
    pub gain: f64,
}

impl EntrainmentConfig {
    pub fn response(&self, flicker_frequency: f64) -> f64 {
        if flicker_frequency <= 0.0 {
            return 0.0;
        }
        let offset = flicker_frequency - self.preferred_frequency;
        self.gain * (-(offset * offset) / (2.0 * self.bandwidth * self.bandwidth)).exp()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LfpConfig {
    pub sampling_rate: f64,
    pub channel_count: usize,
    pub samples_per_block: usize,
    pub oscillations: Vec<Oscillation>,
    #[serde(default)]
    pub noise: NoiseConfig,
    /// Power line interference (50/60Hz)
    #[serde(default)]
    pub powerline_freq: Option<f64>,
    #[serde(default)]
    pub entrainment: Option<EntrainmentConfig>,
    /// Random seed for reproducibility
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for LfpConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 1000.0,
            channel_count: 4,
            samples_per_block: 500,
            oscillations: vec![Oscillation {
                frequency: 40.0,
                amplitude: 1.0,
                pattern: AmplitudePattern::default(),
            }],
            noise: NoiseConfig::default(),
            powerline_freq: Some(50.0),
            entrainment: None,
            seed: None,
        }
    }
}

impl LfpConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if !(self.sampling_rate > 0.0) {
            return Err(cls_core::config_error!("sampling rate must be positive"));
        }
        if self.channel_count == 0 || self.samples_per_block == 0 {
            return Err(cls_core::config_error!("simulated blocks need channels and samples"));
        }
        let nyquist = self.sampling_rate / 2.0;
        if let Some(bad) = self.oscillations.iter().find(|o| !(o.frequency > 0.0 && o.frequency < nyquist)) {
            return Err(cls_core::config_error!(
                "oscillation at {} Hz outside (0, {}) Hz",
                bad.frequency,
                nyquist
            ));
        }
        if !(self.noise.gaussian_std >= 0.0) || !(self.noise.spike_rate >= 0.0) {
            return Err(cls_core::config_error!("noise parameters must be non-negative"));
        }
        if let Some(entrainment) = &self.entrainment {
            if !(entrainment.bandwidth > 0.0) {
                return Err(cls_core::config_error!("entrainment bandwidth must be positive"));
            }
        }
        Ok(())
    }

    /// Block period in milliseconds
    pub fn block_period_ms(&self) -> u64 {
        (self.samples_per_block as f64 * 1000.0 / self.sampling_rate).round() as u64
    }
}

pub struct LfpSimulator {
    config: LfpConfig,
    rng: rand::rngs::StdRng,
    normal_dist: Normal<f64>,
    /// Samples generated so far, per channel
    sample_offset: u64,
    /// Phase of the driven response, kept continuous across frequency changes
    driven_phase: f64,
    stimulator: Option<StimulatorHandle>,
    labels: Vec<String>,
}

impl LfpSimulator {
    pub fn new(config: LfpConfig) -> ClsResult<Self> {
        config.validate()?;

        let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let rng = rand::rngs::StdRng::seed_from_u64(seed);
        let normal_dist = Normal::new(0.0, config.noise.gaussian_std).map_err(|e| ClsError::InvalidConfig {
            reason: format!("Failed to create normal distribution: {}", e),
        })?;
        let labels = default_labels(config.channel_count);

        Ok(Self {
            config,
            rng,
            normal_dist,
            sample_offset: 0,
            driven_phase: 0.0,
            stimulator: None,
            labels,
        })
    }

    /// Drive the entrained response from the stimulator's flicker frequency
    pub fn couple(&mut self, stimulator: StimulatorHandle) {
        self.stimulator = Some(stimulator);
    }

    pub fn config(&self) -> &LfpConfig {
        &self.config
    }

    pub fn update_config(&mut self, config: LfpConfig) -> ClsResult<()> {
        config.validate()?;
        self.normal_dist = Normal::new(0.0, config.noise.gaussian_std).map_err(|e| ClsError::InvalidConfig {
            reason: format!("Failed to create normal distribution: {}", e),
        })?;
        self.labels = default_labels(config.channel_count);
        self.config = config;
        Ok(())
    }

    /// Restart simulated time at zero
    pub fn reset_time(&mut self) {
        self.sample_offset = 0;
        self.driven_phase = 0.0;
    }

    pub fn elapsed(&self) -> f64 {
        self.sample_offset as f64 / self.config.sampling_rate
    }

    /// Next block of `channel_count × samples_per_block` samples
    pub fn generate_block(&mut self) -> ClsResult<MultichannelBuffer> {
        let fs = self.config.sampling_rate;
        let samples = self.config.samples_per_block;
        let dt = 1.0 / fs;
        let spike_probability = (self.config.noise.spike_rate * dt).min(1.0);

        let (driven_frequency, driven_amplitude) = match (&self.config.entrainment, &self.stimulator) {
            (Some(entrainment), Some(stimulator)) => {
                let frequency = stimulator.flicker_frequency();
                (frequency, entrainment.response(frequency))
            }
            _ => (0.0, 0.0),
        };

        let mut buffer = MultichannelBuffer::new("simulated", samples, fs, self.labels.clone())?;
        for (channel, row) in buffer.rows_mut().enumerate() {
            // small per-channel phase lag
            let lag = channel as f64 * 0.1;
            for (i, value) in row.iter_mut().enumerate() {
                let time = (self.sample_offset + i as u64) as f64 * dt;

                let mut sample: f64 = self
                    .config
                    .oscillations
                    .iter()
                    .map(|o| o.amplitude * o.pattern.gain_at(time) * (2.0 * PI * o.frequency * time - lag).sin())
                    .sum();

                if driven_amplitude > 0.0 {
                    let phase = self.driven_phase + 2.0 * PI * driven_frequency * i as f64 * dt;
                    sample += driven_amplitude * (phase - lag).sin();
                }

                sample += self.normal_dist.sample(&mut self.rng);
                sample += self.config.noise.baseline_wander * (2.0 * PI * 0.1 * time).sin();
                if let Some(powerline) = self.config.powerline_freq {
                    sample += 0.05 * (2.0 * PI * powerline * time).sin();
                }
                if spike_probability > 0.0 && self.rng.gen::<f64>() < spike_probability {
                    sample -= self.config.noise.spike_amplitude;
                }

                *value = sample;
            }
        }

        if driven_amplitude > 0.0 {
            self.driven_phase = (self.driven_phase + 2.0 * PI * driven_frequency * samples as f64 * dt) % (2.0 * PI);
        }
        self.sample_offset += samples as u64;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cls_core::{Instruction, InstructionCodec, StimulusTransport};
    use crate::stimulator::SimulatedStimulator;

    fn quiet_config() -> LfpConfig {
        LfpConfig {
            channel_count: 2,
            samples_per_block: 1000,
            noise: NoiseConfig {
                gaussian_std: 0.0,
                baseline_wander: 0.0,
                spike_rate: 0.0,
                spike_amplitude: 0.0,
            },
            powerline_freq: None,
            seed: Some(7),
            ..LfpConfig::default()
        }
    }

    /// Amplitude of the `frequency` component of a row
    fn tone_amplitude(row: &[f64], fs: f64, frequency: f64) -> f64 {
        let (mut re, mut im) = (0.0, 0.0);
        for (i, x) in row.iter().enumerate() {
            let phase = 2.0 * PI * frequency * i as f64 / fs;
            re += x * phase.cos();
            im += x * phase.sin();
        }
        2.0 * (re * re + im * im).sqrt() / row.len() as f64
    }

    #[test]
    fn test_block_shape_and_continuity() {
        let mut simulator = LfpSimulator::new(quiet_config()).unwrap();
        let first = simulator.generate_block().unwrap();
        let second = simulator.generate_block().unwrap();

        assert_eq!(first.shape(), (2, 1000));
        assert_eq!(simulator.elapsed(), 2.0);
        // 40 Hz over whole seconds: both blocks start at the same phase
        assert!((first.row(0)[0] - second.row(0)[0]).abs() < 1e-9);
        assert!((tone_amplitude(first.row(1), 1000.0, 40.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let config = LfpConfig { seed: Some(42), ..LfpConfig::default() };
        let a = LfpSimulator::new(config.clone()).unwrap().generate_block().unwrap();
        let b = LfpSimulator::new(config).unwrap().generate_block().unwrap();
        assert_eq!(a.as_slice(), b.as_slice());
    }

    #[test]
    fn test_entrainment_follows_stimulator() {
        let mut config = quiet_config();
        config.oscillations.clear();
        config.entrainment = Some(EntrainmentConfig {
            preferred_frequency: 20.0,
            bandwidth: 5.0,
            gain: 2.0,
        });

        let mut stimulator = SimulatedStimulator::new();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        stimulator.open(tx).unwrap();
        let mut simulator = LfpSimulator::new(config).unwrap();
        simulator.couple(stimulator.handle());

        // silent device, no driven response
        let block = simulator.generate_block().unwrap();
        assert!(block.as_slice().iter().all(|v| v.abs() < 1e-12));

        let codec = InstructionCodec::default();
        stimulator.write(&codec.encode(&Instruction::SetLeftFrequency(20.0))).unwrap();
        let block = simulator.generate_block().unwrap();
        assert!((tone_amplitude(block.row(0), 1000.0, 20.0) - 2.0).abs() < 1e-6);

        stimulator.write(&codec.encode(&Instruction::SetLeftFrequency(30.0))).unwrap();
        let block = simulator.generate_block().unwrap();
        let expected = 2.0 * (-(10.0f64 * 10.0) / 50.0).exp();
        assert!((tone_amplitude(block.row(0), 1000.0, 30.0) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = LfpConfig::default();
        config.oscillations[0].frequency = 600.0;
        assert!(LfpSimulator::new(config).is_err());
        assert_eq!(LfpConfig::default().block_period_ms(), 500);
    }
}
