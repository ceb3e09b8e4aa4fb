//! Per-channel threshold-crossing spike detection

use crate::analysis::AnalysisStage;
use crate::worker::WorkerPool;
use cls_core::{config_error, lock_buffer, ChannelStats, ClsError, ClsResult, SharedBuffer};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

/// How the detection threshold is obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Same threshold for every channel
    Global(f64),
    /// One threshold per channel
    PerChannel(Vec<f64>),
    /// `mean ∓ k·SD` of everything the channel has seen so far
    Auto { k: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Detect downward crossings below the threshold
    #[default]
    Negative,
    /// Detect upward crossings above the threshold
    Positive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeConfig {
    pub threshold: ThresholdMode,
    #[serde(default)]
    pub polarity: Polarity,
    /// Samples per extracted waveform
    pub waveform_length: usize,
    /// Samples kept before the crossing sample
    pub pre_peak: usize,
    /// Samples after a detection during which no new detection fires
    pub refractory: usize,
}

impl SpikeConfig {
    pub fn validate(&self, channels: usize) -> ClsResult<()> {
        if self.waveform_length == 0 {
            return Err(config_error!("spike waveform_length must be positive"));
        }
        if self.pre_peak >= self.waveform_length {
            return Err(config_error!(
                "pre_peak {} must be shorter than waveform_length {}",
                self.pre_peak, self.waveform_length
            ));
        }
        match &self.threshold {
            ThresholdMode::PerChannel(values) if values.len() != channels => Err(config_error!(
                "{} per-channel thresholds for {} channels", values.len(), channels
            )),
            ThresholdMode::Auto { k } if !(*k > 0.0) => {
                Err(config_error!("auto threshold factor must be positive, got {}", k))
            }
            _ => Ok(()),
        }
    }
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            threshold: ThresholdMode::Auto { k: 4.0 },
            polarity: Polarity::Negative,
            waveform_length: 48,
            pre_peak: 16,
            refractory: 30,
        }
    }
}

/// One detected spike
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpikeEvent {
    pub channel: usize,
    /// Absolute index of the crossing sample since the last reset
    pub sample_index: u64,
    pub threshold: f64,
    pub waveform: Vec<f64>,
}

/// Spikes completed during the latest block, per channel
pub type SpikeResults = Vec<Vec<SpikeEvent>>;
pub type SharedSpikes = Arc<RwLock<SpikeResults>>;

/// Running mean/variance, merged block by block
#[derive(Debug, Clone, Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    /// Fold in a whole block summarised by its population statistics
    fn merge(&mut self, block: &ChannelStats, n: usize) {
        if n == 0 {
            return;
        }
        let n_b = n as f64;
        let n_a = self.count as f64;
        let total = n_a + n_b;
        let delta = block.mean - self.mean;
        self.mean += delta * n_b / total;
        self.m2 += block.std_dev * block.std_dev * n_b + delta * delta * n_a * n_b / total;
        self.count += n as u64;
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone)]
struct PendingWaveform {
    sample_index: u64,
    threshold: f64,
    samples: Vec<f64>,
}

/// Detection state of one channel, carried across blocks
#[derive(Debug, Clone)]
struct ChannelDetector {
    channel: usize,
    previous: Option<f64>,
    refractory_left: usize,
    history: VecDeque<f64>,
    pending: Vec<PendingWaveform>,
    stats: RunningStats,
    samples_seen: u64,
}

impl ChannelDetector {
    fn new(channel: usize) -> Self {
        Self {
            channel,
            previous: None,
            refractory_left: 0,
            history: VecDeque::new(),
            pending: Vec::new(),
            stats: RunningStats::default(),
            samples_seen: 0,
        }
    }

    fn threshold(&self, config: &SpikeConfig) -> f64 {
        match &config.threshold {
            ThresholdMode::Global(value) => *value,
            ThresholdMode::PerChannel(values) => values[self.channel],
            ThresholdMode::Auto { k } => match config.polarity {
                Polarity::Negative => self.stats.mean - k * self.stats.std_dev(),
                Polarity::Positive => self.stats.mean + k * self.stats.std_dev(),
            },
        }
    }

    /// Update the auto-threshold statistics with the block about to be processed
    fn absorb(&mut self, block: &ChannelStats, n: usize) {
        self.stats.merge(block, n);
    }

    fn process(&mut self, data: &[f64], config: &SpikeConfig) -> Vec<SpikeEvent> {
        let threshold = self.threshold(config);
        let mut completed = Vec::new();

        for &x in data {
            let index = self.samples_seen;
            self.samples_seen += 1;

            for wave in &mut self.pending {
                wave.samples.push(x);
            }
            self.flush_completed(config.waveform_length, &mut completed);

            let crossed = match (self.previous, config.polarity) {
                (Some(prev), Polarity::Negative) => prev > threshold && x <= threshold,
                (Some(prev), Polarity::Positive) => prev < threshold && x >= threshold,
                (None, _) => false,
            };

            if self.refractory_left > 0 {
                self.refractory_left -= 1;
            } else if crossed && self.history.len() == config.pre_peak {
                let mut samples = Vec::with_capacity(config.waveform_length);
                samples.extend(self.history.iter().copied());
                samples.push(x);
                self.pending.push(PendingWaveform { sample_index: index, threshold, samples });
                self.flush_completed(config.waveform_length, &mut completed);
                self.refractory_left = config.refractory;
            }

            if config.pre_peak > 0 {
                if self.history.len() == config.pre_peak {
                    self.history.pop_front();
                }
                self.history.push_back(x);
            }
            self.previous = Some(x);
        }
        completed
    }

    fn flush_completed(&mut self, length: usize, out: &mut Vec<SpikeEvent>) {
        let channel = self.channel;
        self.pending.retain_mut(|wave| {
            if wave.samples.len() >= length {
                out.push(SpikeEvent {
                    channel,
                    sample_index: wave.sample_index,
                    threshold: wave.threshold,
                    waveform: std::mem::take(&mut wave.samples),
                });
                false
            } else {
                true
            }
        });
    }

    fn reset(&mut self) {
        *self = Self::new(self.channel);
    }
}

/// Independent detector per channel over a shared input buffer
pub struct SpikeDetector {
    name: String,
    config: SpikeConfig,
    input: SharedBuffer,
    detectors: Vec<ChannelDetector>,
    results: SharedSpikes,
    pool: WorkerPool,
}

impl SpikeDetector {
    pub fn new(name: &str, config: SpikeConfig, input: SharedBuffer, pool: WorkerPool) -> ClsResult<Self> {
        let channels = lock_buffer(&input).channel_count();
        config.validate(channels)?;

        Ok(Self {
            name: name.to_string(),
            config,
            input,
            detectors: (0..channels).map(ChannelDetector::new).collect(),
            results: Arc::new(RwLock::new(vec![Vec::new(); channels])),
            pool,
        })
    }

    /// Shared handle to the latest per-channel detections
    pub fn results(&self) -> SharedSpikes {
        self.results.clone()
    }

    pub fn config(&self) -> &SpikeConfig {
        &self.config
    }
}

impl AnalysisStage for SpikeDetector {
    fn run(&mut self) -> ClsResult<()> {
        let input = lock_buffer(&self.input);
        if input.channel_count() != self.detectors.len() {
            return Err(ClsError::ShapeMismatch {
                context: format!("spike detector '{}' input", self.name),
                expected: (self.detectors.len(), input.samples_per_channel()),
                actual: input.shape(),
            });
        }

        if matches!(self.config.threshold, ThresholdMode::Auto { .. }) {
            let samples = input.samples_per_channel();
            for detector in &mut self.detectors {
                detector.absorb(&input.channel_stats(detector.channel)?, samples);
            }
        }

        let config = &self.config;
        let detectors = &mut self.detectors;
        let found: SpikeResults = self.pool.install(|| {
            detectors
                .par_iter_mut()
                .zip(input.as_slice().par_chunks(input.samples_per_channel()))
                .map(|(detector, row)| detector.process(row, config))
                .collect()
        });
        drop(input);

        let total: usize = found.iter().map(Vec::len).sum();
        if total > 0 {
            tracing::debug!(stage = %self.name, spikes = total, "spikes detected");
        }
        *self.results.write().unwrap_or_else(|p| p.into_inner()) = found;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        for detector in &mut self.detectors {
            detector.reset();
        }
        for channel in self.results.write().unwrap_or_else(|p| p.into_inner()).iter_mut() {
            channel.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cls_core::MultichannelBuffer;

    fn config(refractory: usize) -> SpikeConfig {
        SpikeConfig {
            threshold: ThresholdMode::Global(-5.0),
            polarity: Polarity::Negative,
            waveform_length: 6,
            pre_peak: 2,
            refractory,
        }
    }

    #[test]
    fn test_detects_crossing_with_waveform() {
        let mut detector = ChannelDetector::new(0);
        let data = [0.0, 1.0, 2.0, -6.0, -3.0, 0.0, 1.0, 2.0, 0.0];
        let spikes = detector.process(&data, &config(0));

        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].sample_index, 3);
        assert_eq!(spikes[0].waveform, vec![1.0, 2.0, -6.0, -3.0, 0.0, 1.0]);
    }

    #[test]
    fn test_refractory_suppresses_detections() {
        let data = [0.0, 0.0, -6.0, 0.0, -6.0, 0.0, -6.0, 0.0, 0.0, 0.0, 0.0, 0.0];

        let mut free = ChannelDetector::new(0);
        assert_eq!(free.process(&data, &config(0)).len(), 3);

        let mut limited = ChannelDetector::new(0);
        let spikes = limited.process(&data, &config(3));
        assert_eq!(spikes.len(), 2);
        assert_eq!(spikes[0].sample_index, 2);
        assert_eq!(spikes[1].sample_index, 6);
    }

    #[test]
    fn test_waveform_completes_in_next_block() {
        let mut detector = ChannelDetector::new(0);
        let cfg = config(0);

        assert!(detector.process(&[0.0, 0.0, 0.0, -7.0, -1.0], &cfg).is_empty());
        let spikes = detector.process(&[0.5, 0.25, 0.0], &cfg);

        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].sample_index, 3);
        assert_eq!(spikes[0].waveform, vec![0.0, 0.0, -7.0, -1.0, 0.5, 0.25]);
    }

    #[test]
    fn test_crossing_spanning_blocks() {
        let mut detector = ChannelDetector::new(0);
        let cfg = config(0);
        detector.process(&[0.0, 0.0, 0.0], &cfg);
        // previous sample comes from the earlier block
        let spikes = detector.process(&[-8.0, 0.0, 0.0, 0.0, 0.0, 0.0], &cfg);
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].sample_index, 3);
    }

    #[test]
    fn test_positive_auto_threshold() {
        let mut detector = ChannelDetector::new(0);
        let cfg = SpikeConfig {
            threshold: ThresholdMode::Auto { k: 3.0 },
            polarity: Polarity::Positive,
            waveform_length: 4,
            pre_peak: 1,
            refractory: 0,
        };
        let mut data: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        data[100] = 20.0;

        detector.absorb(&ChannelStats::calculate(&data), data.len());
        let spikes = detector.process(&data, &cfg);
        assert_eq!(spikes.len(), 1);
        assert_eq!(spikes[0].sample_index, 100);
        assert!(spikes[0].threshold > 1.0 && spikes[0].threshold < 20.0);
    }

    #[test]
    fn test_block_merge_matches_whole_signal() {
        let first = [1.0, 2.0, 3.0, 4.0];
        let second = [10.0, -2.0, 5.0];
        let mut stats = RunningStats::default();
        stats.merge(&ChannelStats::calculate(&first), first.len());
        stats.merge(&ChannelStats::calculate(&second), second.len());

        let whole: Vec<f64> = first.iter().chain(&second).copied().collect();
        let expected = ChannelStats::calculate(&whole);
        let n = whole.len() as f64;
        assert_eq!(stats.count, 7);
        assert!((stats.mean - expected.mean).abs() < 1e-12);
        assert!((stats.std_dev() - expected.std_dev * (n / (n - 1.0)).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn test_stage_auto_threshold_spans_blocks() {
        let pool = WorkerPool::new(1).unwrap();
        let noise: Vec<f64> = (0..200).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }).collect();
        let input = MultichannelBuffer::from_rows("mua", vec![noise.clone()], 1000.0).unwrap().into_shared();
        let cfg = SpikeConfig {
            threshold: ThresholdMode::Auto { k: 3.0 },
            polarity: Polarity::Positive,
            waveform_length: 4,
            pre_peak: 1,
            refractory: 0,
        };
        let mut stage = SpikeDetector::new("spikes", cfg, input.clone(), pool).unwrap();
        stage.run().unwrap();
        assert!(stage.results().read().unwrap()[0].is_empty());

        let mut block = noise;
        block[50] = 20.0;
        lock_buffer(&input).row_mut(0).copy_from_slice(&block);
        stage.run().unwrap();

        let results = stage.results();
        let results = results.read().unwrap();
        assert_eq!(results[0].len(), 1);
        assert_eq!(results[0][0].sample_index, 250);
    }

    #[test]
    fn test_stage_runs_channels_independently() {
        let pool = WorkerPool::new(2).unwrap();
        let mut rows = vec![vec![0.0; 20], vec![0.0; 20]];
        rows[1][10] = -9.0;
        let input = MultichannelBuffer::from_rows("mua", rows, 1000.0).unwrap().into_shared();

        let mut stage = SpikeDetector::new("spikes", config(5), input, pool).unwrap();
        stage.run().unwrap();

        let results = stage.results();
        let results = results.read().unwrap();
        assert!(results[0].is_empty());
        assert_eq!(results[1].len(), 1);
        assert_eq!(results[1][0].channel, 1);
    }

    #[test]
    fn test_invalid_spike_config() {
        let mut cfg = config(0);
        cfg.pre_peak = 6;
        assert!(cfg.validate(1).is_err());
        cfg.pre_peak = 1;
        cfg.threshold = ThresholdMode::PerChannel(vec![1.0]);
        assert!(cfg.validate(2).is_err());
    }
}
