//! 1-D power spectra reduced from the analyzer's spectrum history

use cls_core::{ClsError, ClsResult};
use cls_processing::SpectrumHistory;
use serde::{Deserialize, Serialize};

/// Floor applied before log compression
const LOG_FLOOR: f64 = 1e-12;

/// Power per frequency bin
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrum {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

impl PowerSpectrum {
    pub fn new(frequencies: Vec<f64>, power: Vec<f64>) -> ClsResult<Self> {
        if frequencies.len() != power.len() {
            return Err(ClsError::ShapeMismatch {
                context: "power spectrum".to_string(),
                expected: (1, frequencies.len()),
                actual: (1, power.len()),
            });
        }
        Ok(Self { frequencies, power })
    }

    /// Spectrum with no bins, read by every strategy as "no peak"
    pub fn empty() -> Self {
        Self { frequencies: Vec::new(), power: Vec::new() }
    }

    /// Build from a closure evaluated at every frequency
    pub fn from_fn(frequencies: Vec<f64>, f: impl Fn(f64) -> f64) -> Self {
        let power = frequencies.iter().map(|&x| f(x)).collect();
        Self { frequencies, power }
    }

    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    /// Index of the loudest bin
    pub fn argmax(&self) -> Option<usize> {
        self.power
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
    }

    /// Bin whose frequency is closest to `frequency`
    pub fn nearest_bin(&self, frequency: f64) -> Option<usize> {
        self.frequencies
            .iter()
            .enumerate()
            .min_by(|a, b| (a.1 - frequency).abs().total_cmp(&(b.1 - frequency).abs()))
            .map(|(i, _)| i)
    }

    pub fn power_range(&self) -> (f64, f64) {
        self.power
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &p| (lo.min(p), hi.max(p)))
    }

    pub fn frequency_range(&self) -> (f64, f64) {
        match (self.frequencies.first(), self.frequencies.last()) {
            (Some(&first), Some(&last)) => (first, last),
            _ => (0.0, 0.0),
        }
    }
}

/// How the 2-D spectrum history is collapsed into one vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectrumConfig {
    /// Channel indices to average; empty means every channel
    #[serde(default)]
    pub channels: Vec<usize>,
    /// Number of most recent time windows averaged per channel
    pub periods: usize,
    #[serde(default)]
    pub log_scale: bool,
    /// Z-score against the prestimulus baseline
    #[serde(default)]
    pub zscore: bool,
    /// Prestimulus blocks accumulated into the baseline
    #[serde(default = "default_baseline_blocks")]
    pub baseline_blocks: usize,
}

fn default_baseline_blocks() -> usize {
    10
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            channels: Vec::new(),
            periods: 4,
            log_scale: false,
            zscore: false,
            baseline_blocks: default_baseline_blocks(),
        }
    }
}

impl SpectrumConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if self.periods == 0 {
            return Err(cls_core::config_error!("spectrum periods must be positive"));
        }
        if self.zscore && self.baseline_blocks == 0 {
            return Err(cls_core::config_error!("z-scoring needs at least one baseline block"));
        }
        Ok(())
    }
}

/// Average the last `periods` windows of the selected channels into one spectrum
///
/// Returns `None` while the history holds no block yet.
pub fn get_1d_power_spectrum(
    history: &SpectrumHistory,
    channels: &[usize],
    periods: usize,
    log_scale: bool,
) -> ClsResult<Option<PowerSpectrum>> {
    if history.is_empty() || periods == 0 {
        return Ok(None);
    }

    let bins = history.frequencies().len();
    let selected: Vec<usize> = if channels.is_empty() {
        (0..history.channel_count()).collect()
    } else {
        channels.to_vec()
    };

    let mut power = vec![0.0; bins];
    let mut used_channels = 0usize;
    for &channel in &selected {
        if channel >= history.channel_count() {
            return Err(ClsError::ChannelNotFound { channel: channel.to_string() });
        }
        let mut channel_power = vec![0.0; bins];
        let mut windows = 0usize;
        for window in history.recent_windows(channel, periods) {
            for (acc, &p) in channel_power.iter_mut().zip(window) {
                *acc += p;
            }
            windows += 1;
        }
        if windows == 0 {
            continue;
        }
        for (acc, p) in power.iter_mut().zip(&channel_power) {
            *acc += p / windows as f64;
        }
        used_channels += 1;
    }

    if used_channels == 0 {
        return Ok(None);
    }
    for p in power.iter_mut() {
        *p /= used_channels as f64;
        if log_scale {
            *p = p.max(LOG_FLOOR).log10();
        }
    }

    Ok(Some(PowerSpectrum {
        frequencies: history.frequencies().to_vec(),
        power,
    }))
}

/// Per-bin mean and standard deviation of prestimulus spectra
#[derive(Debug, Clone, Default)]
pub struct Baseline {
    count: usize,
    mean: Vec<f64>,
    m2: Vec<f64>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
        self.mean.clear();
        self.m2.clear();
    }

    pub fn accumulate(&mut self, spectrum: &PowerSpectrum) -> ClsResult<()> {
        if self.count == 0 {
            self.mean = vec![0.0; spectrum.len()];
            self.m2 = vec![0.0; spectrum.len()];
        } else if spectrum.len() != self.mean.len() {
            return Err(ClsError::ShapeMismatch {
                context: "spectral baseline".to_string(),
                expected: (1, self.mean.len()),
                actual: (1, spectrum.len()),
            });
        }

        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(&spectrum.power) {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
        Ok(())
    }

    pub fn mean(&self) -> &[f64] {
        &self.mean
    }

    pub fn std_dev(&self) -> Vec<f64> {
        if self.count < 2 {
            return vec![0.0; self.mean.len()];
        }
        let n = (self.count - 1) as f64;
        self.m2.iter().map(|m2| (m2 / n).sqrt()).collect()
    }

    /// Z-score a spectrum in place; bins without spread are only centred
    pub fn zscore(&self, spectrum: &mut PowerSpectrum) -> ClsResult<()> {
        if self.is_empty() {
            return Ok(());
        }
        if spectrum.len() != self.mean.len() {
            return Err(ClsError::ShapeMismatch {
                context: "spectral baseline".to_string(),
                expected: (1, self.mean.len()),
                actual: (1, spectrum.len()),
            });
        }
        for ((p, mean), sd) in spectrum.power.iter_mut().zip(&self.mean).zip(self.std_dev()) {
            *p -= mean;
            if sd > f64::EPSILON {
                *p /= sd;
            }
        }
        Ok(())
    }
}
