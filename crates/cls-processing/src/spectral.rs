//! Time-resolved power spectra: short-time Fourier and superlet analyzers
//!
//! Both analyzers turn one channel block into a `windows × bins` power
//! matrix restricted to a frequency band. Results of recent blocks are kept
//! in a [`SpectrumHistory`] so that a moving window longer than one block can
//! be averaged downstream.

use crate::analysis::AnalysisStage;
use crate::worker::{UnitPool, WorkerPool};
use cls_core::{config_error, lock_buffer, ClsError, ClsResult, SharedBuffer};
use rayon::prelude::*;
use realfft::{RealFftPlanner, RealToComplex};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunction {
    Rectangular,
    #[default]
    Hann,
    Hamming,
    Blackman,
}

impl WindowFunction {
    /// Symmetric window of `length` samples
    pub fn coefficients(&self, length: usize) -> Vec<f64> {
        if length <= 1 {
            return vec![1.0; length];
        }
        let denom = (length - 1) as f64;
        (0..length)
            .map(|i| {
                let x = 2.0 * PI * i as f64 / denom;
                match self {
                    WindowFunction::Rectangular => 1.0,
                    WindowFunction::Hann => 0.5 - 0.5 * x.cos(),
                    WindowFunction::Hamming => 0.54 - 0.46 * x.cos(),
                    WindowFunction::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StftConfig {
    /// Samples per analysis window
    pub window_length: usize,
    /// DFT length, at least `window_length` (zero padded)
    pub dft_size: usize,
    /// Hop between windows in samples
    pub step: usize,
    #[serde(default)]
    pub window: WindowFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuperletMode {
    /// Cycles of order `o` = base × o
    #[default]
    Multiplicative,
    /// Cycles of order `o` = base + o - 1
    Additive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuperletConfig {
    /// Cycles of the order-1 wavelet
    pub base_cycles: f64,
    pub order_min: usize,
    pub order_max: usize,
    #[serde(default)]
    pub mode: SuperletMode,
    /// Order grows linearly with frequency from `order_min` to `order_max`
    #[serde(default)]
    pub adaptive: bool,
    /// Spacing of the analysed frequencies in Hz
    pub frequency_step: f64,
    /// Samples per output time window
    pub time_step: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SpectralMethod {
    Stft(StftConfig),
    Superlet(SuperletConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpectralConfig {
    #[serde(flatten)]
    pub method: SpectralMethod,
    /// Lower edge of the reported band (Hz)
    pub freq_min: f64,
    /// Upper edge of the reported band (Hz)
    pub freq_max: f64,
    /// Number of recent blocks kept for moving-window averaging
    #[serde(default = "default_history_blocks")]
    pub history_blocks: usize,
}

fn default_history_blocks() -> usize {
    4
}

impl SpectralConfig {
    pub fn validate(&self, input_length: usize, sampling_rate: f64) -> ClsResult<()> {
        let nyquist = sampling_rate / 2.0;
        if !(self.freq_min >= 0.0 && self.freq_min < self.freq_max && self.freq_max <= nyquist) {
            return Err(config_error!(
                "band {}-{} Hz must satisfy 0 <= min < max <= {} Hz",
                self.freq_min, self.freq_max, nyquist
            ));
        }
        if self.history_blocks == 0 {
            return Err(config_error!("history_blocks must be at least 1"));
        }

        match &self.method {
            SpectralMethod::Stft(stft) => {
                if stft.window_length == 0 || stft.step == 0 {
                    return Err(config_error!("STFT window_length and step must be positive"));
                }
                if stft.dft_size < stft.window_length {
                    return Err(config_error!(
                        "DFT size {} is shorter than the window {}", stft.dft_size, stft.window_length
                    ));
                }
                if input_length < stft.window_length {
                    return Err(config_error!(
                        "input of {} samples is shorter than the window {}", input_length, stft.window_length
                    ));
                }
            }
            SpectralMethod::Superlet(slt) => {
                if slt.order_min == 0 || slt.order_min > slt.order_max {
                    return Err(config_error!(
                        "superlet orders must satisfy 1 <= min <= max, got {}..{}", slt.order_min, slt.order_max
                    ));
                }
                if !(slt.base_cycles > 0.0) || !(slt.frequency_step > 0.0) {
                    return Err(config_error!("superlet base_cycles and frequency_step must be positive"));
                }
                if self.freq_min <= 0.0 {
                    return Err(config_error!("superlet band must start above 0 Hz"));
                }
                if slt.time_step == 0 || slt.time_step > input_length {
                    return Err(config_error!(
                        "superlet time_step must lie in 1..={}, got {}", input_length, slt.time_step
                    ));
                }
            }
        }
        Ok(())
    }

    /// Frequencies of the reported bins
    pub fn frequencies(&self, sampling_rate: f64) -> Vec<f64> {
        match &self.method {
            SpectralMethod::Stft(stft) => {
                let (first, last) = stft_bins(stft.dft_size, sampling_rate, self.freq_min, self.freq_max);
                (first..=last).map(|k| k as f64 * sampling_rate / stft.dft_size as f64).collect()
            }
            SpectralMethod::Superlet(slt) => {
                let count = ((self.freq_max - self.freq_min) / slt.frequency_step + 1e-9).floor() as usize + 1;
                (0..count).map(|i| self.freq_min + i as f64 * slt.frequency_step).collect()
            }
        }
    }

    /// Time windows produced per block of `input_length` samples
    pub fn windows_per_block(&self, input_length: usize) -> usize {
        match &self.method {
            SpectralMethod::Stft(stft) => (input_length - stft.window_length) / stft.step + 1,
            SpectralMethod::Superlet(slt) => input_length / slt.time_step,
        }
    }
}

impl SuperletConfig {
    /// Wavelet orders used at `freq` inside `[freq_min, freq_max]`
    fn orders(&self, freq: f64, freq_min: f64, freq_max: f64) -> std::ops::RangeInclusive<usize> {
        if !self.adaptive {
            return self.order_min..=self.order_max;
        }
        let span = (self.order_max - self.order_min) as f64;
        let position = ((freq - freq_min) / (freq_max - freq_min)).clamp(0.0, 1.0);
        self.order_min..=self.order_min + (span * position).round() as usize
    }

    fn cycles(&self, order: usize) -> f64 {
        match self.mode {
            SuperletMode::Multiplicative => self.base_cycles * order as f64,
            SuperletMode::Additive => self.base_cycles + order as f64 - 1.0,
        }
    }
}

/// First and last DFT bin inside the band, clamped to the one-sided spectrum
fn stft_bins(dft_size: usize, sampling_rate: f64, freq_min: f64, freq_max: f64) -> (usize, usize) {
    let resolution = sampling_rate / dft_size as f64;
    let first = (freq_min / resolution - 1e-9).ceil().max(0.0) as usize;
    let last = ((freq_max / resolution + 1e-9).floor() as usize).min(dft_size / 2);
    (first, last.max(first))
}

/// Spectra of one block: `[channel][window][bin]`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumBlock {
    pub channels: Vec<Vec<Vec<f64>>>,
}

/// Ring of the most recent spectrum blocks
#[derive(Debug, Clone)]
pub struct SpectrumHistory {
    frequencies: Vec<f64>,
    labels: Vec<String>,
    capacity: usize,
    blocks: VecDeque<SpectrumBlock>,
    blocks_written: u64,
}

pub type SharedSpectrum = Arc<RwLock<SpectrumHistory>>;

impl SpectrumHistory {
    pub fn new(frequencies: Vec<f64>, labels: Vec<String>, capacity: usize) -> Self {
        Self {
            frequencies,
            labels,
            capacity: capacity.max(1),
            blocks: VecDeque::with_capacity(capacity.max(1)),
            blocks_written: 0,
        }
    }

    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn channel_count(&self) -> usize {
        self.labels.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn push(&mut self, block: SpectrumBlock) {
        if self.blocks.len() == self.capacity {
            self.blocks.pop_front();
        }
        self.blocks.push_back(block);
        self.blocks_written += 1;
    }

    pub fn latest(&self) -> Option<&SpectrumBlock> {
        self.blocks.back()
    }

    /// Up to `periods` most recent time windows of `channel`, newest first
    pub fn recent_windows(&self, channel: usize, periods: usize) -> impl Iterator<Item = &[f64]> + '_ {
        self.blocks
            .iter()
            .rev()
            .filter_map(move |block| block.channels.get(channel))
            .flat_map(|windows| windows.iter().rev())
            .map(|w| w.as_slice())
            .take(periods)
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.blocks_written = 0;
    }
}

struct StftUnit {
    step: usize,
    window: Vec<f64>,
    energy: f64,
    fft: Arc<dyn RealToComplex<f64>>,
    frame: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
    bins: (usize, usize),
}

impl StftUnit {
    fn new(config: &StftConfig, bins: (usize, usize)) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(config.dft_size);
        let window = config.window.coefficients(config.window_length);
        let energy = window.iter().map(|w| w * w).sum::<f64>().max(f64::EPSILON);

        Self {
            step: config.step,
            energy,
            frame: fft.make_input_vec(),
            spectrum: fft.make_output_vec(),
            scratch: fft.make_scratch_vec(),
            window,
            fft,
            bins,
        }
    }

    fn analyze(&mut self, signal: &[f64]) -> ClsResult<Vec<Vec<f64>>> {
        let length = self.window.len();
        let windows = (signal.len() - length) / self.step + 1;
        let mut out = Vec::with_capacity(windows);

        for w in 0..windows {
            let segment = &signal[w * self.step..w * self.step + length];
            self.frame.fill(0.0);
            for ((dst, &x), &coef) in self.frame.iter_mut().zip(segment).zip(&self.window) {
                *dst = x * coef;
            }
            self.fft
                .process_with_scratch(&mut self.frame, &mut self.spectrum, &mut self.scratch)
                .map_err(|e| ClsError::InvalidConfig { reason: format!("FFT failed: {}", e) })?;

            out.push(
                self.spectrum[self.bins.0..=self.bins.1]
                    .iter()
                    .map(|c| c.norm_sqr() / self.energy)
                    .collect(),
            );
        }
        Ok(out)
    }
}

/// Precomputed wavelet spectrum and its centre offset
struct Wavelet {
    spectrum: Vec<Complex<f64>>,
    center: usize,
}

struct SuperletUnit {
    time_step: usize,
    fft: Arc<dyn Fft<f64>>,
    ifft: Arc<dyn Fft<f64>>,
    /// Per frequency, one wavelet per order
    rows: Vec<Vec<Wavelet>>,
    signal: Vec<Complex<f64>>,
    product: Vec<Complex<f64>>,
}

impl SuperletUnit {
    fn new(config: &SuperletConfig, frequencies: &[f64], band: (f64, f64), input_length: usize, sampling_rate: f64) -> Self {
        // taps further than one block away never overlap the block
        let max_half = input_length.saturating_sub(1);
        let nfft = (input_length + 2 * max_half).next_power_of_two();
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(nfft);
        let ifft = planner.plan_fft_inverse(nfft);

        let rows = frequencies
            .iter()
            .map(|&freq| {
                config
                    .orders(freq, band.0, band.1)
                    .map(|order| {
                        let (taps, center) = morlet(freq, config.cycles(order), sampling_rate, max_half);
                        let mut spectrum = vec![Complex::new(0.0, 0.0); nfft];
                        spectrum[..taps.len()].copy_from_slice(&taps);
                        fft.process(&mut spectrum);
                        Wavelet { spectrum, center }
                    })
                    .collect()
            })
            .collect();

        Self {
            time_step: config.time_step,
            fft,
            ifft,
            rows,
            signal: vec![Complex::new(0.0, 0.0); nfft],
            product: vec![Complex::new(0.0, 0.0); nfft],
        }
    }

    fn analyze(&mut self, signal: &[f64]) -> ClsResult<Vec<Vec<f64>>> {
        let nfft = self.signal.len();
        for (dst, &x) in self.signal.iter_mut().zip(signal.iter().chain(std::iter::repeat(&0.0))) {
            *dst = Complex::new(x, 0.0);
        }
        self.fft.process(&mut self.signal);

        let windows = signal.len() / self.time_step;
        let centers: Vec<usize> = (0..windows).map(|w| w * self.time_step + self.time_step / 2).collect();
        let mut out = vec![vec![0.0; self.rows.len()]; windows];

        for (bin, wavelets) in self.rows.iter().enumerate() {
            let mut log_sum = vec![0.0; windows];
            for wavelet in wavelets {
                for ((p, s), w) in self.product.iter_mut().zip(&self.signal).zip(&wavelet.spectrum) {
                    *p = s * w;
                }
                self.ifft.process(&mut self.product);
                for (acc, &t) in log_sum.iter_mut().zip(&centers) {
                    let response = self.product[t + wavelet.center] / nfft as f64;
                    let power = 4.0 * response.norm_sqr();
                    *acc += power.max(f64::MIN_POSITIVE).ln();
                }
            }
            let n = wavelets.len() as f64;
            for (window, acc) in out.iter_mut().zip(log_sum) {
                window[bin] = (acc / n).exp();
            }
        }
        Ok(out)
    }
}

/// Complex Morlet taps with unit-sum envelope, truncated to `max_half` each side
fn morlet(freq: f64, cycles: f64, sampling_rate: f64, max_half: usize) -> (Vec<Complex<f64>>, usize) {
    let sigma = cycles / (2.0 * PI * freq);
    let half = ((3.0 * sigma * sampling_rate).ceil() as usize).min(max_half);
    let envelope: Vec<f64> = (0..=2 * half)
        .map(|j| {
            let t = (j as f64 - half as f64) / sampling_rate;
            (-t * t / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let norm: f64 = envelope.iter().sum();

    let taps = envelope
        .iter()
        .enumerate()
        .map(|(j, &e)| {
            let t = (j as f64 - half as f64) / sampling_rate;
            Complex::from_polar(e / norm, 2.0 * PI * freq * t)
        })
        .collect();
    (taps, half)
}

enum AnalyzerUnit {
    Stft(StftUnit),
    Superlet(SuperletUnit),
}

impl AnalyzerUnit {
    fn analyze(&mut self, signal: &[f64]) -> ClsResult<Vec<Vec<f64>>> {
        match self {
            AnalyzerUnit::Stft(unit) => unit.analyze(signal),
            AnalyzerUnit::Superlet(unit) => unit.analyze(signal),
        }
    }
}

/// Per-channel time-resolved spectrum of a shared buffer
pub struct SpectralAnalyzer {
    name: String,
    config: SpectralConfig,
    input: SharedBuffer,
    input_length: usize,
    units: UnitPool<AnalyzerUnit>,
    history: SharedSpectrum,
    pool: WorkerPool,
}

impl SpectralAnalyzer {
    pub fn new(name: &str, config: SpectralConfig, input: SharedBuffer, pool: WorkerPool) -> ClsResult<Self> {
        let (input_length, sampling_rate, labels) = {
            let buffer = lock_buffer(&input);
            (buffer.samples_per_channel(), buffer.sampling_rate(), buffer.labels().to_vec())
        };
        config.validate(input_length, sampling_rate)?;

        let frequencies = config.frequencies(sampling_rate);
        let units = (0..pool.threads())
            .map(|_| match &config.method {
                SpectralMethod::Stft(stft) => AnalyzerUnit::Stft(StftUnit::new(
                    stft,
                    stft_bins(stft.dft_size, sampling_rate, config.freq_min, config.freq_max),
                )),
                SpectralMethod::Superlet(slt) => AnalyzerUnit::Superlet(SuperletUnit::new(
                    slt,
                    &frequencies,
                    (config.freq_min, config.freq_max),
                    input_length,
                    sampling_rate,
                )),
            })
            .collect();

        tracing::debug!(
            analyzer = name,
            bins = frequencies.len(),
            windows = config.windows_per_block(input_length),
            input_length,
            "spectral analyzer created"
        );

        let history = SpectrumHistory::new(frequencies, labels, config.history_blocks);
        Ok(Self {
            name: name.to_string(),
            input_length,
            units: UnitPool::new(units)?,
            history: Arc::new(RwLock::new(history)),
            config,
            input,
            pool,
        })
    }

    /// Shared handle to the spectrum history
    pub fn history(&self) -> SharedSpectrum {
        self.history.clone()
    }

    pub fn config(&self) -> &SpectralConfig {
        &self.config
    }

    pub fn input_length(&self) -> usize {
        self.input_length
    }
}

impl AnalysisStage for SpectralAnalyzer {
    fn run(&mut self) -> ClsResult<()> {
        let input = lock_buffer(&self.input);
        if input.samples_per_channel() != self.input_length {
            return Err(ClsError::InputSizeMismatch {
                expected: self.input_length,
                actual: input.samples_per_channel(),
            });
        }

        let units = &self.units;
        let channels = self.pool.install(|| {
            input
                .as_slice()
                .par_chunks(input.samples_per_channel())
                .map(|row| units.acquire().analyze(row))
                .collect::<ClsResult<Vec<_>>>()
        })?;
        drop(input);

        self.history
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(SpectrumBlock { channels });
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        self.history.write().unwrap_or_else(|p| p.into_inner()).clear();
    }
}
