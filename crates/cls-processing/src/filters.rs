//! Butterworth filter bank with one stateful filter per channel

use crate::processor::{Pipe, PipeType};
use crate::worker::WorkerPool;
use cls_core::{config_error, lock_buffer, same_buffer, ClsError, ClsResult, SharedBuffer};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Filter types supported by the filter bank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Lowpass,
    Highpass,
    Bandpass,
    Bandstop,
}

/// Filter configuration parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub filter_type: FilterType,
    /// Butterworth order
    pub order: usize,
    /// Cutoff frequency for lowpass/highpass (Hz)
    #[serde(default)]
    pub cutoff_freq: Option<f64>,
    /// Low edge for bandpass/bandstop (Hz)
    #[serde(default)]
    pub low_cutoff: Option<f64>,
    /// High edge for bandpass/bandstop (Hz)
    #[serde(default)]
    pub high_cutoff: Option<f64>,
}

impl FilterConfig {
    pub fn lowpass(cutoff_freq: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Lowpass,
            order,
            cutoff_freq: Some(cutoff_freq),
            low_cutoff: None,
            high_cutoff: None,
        }
    }

    pub fn highpass(cutoff_freq: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Highpass,
            order,
            cutoff_freq: Some(cutoff_freq),
            low_cutoff: None,
            high_cutoff: None,
        }
    }

    pub fn bandpass(low_cutoff: f64, high_cutoff: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Bandpass,
            order,
            cutoff_freq: None,
            low_cutoff: Some(low_cutoff),
            high_cutoff: Some(high_cutoff),
        }
    }

    pub fn bandstop(low_cutoff: f64, high_cutoff: f64, order: usize) -> Self {
        Self {
            filter_type: FilterType::Bandstop,
            order,
            cutoff_freq: None,
            low_cutoff: Some(low_cutoff),
            high_cutoff: Some(high_cutoff),
        }
    }

    /// Check parameters against a sampling rate
    pub fn validate(&self, sampling_rate: f64) -> ClsResult<()> {
        if self.order == 0 {
            return Err(config_error!("filter order must be at least 1"));
        }
        let nyquist = sampling_rate / 2.0;
        let in_range = |f: f64| f > 0.0 && f < nyquist;

        match self.filter_type {
            FilterType::Lowpass | FilterType::Highpass => {
                let cutoff = self
                    .cutoff_freq
                    .ok_or_else(|| config_error!("{:?} filter requires cutoff_freq", self.filter_type))?;
                if !in_range(cutoff) {
                    return Err(config_error!(
                        "cutoff {} Hz must lie in (0, {}) Hz", cutoff, nyquist
                    ));
                }
            }
            FilterType::Bandpass | FilterType::Bandstop => {
                let (low, high) = match (self.low_cutoff, self.high_cutoff) {
                    (Some(low), Some(high)) => (low, high),
                    _ => {
                        return Err(config_error!(
                            "{:?} filter requires low_cutoff and high_cutoff", self.filter_type
                        ))
                    }
                };
                if low >= high {
                    return Err(config_error!(
                        "low cutoff {} Hz must be below high cutoff {} Hz", low, high
                    ));
                }
                if !in_range(low) || !in_range(high) {
                    return Err(config_error!(
                        "band {}-{} Hz must lie in (0, {}) Hz", low, high, nyquist
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Single second-order section, transposed direct form II
///
/// A first-order section is a biquad with `b2 = a2 = 0`.
#[derive(Debug, Clone)]
struct Biquad {
    b0: f64, b1: f64, b2: f64,
    a1: f64, a2: f64,
    z1: f64, z2: f64,
}

impl Biquad {
    fn normalized(b: [f64; 3], a: [f64; 3]) -> Self {
        Self {
            b0: b[0] / a[0],
            b1: b[1] / a[0],
            b2: b[2] / a[0],
            a1: a[1] / a[0],
            a2: a[2] / a[0],
            z1: 0.0,
            z2: 0.0,
        }
    }

    fn lowpass(cutoff: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalized(
            [(1.0 - cos) / 2.0, 1.0 - cos, (1.0 - cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn highpass(cutoff: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * cutoff / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalized(
            [(1.0 + cos) / 2.0, -(1.0 + cos), (1.0 + cos) / 2.0],
            [1.0 + alpha, -2.0 * cos, 1.0 - alpha],
        )
    }

    fn notch(center: f64, fs: f64, q: f64) -> Self {
        let w0 = 2.0 * PI * center / fs;
        let (sin, cos) = w0.sin_cos();
        let alpha = sin / (2.0 * q);
        Self::normalized([1.0, -2.0 * cos, 1.0], [1.0 + alpha, -2.0 * cos, 1.0 - alpha])
    }

    fn first_order(cutoff: f64, fs: f64, highpass: bool) -> Self {
        let k = (PI * cutoff / fs).tan();
        let a = [1.0 + k, k - 1.0, 0.0];
        if highpass {
            Self::normalized([1.0, -1.0, 0.0], a)
        } else {
            Self::normalized([k, k, 0.0], a)
        }
    }

    #[inline]
    fn process(&mut self, x: f64) -> f64 {
        let y = self.b0 * x + self.z1;
        self.z1 = self.b1 * x - self.a1 * y + self.z2;
        self.z2 = self.b2 * x - self.a2 * y;
        y
    }

    fn reset(&mut self) {
        self.z1 = 0.0;
        self.z2 = 0.0;
    }
}

/// Q factors of the second-order sections of an order-`n` Butterworth filter
fn butterworth_q(order: usize) -> Vec<f64> {
    (0..order / 2)
        .map(|k| 1.0 / (2.0 * (PI * (2 * k + 1) as f64 / (2 * order) as f64).sin()))
        .collect()
}

fn butterworth_sections(cutoff: f64, fs: f64, order: usize, highpass: bool) -> Vec<Biquad> {
    let mut sections: Vec<Biquad> = butterworth_q(order)
        .into_iter()
        .map(|q| {
            if highpass {
                Biquad::highpass(cutoff, fs, q)
            } else {
                Biquad::lowpass(cutoff, fs, q)
            }
        })
        .collect();
    if order % 2 == 1 {
        sections.push(Biquad::first_order(cutoff, fs, highpass));
    }
    sections
}

fn design_sections(config: &FilterConfig, fs: f64) -> ClsResult<Vec<Biquad>> {
    config.validate(fs)?;
    let order = config.order;

    let sections = match config.filter_type {
        FilterType::Lowpass => butterworth_sections(config.cutoff_freq.unwrap_or_default(), fs, order, false),
        FilterType::Highpass => butterworth_sections(config.cutoff_freq.unwrap_or_default(), fs, order, true),
        FilterType::Bandpass => {
            let (low, high) = (config.low_cutoff.unwrap_or_default(), config.high_cutoff.unwrap_or_default());
            let mut sections = butterworth_sections(low, fs, order, true);
            sections.extend(butterworth_sections(high, fs, order, false));
            sections
        }
        FilterType::Bandstop => {
            let (low, high) = (config.low_cutoff.unwrap_or_default(), config.high_cutoff.unwrap_or_default());
            let center = (low * high).sqrt();
            let q = center / (high - low);
            (0..order.div_ceil(2)).map(|_| Biquad::notch(center, fs, q)).collect()
        }
    };
    Ok(sections)
}

/// Cascade of sections with its own delay lines, used for one channel
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    sections: Vec<Biquad>,
}

impl ChannelFilter {
    pub fn new(config: &FilterConfig, sampling_rate: f64) -> ClsResult<Self> {
        Ok(Self { sections: design_sections(config, sampling_rate)? })
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }

    /// Filter a slice in place, carrying state into the next call
    pub fn process(&mut self, data: &mut [f64]) {
        for sample in data.iter_mut() {
            let mut value = *sample;
            for section in &mut self.sections {
                value = section.process(value);
            }
            *sample = value;
        }
    }

    pub fn reset(&mut self) {
        for section in &mut self.sections {
            section.reset();
        }
    }
}

/// Per-channel IIR filtering of a multichannel buffer
pub struct FilterBank {
    name: String,
    config: FilterConfig,
    input: SharedBuffer,
    output: SharedBuffer,
    in_place: bool,
    filters: Vec<ChannelFilter>,
    pool: WorkerPool,
}

impl FilterBank {
    pub fn new(
        name: &str,
        config: FilterConfig,
        input: SharedBuffer,
        output: SharedBuffer,
        pool: WorkerPool,
    ) -> ClsResult<Self> {
        let in_place = same_buffer(&input, &output);

        let (shape, sampling_rate, labels) = {
            let input_buf = lock_buffer(&input);
            (input_buf.shape(), input_buf.sampling_rate(), input_buf.labels().to_vec())
        };

        if !in_place {
            let mut output_buf = lock_buffer(&output);
            if output_buf.shape() != shape || output_buf.sampling_rate() != sampling_rate {
                return Err(ClsError::ShapeMismatch {
                    context: format!("filter '{}' output", name),
                    expected: shape,
                    actual: output_buf.shape(),
                });
            }
            output_buf.set_labels(labels)?;
        }

        let prototype = ChannelFilter::new(&config, sampling_rate)?;
        let filters = vec![prototype; shape.0];

        tracing::debug!(
            filter = name,
            kind = ?config.filter_type,
            order = config.order,
            channels = shape.0,
            in_place,
            "filter bank created"
        );

        Ok(Self {
            name: name.to_string(),
            config,
            input,
            output,
            in_place,
            filters,
            pool,
        })
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    fn filter_rows(pool: &WorkerPool, filters: &mut [ChannelFilter], data: &mut [f64], samples: usize) {
        pool.install(|| {
            data.par_chunks_mut(samples)
                .zip(filters.par_iter_mut())
                .for_each(|(row, filter)| filter.process(row));
        });
    }

    fn check_channels(&self, shape: (usize, usize)) -> ClsResult<()> {
        if shape.0 != self.filters.len() {
            return Err(ClsError::ShapeMismatch {
                context: format!("filter '{}' input", self.name),
                expected: (self.filters.len(), shape.1),
                actual: shape,
            });
        }
        Ok(())
    }
}

impl Pipe for FilterBank {
    fn run(&mut self) -> ClsResult<()> {
        if self.in_place {
            let mut buffer = lock_buffer(&self.input);
            self.check_channels(buffer.shape())?;
            let samples = buffer.samples_per_channel();
            Self::filter_rows(&self.pool, &mut self.filters, buffer.as_mut_slice(), samples);
        } else {
            let input = lock_buffer(&self.input);
            let mut output = lock_buffer(&self.output);
            self.check_channels(input.shape())?;
            output.copy_from(&input)?;
            drop(input);
            let samples = output.samples_per_channel();
            Self::filter_rows(&self.pool, &mut self.filters, output.as_mut_slice(), samples);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {
        for filter in &mut self.filters {
            filter.reset();
        }
    }

    fn input(&self) -> &SharedBuffer {
        &self.input
    }

    fn output(&self) -> &SharedBuffer {
        &self.output
    }

    fn latency_estimate(&self) -> u64 {
        let (channels, samples) = lock_buffer(&self.input).shape();
        let sections = self.filters.first().map(|f| f.section_count()).unwrap_or(0);
        // ~10ns per section and sample, spread over the pool
        let work = (sections * samples * channels) as u64 / 100;
        50 + work / self.pool.threads() as u64
    }

    fn pipe_type(&self) -> PipeType {
        PipeType::Filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cls_core::MultichannelBuffer;

    fn sine(freq: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).sin()).collect()
    }

    fn steady_amplitude(config: &FilterConfig, freq: f64) -> f64 {
        let fs = 1000.0;
        let mut filter = ChannelFilter::new(config, fs).unwrap();
        let mut data = sine(freq, fs, 4000);
        filter.process(&mut data);
        data[3000..].iter().fold(0.0f64, |m, v| m.max(v.abs()))
    }

    #[test]
    fn test_butterworth_q_values() {
        let q = butterworth_q(4);
        assert!((q[0] - 1.3066).abs() < 1e-3);
        assert!((q[1] - 0.5412).abs() < 1e-3);
        assert!((butterworth_q(2)[0] - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn test_lowpass_response() {
        let config = FilterConfig::lowpass(50.0, 4);
        assert!((steady_amplitude(&config, 5.0) - 1.0).abs() < 0.02);
        assert!(steady_amplitude(&config, 200.0) < 0.01);
        // -3 dB at the cutoff
        assert!((steady_amplitude(&config, 50.0) - std::f64::consts::FRAC_1_SQRT_2).abs() < 0.02);
    }

    #[test]
    fn test_odd_order_highpass() {
        let config = FilterConfig::highpass(20.0, 3);
        assert_eq!(ChannelFilter::new(&config, 1000.0).unwrap().section_count(), 2);
        assert!(steady_amplitude(&config, 2.0) < 0.01);
        assert!((steady_amplitude(&config, 200.0) - 1.0).abs() < 0.02);
    }

    #[test]
    fn test_bandpass_and_bandstop() {
        let bandpass = FilterConfig::bandpass(30.0, 80.0, 4);
        assert!(steady_amplitude(&bandpass, 45.0) > 0.9);
        assert!(steady_amplitude(&bandpass, 5.0) < 0.01);

        let bandstop = FilterConfig::bandstop(45.0, 55.0, 2);
        assert!(steady_amplitude(&bandstop, 50.0) < 0.05);
        assert!(steady_amplitude(&bandstop, 150.0) > 0.95);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(FilterConfig::lowpass(600.0, 2).validate(1000.0).is_err());
        assert!(FilterConfig::lowpass(0.0, 2).validate(1000.0).is_err());
        assert!(FilterConfig::bandpass(80.0, 30.0, 2).validate(1000.0).is_err());
        assert!(FilterConfig::highpass(10.0, 0).validate(1000.0).is_err());
        let mut missing = FilterConfig::bandpass(1.0, 2.0, 2);
        missing.high_cutoff = None;
        assert!(missing.validate(1000.0).is_err());
    }

    #[test]
    fn test_reset_then_zero_block_is_silent() {
        let pool = WorkerPool::new(2).unwrap();
        let input = MultichannelBuffer::zeros("raw", 3, 200, 1000.0).unwrap().into_shared();
        let output = MultichannelBuffer::zeros("lfp", 3, 200, 1000.0).unwrap().into_shared();
        let mut bank = FilterBank::new("bp", FilterConfig::bandpass(30.0, 80.0, 4), input.clone(), output.clone(), pool).unwrap();

        lock_buffer(&input).fill(1.0);
        bank.run().unwrap();
        assert!(lock_buffer(&output).as_slice().iter().any(|&v| v != 0.0));

        bank.reset();
        lock_buffer(&input).fill(0.0);
        bank.run().unwrap();
        assert!(lock_buffer(&output).as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_channels_are_independent() {
        let pool = WorkerPool::new(4).unwrap();
        let rows = vec![vec![0.0; 256], sine(40.0, 1000.0, 256)];
        let input = MultichannelBuffer::from_rows("raw", rows, 1000.0).unwrap().into_shared();
        let mut bank = FilterBank::new("lp", FilterConfig::lowpass(100.0, 2), input.clone(), input.clone(), pool).unwrap();

        bank.run().unwrap();
        let buffer = lock_buffer(&input);
        assert!(buffer.row(0).iter().all(|&v| v == 0.0));
        assert!(buffer.row(1).iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let pool = WorkerPool::new(1).unwrap();
        let input = MultichannelBuffer::zeros("raw", 2, 100, 1000.0).unwrap().into_shared();
        let output = MultichannelBuffer::zeros("lfp", 3, 100, 1000.0).unwrap().into_shared();
        let result = FilterBank::new("lp", FilterConfig::lowpass(100.0, 2), input, output, pool);
        assert!(matches!(result, Err(ClsError::ShapeMismatch { .. })));
    }
}
