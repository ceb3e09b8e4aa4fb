//! Spectral peak detection gated on prominence and aspect ratio

use crate::spectrum::PowerSpectrum;
use cls_core::ClsResult;
use serde::{Deserialize, Serialize};

/// Which surviving candidate wins
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeakSelection {
    #[default]
    HighestPower,
    HighestProminence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeakConfig {
    /// Minimum prominence relative to the peak's height above the spectrum floor
    pub prominence_ratio: f64,
    /// Minimum normalized prominence-to-width ratio
    pub min_aspect_ratio: f64,
    /// Widest peak considered, in Hz
    pub max_width: f64,
    #[serde(default)]
    pub selection: PeakSelection,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            prominence_ratio: 1.0,
            min_aspect_ratio: 1.0,
            max_width: 10.0,
            selection: PeakSelection::HighestPower,
        }
    }
}

impl PeakConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if !(self.prominence_ratio >= 0.0) {
            return Err(cls_core::config_error!("prominence ratio must be non-negative"));
        }
        if !(self.min_aspect_ratio >= 0.0) {
            return Err(cls_core::config_error!("minimum aspect ratio must be non-negative"));
        }
        if !(self.max_width > 0.0) {
            return Err(cls_core::config_error!("maximum peak width must be positive, got {}", self.max_width));
        }
        Ok(())
    }
}

/// A qualifying spectral peak
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    pub index: usize,
    pub frequency: f64,
    pub power: f64,
    pub prominence: f64,
    /// Width in Hz between the flanking minima, after clamping
    pub width: f64,
    pub aspect_ratio: f64,
}

fn local_extrema(power: &[f64]) -> (Vec<usize>, Vec<usize>) {
    let mut minima = Vec::new();
    let mut maxima = Vec::new();
    for i in 1..power.len().saturating_sub(1) {
        let (prev, here, next) = (power[i - 1], power[i], power[i + 1]);
        if here > prev && here >= next {
            maxima.push(i);
        } else if here < prev && here <= next {
            minima.push(i);
        }
    }
    (minima, maxima)
}

/// Find the best qualifying peak, or `None` when no candidate passes
pub fn find_peak(spectrum: &PowerSpectrum, config: &PeakConfig) -> Option<Peak> {
    let power = &spectrum.power;
    let freqs = &spectrum.frequencies;
    let n = power.len();
    if n < 3 || freqs.len() != n {
        return None;
    }

    let (floor, ceiling) = spectrum.power_range();
    let power_range = ceiling - floor;
    let (f_first, f_last) = spectrum.frequency_range();
    let freq_range = f_last - f_first;
    if !(power_range > 0.0) || !(freq_range > 0.0) {
        return None;
    }

    let (minima, maxima) = local_extrema(power);
    let half_width = config.max_width / 2.0;

    let candidates = maxima.into_iter().filter_map(|i| {
        // spectrum ends stand in for missing minima
        let left = minima.iter().rev().copied().find(|&m| m < i).unwrap_or(0);
        let right = minima.iter().copied().find(|&m| m > i).unwrap_or(n - 1);

        let peak = power[i];
        let prominence = (peak - power[left].max(power[right])).abs();
        let basis = (peak - prominence - floor).abs();
        if basis > 0.0 && prominence / basis < config.prominence_ratio {
            return None;
        }

        let lower = freqs[left].max(freqs[i] - half_width);
        let upper = freqs[right].min(freqs[i] + half_width);
        let width = upper - lower;
        if !(width > 0.0) {
            return None;
        }
        let aspect_ratio = (prominence / power_range) / (width / freq_range);
        if aspect_ratio < config.min_aspect_ratio {
            return None;
        }

        Some(Peak {
            index: i,
            frequency: freqs[i],
            power: peak,
            prominence,
            width,
            aspect_ratio,
        })
    });

    match config.selection {
        PeakSelection::HighestPower => candidates.max_by(|a, b| a.power.total_cmp(&b.power)),
        PeakSelection::HighestProminence => candidates.max_by(|a, b| a.prominence.total_cmp(&b.prominence)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Decaying background plus a Gaussian bump at 40 Hz
    fn bump_spectrum(amplitude: f64) -> PowerSpectrum {
        let freqs: Vec<f64> = (1..=100).map(|f| f as f64).collect();
        PowerSpectrum::from_fn(freqs, |f| {
            5.0 * (-f / 10.0).exp() + amplitude * (-(f - 40.0).powi(2) / 8.0).exp()
        })
    }

    fn config() -> PeakConfig {
        PeakConfig {
            prominence_ratio: 2.0,
            min_aspect_ratio: 1.0,
            max_width: 10.0,
            selection: PeakSelection::HighestPower,
        }
    }

    #[test]
    fn test_gaussian_bump_found() {
        let peak = find_peak(&bump_spectrum(2.0), &config()).unwrap();
        assert_eq!(peak.frequency, 40.0);
        assert!(peak.width <= 10.0);
        assert!(peak.prominence > 1.5);
    }

    #[test]
    fn test_prominence_below_threshold() {
        let strict = PeakConfig { prominence_ratio: 1e6, ..config() };
        assert!(find_peak(&bump_spectrum(2.0), &strict).is_none());
        assert!(find_peak(&bump_spectrum(0.05), &config()).is_none());
    }

    #[test]
    fn test_aspect_ratio_gate() {
        let strict = PeakConfig { min_aspect_ratio: 50.0, ..config() };
        assert!(find_peak(&bump_spectrum(2.0), &strict).is_none());
    }

    #[test]
    fn test_monotonic_spectrum_has_no_peak() {
        let freqs: Vec<f64> = (1..=50).map(|f| f as f64).collect();
        let spectrum = PowerSpectrum::from_fn(freqs, |f| 1.0 / f);
        assert!(find_peak(&spectrum, &config()).is_none());
    }

    #[test]
    fn test_selection_variants() {
        // loud peak at 20 Hz riding the background, quieter but more prominent one at 70 Hz
        let freqs: Vec<f64> = (1..=100).map(|f| f as f64).collect();
        let spectrum = PowerSpectrum::from_fn(freqs, |f| {
            6.0 * (-f / 15.0).exp()
                + 1.5 * (-(f - 20.0).powi(2) / 2.0).exp()
                + 1.5 * (-(f - 70.0).powi(2) / 8.0).exp()
        });
        let loose = PeakConfig { prominence_ratio: 0.1, min_aspect_ratio: 0.1, ..config() };

        let by_power = find_peak(&spectrum, &loose).unwrap();
        assert_eq!(by_power.frequency, 20.0);

        let by_prominence =
            find_peak(&spectrum, &PeakConfig { selection: PeakSelection::HighestProminence, ..loose }).unwrap();
        assert_eq!(by_prominence.frequency, 70.0);
    }

    #[test]
    fn test_invalid_config() {
        assert!(PeakConfig { max_width: 0.0, ..config() }.validate().is_err());
        assert!(config().validate().is_ok());
    }
}
