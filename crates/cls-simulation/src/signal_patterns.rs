//! Amplitude envelopes for simulated oscillations

use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Gain applied to an oscillation over time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pattern", rename_all = "snake_case")]
pub enum AmplitudePattern {
    Constant { level: f64 },
    /// Slow sinusoidal modulation around a baseline
    Sinusoidal {
        frequency: f64,
        amplitude: f64,
        baseline: f64,
    },
    Ramp {
        start_level: f64,
        end_level: f64,
        duration: f64,
    },
    /// Oscillation bursts separated by silence
    Burst {
        on_duration: f64,
        off_duration: f64,
        amplitude: f64,
    },
}

impl Default for AmplitudePattern {
    fn default() -> Self {
        AmplitudePattern::Constant { level: 1.0 }
    }
}

impl AmplitudePattern {
    /// Gain at `time` seconds, never negative
    pub fn gain_at(&self, time: f64) -> f64 {
        let gain = match self {
            AmplitudePattern::Constant { level } => *level,

            AmplitudePattern::Sinusoidal { frequency, amplitude, baseline } => {
                baseline + amplitude * (2.0 * PI * frequency * time).sin()
            }

            AmplitudePattern::Ramp { start_level, end_level, duration } => {
                if time >= *duration {
                    *end_level
                } else {
                    start_level + (end_level - start_level) * (time / duration)
                }
            }

            AmplitudePattern::Burst { on_duration, off_duration, amplitude } => {
                let cycle = on_duration + off_duration;
                if cycle <= 0.0 || time % cycle < *on_duration {
                    *amplitude
                } else {
                    0.0
                }
            }
        };
        gain.max(0.0)
    }

    pub fn description(&self) -> &'static str {
        match self {
            AmplitudePattern::Constant { .. } => "Constant amplitude",
            AmplitudePattern::Sinusoidal { .. } => "Slow amplitude modulation",
            AmplitudePattern::Ramp { .. } => "Amplitude ramp",
            AmplitudePattern::Burst { .. } => "Oscillation bursts",
        }
    }

    pub fn presets() -> Vec<(&'static str, AmplitudePattern)> {
        vec![
            ("Steady", AmplitudePattern::Constant { level: 1.0 }),
            ("Waxing and waning", AmplitudePattern::Sinusoidal {
                frequency: 0.2, amplitude: 0.5, baseline: 1.0
            }),
            ("Emerging rhythm", AmplitudePattern::Ramp {
                start_level: 0.0, end_level: 1.0, duration: 20.0
            }),
            ("Spindles", AmplitudePattern::Burst {
                on_duration: 1.0, off_duration: 2.0, amplitude: 1.5
            }),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_gains() {
        assert_eq!(AmplitudePattern::Constant { level: 0.7 }.gain_at(3.0), 0.7);

        let ramp = AmplitudePattern::Ramp { start_level: 0.0, end_level: 1.0, duration: 10.0 };
        assert!((ramp.gain_at(5.0) - 0.5).abs() < 1e-12);
        assert_eq!(ramp.gain_at(20.0), 1.0);

        let burst = AmplitudePattern::Burst { on_duration: 1.0, off_duration: 1.0, amplitude: 2.0 };
        assert_eq!(burst.gain_at(0.5), 2.0);
        assert_eq!(burst.gain_at(1.5), 0.0);

        let modulated = AmplitudePattern::Sinusoidal { frequency: 1.0, amplitude: 2.0, baseline: 0.0 };
        assert_eq!(modulated.gain_at(0.75), 0.0);
    }

    #[test]
    fn test_presets_are_described() {
        for (name, pattern) in AmplitudePattern::presets() {
            assert!(!name.is_empty());
            assert!(!pattern.description().is_empty());
        }
    }
}
