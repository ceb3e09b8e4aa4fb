//! Integer-factor decimation between two buffers

use crate::processor::{Pipe, PipeType};
use cls_core::{lock_buffer, same_buffer, ClsError, ClsResult, SharedBuffer};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecimationMethod {
    /// Keep every k-th sample
    #[default]
    Step,
    /// Mean of each k-sample block
    Average,
}

pub struct Decimator {
    name: String,
    order: usize,
    method: DecimationMethod,
    input: SharedBuffer,
    output: SharedBuffer,
}

impl Decimator {
    /// Output shape and rate for an input of `samples` at `sampling_rate`
    pub fn decimated_shape(samples: usize, sampling_rate: f64, order: usize) -> (usize, f64) {
        (samples / order, sampling_rate / order as f64)
    }

    pub fn new(
        name: &str,
        order: usize,
        method: DecimationMethod,
        input: SharedBuffer,
        output: SharedBuffer,
    ) -> ClsResult<Self> {
        if order == 0 {
            return Err(ClsError::InvalidConfig {
                reason: format!("decimator '{}' order must be at least 1", name),
            });
        }
        if same_buffer(&input, &output) {
            return Err(ClsError::InPlaceDecimation {
                buffer: lock_buffer(&input).name().to_string(),
            });
        }

        {
            let input_buf = lock_buffer(&input);
            let mut output_buf = lock_buffer(&output);
            let (samples, rate) = Self::decimated_shape(input_buf.samples_per_channel(), input_buf.sampling_rate(), order);
            let expected = (input_buf.channel_count(), samples);

            if output_buf.shape() != expected {
                return Err(ClsError::ShapeMismatch {
                    context: format!("decimator '{}' output", name),
                    expected,
                    actual: output_buf.shape(),
                });
            }
            if (output_buf.sampling_rate() - rate).abs() > 1e-9 * rate {
                return Err(ClsError::InvalidConfig {
                    reason: format!(
                        "decimator '{}' output rate {} Hz, expected {} Hz",
                        name, output_buf.sampling_rate(), rate
                    ),
                });
            }
            output_buf.set_labels(input_buf.labels().to_vec())?;
        }

        Ok(Self {
            name: name.to_string(),
            order,
            method,
            input,
            output,
        })
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn method(&self) -> DecimationMethod {
        self.method
    }
}

impl Pipe for Decimator {
    fn run(&mut self) -> ClsResult<()> {
        let input = lock_buffer(&self.input);
        let mut output = lock_buffer(&self.output);
        let k = self.order;

        let expected = (input.channel_count(), input.samples_per_channel() / k);
        if output.shape() != expected {
            return Err(ClsError::ShapeMismatch {
                context: format!("decimator '{}' output", self.name),
                expected,
                actual: output.shape(),
            });
        }

        for (src, dst) in input.rows().zip(output.rows_mut()) {
            match self.method {
                DecimationMethod::Step => {
                    for (j, value) in dst.iter_mut().enumerate() {
                        *value = src[j * k];
                    }
                }
                DecimationMethod::Average => {
                    for (value, chunk) in dst.iter_mut().zip(src.chunks_exact(k)) {
                        *value = chunk.iter().sum::<f64>() / k as f64;
                    }
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn reset(&mut self) {}

    fn input(&self) -> &SharedBuffer {
        &self.input
    }

    fn output(&self) -> &SharedBuffer {
        &self.output
    }

    fn latency_estimate(&self) -> u64 {
        50
    }

    fn pipe_type(&self) -> PipeType {
        PipeType::Decimator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cls_core::MultichannelBuffer;

    fn ramp_buffers(n: usize, k: usize) -> (SharedBuffer, SharedBuffer) {
        let rows = vec![(0..n).map(|i| i as f64).collect(), (0..n).map(|i| (i * i) as f64).collect()];
        let input = MultichannelBuffer::from_rows("raw", rows, 1000.0).unwrap().into_shared();
        let output = MultichannelBuffer::zeros("dec", 2, n / k, 1000.0 / k as f64).unwrap().into_shared();
        (input, output)
    }

    #[test]
    fn test_step_decimation() {
        let (input, output) = ramp_buffers(103, 4);
        let mut dec = Decimator::new("dec", 4, DecimationMethod::Step, input.clone(), output.clone()).unwrap();
        dec.run().unwrap();

        let input = lock_buffer(&input);
        let output = lock_buffer(&output);
        assert_eq!(output.samples_per_channel(), 25);
        for ch in 0..2 {
            for j in 0..25 {
                assert_eq!(output.row(ch)[j], input.row(ch)[j * 4]);
            }
        }
    }

    #[test]
    fn test_average_decimation() {
        let (input, output) = ramp_buffers(100, 5);
        let mut dec = Decimator::new("dec", 5, DecimationMethod::Average, input.clone(), output.clone()).unwrap();
        dec.run().unwrap();

        let input = lock_buffer(&input);
        let output = lock_buffer(&output);
        for ch in 0..2 {
            for j in 0..20 {
                let mean = input.row(ch)[j * 5..j * 5 + 5].iter().sum::<f64>() / 5.0;
                assert!((output.row(ch)[j] - mean).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_in_place_rejected() {
        let input = MultichannelBuffer::zeros("raw", 1, 10, 100.0).unwrap().into_shared();
        let result = Decimator::new("dec", 2, DecimationMethod::Step, input.clone(), input);
        assert!(matches!(result, Err(ClsError::InPlaceDecimation { .. })));
    }

    #[test]
    fn test_bad_order_and_shape() {
        let (input, output) = ramp_buffers(100, 4);
        assert!(Decimator::new("dec", 0, DecimationMethod::Step, input.clone(), output.clone()).is_err());
        assert!(matches!(
            Decimator::new("dec", 5, DecimationMethod::Step, input, output),
            Err(ClsError::ShapeMismatch { .. })
        ));
    }
}
