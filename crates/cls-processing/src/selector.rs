//! Channel subset selection

use crate::processor::{Pipe, PipeType};
use cls_core::{lock_buffer, same_buffer, ClsError, ClsResult, MultichannelBuffer, SharedBuffer};
use serde::{Deserialize, Serialize};

/// Channel reference by label or position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelSelection {
    Index(usize),
    Label(String),
}

impl ChannelSelection {
    pub fn resolve(&self, buffer: &MultichannelBuffer) -> ClsResult<usize> {
        match self {
            ChannelSelection::Index(index) if *index < buffer.channel_count() => Ok(*index),
            ChannelSelection::Index(index) => Err(ClsError::ChannelNotFound {
                channel: format!("#{}", index),
            }),
            ChannelSelection::Label(label) => buffer.label_index(label),
        }
    }
}

/// Copies a reordered subset of input channels into the output buffer
pub struct Selector {
    name: String,
    indices: Vec<usize>,
    input: SharedBuffer,
    output: SharedBuffer,
}

impl Selector {
    pub fn new(
        name: &str,
        channels: &[ChannelSelection],
        input: SharedBuffer,
        output: SharedBuffer,
    ) -> ClsResult<Self> {
        if same_buffer(&input, &output) {
            return Err(ClsError::InvalidConfig {
                reason: format!("selector '{}' needs distinct input and output buffers", name),
            });
        }
        if channels.is_empty() {
            return Err(ClsError::InvalidConfig {
                reason: format!("selector '{}' selects no channels", name),
            });
        }

        let indices = {
            let input_buf = lock_buffer(&input);
            let mut output_buf = lock_buffer(&output);
            let indices = channels
                .iter()
                .map(|c| c.resolve(&input_buf))
                .collect::<ClsResult<Vec<_>>>()?;

            let expected = (indices.len(), input_buf.samples_per_channel());
            if output_buf.shape() != expected {
                return Err(ClsError::ShapeMismatch {
                    context: format!("selector '{}' output", name),
                    expected,
                    actual: output_buf.shape(),
                });
            }
            let labels = indices.iter().map(|&i| input_buf.labels()[i].clone()).collect();
            output_buf.set_labels(labels)?;
            indices
        };

        Ok(Self {
            name: name.to_string(),
            indices,
            input,
            output,
        })
    }

    /// Source channel index for each output row
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl Pipe for Selector {
    fn run(&mut self) -> ClsResult<()> {
        let input = lock_buffer(&self.input);
        let mut output = lock_buffer(&self.output);

        let expected = (self.indices.len(), input.samples_per_channel());
        if output.shape() != expected {
            return Err(ClsError::ShapeMismatch {
                context: format!("selector '{}' output", self.name),
                expected,
                actual: output.shape(),
            });
        }
        for (row, &source) in self.indices.iter().enumerate() {
            output.row_mut(row).copy_from_slice(input.channel_data(source)?);
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
        20
    }

    fn pipe_type(&self) -> PipeType {
        PipeType::Selector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_reorders_and_relabels() {
        let labels = vec!["Fz".to_string(), "Cz".to_string(), "Pz".to_string()];
        let mut raw = MultichannelBuffer::new("raw", 4, 250.0, labels).unwrap();
        for ch in 0..3 {
            raw.row_mut(ch).fill(ch as f64);
        }
        let input = raw.into_shared();
        let output = MultichannelBuffer::zeros("sel", 2, 4, 250.0).unwrap().into_shared();

        let channels = vec![ChannelSelection::Label("Pz".to_string()), ChannelSelection::Index(0)];
        let mut selector = Selector::new("sel", &channels, input, output.clone()).unwrap();
        selector.run().unwrap();

        let output = lock_buffer(&output);
        assert_eq!(output.labels(), &["Pz".to_string(), "Fz".to_string()]);
        assert_eq!(output.row(0), &[2.0; 4]);
        assert_eq!(output.row(1), &[0.0; 4]);
    }

    #[test]
    fn test_unknown_channel() {
        let input = MultichannelBuffer::zeros("raw", 2, 4, 250.0).unwrap().into_shared();
        let output = MultichannelBuffer::zeros("sel", 1, 4, 250.0).unwrap().into_shared();

        let by_label = Selector::new("sel", &[ChannelSelection::Label("O1".into())], input.clone(), output.clone());
        assert!(matches!(by_label, Err(ClsError::ChannelNotFound { .. })));
        assert!(Selector::new("sel", &[ChannelSelection::Index(2)], input, output).is_err());
    }

    #[test]
    fn test_resized_output_rejected_at_run() {
        let input = MultichannelBuffer::zeros("raw", 3, 4, 250.0).unwrap().into_shared();
        let output = MultichannelBuffer::zeros("sel", 2, 4, 250.0).unwrap().into_shared();
        let channels = vec![ChannelSelection::Index(2), ChannelSelection::Index(1)];
        let mut selector = Selector::new("sel", &channels, input, output.clone()).unwrap();

        *lock_buffer(&output) = MultichannelBuffer::zeros("sel", 3, 4, 250.0).unwrap();
        assert!(matches!(
            selector.run(),
            Err(ClsError::ShapeMismatch { expected: (2, 4), actual: (3, 4), .. })
        ));
    }

    #[test]
    fn test_same_buffer_rejected() {
        let buffer = MultichannelBuffer::zeros("raw", 2, 4, 250.0).unwrap().into_shared();
        let result = Selector::new("sel", &[ChannelSelection::Index(0)], buffer.clone(), buffer);
        assert!(matches!(result, Err(ClsError::InvalidConfig { .. })));
    }

    #[test]
    fn test_selection_from_json() {
        let parsed: Vec<ChannelSelection> = serde_json::from_str(r#"[1, "Cz"]"#).unwrap();
        assert_eq!(parsed, vec![ChannelSelection::Index(1), ChannelSelection::Label("Cz".into())]);
    }
}
