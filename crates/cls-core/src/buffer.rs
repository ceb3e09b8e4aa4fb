//! MultichannelBuffer: fixed-shape container for one block of channel data

use crate::error::{ClsError, ClsResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Buffer shared between the pipeline and its pipes
pub type SharedBuffer = Arc<Mutex<MultichannelBuffer>>;

/// Named 2-D sample buffer (rows = channels, cols = samples per block)
///
/// The shape only changes through [`MultichannelBuffer::reconfigure`]; every
/// other mutator writes in place.
#[derive(Debug, Clone)]
pub struct MultichannelBuffer {
    /// Stable identity, used to detect aliasing between pipe ends
    pub id: Uuid,
    name: String,
    /// Row-major sample storage (channel after channel)
    data: Vec<f64>,
    channels: usize,
    samples: usize,
    sampling_rate: f64,
    labels: Vec<String>,
}

impl MultichannelBuffer {
    /// Create a zero-filled buffer with explicit channel labels
    pub fn new(
        name: &str,
        samples: usize,
        sampling_rate: f64,
        labels: Vec<String>,
    ) -> ClsResult<Self> {
        Self::validate_shape(labels.len(), samples, sampling_rate)?;
        Self::validate_labels(&labels)?;

        Ok(MultichannelBuffer {
            id: Uuid::new_v4(),
            name: name.to_string(),
            data: vec![0.0; labels.len() * samples],
            channels: labels.len(),
            samples,
            sampling_rate,
            labels,
        })
    }

    /// Create a zero-filled buffer labelled `ch0`, `ch1`, ...
    pub fn zeros(name: &str, channels: usize, samples: usize, sampling_rate: f64) -> ClsResult<Self> {
        Self::new(name, samples, sampling_rate, default_labels(channels))
    }

    /// Create a buffer from per-channel rows of equal length
    pub fn from_rows(name: &str, rows: Vec<Vec<f64>>, sampling_rate: f64) -> ClsResult<Self> {
        let samples = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut buffer = Self::zeros(name, rows.len(), samples, sampling_rate)?;
        for (ch, row) in rows.iter().enumerate() {
            if row.len() != samples {
                return Err(ClsError::ShapeMismatch {
                    context: format!("rows of buffer '{}'", name),
                    expected: (rows.len(), samples),
                    actual: (rows.len(), row.len()),
                });
            }
            buffer.row_mut(ch).copy_from_slice(row);
        }
        Ok(buffer)
    }

    /// Wrap the buffer for sharing between pipes
    pub fn into_shared(self) -> SharedBuffer {
        Arc::new(Mutex::new(self))
    }

    fn validate_shape(channels: usize, samples: usize, sampling_rate: f64) -> ClsResult<()> {
        if channels == 0 || samples == 0 {
            return Err(ClsError::InvalidConfig {
                reason: format!("buffer shape must be non-empty, got {}x{}", channels, samples),
            });
        }
        if !(sampling_rate > 0.0) || !sampling_rate.is_finite() {
            return Err(ClsError::InvalidConfig {
                reason: format!("sampling rate must be positive, got {}", sampling_rate),
            });
        }
        Ok(())
    }

    fn validate_labels(labels: &[String]) -> ClsResult<()> {
        let mut seen = HashSet::with_capacity(labels.len());
        for label in labels {
            if !seen.insert(label.as_str()) {
                return Err(ClsError::InvalidLabels {
                    reason: format!("duplicate label '{}'", label),
                });
            }
        }
        Ok(())
    }

    /// Buffer name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of channels (rows)
    pub fn channel_count(&self) -> usize {
        self.channels
    }

    /// Number of samples per channel (columns)
    pub fn samples_per_channel(&self) -> usize {
        self.samples
    }

    /// `(channels, samples)`
    pub fn shape(&self) -> (usize, usize) {
        (self.channels, self.samples)
    }

    /// Sampling rate in Hz
    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    /// Ordered channel labels
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Index of the channel carrying `label`
    pub fn label_index(&self, label: &str) -> ClsResult<usize> {
        self.labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| ClsError::ChannelNotFound { channel: label.to_string() })
    }

    /// Replace the channel labels without touching the shape
    pub fn set_labels(&mut self, labels: Vec<String>) -> ClsResult<()> {
        if labels.len() != self.channels {
            return Err(ClsError::InvalidLabels {
                reason: format!(
                    "buffer '{}' has {} channels, got {} labels",
                    self.name, self.channels, labels.len()
                ),
            });
        }
        Self::validate_labels(&labels)?;
        self.labels = labels;
        Ok(())
    }

    /// Explicitly change the buffer shape; contents are zeroed
    pub fn reconfigure(&mut self, samples: usize, sampling_rate: f64, labels: Vec<String>) -> ClsResult<()> {
        Self::validate_shape(labels.len(), samples, sampling_rate)?;
        Self::validate_labels(&labels)?;

        tracing::debug!(
            buffer = %self.name,
            from = ?self.shape(),
            to = ?(labels.len(), samples),
            "reconfiguring buffer"
        );

        self.channels = labels.len();
        self.samples = samples;
        self.sampling_rate = sampling_rate;
        self.labels = labels;
        self.data = vec![0.0; self.channels * self.samples];
        Ok(())
    }

    /// Samples of one channel
    ///
    /// Panics if `channel` is out of range, like slice indexing.
    pub fn row(&self, channel: usize) -> &[f64] {
        let start = channel * self.samples;
        &self.data[start..start + self.samples]
    }

    /// Mutable samples of one channel
    pub fn row_mut(&mut self, channel: usize) -> &mut [f64] {
        let start = channel * self.samples;
        &mut self.data[start..start + self.samples]
    }

    /// Checked access to one channel
    pub fn channel_data(&self, channel: usize) -> ClsResult<&[f64]> {
        if channel >= self.channels {
            return Err(ClsError::ChannelNotFound {
                channel: format!("#{} (buffer '{}' has {})", channel, self.name, self.channels),
            });
        }
        Ok(self.row(channel))
    }

    /// Iterate over channel rows
    pub fn rows(&self) -> std::slice::Chunks<'_, f64> {
        self.data.chunks(self.samples)
    }

    /// Iterate mutably over channel rows
    pub fn rows_mut(&mut self) -> std::slice::ChunksMut<'_, f64> {
        self.data.chunks_mut(self.samples)
    }

    /// Whole row-major storage
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Whole row-major storage, mutable
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Overwrite all samples with `value`
    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Copy samples from a buffer of identical shape
    pub fn copy_from(&mut self, other: &MultichannelBuffer) -> ClsResult<()> {
        if other.shape() != self.shape() {
            return Err(ClsError::ShapeMismatch {
                context: format!("copy '{}' -> '{}'", other.name, self.name),
                expected: self.shape(),
                actual: other.shape(),
            });
        }
        self.data.copy_from_slice(&other.data);
        Ok(())
    }

    /// Copy a row-major slice of `channels * samples` values
    pub fn copy_from_slice(&mut self, data: &[f64]) -> ClsResult<()> {
        if data.len() != self.data.len() {
            return Err(ClsError::ShapeMismatch {
                context: format!("raw block into '{}'", self.name),
                expected: self.shape(),
                actual: (self.channels, data.len() / self.channels.max(1)),
            });
        }
        self.data.copy_from_slice(data);
        Ok(())
    }

    /// Block duration in seconds
    pub fn duration(&self) -> f64 {
        self.samples as f64 / self.sampling_rate
    }

    /// Basic statistics for a channel
    pub fn channel_stats(&self, channel: usize) -> ClsResult<ChannelStats> {
        Ok(ChannelStats::calculate(self.channel_data(channel)?))
    }
}

/// Default labels `ch0..chN`
pub fn default_labels(channels: usize) -> Vec<String> {
    (0..channels).map(|i| format!("ch{}", i)).collect()
}

/// Lock a shared buffer, recovering the data if a previous holder panicked
pub fn lock_buffer(buffer: &SharedBuffer) -> MutexGuard<'_, MultichannelBuffer> {
    buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Basic statistics for a signal channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub mean: f64,
    pub rms: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub peak_to_peak: f64,
}

impl ChannelStats {
    pub fn calculate(data: &[f64]) -> Self {
        if data.is_empty() {
            return Self {
                mean: 0.0,
                rms: 0.0,
                std_dev: 0.0,
                min: 0.0,
                max: 0.0,
                peak_to_peak: 0.0,
            };
        }

        let n = data.len() as f64;
        let mean = data.iter().sum::<f64>() / n;
        let rms = (data.iter().map(|x| x * x).sum::<f64>() / n).sqrt();
        let variance = data.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n;

        let min = data.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = data.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));

        Self {
            mean,
            rms,
            std_dev: variance.sqrt(),
            min,
            max,
            peak_to_peak: max - min,
        }
    }
}

/// Name → buffer map used while wiring pipelines together
#[derive(Debug, Default, Clone)]
pub struct BufferRegistry {
    buffers: HashMap<String, SharedBuffer>,
}

impl BufferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a buffer under its own name, returning the shared handle
    pub fn insert(&mut self, buffer: MultichannelBuffer) -> ClsResult<SharedBuffer> {
        let name = buffer.name().to_string();
        if self.buffers.contains_key(&name) {
            return Err(ClsError::InvalidConfig {
                reason: format!("buffer '{}' registered twice", name),
            });
        }
        let shared = buffer.into_shared();
        self.buffers.insert(name, shared.clone());
        Ok(shared)
    }

    /// Look up a buffer by name
    pub fn get(&self, name: &str) -> ClsResult<SharedBuffer> {
        self.buffers
            .get(name)
            .cloned()
            .ok_or_else(|| ClsError::MissingBuffer { name: name.to_string() })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// True if both handles point at the same buffer
pub fn same_buffer(a: &SharedBuffer, b: &SharedBuffer) -> bool {
    Arc::ptr_eq(a, b) || lock_buffer(a).id == lock_buffer(b).id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_creation() {
        let buffer = MultichannelBuffer::zeros("raw", 4, 500, 1000.0).unwrap();

        assert_eq!(buffer.shape(), (4, 500));
        assert_eq!(buffer.labels()[3], "ch3");
        assert_eq!(buffer.rows().count(), 4);
        assert!((buffer.duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_labels_rejected() {
        let labels = vec!["a".to_string(), "a".to_string()];
        assert!(matches!(
            MultichannelBuffer::new("raw", 10, 100.0, labels),
            Err(ClsError::InvalidLabels { .. })
        ));
    }

    #[test]
    fn test_rows_are_independent() {
        let mut buffer = MultichannelBuffer::zeros("raw", 2, 3, 100.0).unwrap();
        buffer.row_mut(1).copy_from_slice(&[1.0, 2.0, 3.0]);

        assert_eq!(buffer.row(0), &[0.0, 0.0, 0.0]);
        assert_eq!(buffer.row(1), &[1.0, 2.0, 3.0]);
        assert_eq!(buffer.as_slice(), &[0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_copy_requires_same_shape() {
        let mut a = MultichannelBuffer::zeros("a", 2, 4, 100.0).unwrap();
        let b = MultichannelBuffer::zeros("b", 2, 5, 100.0).unwrap();
        assert!(matches!(a.copy_from(&b), Err(ClsError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_reconfigure_is_explicit() {
        let mut buffer = MultichannelBuffer::zeros("a", 2, 4, 100.0).unwrap();
        buffer.fill(1.0);
        buffer.reconfigure(8, 200.0, default_labels(3)).unwrap();

        assert_eq!(buffer.shape(), (3, 8));
        assert_eq!(buffer.sampling_rate(), 200.0);
        assert!(buffer.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_set_labels_keeps_shape() {
        let mut buffer = MultichannelBuffer::zeros("a", 2, 4, 100.0).unwrap();
        assert!(buffer.set_labels(vec!["x".to_string()]).is_err());
        buffer.set_labels(vec!["x".to_string(), "y".to_string()]).unwrap();
        assert_eq!(buffer.label_index("y").unwrap(), 1);
        assert!(buffer.label_index("z").is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = BufferRegistry::new();
        let raw = registry.insert(MultichannelBuffer::zeros("raw", 1, 4, 100.0).unwrap()).unwrap();

        assert!(Arc::ptr_eq(&raw, &registry.get("raw").unwrap()));
        assert!(matches!(registry.get("lfp"), Err(ClsError::MissingBuffer { .. })));
        assert!(registry.insert(MultichannelBuffer::zeros("raw", 1, 4, 100.0).unwrap()).is_err());
    }

    #[test]
    fn test_channel_stats() {
        let stats = ChannelStats::calculate(&[1.0, -1.0, 1.0, -1.0]);
        assert!((stats.mean).abs() < 1e-12);
        assert!((stats.rms - 1.0).abs() < 1e-12);
        assert!((stats.peak_to_peak - 2.0).abs() < 1e-12);
    }
}
