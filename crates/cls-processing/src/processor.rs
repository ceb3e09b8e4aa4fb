//! Core pipe trait and timing types

use cls_core::{ClsResult, SharedBuffer};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A processing step reading one shared buffer and writing another
///
/// Pipes lock their input first and their output second. A pipe whose input
/// and output are the same buffer takes a single lock.
pub trait Pipe: Send {
    /// Move one block from the input buffer to the output buffer
    fn run(&mut self) -> ClsResult<()>;

    /// Pipe name, unique within a pipeline
    fn name(&self) -> &str;

    /// Clear any internal state (filter delay lines etc.)
    fn reset(&mut self);

    fn input(&self) -> &SharedBuffer;

    fn output(&self) -> &SharedBuffer;

    /// Get processing latency estimate in microseconds
    fn latency_estimate(&self) -> u64 {
        1000 // 1ms default
    }

    fn pipe_type(&self) -> PipeType;
}

/// Kinds of pipes, used for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeType {
    Filter,
    Decimator,
    Selector,
}

/// Performance metrics for one pipe or stage run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    /// Actual processing time in microseconds
    pub processing_time_us: u64,
    /// Success/failure status
    pub success: bool,
    /// Error message if processing failed
    pub error_message: Option<String>,
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self {
            processing_time_us: 0,
            success: true,
            error_message: None,
        }
    }

    /// Start timing a processing operation
    pub fn start_timing() -> ProcessingTimer {
        ProcessingTimer {
            start_time: Instant::now(),
            metrics: ProcessingMetrics::new(),
        }
    }

    /// Check if processing met a latency bound
    pub fn meets_latency(&self, max_latency_us: u64) -> bool {
        self.success && self.processing_time_us <= max_latency_us
    }
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper for timing processing operations
pub struct ProcessingTimer {
    start_time: Instant,
    metrics: ProcessingMetrics,
}

impl ProcessingTimer {
    /// Finish timing and return metrics
    pub fn finish(mut self) -> ProcessingMetrics {
        self.metrics.processing_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics
    }

    /// Finish with error
    pub fn finish_with_error(mut self, error: &str) -> ProcessingMetrics {
        self.metrics.processing_time_us = self.start_time.elapsed().as_micros() as u64;
        self.metrics.success = false;
        self.metrics.error_message = Some(error.to_string());
        self.metrics
    }
}

/// Aggregated pipeline timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelinePerformance {
    pub total_latency_us: u64,
    pub avg_latency_us: u64,
    pub success_rate: f32,
    pub pipe_count: usize,
    pub blocks_processed: u64,
    pub slow_runs: u64,
}

impl PipelinePerformance {
    pub fn from_metrics(metrics: &[ProcessingMetrics], pipe_count: usize, blocks_processed: u64, slow_runs: u64) -> Self {
        let total_latency: u64 = metrics.iter().map(|m| m.processing_time_us).sum();

        let success_rate = if metrics.is_empty() {
            1.0
        } else {
            metrics.iter().filter(|m| m.success).count() as f32 / metrics.len() as f32
        };

        let avg_latency = if metrics.is_empty() {
            0
        } else {
            total_latency / metrics.len() as u64
        };

        Self {
            total_latency_us: total_latency,
            avg_latency_us: avg_latency,
            success_rate,
            pipe_count,
            blocks_processed,
            slow_runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_processing_metrics() {
        let timer = ProcessingMetrics::start_timing();
        std::thread::sleep(Duration::from_millis(1));
        let metrics = timer.finish();

        assert!(metrics.processing_time_us > 0);
        assert!(metrics.success);
        assert!(metrics.error_message.is_none());
        assert!(!metrics.meets_latency(0));
    }

    #[test]
    fn test_failed_metrics() {
        let metrics = ProcessingMetrics::start_timing().finish_with_error("shape");
        assert!(!metrics.success);
        assert_eq!(metrics.error_message.as_deref(), Some("shape"));
    }

    #[test]
    fn test_performance_summary() {
        let metrics = vec![
            ProcessingMetrics { processing_time_us: 100, success: true, error_message: None },
            ProcessingMetrics { processing_time_us: 300, success: false, error_message: None },
        ];
        let perf = PipelinePerformance::from_metrics(&metrics, 2, 5, 1);

        assert_eq!(perf.total_latency_us, 400);
        assert_eq!(perf.avg_latency_us, 200);
        assert!((perf.success_rate - 0.5).abs() < 1e-6);
        assert_eq!(perf.blocks_processed, 5);
    }
}
