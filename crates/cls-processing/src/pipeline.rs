//! Processing pipeline chaining pipes behind a raw input frame

use crate::processor::{Pipe, PipeType, PipelinePerformance, ProcessingMetrics};
use cls_core::{lock_buffer, ClsError, ClsResult, MultichannelBuffer, SharedBuffer};
use std::sync::Arc;

/// Raw frame plus an ordered chain of pipes
pub struct ProcessingPipeline {
    name: String,
    raw: SharedBuffer,
    pipes: Vec<Box<dyn Pipe>>,
    processing_metrics: Vec<ProcessingMetrics>,
    blocks_processed: u64,
    slow_runs: u64,
}

/// Pipeline builder checking that every pipe is fed by an earlier one
pub struct ProcessingPipelineBuilder {
    name: String,
    raw: SharedBuffer,
    pipes: Vec<Box<dyn Pipe>>,
}

impl ProcessingPipelineBuilder {
    pub fn new(name: &str, raw: SharedBuffer) -> Self {
        Self {
            name: name.to_string(),
            raw,
            pipes: Vec::new(),
        }
    }

    pub fn add_pipe(mut self, pipe: Box<dyn Pipe>) -> Self {
        self.pipes.push(pipe);
        self
    }

    pub fn build(self) -> ClsResult<ProcessingPipeline> {
        let mut reachable: Vec<SharedBuffer> = vec![self.raw.clone()];
        let mut names: Vec<&str> = Vec::with_capacity(self.pipes.len());

        for pipe in &self.pipes {
            if names.contains(&pipe.name()) {
                return Err(ClsError::InvalidConfig {
                    reason: format!("pipe '{}' appears twice in pipeline '{}'", pipe.name(), self.name),
                });
            }
            names.push(pipe.name());

            if !reachable.iter().any(|b| Arc::ptr_eq(b, pipe.input())) {
                return Err(ClsError::MissingBuffer {
                    name: lock_buffer(pipe.input()).name().to_string(),
                });
            }
            reachable.push(pipe.output().clone());
        }

        tracing::info!(pipeline = %self.name, pipes = self.pipes.len(), "processing pipeline built");

        Ok(ProcessingPipeline {
            name: self.name,
            raw: self.raw,
            pipes: self.pipes,
            processing_metrics: Vec::new(),
            blocks_processed: 0,
            slow_runs: 0,
        })
    }
}

impl ProcessingPipeline {
    pub fn builder(name: &str, raw: SharedBuffer) -> ProcessingPipelineBuilder {
        ProcessingPipelineBuilder::new(name, raw)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared handle to the raw input frame
    pub fn raw_frame(&self) -> &SharedBuffer {
        &self.raw
    }

    /// Copy a row-major block into the raw frame, then run every pipe in order
    pub fn run(&mut self, block: &[f64]) -> ClsResult<()> {
        lock_buffer(&self.raw).copy_from_slice(block)?;
        self.run_pipes()
    }

    /// Same as [`ProcessingPipeline::run`] for a block already held in a buffer
    pub fn run_buffer(&mut self, block: &MultichannelBuffer) -> ClsResult<()> {
        lock_buffer(&self.raw).copy_from(block)?;
        self.run_pipes()
    }

    fn run_pipes(&mut self) -> ClsResult<()> {
        self.processing_metrics.clear();

        for pipe in self.pipes.iter_mut() {
            let timer = ProcessingMetrics::start_timing();

            match pipe.run() {
                Ok(()) => {
                    let metrics = timer.finish();
                    let latency_estimate = pipe.latency_estimate();
                    if metrics.processing_time_us > latency_estimate * 2 {
                        self.slow_runs += 1;
                        tracing::warn!(
                            pipe = pipe.name(),
                            took_us = metrics.processing_time_us,
                            expected_us = latency_estimate,
                            "pipe exceeded its latency estimate"
                        );
                    }
                    self.processing_metrics.push(metrics);
                }
                Err(e) => {
                    self.processing_metrics.push(timer.finish_with_error(&e.to_string()));
                    tracing::error!(pipe = pipe.name(), error = %e, "pipe failed");
                    return Err(e);
                }
            }
        }

        self.blocks_processed += 1;
        Ok(())
    }

    /// Reset all pipes in the pipeline
    pub fn reset(&mut self) {
        for pipe in &mut self.pipes {
            pipe.reset();
        }
        self.processing_metrics.clear();
        self.blocks_processed = 0;
        self.slow_runs = 0;
    }

    pub fn get_pipe(&self, name: &str) -> ClsResult<&dyn Pipe> {
        self.pipes
            .iter()
            .find(|p| p.name() == name)
            .map(|p| p.as_ref())
            .ok_or_else(|| ClsError::MissingPipe { name: name.to_string() })
    }

    /// Output buffer of a named pipe
    pub fn pipe_output(&self, name: &str) -> ClsResult<SharedBuffer> {
        Ok(self.get_pipe(name)?.output().clone())
    }

    /// Output of the last pipe, or the raw frame for an empty pipeline
    pub fn final_output(&self) -> SharedBuffer {
        self.pipes
            .last()
            .map(|p| p.output().clone())
            .unwrap_or_else(|| self.raw.clone())
    }

    pub fn pipe_names(&self) -> Vec<String> {
        self.pipes.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn pipe_types(&self) -> Vec<PipeType> {
        self.pipes.iter().map(|p| p.pipe_type()).collect()
    }

    /// Get estimated total latency
    pub fn estimated_latency(&self) -> u64 {
        self.pipes.iter().map(|p| p.latency_estimate()).sum()
    }

    /// Metrics of the most recent block
    pub fn last_metrics(&self) -> &[ProcessingMetrics] {
        &self.processing_metrics
    }

    pub fn performance_summary(&self) -> PipelinePerformance {
        PipelinePerformance::from_metrics(
            &self.processing_metrics,
            self.pipes.len(),
            self.blocks_processed,
            self.slow_runs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimator::{DecimationMethod, Decimator};
    use crate::filters::{FilterBank, FilterConfig};
    use crate::worker::WorkerPool;

    fn buffers() -> (SharedBuffer, SharedBuffer, SharedBuffer) {
        (
            MultichannelBuffer::zeros("raw", 2, 100, 1000.0).unwrap().into_shared(),
            MultichannelBuffer::zeros("lfp", 2, 100, 1000.0).unwrap().into_shared(),
            MultichannelBuffer::zeros("dec", 2, 50, 500.0).unwrap().into_shared(),
        )
    }

    #[test]
    fn test_pipeline_runs_in_order() {
        let pool = WorkerPool::new(2).unwrap();
        let (raw, lfp, dec) = buffers();
        let filter = FilterBank::new("lowpass", FilterConfig::lowpass(200.0, 2), raw.clone(), lfp.clone(), pool).unwrap();
        let decimator = Decimator::new("decimate", 2, DecimationMethod::Step, lfp, dec.clone()).unwrap();

        let mut pipeline = ProcessingPipeline::builder("lfp", raw)
            .add_pipe(Box::new(filter))
            .add_pipe(Box::new(decimator))
            .build()
            .unwrap();

        pipeline.run(&vec![1.0; 200]).unwrap();

        assert_eq!(pipeline.pipe_names(), vec!["lowpass", "decimate"]);
        assert_eq!(pipeline.pipe_types(), vec![PipeType::Filter, PipeType::Decimator]);
        assert_eq!(pipeline.last_metrics().len(), 2);
        assert!(lock_buffer(&dec).as_slice().iter().any(|&v| v != 0.0));
        assert!(Arc::ptr_eq(&pipeline.final_output(), &dec));
        assert_eq!(pipeline.performance_summary().blocks_processed, 1);
    }

    #[test]
    fn test_wrong_block_size() {
        let (raw, _, _) = buffers();
        let mut pipeline = ProcessingPipeline::builder("empty", raw).build().unwrap();
        assert!(matches!(pipeline.run(&[0.0; 10]), Err(ClsError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_unconnected_pipe_rejected() {
        let (raw, lfp, dec) = buffers();
        let decimator = Decimator::new("decimate", 2, DecimationMethod::Step, lfp, dec).unwrap();
        let result = ProcessingPipeline::builder("broken", raw).add_pipe(Box::new(decimator)).build();
        assert!(matches!(result, Err(ClsError::MissingBuffer { .. })));
    }

    #[test]
    fn test_pipe_lookup() {
        let (raw, _, dec) = buffers();
        let decimator = Decimator::new("decimate", 2, DecimationMethod::Average, raw.clone(), dec).unwrap();
        let pipeline = ProcessingPipeline::builder("p", raw).add_pipe(Box::new(decimator)).build().unwrap();

        assert_eq!(pipeline.get_pipe("decimate").unwrap().pipe_type(), PipeType::Decimator);
        assert!(matches!(pipeline.get_pipe("notch"), Err(ClsError::MissingPipe { .. })));
    }
}
