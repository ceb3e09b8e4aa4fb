//! Analysis pipeline: ordered stages reading processed buffers

use crate::processor::ProcessingMetrics;
use crate::spectral::{SharedSpectrum, SpectralAnalyzer};
use crate::spikes::{SharedSpikes, SpikeDetector};
use cls_core::{ClsError, ClsResult};
use std::collections::HashMap;

/// A stage producing results from a shared buffer
pub trait AnalysisStage: Send {
    fn run(&mut self) -> ClsResult<()>;

    fn name(&self) -> &str;

    fn reset(&mut self);
}

pub struct AnalysisPipeline {
    name: String,
    stages: Vec<Box<dyn AnalysisStage>>,
    spectra: HashMap<String, SharedSpectrum>,
    spikes: HashMap<String, SharedSpikes>,
    processing_metrics: Vec<ProcessingMetrics>,
}

impl AnalysisPipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
            spectra: HashMap::new(),
            spikes: HashMap::new(),
            processing_metrics: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_unique(&self, name: &str) -> ClsResult<()> {
        if self.has_stage(name) {
            return Err(ClsError::InvalidConfig {
                reason: format!("analysis stage '{}' registered twice", name),
            });
        }
        Ok(())
    }

    /// Add a stage whose results are reached through its own handles
    pub fn add_stage(&mut self, stage: Box<dyn AnalysisStage>) -> ClsResult<()> {
        self.check_unique(stage.name())?;
        self.stages.push(stage);
        Ok(())
    }

    pub fn add_spectral_analyzer(&mut self, analyzer: SpectralAnalyzer) -> ClsResult<SharedSpectrum> {
        self.check_unique(analyzer.name())?;
        let history = analyzer.history();
        self.spectra.insert(analyzer.name().to_string(), history.clone());
        self.stages.push(Box::new(analyzer));
        Ok(history)
    }

    pub fn add_spike_detector(&mut self, detector: SpikeDetector) -> ClsResult<SharedSpikes> {
        self.check_unique(detector.name())?;
        let results = detector.results();
        self.spikes.insert(detector.name().to_string(), results.clone());
        self.stages.push(Box::new(detector));
        Ok(results)
    }

    /// Run every stage in insertion order
    pub fn run(&mut self) -> ClsResult<()> {
        self.processing_metrics.clear();
        for stage in self.stages.iter_mut() {
            let timer = ProcessingMetrics::start_timing();
            if let Err(e) = stage.run() {
                self.processing_metrics.push(timer.finish_with_error(&e.to_string()));
                tracing::error!(stage = stage.name(), error = %e, "analysis stage failed");
                return Err(e);
            }
            self.processing_metrics.push(timer.finish());
        }
        Ok(())
    }

    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            stage.reset();
        }
        self.processing_metrics.clear();
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.stages.iter().any(|s| s.name() == name)
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Spectrum history written by a named spectral stage
    pub fn spectrum(&self, name: &str) -> ClsResult<SharedSpectrum> {
        self.spectra
            .get(name)
            .cloned()
            .ok_or_else(|| ClsError::MissingPipe { name: name.to_string() })
    }

    /// Detections written by a named spike stage
    pub fn spikes(&self, name: &str) -> ClsResult<SharedSpikes> {
        self.spikes
            .get(name)
            .cloned()
            .ok_or_else(|| ClsError::MissingPipe { name: name.to_string() })
    }

    pub fn last_metrics(&self) -> &[ProcessingMetrics] {
        &self.processing_metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spectral::{SpectralConfig, SpectralMethod, StftConfig, WindowFunction};
    use crate::spikes::SpikeConfig;
    use crate::worker::WorkerPool;
    use cls_core::MultichannelBuffer;

    #[test]
    fn test_stage_registry() {
        let pool = WorkerPool::new(2).unwrap();
        let input = MultichannelBuffer::zeros("lfp", 2, 128, 256.0).unwrap().into_shared();
        let config = SpectralConfig {
            method: SpectralMethod::Stft(StftConfig {
                window_length: 64,
                dft_size: 128,
                step: 32,
                window: WindowFunction::Hamming,
            }),
            freq_min: 2.0,
            freq_max: 60.0,
            history_blocks: 2,
        };

        let mut analysis = AnalysisPipeline::new("analysis");
        analysis
            .add_spectral_analyzer(SpectralAnalyzer::new("psd", config.clone(), input.clone(), pool.clone()).unwrap())
            .unwrap();
        analysis
            .add_spike_detector(SpikeDetector::new("spikes", SpikeConfig::default(), input.clone(), pool.clone()).unwrap())
            .unwrap();

        let duplicate = SpectralAnalyzer::new("psd", config, input, pool).unwrap();
        assert!(analysis.add_spectral_analyzer(duplicate).is_err());

        analysis.run().unwrap();
        assert_eq!(analysis.stage_names(), vec!["psd", "spikes"]);
        assert_eq!(analysis.last_metrics().len(), 2);
        assert_eq!(analysis.spectrum("psd").unwrap().read().unwrap().blocks_written(), 1);
        assert!(matches!(analysis.spectrum("spikes"), Err(ClsError::MissingPipe { .. })));
        assert!(analysis.spikes("spikes").is_ok());

        analysis.reset();
        assert!(analysis.spectrum("psd").unwrap().read().unwrap().is_empty());
    }
}
