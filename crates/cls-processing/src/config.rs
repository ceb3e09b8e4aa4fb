//! Configuration management for processing and analysis pipelines

use crate::analysis::AnalysisPipeline;
use crate::decimator::{DecimationMethod, Decimator};
use crate::filters::{FilterBank, FilterConfig};
use crate::pipeline::ProcessingPipeline;
use crate::selector::{ChannelSelection, Selector};
use crate::spectral::{SpectralAnalyzer, SpectralConfig, SpectralMethod, StftConfig, WindowFunction};
use crate::spikes::{SpikeConfig, SpikeDetector};
use crate::worker::WorkerPool;
use cls_core::{config_error, default_labels, lock_buffer, BufferRegistry, ClsError, ClsResult, MultichannelBuffer, SharedBuffer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Shape of the raw frames delivered by the data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Name of the raw frame buffer
    pub name: String,
    pub labels: Vec<String>,
    pub samples_per_block: usize,
    pub sampling_rate: f64,
}

impl InputConfig {
    /// Block period in milliseconds
    pub fn block_period_ms(&self) -> f64 {
        self.samples_per_block as f64 * 1000.0 / self.sampling_rate
    }
}

/// One pipe of the processing pipeline
///
/// Output buffers that do not exist yet are created with the shape the pipe
/// produces. A filter whose output names its input filters in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipeConfig {
    Filter {
        name: String,
        input: String,
        output: String,
        filter: FilterConfig,
    },
    Decimator {
        name: String,
        input: String,
        output: String,
        order: usize,
        #[serde(default)]
        method: DecimationMethod,
    },
    Selector {
        name: String,
        input: String,
        output: String,
        channels: Vec<ChannelSelection>,
    },
}

impl PipeConfig {
    pub fn name(&self) -> &str {
        match self {
            PipeConfig::Filter { name, .. }
            | PipeConfig::Decimator { name, .. }
            | PipeConfig::Selector { name, .. } => name,
        }
    }

    fn endpoints(&self) -> (&str, &str) {
        match self {
            PipeConfig::Filter { input, output, .. }
            | PipeConfig::Decimator { input, output, .. }
            | PipeConfig::Selector { input, output, .. } => (input, output),
        }
    }
}

/// One stage of the analysis pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    Spectral {
        name: String,
        input: String,
        spectral: SpectralConfig,
    },
    Spikes {
        name: String,
        input: String,
        spikes: SpikeConfig,
    },
}

impl StageConfig {
    pub fn name(&self) -> &str {
        match self {
            StageConfig::Spectral { name, .. } | StageConfig::Spikes { name, .. } => name,
        }
    }

    fn input(&self) -> &str {
        match self {
            StageConfig::Spectral { input, .. } | StageConfig::Spikes { input, .. } => input,
        }
    }
}

/// Global processing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    pub name: String,
    /// Degree of parallelism for per-channel work
    pub worker_threads: usize,
    pub input: InputConfig,
    pub pipes: Vec<PipeConfig>,
    pub analysis: Vec<StageConfig>,
}

/// Everything built from a [`ProcessingConfig`]
pub struct ProcessingSetup {
    pub pool: WorkerPool,
    pub buffers: BufferRegistry,
    pub pipeline: ProcessingPipeline,
    pub analysis: AnalysisPipeline,
}

impl ProcessingConfig {
    /// LFP tracking preset: bandpass, decimate by 2, STFT with 1 Hz bins
    pub fn lfp_tracking(channels: usize, sampling_rate: f64, samples_per_block: usize) -> Self {
        let decimated_rate = sampling_rate / 2.0;
        let decimated_block = samples_per_block / 2;

        ProcessingConfig {
            name: "LFP tracking".to_string(),
            worker_threads: channels.clamp(1, 4),
            input: InputConfig {
                name: "raw".to_string(),
                labels: default_labels(channels),
                samples_per_block,
                sampling_rate,
            },
            pipes: vec![
                PipeConfig::Filter {
                    name: "bandpass".to_string(),
                    input: "raw".to_string(),
                    output: "lfp".to_string(),
                    filter: FilterConfig::bandpass(1.0, 100.0, 4),
                },
                PipeConfig::Decimator {
                    name: "decimate".to_string(),
                    input: "lfp".to_string(),
                    output: "lfp_dec".to_string(),
                    order: 2,
                    method: DecimationMethod::Step,
                },
            ],
            analysis: vec![StageConfig::Spectral {
                name: "psd".to_string(),
                input: "lfp_dec".to_string(),
                spectral: SpectralConfig {
                    method: SpectralMethod::Stft(StftConfig {
                        window_length: decimated_block,
                        dft_size: decimated_rate.round() as usize,
                        step: decimated_block,
                        window: WindowFunction::Hann,
                    }),
                    freq_min: 1.0,
                    freq_max: 100.0_f64.min(decimated_rate / 2.0),
                    history_blocks: 4,
                },
            }],
        }
    }

    /// Structural checks; numeric checks happen when stages are built
    pub fn validate(&self) -> ClsResult<()> {
        if self.worker_threads == 0 {
            return Err(config_error!("worker_threads must be at least 1"));
        }
        if self.input.labels.is_empty() || self.input.samples_per_block == 0 {
            return Err(config_error!("input must have channels and samples"));
        }
        if !(self.input.sampling_rate > 0.0) {
            return Err(config_error!("input sampling rate must be positive"));
        }

        let mut buffers: HashSet<&str> = HashSet::from([self.input.name.as_str()]);
        let mut names: HashSet<&str> = HashSet::new();

        for pipe in &self.pipes {
            if !names.insert(pipe.name()) {
                return Err(config_error!("duplicate pipe name '{}'", pipe.name()));
            }
            let (input, output) = pipe.endpoints();
            if !buffers.contains(input) {
                return Err(ClsError::MissingBuffer { name: input.to_string() });
            }
            if let PipeConfig::Decimator { order, .. } = pipe {
                if *order == 0 {
                    return Err(config_error!("decimator '{}' order must be at least 1", pipe.name()));
                }
                if input == output {
                    return Err(ClsError::InPlaceDecimation { buffer: input.to_string() });
                }
            }
            buffers.insert(output);
        }

        for stage in &self.analysis {
            if !names.insert(stage.name()) {
                return Err(config_error!("duplicate stage name '{}'", stage.name()));
            }
            if !buffers.contains(stage.input()) {
                return Err(ClsError::MissingBuffer { name: stage.input().to_string() });
            }
        }
        Ok(())
    }

    /// Create buffers, pipes and stages
    pub fn build(&self) -> ClsResult<ProcessingSetup> {
        self.validate()?;

        let pool = WorkerPool::new(self.worker_threads)?;
        let mut buffers = BufferRegistry::new();
        let raw = buffers.insert(MultichannelBuffer::new(
            &self.input.name,
            self.input.samples_per_block,
            self.input.sampling_rate,
            self.input.labels.clone(),
        )?)?;

        let mut builder = ProcessingPipeline::builder(&self.name, raw);
        for pipe in &self.pipes {
            let (input_name, output_name) = pipe.endpoints();
            let input = buffers.get(input_name)?;

            builder = match pipe {
                PipeConfig::Filter { name, filter, .. } => {
                    let output = if input_name == output_name {
                        input.clone()
                    } else {
                        output_buffer(&mut buffers, output_name, &input, |b| {
                            MultichannelBuffer::new(output_name, b.samples_per_channel(), b.sampling_rate(), b.labels().to_vec())
                        })?
                    };
                    builder.add_pipe(Box::new(FilterBank::new(name, filter.clone(), input, output, pool.clone())?))
                }
                PipeConfig::Decimator { name, order, method, .. } => {
                    let output = output_buffer(&mut buffers, output_name, &input, |b| {
                        let (samples, rate) = Decimator::decimated_shape(b.samples_per_channel(), b.sampling_rate(), *order);
                        MultichannelBuffer::new(output_name, samples, rate, b.labels().to_vec())
                    })?;
                    builder.add_pipe(Box::new(Decimator::new(name, *order, *method, input, output)?))
                }
                PipeConfig::Selector { name, channels, .. } => {
                    let output = output_buffer(&mut buffers, output_name, &input, |b| {
                        MultichannelBuffer::zeros(output_name, channels.len(), b.samples_per_channel(), b.sampling_rate())
                    })?;
                    builder.add_pipe(Box::new(Selector::new(name, channels, input, output)?))
                }
            };
        }
        let pipeline = builder.build()?;

        let mut analysis = AnalysisPipeline::new(&format!("{} analysis", self.name));
        for stage in &self.analysis {
            let input = buffers.get(stage.input())?;
            match stage {
                StageConfig::Spectral { name, spectral, .. } => {
                    analysis.add_spectral_analyzer(SpectralAnalyzer::new(name, spectral.clone(), input, pool.clone())?)?;
                }
                StageConfig::Spikes { name, spikes, .. } => {
                    analysis.add_spike_detector(SpikeDetector::new(name, spikes.clone(), input, pool.clone())?)?;
                }
            }
        }

        tracing::info!(
            config = %self.name,
            buffers = ?buffers.names(),
            stages = ?analysis.stage_names(),
            threads = pool.threads(),
            "processing setup built"
        );

        Ok(ProcessingSetup { pool, buffers, pipeline, analysis })
    }

    /// Export configuration to JSON
    pub fn to_json(&self) -> ClsResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ClsError::InvalidConfig {
            reason: format!("Failed to serialize configuration: {}", e),
        })
    }

    /// Import configuration from JSON
    pub fn from_json(json: &str) -> ClsResult<Self> {
        serde_json::from_str(json).map_err(|e| ClsError::InvalidConfig {
            reason: format!("Failed to deserialize configuration: {}", e),
        })
    }
}

/// Existing buffer named `name`, or a new one derived from `input`
fn output_buffer<F>(buffers: &mut BufferRegistry, name: &str, input: &SharedBuffer, make: F) -> ClsResult<SharedBuffer>
where
    F: FnOnce(&MultichannelBuffer) -> ClsResult<MultichannelBuffer>,
{
    if buffers.contains(name) {
        return buffers.get(name);
    }
    let buffer = make(&lock_buffer(input))?;
    buffers.insert(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_builds() {
        let config = ProcessingConfig::lfp_tracking(4, 1000.0, 500);
        assert!(config.validate().is_ok());
        assert!((config.input.block_period_ms() - 500.0).abs() < 1e-9);

        let setup = config.build().unwrap();
        assert_eq!(setup.pipeline.pipe_names(), vec!["bandpass", "decimate"]);
        assert_eq!(setup.buffers.names(), vec!["lfp", "lfp_dec", "raw"]);
        assert_eq!(lock_buffer(&setup.buffers.get("lfp_dec").unwrap()).shape(), (4, 250));

        let history = setup.analysis.spectrum("psd").unwrap();
        assert_eq!(history.read().unwrap().frequencies().len(), 100);
    }

    #[test]
    fn test_json_serialization() {
        let config = ProcessingConfig::lfp_tracking(2, 1000.0, 500);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"kind\": \"decimator\""));
        assert!(json.contains("\"method\": \"stft\""));

        let restored = ProcessingConfig::from_json(&json).unwrap();
        assert_eq!(restored, config);
        assert!(ProcessingConfig::from_json("{").is_err());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProcessingConfig::lfp_tracking(2, 1000.0, 500);
        config.worker_threads = 0;
        assert!(config.validate().is_err());

        let mut config = ProcessingConfig::lfp_tracking(2, 1000.0, 500);
        if let PipeConfig::Decimator { output, .. } = &mut config.pipes[1] {
            *output = "lfp".to_string();
        }
        assert!(matches!(config.validate(), Err(ClsError::InPlaceDecimation { .. })));

        let mut config = ProcessingConfig::lfp_tracking(2, 1000.0, 500);
        config.pipes.remove(0);
        assert!(matches!(config.validate(), Err(ClsError::MissingBuffer { .. })));
    }

    #[test]
    fn test_selector_and_in_place_filter() {
        let mut config = ProcessingConfig::lfp_tracking(3, 1000.0, 500);
        config.pipes.insert(1, PipeConfig::Filter {
            name: "notch".to_string(),
            input: "lfp".to_string(),
            output: "lfp".to_string(),
            filter: FilterConfig::bandstop(48.0, 52.0, 2),
        });
        config.pipes.push(PipeConfig::Selector {
            name: "pick".to_string(),
            input: "lfp_dec".to_string(),
            output: "picked".to_string(),
            channels: vec![ChannelSelection::Label("ch2".to_string())],
        });
        config.analysis.push(StageConfig::Spikes {
            name: "spikes".to_string(),
            input: "raw".to_string(),
            spikes: SpikeConfig::default(),
        });

        let mut setup = config.build().unwrap();
        setup.pipeline.run(&vec![0.0; 3 * 500]).unwrap();
        setup.analysis.run().unwrap();

        let picked = setup.buffers.get("picked").unwrap();
        assert_eq!(lock_buffer(&picked).labels(), &["ch2".to_string()]);
    }
}
