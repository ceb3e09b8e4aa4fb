//! CLS-Processing: real-time processing and analysis pipelines
//!
//! Filtering, decimation and channel selection run as pipes between shared
//! buffers. Spike detection and spectral analysis run as analysis stages on
//! the processed buffers. Per-channel work is spread over a bounded worker
//! pool.

pub mod analysis;
pub mod config;
pub mod decimator;
pub mod filters;
pub mod pipeline;
pub mod processor;
pub mod selector;
pub mod spectral;
pub mod spikes;
pub mod worker;

pub use analysis::{AnalysisPipeline, AnalysisStage};
pub use config::{InputConfig, PipeConfig, ProcessingConfig, ProcessingSetup, StageConfig};
pub use decimator::{DecimationMethod, Decimator};
pub use filters::{ChannelFilter, FilterBank, FilterConfig, FilterType};
pub use pipeline::{ProcessingPipeline, ProcessingPipelineBuilder};
pub use processor::{Pipe, PipeType, PipelinePerformance, ProcessingMetrics, ProcessingTimer};
pub use selector::{ChannelSelection, Selector};
pub use spectral::{
    SharedSpectrum, SpectralAnalyzer, SpectralConfig, SpectralMethod, SpectrumBlock, SpectrumHistory,
    StftConfig, SuperletConfig, SuperletMode, WindowFunction,
};
pub use spikes::{Polarity, SharedSpikes, SpikeConfig, SpikeDetector, SpikeEvent, ThresholdMode};
pub use worker::{UnitPool, WorkerPool};
