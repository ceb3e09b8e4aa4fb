//! Closed-loop session: frames in, processing, protocol step, stimulus out

use crate::config::ExperimentConfig;
use cls_control::{Phase, Protocol, StimulusController, TrialLog, TrialSink};
use cls_core::{ClsResult, StimulusTransport};
use cls_processing::ProcessingSetup;
use cls_simulation::Frame;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, Mutex};

/// Commands for a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    /// External response, such as the participant's button press
    Respond,
    Stop,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub blocks_processed: u64,
    pub lagged_blocks: u64,
    pub trial: u32,
    pub phase: Option<Phase>,
    pub frequency: f64,
    pub updates: u64,
    pub total_processing_time_us: u64,
    pub average_latency_us: u64,
}

pub struct ClosedLoopSession {
    setup: ProcessingSetup,
    protocol: Protocol,
    frames: broadcast::Receiver<Frame>,
    command_receiver: mpsc::Receiver<SessionCommand>,
    command_sender: mpsc::Sender<SessionCommand>,
    stats: Arc<Mutex<SessionStats>>,
}

impl ClosedLoopSession {
    /// Build processing, controller, stimulus and protocol from one configuration
    pub fn new(
        config: &ExperimentConfig,
        transport: Box<dyn StimulusTransport>,
        frames: broadcast::Receiver<Frame>,
    ) -> ClsResult<Self> {
        let setup = config.processing.build()?;
        let source = setup.analysis.spectrum(&config.control.spectrum_source)?;
        let controller = config.control.build_controller(source)?;
        let stimulus = StimulusController::new(transport, config.control.stimulus.clone())?;
        let log: Option<Box<dyn TrialSink>> = match &config.control.trial_log {
            Some(path) => Some(Box::new(TrialLog::create(path)?)),
            None => None,
        };

        let protocol = Protocol::new(
            config.control.protocol.clone(),
            controller,
            stimulus,
            log,
            config.stream.simulator.block_period_ms(),
        )?;
        let (command_sender, command_receiver) = mpsc::channel(8);

        Ok(Self {
            setup,
            protocol,
            frames,
            command_receiver,
            command_sender,
            stats: Arc::new(Mutex::new(SessionStats::default())),
        })
    }

    pub fn command_handle(&self) -> mpsc::Sender<SessionCommand> {
        self.command_sender.clone()
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    /// Run the protocol to completion, a stop command or the end of the stream
    pub async fn run(&mut self) -> ClsResult<SessionStats> {
        self.protocol.start()?;
        let result = self.block_loop().await;
        let closed = self.protocol.close();
        result?;
        closed?;

        let stats = self.stats.lock().await.clone();
        tracing::info!(
            blocks = stats.blocks_processed,
            trials = stats.trial,
            updates = stats.updates,
            average_latency_us = stats.average_latency_us,
            "session ended"
        );
        Ok(stats)
    }

    async fn block_loop(&mut self) -> ClsResult<()> {
        let stop = self.protocol.stop_handle();

        while !stop.load(Ordering::SeqCst) {
            tokio::select! {
                frame = self.frames.recv() => {
                    match frame {
                        Ok(frame) => self.process_frame(&frame).await?,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "session lagged behind the data source");
                            self.stats.lock().await.lagged_blocks += skipped;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            tracing::warn!("data source closed before the protocol finished");
                            break;
                        }
                    }
                }

                command = self.command_receiver.recv() => {
                    match command {
                        Some(SessionCommand::Respond) => {
                            if !self.protocol.respond()? {
                                tracing::debug!(phase = ?self.protocol.phase(), "response ignored");
                            }
                        }
                        Some(SessionCommand::Stop) => {
                            tracing::info!("stop requested");
                            self.protocol.stop()?;
                            break;
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(())
    }

    async fn process_frame(&mut self, frame: &Frame) -> ClsResult<()> {
        let started = Instant::now();
        self.setup.pipeline.run_buffer(frame)?;
        self.setup.analysis.run()?;
        self.protocol.on_block()?;
        let elapsed = started.elapsed().as_micros() as u64;

        let mut stats = self.stats.lock().await;
        stats.blocks_processed += 1;
        stats.total_processing_time_us += elapsed;
        stats.average_latency_us = stats.total_processing_time_us / stats.blocks_processed;
        stats.trial = self.protocol.trial();
        stats.phase = Some(self.protocol.phase());
        stats.frequency = self.protocol.frequency();
        stats.updates = self.protocol.total_updates();
        Ok(())
    }
}
