//! Real-time block stream delivering simulated frames at the polling period

use crate::lfp_simulator::{LfpConfig, LfpSimulator};
use crate::stimulator::StimulatorHandle;
use cls_core::{ClsResult, MultichannelBuffer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub simulator: LfpConfig,
    /// Blocks buffered per subscriber before it lags
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            simulator: LfpConfig::default(),
            buffer_size: 16,
        }
    }
}

impl StreamConfig {
    /// Polling period derived from the block shape
    pub fn block_period(&self) -> Duration {
        Duration::from_secs_f64(self.simulator.samples_per_block as f64 / self.simulator.sampling_rate)
    }
}

/// Commands for controlling the stream
#[derive(Debug, Clone)]
pub enum StreamCommand {
    Start,
    Stop,
    Pause,
    Resume,
    UpdateConfig(StreamConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamStats {
    pub is_running: bool,
    pub blocks_generated: u64,
    pub total_duration: f64,
    /// Generation time of the last block, in seconds
    pub last_generation_time: f64,
}

/// Frames shared with every subscriber
pub type Frame = Arc<MultichannelBuffer>;

pub struct BlockStream {
    config: StreamConfig,
    simulator: Arc<Mutex<LfpSimulator>>,
    data_sender: broadcast::Sender<Frame>,
    control_receiver: mpsc::Receiver<StreamCommand>,
    control_sender: mpsc::Sender<StreamCommand>,
    stats: Arc<Mutex<StreamStats>>,
}

impl BlockStream {
    pub fn new(config: StreamConfig) -> ClsResult<Self> {
        let simulator = LfpSimulator::new(config.simulator.clone())?;
        let (data_sender, _) = broadcast::channel(config.buffer_size.max(1));
        let (control_sender, control_receiver) = mpsc::channel(32);

        Ok(Self {
            config,
            simulator: Arc::new(Mutex::new(simulator)),
            data_sender,
            control_receiver,
            control_sender,
            stats: Arc::new(Mutex::new(StreamStats::default())),
        })
    }

    /// Couple the simulated response to a stimulator before running
    pub async fn couple(&self, stimulator: StimulatorHandle) {
        self.simulator.lock().await.couple(stimulator);
    }

    /// Get a receiver for new blocks
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.data_sender.subscribe()
    }

    pub fn control_handle(&self) -> mpsc::Sender<StreamCommand> {
        self.control_sender.clone()
    }

    pub fn stats_handle(&self) -> Arc<Mutex<StreamStats>> {
        self.stats.clone()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Generate blocks until the control channel closes
    pub async fn run(&mut self) -> ClsResult<()> {
        let period = self.config.block_period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut running = false;

        tracing::info!(period_ms = period.as_millis() as u64, "block stream ready");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !running {
                        continue;
                    }
                    let started = Instant::now();
                    let block = self.simulator.lock().await.generate_block()?;
                    let generation_time = started.elapsed();

                    {
                        let mut stats = self.stats.lock().await;
                        stats.blocks_generated += 1;
                        stats.total_duration += period.as_secs_f64();
                        stats.last_generation_time = generation_time.as_secs_f64();
                    }

                    // no subscriber is not an error
                    let _ = self.data_sender.send(Arc::new(block));

                    if generation_time > period {
                        tracing::warn!(
                            took_ms = generation_time.as_millis() as u64,
                            period_ms = period.as_millis() as u64,
                            "block generation slower than the polling period"
                        );
                    }
                }

                command = self.control_receiver.recv() => {
                    match command {
                        Some(StreamCommand::Start) => {
                            running = true;
                            ticker.reset();
                            self.stats.lock().await.is_running = true;
                            tracing::info!("block stream started");
                        }
                        Some(StreamCommand::Stop) => {
                            running = false;
                            *self.stats.lock().await = StreamStats::default();
                            self.simulator.lock().await.reset_time();
                            tracing::info!("block stream stopped");
                        }
                        Some(StreamCommand::Pause) => {
                            running = false;
                            self.stats.lock().await.is_running = false;
                            tracing::info!("block stream paused");
                        }
                        Some(StreamCommand::Resume) => {
                            running = true;
                            self.stats.lock().await.is_running = true;
                            tracing::info!("block stream resumed");
                        }
                        Some(StreamCommand::UpdateConfig(config)) => {
                            self.simulator.lock().await.update_config(config.simulator.clone())?;
                            self.config = config;
                            ticker = interval(self.config.block_period());
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                            tracing::info!("block stream configuration updated");
                        }
                        None => {
                            tracing::debug!("block stream control channel closed");
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

/// Spawn a stream in the background
pub async fn start_block_stream(
    config: StreamConfig,
    stimulator: Option<StimulatorHandle>,
) -> ClsResult<(broadcast::Receiver<Frame>, mpsc::Sender<StreamCommand>)> {
    let mut stream = BlockStream::new(config)?;
    if let Some(stimulator) = stimulator {
        stream.couple(stimulator).await;
    }
    let data_receiver = stream.subscribe();
    let control_sender = stream.control_handle();

    tokio::spawn(async move {
        if let Err(e) = stream.run().await {
            tracing::error!(error = %e, "block stream failed");
        }
    });

    Ok((data_receiver, control_sender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn fast_config() -> StreamConfig {
        StreamConfig {
            simulator: LfpConfig {
                channel_count: 2,
                samples_per_block: 50,
                seed: Some(1),
                ..LfpConfig::default()
            },
            buffer_size: 64,
        }
    }

    #[tokio::test]
    async fn test_stream_delivers_blocks() {
        let config = fast_config();
        assert_eq!(config.block_period(), Duration::from_millis(50));

        let (mut data_receiver, control_sender) = start_block_stream(config, None).await.unwrap();
        control_sender.send(StreamCommand::Start).await.unwrap();

        for _ in 0..3 {
            let block = tokio::time::timeout(Duration::from_secs(2), data_receiver.recv())
                .await
                .expect("no block within 2s")
                .unwrap();
            assert_eq!(block.shape(), (2, 50));
            assert_eq!(block.sampling_rate(), 1000.0);
        }

        control_sender.send(StreamCommand::Stop).await.unwrap();
    }

    #[tokio::test]
    async fn test_pause_stops_delivery() {
        let mut stream = BlockStream::new(fast_config()).unwrap();
        let mut data_receiver = stream.subscribe();
        let control = stream.control_handle();
        let stats = stream.stats_handle();
        let task = tokio::spawn(async move { stream.run().await });

        control.send(StreamCommand::Start).await.unwrap();
        sleep(Duration::from_millis(180)).await;
        control.send(StreamCommand::Pause).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        while data_receiver.try_recv().is_ok() {}

        sleep(Duration::from_millis(150)).await;
        assert!(data_receiver.try_recv().is_err());
        assert!(!stats.lock().await.is_running);
        assert!(stats.lock().await.blocks_generated >= 2);

        drop(control);
        task.await.unwrap().unwrap();
    }
}
