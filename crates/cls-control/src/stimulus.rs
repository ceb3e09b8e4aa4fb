//! Stimulus controller: instruction programs and triggers over a transport

use cls_core::{
    ClsError, ClsResult, DeviceFeedback, FeedbackReceiver, Instruction, InstructionCodec, StimulusTransport,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Which flicker outputs follow the closed-loop frequency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusConfig {
    #[serde(default = "enabled")]
    pub left: bool,
    #[serde(default = "enabled")]
    pub right: bool,
    #[serde(default)]
    pub audio: bool,
    /// Device-side pause before and after each trigger, in microseconds
    #[serde(default = "default_trigger_sleep_us")]
    pub trigger_sleep_us: u64,
    /// Ask the device to report completion after each program
    #[serde(default)]
    pub request_feedback: bool,
}

fn enabled() -> bool {
    true
}

fn default_trigger_sleep_us() -> u64 {
    500
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            left: true,
            right: true,
            audio: false,
            trigger_sleep_us: default_trigger_sleep_us(),
            request_feedback: false,
        }
    }
}

impl StimulusConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if !(self.left || self.right || self.audio) {
            return Err(cls_core::config_error!("at least one stimulus output must be enabled"));
        }
        if i32::try_from(self.trigger_sleep_us).is_err() {
            return Err(cls_core::config_error!("trigger sleep of {} us does not fit a record", self.trigger_sleep_us));
        }
        Ok(())
    }

    /// Instructions setting every enabled output to `frequency`
    pub fn frequency_program(&self, frequency: f64) -> Vec<Instruction> {
        let frequency = frequency as f32;
        let mut program = Vec::with_capacity(4);
        if self.left {
            program.push(Instruction::SetLeftFrequency(frequency));
        }
        if self.right {
            program.push(Instruction::SetRightFrequency(frequency));
        }
        if self.audio {
            program.push(Instruction::SetAudioFrequency(frequency));
        }
        if self.request_feedback {
            program.push(Instruction::SendFeedback(true));
        }
        program
    }
}

pub struct StimulusController {
    transport: Box<dyn StimulusTransport>,
    codec: InstructionCodec,
    config: StimulusConfig,
    feedback: Option<FeedbackReceiver>,
    frequency: f64,
    bytes_written: usize,
}

impl StimulusController {
    pub fn new(transport: Box<dyn StimulusTransport>, config: StimulusConfig) -> ClsResult<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            codec: InstructionCodec::default(),
            config,
            feedback: None,
            frequency: 0.0,
            bytes_written: 0,
        })
    }

    pub fn with_codec(mut self, codec: InstructionCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Open the transport and start listening for feedback
    pub fn start(&mut self) -> ClsResult<()> {
        if self.transport.is_open() {
            return Ok(());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.open(tx).map_err(|e| match e {
            ClsError::DeviceError { .. } => e,
            other => cls_core::device_error!("cannot open stimulus transport: {}", other),
        })?;
        self.feedback = Some(rx);
        tracing::info!(codec = ?self.codec.version(), "stimulus transport opened");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Frequency most recently programmed
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn write(&mut self, bytes: &[u8]) -> ClsResult<()> {
        if !self.transport.is_open() {
            return Err(cls_core::device_error!("stimulus transport is not open"));
        }
        self.transport.write(bytes)?;
        self.bytes_written += bytes.len();
        Ok(())
    }

    /// Emit a trigger byte
    ///
    /// With a settle time configured the trigger goes out as one batch
    /// `SleepUs, Trigger, SleepUs`, so the pause happens on the device and the
    /// caller never blocks.
    pub fn send_trigger(&mut self, trigger: u8) -> ClsResult<()> {
        let settle = i32::try_from(self.config.trigger_sleep_us).unwrap_or(i32::MAX);
        let bytes = if settle > 0 {
            self.codec.encode_program(&[
                Instruction::SleepUs(settle),
                Instruction::Trigger(trigger),
                Instruction::SleepUs(settle),
            ])?
        } else {
            self.codec.encode(&Instruction::Trigger(trigger)).to_vec()
        };
        self.write(&bytes)?;
        tracing::trace!(trigger, "trigger sent");
        Ok(())
    }

    /// Program every enabled output to `frequency` as one atomic batch
    pub fn set_frequency(&mut self, frequency: f64) -> ClsResult<()> {
        let program = self.config.frequency_program(frequency);
        self.send_program(&program)?;
        self.frequency = frequency;
        Ok(())
    }

    /// Stop flickering on every enabled output
    pub fn silence(&mut self) -> ClsResult<()> {
        self.set_frequency(0.0)
    }

    pub fn send_program(&mut self, program: &[Instruction]) -> ClsResult<()> {
        let bytes = self.codec.encode_program(program)?;
        self.write(&bytes)
    }

    pub fn reset(&mut self) -> ClsResult<()> {
        let record = self.codec.encode(&Instruction::Reset);
        self.write(&record)?;
        self.frequency = 0.0;
        Ok(())
    }

    /// Status bytes received since the last poll, decoded
    ///
    /// A byte outside the known statuses is reported as `Error`.
    pub fn poll_feedback(&mut self) -> Vec<DeviceFeedback> {
        let mut received = Vec::new();
        if let Some(rx) = self.feedback.as_mut() {
            while let Ok(byte) = rx.try_recv() {
                match DeviceFeedback::from_byte(byte) {
                    Ok(feedback) => received.push(feedback),
                    Err(e) => {
                        tracing::error!(byte, error = %e, "unrecognised device status");
                        received.push(DeviceFeedback::Error);
                    }
                }
            }
        }
        received
    }

    /// Silence the outputs and close the transport
    pub fn stop(&mut self) -> ClsResult<()> {
        if !self.transport.is_open() {
            return Ok(());
        }
        self.silence()?;
        self.transport.close()?;
        self.feedback = None;
        tracing::info!(bytes_written = self.bytes_written, "stimulus transport closed");
        Ok(())
    }
}
