//! Simulated flicker stimulator speaking the instruction wire format

use cls_core::{
    ClsError, ClsResult, DeviceFeedback, FeedbackSender, Instruction, InstructionCodec, StimulusTransport,
    INSTRUCTION_SIZE,
};
use std::sync::{Arc, Mutex, MutexGuard};

/// Output state of the simulated device
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StimulatorState {
    pub left_frequency: f32,
    pub right_frequency: f32,
    pub audio_frequency: f32,
    pub audio_tone: Option<(i16, i16)>,
    pub triggers: Vec<u8>,
    /// Instructions in the order they took effect
    pub executed: Vec<Instruction>,
    pub batches: usize,
    pub resets: usize,
}

impl StimulatorState {
    /// Visual flicker frequency, preferring the left output
    pub fn flicker_frequency(&self) -> f64 {
        if self.left_frequency > 0.0 {
            self.left_frequency as f64
        } else {
            self.right_frequency as f64
        }
    }

    fn apply(&mut self, instruction: Instruction, feedback: Option<&FeedbackSender>) {
        match instruction {
            Instruction::SetLeftFrequency(f) => self.left_frequency = f,
            Instruction::SetRightFrequency(f) => self.right_frequency = f,
            Instruction::SetAudioFrequency(f) => self.audio_frequency = f,
            Instruction::SetAudioTone { frequency, volume } => self.audio_tone = Some((frequency, volume)),
            Instruction::Trigger(t) => self.triggers.push(t),
            Instruction::SleepMs(_) | Instruction::SleepUs(_) | Instruction::Await(_) => {}
            Instruction::Reset => {
                self.left_frequency = 0.0;
                self.right_frequency = 0.0;
                self.audio_frequency = 0.0;
                self.audio_tone = None;
                self.resets += 1;
            }
            Instruction::SendFeedback(true) => {
                if let Some(tx) = feedback {
                    let _ = tx.send(DeviceFeedback::StimulationComplete.to_byte());
                }
            }
            Instruction::SendFeedback(false) => {}
        }
        self.executed.push(instruction);
    }
}

/// Cloneable view of a [`SimulatedStimulator`]
#[derive(Clone, Default)]
pub struct StimulatorHandle {
    state: Arc<Mutex<StimulatorState>>,
    feedback: Arc<Mutex<Option<FeedbackSender>>>,
}

impl StimulatorHandle {
    fn lock(&self) -> MutexGuard<'_, StimulatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn snapshot(&self) -> StimulatorState {
        self.lock().clone()
    }

    pub fn flicker_frequency(&self) -> f64 {
        self.lock().flicker_frequency()
    }

    pub fn triggers(&self) -> Vec<u8> {
        self.lock().triggers.clone()
    }

    /// Report a device error on the feedback channel
    pub fn inject_error(&self) -> bool {
        self.inject_status(DeviceFeedback::Error.to_byte())
    }

    /// Put an arbitrary status byte on the feedback channel
    ///
    /// False when the device is not open.
    pub fn inject_status(&self, byte: u8) -> bool {
        let feedback = self.feedback.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match feedback.as_ref() {
            Some(tx) => tx.send(byte).is_ok(),
            None => false,
        }
    }
}

/// In-process stimulus device
///
/// An `Await(n)` record holds the next `n` records back and executes them
/// together once the last one has arrived. Records may be split across
/// writes.
pub struct SimulatedStimulator {
    codec: InstructionCodec,
    handle: StimulatorHandle,
    partial: Vec<u8>,
    awaiting: usize,
    batch: Vec<Instruction>,
    open: bool,
    refuse_open: bool,
    ack_writes: bool,
}

impl SimulatedStimulator {
    pub fn new() -> Self {
        Self {
            codec: InstructionCodec::default(),
            handle: StimulatorHandle::default(),
            partial: Vec::new(),
            awaiting: 0,
            batch: Vec::new(),
            open: false,
            refuse_open: false,
            ack_writes: false,
        }
    }

    /// Device that cannot be opened, as when no port is present
    pub fn unavailable() -> Self {
        Self { refuse_open: true, ..Self::new() }
    }

    /// Answer every completed batch with an `Ok` status byte
    pub fn with_acknowledgements(mut self) -> Self {
        self.ack_writes = true;
        self
    }

    pub fn handle(&self) -> StimulatorHandle {
        self.handle.clone()
    }

    fn feedback(&self) -> Option<FeedbackSender> {
        self.handle.feedback.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    fn execute(&mut self, instructions: Vec<Instruction>) {
        let feedback = self.feedback();
        {
            let mut state = self.handle.lock();
            for instruction in instructions {
                state.apply(instruction, feedback.as_ref());
            }
            state.batches += 1;
        }
        if self.ack_writes {
            if let Some(tx) = feedback {
                let _ = tx.send(DeviceFeedback::Ok.to_byte());
            }
        }
    }

    fn receive(&mut self, instruction: Instruction) -> ClsResult<()> {
        if self.awaiting > 0 {
            if let Instruction::Await(_) = instruction {
                return Err(cls_core::device_error!("nested await inside a pending batch"));
            }
            self.batch.push(instruction);
            self.awaiting -= 1;
            if self.awaiting == 0 {
                let batch = std::mem::take(&mut self.batch);
                self.execute(batch);
            }
            return Ok(());
        }

        match instruction {
            Instruction::Await(n) if n > 0 => {
                self.awaiting = n as usize;
                self.handle.lock().executed.push(instruction);
            }
            Instruction::Await(_) => {}
            other => self.execute(vec![other]),
        }
        Ok(())
    }
}

impl Default for SimulatedStimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl StimulusTransport for SimulatedStimulator {
    fn open(&mut self, feedback: FeedbackSender) -> ClsResult<()> {
        if self.refuse_open {
            return Err(cls_core::device_error!("simulated stimulator unavailable"));
        }
        *self.handle.feedback.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(feedback);
        self.open = true;
        tracing::debug!("simulated stimulator opened");
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> ClsResult<()> {
        if !self.open {
            return Err(ClsError::DeviceError { reason: "simulated stimulator is closed".to_string() });
        }
        self.partial.extend_from_slice(bytes);
        let whole = self.partial.len() / INSTRUCTION_SIZE * INSTRUCTION_SIZE;
        let records: Vec<u8> = self.partial.drain(..whole).collect();
        for instruction in self.codec.decode_all(&records)? {
            self.receive(instruction)?;
        }
        Ok(())
    }

    fn close(&mut self) -> ClsResult<()> {
        self.open = false;
        self.partial.clear();
        self.batch.clear();
        self.awaiting = 0;
        *self.handle.feedback.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
