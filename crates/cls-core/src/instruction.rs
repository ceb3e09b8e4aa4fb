//! Stimulus device instructions and their binary wire format
//!
//! Every instruction is an 8-byte little-endian record `{command: i32,
//! parameter: i32}`. The parameter is reinterpreted per command: an `f32`
//! bit pattern for frequencies, two packed `i16` for audio tones, a byte for
//! triggers, and a plain integer for sleeps and batch counts.

use crate::error::{ClsError, ClsResult};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Size of one encoded instruction in bytes
pub const INSTRUCTION_SIZE: usize = 8;

/// Instruction understood by the stimulus device
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    SetLeftFrequency(f32),
    SetRightFrequency(f32),
    SetAudioFrequency(f32),
    SetAudioTone { frequency: i16, volume: i16 },
    Trigger(u8),
    SleepMs(i32),
    SleepUs(i32),
    /// Buffer the next `n` instructions and execute them as one batch
    Await(i32),
    Reset,
    SendFeedback(bool),
}

impl Instruction {
    /// Numeric command identifier on the wire
    pub fn command_id(&self) -> i32 {
        match self {
            Instruction::SetLeftFrequency(_) => 0,
            Instruction::SetRightFrequency(_) => 1,
            Instruction::SetAudioFrequency(_) => 2,
            Instruction::SetAudioTone { .. } => 3,
            Instruction::Trigger(_) => 4,
            Instruction::SleepMs(_) => 5,
            Instruction::SleepUs(_) => 6,
            Instruction::Await(_) => 7,
            Instruction::Reset => 8,
            Instruction::SendFeedback(_) => 9,
        }
    }

    fn parameter(&self) -> i32 {
        match *self {
            Instruction::SetLeftFrequency(f)
            | Instruction::SetRightFrequency(f)
            | Instruction::SetAudioFrequency(f) => f.to_bits() as i32,
            Instruction::SetAudioTone { frequency, volume } => {
                (frequency as u16 as u32 | ((volume as u16 as u32) << 16)) as i32
            }
            Instruction::Trigger(value) => value as i32,
            Instruction::SleepMs(v) | Instruction::SleepUs(v) | Instruction::Await(v) => v,
            Instruction::Reset => 0,
            Instruction::SendFeedback(enabled) => enabled as i32,
        }
    }

    fn from_parts(command: i32, parameter: i32) -> ClsResult<Self> {
        let bits = parameter as u32;
        let instruction = match command {
            0 => Instruction::SetLeftFrequency(f32::from_bits(bits)),
            1 => Instruction::SetRightFrequency(f32::from_bits(bits)),
            2 => Instruction::SetAudioFrequency(f32::from_bits(bits)),
            3 => Instruction::SetAudioTone {
                frequency: (bits & 0xFFFF) as u16 as i16,
                volume: (bits >> 16) as u16 as i16,
            },
            4 => Instruction::Trigger((bits & 0xFF) as u8),
            5 => Instruction::SleepMs(parameter),
            6 => Instruction::SleepUs(parameter),
            7 => Instruction::Await(parameter),
            8 => Instruction::Reset,
            9 => Instruction::SendFeedback(parameter != 0),
            other => {
                return Err(ClsError::CodecError {
                    reason: format!("unknown command id {}", other),
                })
            }
        };
        Ok(instruction)
    }
}

/// Wire format revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CodecVersion {
    #[default]
    V1,
}

/// Encoder/decoder for instruction records
#[derive(Debug, Clone, Copy, Default)]
pub struct InstructionCodec {
    version: CodecVersion,
}

impl InstructionCodec {
    pub const fn new(version: CodecVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> CodecVersion {
        self.version
    }

    /// Encode a single instruction
    pub fn encode(&self, instruction: &Instruction) -> [u8; INSTRUCTION_SIZE] {
        match self.version {
            CodecVersion::V1 => {
                let mut out = [0u8; INSTRUCTION_SIZE];
                out[..4].copy_from_slice(&instruction.command_id().to_le_bytes());
                out[4..].copy_from_slice(&instruction.parameter().to_le_bytes());
                out
            }
        }
    }

    /// Decode a single 8-byte record
    pub fn decode(&self, bytes: &[u8]) -> ClsResult<Instruction> {
        if bytes.len() != INSTRUCTION_SIZE {
            return Err(ClsError::CodecError {
                reason: format!("record must be {} bytes, got {}", INSTRUCTION_SIZE, bytes.len()),
            });
        }
        match self.version {
            CodecVersion::V1 => {
                let command = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                let parameter = i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                Instruction::from_parts(command, parameter)
            }
        }
    }

    /// Encode several instructions back to back, without framing
    pub fn encode_all(&self, instructions: &[Instruction]) -> Vec<u8> {
        let mut out = Vec::with_capacity(instructions.len() * INSTRUCTION_SIZE);
        for instruction in instructions {
            out.extend_from_slice(&self.encode(instruction));
        }
        out
    }

    /// Encode a batched program: one `Await(n)` followed by the `n` instructions
    pub fn encode_program(&self, instructions: &[Instruction]) -> ClsResult<Vec<u8>> {
        let count = i32::try_from(instructions.len()).map_err(|_| ClsError::CodecError {
            reason: format!("program of {} instructions is too long", instructions.len()),
        })?;
        let mut out = Vec::with_capacity((instructions.len() + 1) * INSTRUCTION_SIZE);
        out.extend_from_slice(&self.encode(&Instruction::Await(count)));
        out.extend_from_slice(&self.encode_all(instructions));
        Ok(out)
    }

    /// Decode a byte stream made of whole records
    pub fn decode_all(&self, bytes: &[u8]) -> ClsResult<Vec<Instruction>> {
        if bytes.len() % INSTRUCTION_SIZE != 0 {
            return Err(ClsError::CodecError {
                reason: format!("stream length {} is not a multiple of {}", bytes.len(), INSTRUCTION_SIZE),
            });
        }
        bytes.chunks_exact(INSTRUCTION_SIZE).map(|chunk| self.decode(chunk)).collect()
    }
}

/// Status byte sent back by the stimulus device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceFeedback {
    Ok,
    StimulationComplete,
    Error,
}

impl DeviceFeedback {
    pub fn from_byte(byte: u8) -> ClsResult<Self> {
        match byte {
            0 => Ok(DeviceFeedback::Ok),
            1 => Ok(DeviceFeedback::StimulationComplete),
            2 => Ok(DeviceFeedback::Error),
            other => Err(ClsError::CodecError {
                reason: format!("unknown feedback byte {}", other),
            }),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            DeviceFeedback::Ok => 0,
            DeviceFeedback::StimulationComplete => 1,
            DeviceFeedback::Error => 2,
        }
    }
}

/// Channel end on which a transport delivers raw status bytes
///
/// Bytes are forwarded exactly as the device sent them and decoded with
/// [`DeviceFeedback::from_byte`] on the receiving side.
pub type FeedbackSender = mpsc::UnboundedSender<u8>;
pub type FeedbackReceiver = mpsc::UnboundedReceiver<u8>;

/// Byte stream to a stimulus device
///
/// Writes are fire-and-forget. Status bytes arrive asynchronously on the
/// sender handed over in [`StimulusTransport::open`].
pub trait StimulusTransport: Send {
    /// Open the device, keeping `feedback` for status bytes
    fn open(&mut self, feedback: FeedbackSender) -> ClsResult<()>;

    /// Write encoded instruction bytes
    fn write(&mut self, bytes: &[u8]) -> ClsResult<()>;

    fn close(&mut self) -> ClsResult<()>;

    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequency_encoding_layout() {
        let codec = InstructionCodec::default();
        let bytes = codec.encode(&Instruction::SetLeftFrequency(40.0));

        assert_eq!(&bytes[..4], &0i32.to_le_bytes());
        assert_eq!(&bytes[4..], &40.0f32.to_bits().to_le_bytes());
    }

    #[test]
    fn test_every_command_decodes() {
        let codec = InstructionCodec::new(CodecVersion::V1);
        let all = [
            Instruction::SetLeftFrequency(12.5),
            Instruction::SetRightFrequency(80.0),
            Instruction::SetAudioFrequency(440.0),
            Instruction::SetAudioTone { frequency: 1000, volume: -3 },
            Instruction::Trigger(0xAB),
            Instruction::SleepMs(5),
            Instruction::SleepUs(250),
            Instruction::Await(3),
            Instruction::Reset,
            Instruction::SendFeedback(true),
        ];

        for (id, instruction) in all.iter().enumerate() {
            let bytes = codec.encode(instruction);
            assert_eq!(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), id as i32);
            assert_eq!(codec.decode(&bytes).unwrap(), *instruction);
        }
    }

    #[test]
    fn test_trigger_uses_low_byte() {
        let codec = InstructionCodec::default();
        let bytes = codec.encode(&Instruction::Trigger(7));
        assert_eq!(&bytes[4..], &[7, 0, 0, 0]);
    }

    #[test]
    fn test_program_is_prefixed_with_await() {
        let codec = InstructionCodec::default();
        let program = [Instruction::SetLeftFrequency(30.0), Instruction::SetRightFrequency(30.0)];
        let bytes = codec.encode_program(&program).unwrap();

        assert_eq!(bytes.len(), 3 * INSTRUCTION_SIZE);
        let decoded = codec.decode_all(&bytes).unwrap();
        assert_eq!(decoded[0], Instruction::Await(2));
        assert_eq!(&decoded[1..], &program);
    }

    #[test]
    fn test_unknown_command_rejected() {
        let codec = InstructionCodec::default();
        let mut bytes = [0u8; INSTRUCTION_SIZE];
        bytes[..4].copy_from_slice(&42i32.to_le_bytes());

        assert!(matches!(codec.decode(&bytes), Err(ClsError::CodecError { .. })));
        assert!(codec.decode(&bytes[..5]).is_err());
        assert!(codec.decode_all(&[0u8; 9]).is_err());
    }

    #[test]
    fn test_feedback_bytes() {
        for feedback in [DeviceFeedback::Ok, DeviceFeedback::StimulationComplete, DeviceFeedback::Error] {
            assert_eq!(DeviceFeedback::from_byte(feedback.to_byte()).unwrap(), feedback);
        }
        assert!(DeviceFeedback::from_byte(9).is_err());
    }
}
