//! CLS-Core: shared types for closed-loop stimulation
//!
//! Multichannel block buffers, the stimulus instruction wire format, the
//! generic state machine and the workspace error type.

pub mod buffer;
pub mod error;
pub mod instruction;
pub mod state_machine;

pub use buffer::*;
pub use error::{ClsError, ClsResult};
pub use instruction::*;
pub use state_machine::{Action, StateMachine, StateMachineBuilder};
