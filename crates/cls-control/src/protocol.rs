//! Trial protocol: phase sequencing, triggers and closed-loop updates
//!
//! One [`Protocol::on_block`] call per acquired block advances block-count
//! timeouts. Every phase entry emits its trigger byte. During stimulation the
//! controller is asked for a new frequency every `update_interval` blocks.

use crate::controller::{ClosedLoopController, ControllerUpdate};
use crate::stimulus::StimulusController;
use crate::strategy::{BlockType, ResultTag};
use crate::trial_log::{TrialLogRow, TrialSink};
use cls_core::{ClsError, ClsResult, DeviceFeedback, StateMachine};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Intertrial,
    Await,
    Mask,
    Prestimulus,
    Stimulation,
    Poststimulus,
    PostMask,
    Fault,
}

impl Phase {
    const RUNNING: [Phase; 7] = [
        Phase::Intertrial,
        Phase::Await,
        Phase::Mask,
        Phase::Prestimulus,
        Phase::Stimulation,
        Phase::Poststimulus,
        Phase::PostMask,
    ];

    pub fn is_running(&self) -> bool {
        Self::RUNNING.contains(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolEvent {
    Start,
    Timeout,
    /// Last trial completed
    Finished,
    /// External response such as a button press
    Response,
    DeviceFault,
    Stop,
}

/// Phase durations in blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimeouts {
    pub intertrial: u32,
    pub mask: u32,
    pub prestimulus: u32,
    pub stimulation: u32,
    pub poststimulus: u32,
    pub post_mask: u32,
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            intertrial: 4,
            mask: 2,
            prestimulus: 10,
            stimulation: 60,
            poststimulus: 10,
            post_mask: 2,
        }
    }
}

/// Trigger byte emitted on entry to each phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTriggers {
    pub intertrial: u8,
    pub await_response: u8,
    pub mask: u8,
    pub prestimulus: u8,
    pub stimulation: u8,
    pub poststimulus: u8,
    pub post_mask: u8,
    pub fault: u8,
}

impl Default for PhaseTriggers {
    fn default() -> Self {
        Self {
            intertrial: 1,
            await_response: 2,
            mask: 3,
            prestimulus: 4,
            stimulation: 5,
            poststimulus: 6,
            post_mask: 7,
            fault: 255,
        }
    }
}

impl PhaseTriggers {
    pub fn for_phase(&self, phase: Phase) -> Option<u8> {
        match phase {
            Phase::Idle => None,
            Phase::Intertrial => Some(self.intertrial),
            Phase::Await => Some(self.await_response),
            Phase::Mask => Some(self.mask),
            Phase::Prestimulus => Some(self.prestimulus),
            Phase::Stimulation => Some(self.stimulation),
            Phase::Poststimulus => Some(self.poststimulus),
            Phase::PostMask => Some(self.post_mask),
            Phase::Fault => Some(self.fault),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolConfig {
    pub trials: u32,
    /// Duration of one acquired block
    pub block_period_ms: u64,
    /// Wait for a response event before each trial's mask
    #[serde(default)]
    pub self_initiated: bool,
    #[serde(default)]
    pub timeouts: PhaseTimeouts,
    #[serde(default)]
    pub triggers: PhaseTriggers,
    /// Blocks between closed-loop updates during stimulation
    pub update_interval: u32,
    pub initial_frequency: f64,
    /// Start each trial from the previous trial's final frequency
    #[serde(default)]
    pub carry_frequency: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            trials: 10,
            block_period_ms: 500,
            self_initiated: false,
            timeouts: PhaseTimeouts::default(),
            triggers: PhaseTriggers::default(),
            update_interval: 4,
            initial_frequency: 40.0,
            carry_frequency: false,
        }
    }
}

impl ProtocolConfig {
    pub fn validate(&self) -> ClsResult<()> {
        if self.trials == 0 {
            return Err(cls_core::config_error!("protocol needs at least one trial"));
        }
        if self.block_period_ms == 0 {
            return Err(cls_core::config_error!("block period must be positive"));
        }
        if self.update_interval == 0 {
            return Err(cls_core::config_error!("update interval must be positive"));
        }
        if self.timeouts.stimulation == 0 {
            return Err(cls_core::config_error!("stimulation must last at least one block"));
        }
        if !(self.initial_frequency > 0.0) {
            return Err(cls_core::config_error!(
                "initial frequency must be positive, got {}",
                self.initial_frequency
            ));
        }
        Ok(())
    }

    /// Block-count timeout of a phase; `None` for phases left only on events
    pub fn timeout(&self, phase: Phase) -> Option<u32> {
        match phase {
            Phase::Intertrial => Some(self.timeouts.intertrial),
            Phase::Mask => Some(self.timeouts.mask),
            Phase::Prestimulus => Some(self.timeouts.prestimulus),
            Phase::Stimulation => Some(self.timeouts.stimulation),
            Phase::Poststimulus => Some(self.timeouts.poststimulus),
            Phase::PostMask => Some(self.timeouts.post_mask),
            Phase::Idle | Phase::Await | Phase::Fault => None,
        }
    }
}

/// Everything the phase actions touch
pub struct ProtocolContext {
    config: ProtocolConfig,
    controller: ClosedLoopController,
    stimulus: StimulusController,
    log: Option<Box<dyn TrialSink>>,
    stop: Arc<AtomicBool>,
    trial: u32,
    phase_blocks: u32,
    update_blocks: u32,
    total_blocks: u64,
    frequency: f64,
    /// Updates of the current trial's stimulation only
    updates: Vec<ControllerUpdate>,
    total_updates: u64,
}

impl ProtocolContext {
    fn enter(&mut self, phase: Phase) -> ClsResult<()> {
        self.phase_blocks = 0;
        if let Some(trigger) = self.config.triggers.for_phase(phase) {
            self.stimulus.send_trigger(trigger)?;
        }
        tracing::info!(trial = self.trial, phase = ?phase, "phase entered");
        Ok(())
    }

    fn log_row(&mut self, update: &ControllerUpdate) -> ClsResult<()> {
        if let Some(log) = self.log.as_mut() {
            log.record(&TrialLogRow::from_update(self.trial, self.phase_blocks as u64, update))?;
        }
        Ok(())
    }

    fn begin_stimulation(&mut self) -> ClsResult<()> {
        if !self.config.carry_frequency || self.trial <= 1 {
            self.frequency = self.config.initial_frequency;
        }
        self.update_blocks = 0;
        self.updates.clear();
        self.stimulus.set_frequency(self.frequency)?;
        let start = ControllerUpdate {
            old_frequency: self.frequency,
            new_frequency: self.frequency,
            block_type: BlockType::Tracking,
            tag: ResultTag::Start,
        };
        self.log_row(&start)
    }

    fn update_tick(&mut self) -> ClsResult<()> {
        let update = self.controller.update(self.frequency, self.phase_blocks as u64)?;
        if update.changed() {
            self.stimulus.set_frequency(update.new_frequency)?;
        }
        self.frequency = update.new_frequency;
        self.log_row(&update)?;
        self.updates.push(update);
        self.total_updates += 1;
        Ok(())
    }

    fn halt(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn build_machine(self_initiated: bool) -> StateMachine<Phase, ProtocolEvent, ProtocolContext> {
    let after_intertrial = if self_initiated { Phase::Await } else { Phase::Mask };

    let mut builder = StateMachine::builder(Phase::Idle)
        .transition_with(Phase::Idle, ProtocolEvent::Start, Phase::Intertrial, |ctx: &mut ProtocolContext| {
            ctx.trial = 0;
            ctx.total_blocks = 0;
            ctx.frequency = ctx.config.initial_frequency;
            ctx.updates.clear();
            ctx.total_updates = 0;
            ctx.controller.reset();
            ctx.stop.store(false, Ordering::SeqCst);
            tracing::info!(trials = ctx.config.trials, "protocol started");
            Ok(())
        })
        .transition(Phase::Intertrial, ProtocolEvent::Timeout, after_intertrial)
        .transition(Phase::Await, ProtocolEvent::Response, Phase::Mask)
        .transition(Phase::Mask, ProtocolEvent::Timeout, Phase::Prestimulus)
        .transition(Phase::Prestimulus, ProtocolEvent::Timeout, Phase::Stimulation)
        .transition(Phase::Stimulation, ProtocolEvent::Timeout, Phase::Poststimulus)
        .transition(Phase::Poststimulus, ProtocolEvent::Timeout, Phase::PostMask)
        .transition(Phase::PostMask, ProtocolEvent::Timeout, Phase::Intertrial)
        .transition(Phase::PostMask, ProtocolEvent::Finished, Phase::Idle)
        .transition(Phase::Fault, ProtocolEvent::Stop, Phase::Idle)
        .on_enter(Phase::Intertrial, |ctx: &mut ProtocolContext| {
            ctx.trial += 1;
            ctx.enter(Phase::Intertrial)
        })
        .on_enter(Phase::Await, |ctx: &mut ProtocolContext| ctx.enter(Phase::Await))
        .on_enter(Phase::Mask, |ctx: &mut ProtocolContext| ctx.enter(Phase::Mask))
        .on_enter(Phase::Prestimulus, |ctx: &mut ProtocolContext| {
            ctx.controller.reset_baseline();
            ctx.enter(Phase::Prestimulus)
        })
        .on_enter(Phase::Stimulation, |ctx: &mut ProtocolContext| {
            ctx.enter(Phase::Stimulation)?;
            ctx.begin_stimulation()
        })
        .on_exit(Phase::Stimulation, |ctx: &mut ProtocolContext| ctx.stimulus.silence())
        .on_enter(Phase::Poststimulus, |ctx: &mut ProtocolContext| ctx.enter(Phase::Poststimulus))
        .on_enter(Phase::PostMask, |ctx: &mut ProtocolContext| ctx.enter(Phase::PostMask))
        .on_enter(Phase::Idle, |ctx: &mut ProtocolContext| {
            ctx.halt();
            tracing::info!(trials = ctx.trial, blocks = ctx.total_blocks, "protocol finished");
            Ok(())
        })
        .on_enter(Phase::Fault, |ctx: &mut ProtocolContext| {
            ctx.halt();
            tracing::error!(trial = ctx.trial, frequency = ctx.frequency, "stimulus device reported an error");
            ctx.stimulus.reset()?;
            if let Some(trigger) = ctx.config.triggers.for_phase(Phase::Fault) {
                ctx.stimulus.send_trigger(trigger)?;
            }
            Ok(())
        });

    for phase in Phase::RUNNING {
        builder = builder
            .transition(phase, ProtocolEvent::Stop, Phase::Idle)
            .transition(phase, ProtocolEvent::DeviceFault, Phase::Fault);
    }
    builder.build()
}

/// Trial protocol driven by block arrivals
pub struct Protocol {
    machine: StateMachine<Phase, ProtocolEvent, ProtocolContext>,
    ctx: ProtocolContext,
}

impl Protocol {
    /// Fails when the protocol's block period differs from the stream's polling period
    pub fn new(
        config: ProtocolConfig,
        controller: ClosedLoopController,
        stimulus: StimulusController,
        log: Option<Box<dyn TrialSink>>,
        stream_period_ms: u64,
    ) -> ClsResult<Self> {
        config.validate()?;
        if config.block_period_ms != stream_period_ms {
            return Err(ClsError::PollingPeriodMismatch {
                protocol_ms: config.block_period_ms,
                stream_ms: stream_period_ms,
            });
        }

        let machine = build_machine(config.self_initiated);
        let frequency = config.initial_frequency;
        Ok(Self {
            machine,
            ctx: ProtocolContext {
                config,
                controller,
                stimulus,
                log,
                stop: Arc::new(AtomicBool::new(false)),
                trial: 0,
                phase_blocks: 0,
                update_blocks: 0,
                total_blocks: 0,
                frequency,
                updates: Vec::new(),
                total_updates: 0,
            },
        })
    }

    pub fn phase(&self) -> Phase {
        self.machine.current()
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    /// 1-based index of the current trial
    pub fn trial(&self) -> u32 {
        self.ctx.trial
    }

    pub fn frequency(&self) -> f64 {
        self.ctx.frequency
    }

    pub fn total_blocks(&self) -> u64 {
        self.ctx.total_blocks
    }

    /// Controller updates of the latest stimulation phase
    pub fn updates(&self) -> &[ControllerUpdate] {
        &self.ctx.updates
    }

    /// Controller updates across the whole run
    pub fn total_updates(&self) -> u64 {
        self.ctx.total_updates
    }

    pub fn stimulus(&self) -> &StimulusController {
        &self.ctx.stimulus
    }

    /// Flag raised when the run ends, for the block loop to observe
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.ctx.stop.clone()
    }

    fn fire(&mut self, event: ProtocolEvent) -> ClsResult<bool> {
        self.machine.process_event(event, &mut self.ctx)
    }

    /// Open the stimulus transport and enter the first trial
    pub fn start(&mut self) -> ClsResult<()> {
        self.ctx.stimulus.start()?;
        self.fire(ProtocolEvent::Start)?;
        Ok(())
    }

    /// Deliver an external response; ignored outside `Await`
    pub fn respond(&mut self) -> ClsResult<bool> {
        self.fire(ProtocolEvent::Response)
    }

    /// Abort the run and silence the stimulus
    pub fn stop(&mut self) -> ClsResult<()> {
        let was_stimulating = self.phase() == Phase::Stimulation;
        self.fire(ProtocolEvent::Stop)?;
        if !was_stimulating && self.ctx.stimulus.is_open() {
            self.ctx.stimulus.silence()?;
        }
        Ok(())
    }

    /// Silence and close the stimulus transport once the run is over
    pub fn close(&mut self) -> ClsResult<()> {
        if self.is_running() {
            self.stop()?;
        }
        if self.ctx.stimulus.is_open() {
            self.ctx.stimulus.stop()?;
        }
        Ok(())
    }

    /// Advance the protocol by one acquired block
    pub fn on_block(&mut self) -> ClsResult<()> {
        if !self.is_running() {
            return Ok(());
        }

        let feedback = self.ctx.stimulus.poll_feedback();
        if feedback.contains(&DeviceFeedback::Error) {
            self.fire(ProtocolEvent::DeviceFault)?;
            return Ok(());
        }

        self.ctx.phase_blocks += 1;
        self.ctx.total_blocks += 1;

        let phase = self.phase();
        match phase {
            Phase::Prestimulus => self.ctx.controller.accumulate_baseline()?,
            Phase::Stimulation => {
                self.ctx.update_blocks += 1;
                if self.ctx.update_blocks >= self.ctx.config.update_interval {
                    self.ctx.update_blocks = 0;
                    self.ctx.update_tick()?;
                }
            }
            _ => {}
        }

        if let Some(limit) = self.ctx.config.timeout(phase) {
            if self.ctx.phase_blocks >= limit {
                let event = if phase == Phase::PostMask && self.ctx.trial >= self.ctx.config.trials {
                    ProtocolEvent::Finished
                } else {
                    ProtocolEvent::Timeout
                };
                self.fire(event)?;
            }
        }
        Ok(())
    }
}
