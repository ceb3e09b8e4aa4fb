use cls_control::{
    find_peak, get_1d_power_spectrum, ClosedLoopController, FrequencyRange, PeakConfig, Phase, Protocol,
    ProtocolConfig, PhaseTimeouts, PhaseTriggers, ResultTag, SpectrumConfig, StimulusConfig, StimulusController,
    StrategyConfig, TrialLog,
};
use cls_core::{ClsResult, FeedbackSender, StimulusTransport};
use cls_processing::{FilterConfig, PipeConfig, ProcessingConfig, ProcessingSetup};
use std::f64::consts::PI;
use std::io::Write;
use std::sync::{Arc, Mutex};

const FS: f64 = 1000.0;
const BLOCK: usize = 500;
const CHANNELS: usize = 3;

fn setup() -> ProcessingSetup {
    let mut config = ProcessingConfig::lfp_tracking(CHANNELS, FS, BLOCK);
    if let PipeConfig::Filter { filter, .. } = &mut config.pipes[0] {
        *filter = FilterConfig::bandpass(30.0, 80.0, 4);
    }
    config.build().unwrap()
}

/// Row-major block of a 40 Hz sine, phase-continuous across blocks
fn sine_block(block: usize) -> Vec<f64> {
    let mut data = Vec::with_capacity(CHANNELS * BLOCK);
    for ch in 0..CHANNELS {
        let amplitude = 1.0 + ch as f64;
        for i in 0..BLOCK {
            let t = (block * BLOCK + i) as f64 / FS;
            data.push(amplitude * (2.0 * PI * 40.0 * t).sin());
        }
    }
    data
}

fn run_block(setup: &mut ProcessingSetup, block: usize) {
    setup.pipeline.run(&sine_block(block)).unwrap();
    setup.analysis.run().unwrap();
}

#[test]
fn test_sine_peak_on_every_channel() {
    let mut setup = setup();
    for block in 0..10 {
        run_block(&mut setup, block);
    }

    let spectrum = setup.analysis.spectrum("psd").unwrap();
    let history = spectrum.read().unwrap();
    assert_eq!(history.blocks_written(), 10);

    let peak_config = PeakConfig::default();
    for channel in 0..CHANNELS {
        let power = get_1d_power_spectrum(&history, &[channel], 1, false).unwrap().unwrap();
        let peak = find_peak(&power, &peak_config).expect("no peak found");
        assert!(
            (peak.frequency - 40.0).abs() <= 2.0,
            "channel {} peaked at {} Hz",
            channel,
            peak.frequency
        );
    }
}

#[derive(Clone, Default)]
struct SharedBytes(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBytes {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct NullTransport {
    feedback: Option<FeedbackSender>,
}

impl StimulusTransport for NullTransport {
    fn open(&mut self, feedback: FeedbackSender) -> ClsResult<()> {
        self.feedback = Some(feedback);
        Ok(())
    }

    fn write(&mut self, _bytes: &[u8]) -> ClsResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ClsResult<()> {
        self.feedback = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.feedback.is_some()
    }
}

#[test]
fn test_closed_loop_converges_on_oscillation() {
    let mut setup = setup();
    let controller = ClosedLoopController::from_config(
        setup.analysis.spectrum("psd").unwrap(),
        SpectrumConfig { periods: 1, ..SpectrumConfig::default() },
        &StrategyConfig::PeakFollowerDelta { delta: 2.0 },
        FrequencyRange::new(5.0, 60.0).unwrap(),
        &PeakConfig::default(),
    )
    .unwrap();
    let stimulus = StimulusController::new(
        Box::new(NullTransport::default()),
        StimulusConfig { trigger_sleep_us: 0, ..StimulusConfig::default() },
    )
    .unwrap();

    let log_bytes = SharedBytes::default();
    let config = ProtocolConfig {
        trials: 1,
        block_period_ms: 500,
        self_initiated: false,
        timeouts: PhaseTimeouts {
            intertrial: 1,
            mask: 1,
            prestimulus: 2,
            stimulation: 8,
            poststimulus: 1,
            post_mask: 1,
        },
        triggers: PhaseTriggers::default(),
        update_interval: 1,
        initial_frequency: 30.0,
        carry_frequency: false,
    };
    let period_ms = (setup.pipeline.raw_frame().lock().unwrap().duration() * 1000.0).round() as u64;
    let mut protocol = Protocol::new(
        config,
        controller,
        stimulus,
        Some(Box::new(TrialLog::from_writer(log_bytes.clone()).unwrap())),
        period_ms,
    )
    .unwrap();

    protocol.start().unwrap();
    let stop = protocol.stop_handle();
    let mut block = 0;
    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        run_block(&mut setup, block);
        protocol.on_block().unwrap();
        block += 1;
        assert!(block < 100, "protocol never finished");
    }

    assert_eq!(protocol.phase(), Phase::Idle);
    let updates = protocol.updates();
    assert_eq!(updates.len(), 8);
    assert_eq!(updates[0].new_frequency, 32.0);
    assert_eq!(updates.last().unwrap().new_frequency, 40.0);
    assert!(updates.iter().all(|u| (u.new_frequency - u.old_frequency).abs() <= 2.0));
    assert_eq!(updates.last().unwrap().tag, ResultTag::NoUpdate);

    let log = String::from_utf8(log_bytes.0.lock().unwrap().clone()).unwrap();
    // header, start row, one row per update
    assert_eq!(log.lines().count(), 10);
    assert!(log.lines().nth(1).unwrap().ends_with(",30.0,30.0,tracking,start"));
}
