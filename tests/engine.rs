use scope_daq::{
    read_acquisition, AcquisitionEngine, AcquisitionMode, ChannelConfig, ChannelId, Condition,
    DriverStatus, EngineConfig, EngineError, Resolution, SampleFormat, SessionState,
    SharedDriver, SimConfig, SimulatedDriver, Threshold, TriggerConfig, TriggerDirection,
    VoltageRange,
};
use std::{
    collections::HashMap,
    fs,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

fn base_config() -> EngineConfig {
    EngineConfig {
        connect_delay: Duration::ZERO,
        device_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    }
}

fn open(config: EngineConfig, sim: SimConfig) -> (Arc<Mutex<SimulatedDriver>>, AcquisitionEngine) {
    let sim = Arc::new(Mutex::new(SimulatedDriver::new(sim)));
    let driver: SharedDriver = sim.clone();
    let engine = AcquisitionEngine::open(driver, config).unwrap();
    (sim, engine)
}

/// Ticks the engine until `done` holds, failing after a generous deadline.
fn tick_until(engine: &mut AcquisitionEngine, mut done: impl FnMut(&mut AcquisitionEngine) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done(engine) {
        assert!(Instant::now() < deadline, "engine never reached the expected state");
        engine.tick();
        thread::sleep(Duration::from_millis(2));
    }
}

fn wait_for_closes(closes: &AtomicUsize, n: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while closes.load(Ordering::SeqCst) < n {
        assert!(Instant::now() < deadline, "device was never closed");
        thread::sleep(Duration::from_millis(5));
    }
}

fn trigger_at(volts: f64) -> TriggerConfig {
    TriggerConfig {
        source: ChannelId::A,
        threshold: Threshold::Volts(volts),
        direction: TriggerDirection::Rising,
        auto_trigger_ms: 0,
    }
}

#[test]
fn streaming_window_fills_ring_without_overwrite() {
    let config = EngineConfig {
        resolution: Resolution::Bits12,
        sample_interval_ns: 20_000_000.0,
        window: Duration::from_secs(5),
        ..base_config()
    };
    let sim = SimConfig {
        stream_limit: Some(250),
        ..SimConfig::burst(64)
    };
    let (_, mut engine) = open(config, sim);
    assert_eq!(engine.timebase().interval_ns, 20_000_000.0);
    assert_eq!(engine.ring_capacity(), 250);

    engine.start().unwrap();
    assert_eq!(engine.state(), SessionState::Streaming);
    tick_until(&mut engine, |e| e.state() == SessionState::Idle);

    assert_eq!(engine.condition(), Some(&Condition::AcquisitionFinished));
    let status = engine.status();
    assert_eq!(status.samples_received, 250);
    assert_eq!(status.dropped_samples, 0);
    for ch in ChannelId::ALL {
        let snap = engine.snapshot(ch).unwrap();
        assert_eq!(snap.samples.len(), 250);
        assert!(!snap.torn);
    }
}

#[test]
fn block_captures_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("session");
    let config = EngineConfig {
        mode: AcquisitionMode::Block,
        window: Duration::from_micros(100),
        block_captures: 3,
        ..base_config()
    };
    let (_, mut engine) = open(config, SimConfig::burst(32));

    engine.start_recording(Some(out.as_path())).unwrap();
    engine.start().unwrap();
    assert_eq!(engine.state(), SessionState::Capturing);
    assert_eq!(engine.status().block_len, 100);
    tick_until(&mut engine, |e| e.state() == SessionState::Idle);

    let summary = engine.stop_recording().unwrap().unwrap();
    assert_eq!(summary.acquisitions_saved, 3);
    for n in 1..=3 {
        let file = out.join(format!("acq_{n:03}.bin"));
        assert_eq!(fs::metadata(&file).unwrap().len(), 2 * 100 * 2);
        let (a, b) = read_acquisition(&file, SampleFormat::F16).unwrap();
        assert_eq!(a.len(), 100);
        assert!(b.iter().all(|v| v.abs() <= 2.0));
    }
    assert!(!out.join("acq_004.bin").exists());

    let meta: HashMap<String, String> = fs::read_to_string(&summary.metadata)
        .unwrap()
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    assert_eq!(meta["acquisitions_saved"], "3");
    assert_eq!(meta["sampling_frequency_hz"], "1000000");
    assert_eq!(meta["frame_rate_hz"], "50");
}

#[test]
fn block_frames_are_decimated() {
    let config = EngineConfig {
        mode: AcquisitionMode::Block,
        window: Duration::from_millis(5),
        max_points: 500,
        ..base_config()
    };
    let (_, mut engine) = open(config, SimConfig::burst(1024));
    engine.start().unwrap();

    let mut frame = None;
    tick_until(&mut engine, |e| {
        frame = e.tick().filter(|f| f.traces[0].is_some());
        frame.is_some()
    });
    let frame = frame.unwrap();
    let trace = frame.traces[0].as_ref().unwrap();
    assert_eq!(trace.points.len(), 500);
    assert_eq!(trace.full_scale, 2.0);
    let (lo, hi) = trace.normalized();
    assert!(lo.iter().zip(&hi).all(|(l, h)| l.1 <= h.1));
    engine.stop().unwrap();
}

#[test]
fn stop_is_cooperative_and_idempotent() {
    let (sim, mut engine) = open(base_config(), SimConfig::burst(128));
    engine.start().unwrap();
    tick_until(&mut engine, |e| e.status().samples_received > 0);

    engine.stop().unwrap();
    assert_eq!(engine.state(), SessionState::Idle);
    assert!(!sim.lock().unwrap().is_running());
    assert!(engine.snapshot(ChannelId::A).is_none());
    engine.stop().unwrap();

    // a stopped engine can start again
    engine.start().unwrap();
    tick_until(&mut engine, |e| e.status().samples_received > 0);
    engine.stop().unwrap();
}

#[test]
fn configuration_is_rejected_while_running() {
    let (sim, mut engine) = open(base_config(), SimConfig::burst(128));
    engine.start().unwrap();

    let wider = ChannelConfig {
        range: VoltageRange::V5,
        ..ChannelConfig::default()
    };
    assert!(matches!(
        engine.configure_channel(ChannelId::A, wider),
        Err(EngineError::InvalidState(SessionState::Streaming))
    ));
    assert!(matches!(
        engine.reconfigure_interval(500.0),
        Err(EngineError::InvalidState(SessionState::Streaming))
    ));
    assert!(matches!(
        engine.set_mode(AcquisitionMode::Block),
        Err(EngineError::InvalidState(_))
    ));
    assert_eq!(engine.channels().range(ChannelId::A), VoltageRange::V2);
    assert_eq!(sim.lock().unwrap().channel(ChannelId::A).range, VoltageRange::V2);

    engine.stop().unwrap();
    engine.configure_channel(ChannelId::A, wider).unwrap();
    assert_eq!(sim.lock().unwrap().channel(ChannelId::A).range, VoltageRange::V5);
}

#[test]
fn unsupported_range_changes_nothing() {
    let sim = SimConfig {
        supported_ranges: vec![VoltageRange::V1, VoltageRange::V2, VoltageRange::V5],
        ..SimConfig::burst(64)
    };
    let (_, mut engine) = open(base_config(), sim);
    let narrow = ChannelConfig {
        range: VoltageRange::Mv10,
        ..ChannelConfig::default()
    };
    assert!(matches!(
        engine.configure_channel(ChannelId::B, narrow),
        Err(EngineError::InvalidRange(_))
    ));
    assert_eq!(engine.channels().range(ChannelId::B), VoltageRange::V2);
}

#[test]
fn device_is_released_exactly_once() {
    let (sim, mut engine) = open(base_config(), SimConfig::burst(64));
    let closes = sim.lock().unwrap().close_counter();
    engine.start().unwrap();
    engine.close().unwrap();
    engine.close().unwrap();
    assert_eq!(engine.state(), SessionState::Closed);
    assert!(matches!(
        engine.start(),
        Err(EngineError::InvalidState(SessionState::Closed))
    ));
    drop(engine);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn dropping_the_engine_closes_the_device() {
    let (sim, mut engine) = open(base_config(), SimConfig::burst(64));
    let closes = sim.lock().unwrap().close_counter();
    engine.start().unwrap();
    drop(engine);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
    assert!(!sim.lock().unwrap().is_running());
}

#[test]
fn slow_device_is_reported_unresponsive() {
    let config = EngineConfig {
        device_timeout: Duration::from_millis(20),
        ..base_config()
    };
    let sim = SimConfig {
        open_delay: Duration::from_millis(400),
        ..SimConfig::burst(64)
    };
    let sim = Arc::new(Mutex::new(SimulatedDriver::new(sim)));
    let closes = sim.lock().unwrap().close_counter();
    let driver: SharedDriver = sim.clone();
    let err = AcquisitionEngine::open(driver.clone(), config.clone()).err().unwrap();
    assert!(matches!(err, EngineError::DeviceUnresponsive(_)));

    // the late handle is released, so a patient retry gets the device
    wait_for_closes(&closes, 1);
    let patient = EngineConfig {
        device_timeout: Duration::from_secs(2),
        ..config
    };
    let mut engine = AcquisitionEngine::open(driver, patient).unwrap();
    engine.close().unwrap();
    assert_eq!(closes.load(Ordering::SeqCst), 2);
}

#[test]
fn blocked_driver_calls_are_reported_unresponsive() {
    let config = EngineConfig {
        device_timeout: Duration::from_millis(50),
        ..base_config()
    };
    let (sim, mut engine) = open(config, SimConfig::burst(64));
    let closes = sim.lock().unwrap().close_counter();
    let before = engine.timebase();
    {
        let _busy = sim.lock().unwrap();
        assert!(matches!(
            engine.reconfigure_interval(2000.0),
            Err(EngineError::DeviceUnresponsive(_))
        ));
        assert_eq!(engine.timebase(), before);
        assert!(matches!(engine.close(), Err(EngineError::DeviceUnresponsive(_))));
    }
    assert_eq!(engine.state(), SessionState::Closed);
    wait_for_closes(&closes, 1);
    drop(engine);
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn missing_device_is_unavailable() {
    let sim = SimConfig {
        open_error: Some(DriverStatus::NotFound),
        ..SimConfig::burst(64)
    };
    let driver: SharedDriver = Arc::new(Mutex::new(SimulatedDriver::new(sim)));
    let err = AcquisitionEngine::open(driver, base_config()).err().unwrap();
    assert!(matches!(err, EngineError::DeviceUnavailable(DriverStatus::NotFound)));
}

#[test]
fn trigger_threshold_uses_device_full_scale() {
    let config = EngineConfig {
        resolution: Resolution::Bits12,
        ..base_config()
    };
    let (sim, mut engine) = open(config, SimConfig::burst(64));
    let realized = engine.arm_trigger(trigger_at(1.0)).unwrap();
    assert_eq!(realized.counts, 16384);
    assert!(!realized.clamped);
    assert_eq!(sim.lock().unwrap().trigger().unwrap().threshold_counts, 16384);

    let clamped = engine.arm_trigger(trigger_at(5.0)).unwrap();
    assert_eq!(clamped.counts, 32767);
    assert!(clamped.clamped);
    assert!(matches!(
        engine.condition(),
        Some(Condition::ThresholdClamped { counts: 32767, .. })
    ));

    engine.disarm_trigger().unwrap();
    assert!(sim.lock().unwrap().trigger().is_none());
    assert!(engine.trigger().is_none());
}

#[test]
fn armed_stream_waits_for_trigger() {
    let (_, mut engine) = open(base_config(), SimConfig::burst(256));
    engine.arm_trigger(trigger_at(0.5)).unwrap();
    engine.start().unwrap();
    tick_until(&mut engine, |e| {
        e.snapshot(ChannelId::A).is_some_and(|s| !s.samples.is_empty())
    });
    // re-arming while running restarts the acquisition
    engine.arm_trigger(trigger_at(-0.5)).unwrap();
    assert_eq!(engine.state(), SessionState::Streaming);
    engine.stop().unwrap();
}

#[test]
fn overflow_is_surfaced() {
    let sim = SimConfig {
        overflow_every: Some(3),
        ..SimConfig::burst(64)
    };
    let (_, mut engine) = open(base_config(), sim);
    engine.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let fault = loop {
        if let Some(fault) = engine.poll_faults() {
            break fault;
        }
        assert!(Instant::now() < deadline, "no overflow reported");
        thread::sleep(Duration::from_millis(2));
    };
    assert!(matches!(fault, EngineError::Overflow { .. }));
    assert!(matches!(engine.condition(), Some(Condition::Overflow { .. })));
    engine.stop().unwrap();
}

#[test]
fn power_source_change_is_acknowledged_while_streaming() {
    let sim = SimConfig {
        power_event_at: Some(0),
        ..SimConfig::burst(64)
    };
    let (_, mut engine) = open(base_config(), sim);
    engine.start().unwrap();
    tick_until(&mut engine, |e| {
        matches!(e.condition(), Some(Condition::PowerSourceChanged(_)))
    });
    assert_eq!(engine.state(), SessionState::Streaming);
    engine.stop().unwrap();
}

#[test]
fn disabled_channel_has_no_data() {
    let (_, mut engine) = open(base_config(), SimConfig::burst(64));
    let off = ChannelConfig {
        enabled: false,
        ..ChannelConfig::default()
    };
    engine.configure_channel(ChannelId::B, off).unwrap();
    engine.start().unwrap();
    let mut frame = None;
    tick_until(&mut engine, |e| {
        frame = e.tick().filter(|f| f.traces[0].is_some());
        frame.is_some()
    });
    assert!(frame.unwrap().traces[1].is_none());
    assert!(engine.snapshot(ChannelId::B).is_none());
    engine.stop().unwrap();
}

#[test]
fn unwritable_destination_is_reported() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let (_, mut engine) = open(base_config(), SimConfig::burst(64));
    let err = engine
        .start_recording(Some(file.path().join("below_a_file").as_path()))
        .unwrap_err();
    assert!(matches!(err, EngineError::DestinationUnwritable { .. }));
    assert!(!engine.is_recording());
}

#[test]
fn streaming_snapshots_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        window: Duration::from_micros(200),
        ..base_config()
    };
    let (_, mut engine) = open(config, SimConfig::burst(64));
    engine.start_recording(Some(dir.path())).unwrap();
    engine.start().unwrap();
    tick_until(&mut engine, |e| e.status().acquisitions_saved >= 2);
    engine.stop().unwrap();
    let summary = engine.stop_recording().unwrap().unwrap();
    assert!(summary.acquisitions_saved >= 2);
    let first = dir.path().join("acq_001.bin");
    let (a, b) = read_acquisition(&first, SampleFormat::F16).unwrap();
    assert_eq!(a.len(), b.len());
    assert!(!a.is_empty() && a.len() <= 200);
}
