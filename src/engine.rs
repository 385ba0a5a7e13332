//! The acquisition engine: one device session and everything between the
//! driver callback and the consumer.
//!
//! The engine is driven from one consumer thread. Configuration calls are
//! all-or-nothing: the device and the engine's view of it change together or
//! not at all. Data arrives on the driver's thread through a
//! [`CallbackBridge`]; [`AcquisitionEngine::tick`] picks it up on the
//! consumer's cadence.

use crate::{
    decimate, AcquisitionMode, Acquisition, BridgeStatus, CallbackBridge, ChannelConfig,
    ChannelId, ChannelSet, Counter, DriverStatus, EngineConfig, EngineError, PlotPoint,
    RealizedThreshold, Recorder, RecordingSummary, RingBuffer, RingSnapshot, SharedDriver,
    TimebaseResult, TriggerConfig, TriggerConfigurator, UnitHandle, VoltageRange,
};
use crossbeam_channel::{bounded, Receiver};
use log::{debug, error, info, warn};
use std::{
    fmt,
    path::Path,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

/// Completed captures waiting for the consumer. When full, the callback
/// evicts the oldest rather than wait.
const CAPTURE_QUEUE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Capturing,
    Closed,
}

impl SessionState {
    pub fn is_running(self) -> bool {
        matches!(self, SessionState::Streaming | SessionState::Capturing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Streaming => write!(f, "streaming"),
            SessionState::Capturing => write!(f, "capturing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// The most recent non-fatal condition, for the status line.
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    MinimumTimebase { interval_ns: f64 },
    IntervalAdjusted { requested_ns: f64, interval_ns: f64 },
    ThresholdClamped { counts: i16, volts: f64 },
    Overflow { dropped: u64 },
    CapturesDiscarded(u64),
    PowerSourceChanged(DriverStatus),
    AcquisitionFinished,
    Recording(String),
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::MinimumTimebase { interval_ns } => {
                write!(f, "minimum timebase applied: {interval_ns} ns")
            }
            Condition::IntervalAdjusted {
                requested_ns,
                interval_ns,
            } => write!(f, "sample interval {requested_ns} ns realized as {interval_ns} ns"),
            Condition::ThresholdClamped { counts, volts } => {
                write!(f, "trigger threshold clamped to {counts} counts ({volts:.3} V)")
            }
            Condition::Overflow { dropped } => {
                write!(f, "overflow: {dropped} samples dropped")
            }
            Condition::CapturesDiscarded(n) => write!(f, "{n} captures discarded"),
            Condition::PowerSourceChanged(status) => {
                write!(f, "power source changed: {status}")
            }
            Condition::AcquisitionFinished => write!(f, "acquisition finished"),
            Condition::Recording(msg) => write!(f, "recording: {msg}"),
        }
    }
}

/// One decimated channel ready to plot.
#[derive(Clone, Debug)]
pub struct Trace {
    pub channel: ChannelId,
    /// Volts at +full scale for the range the data was captured with.
    pub full_scale: f64,
    pub points: Vec<PlotPoint>,
    pub generation: u64,
    pub torn: bool,
}

impl Trace {
    /// Min and max envelopes scaled to [-1, 1] of full scale.
    pub fn normalized(&self) -> (Vec<(f64, f64)>, Vec<(f64, f64)>) {
        let fs = self.full_scale;
        self.points
            .iter()
            .map(|p| ((p.t, f64::from(p.min) / fs), (p.t, f64::from(p.max) / fs)))
            .unzip()
    }
}

#[derive(Clone, Debug)]
pub struct DisplayFrame {
    pub traces: [Option<Trace>; 2],
    /// Seconds covered by the display window.
    pub window_s: f64,
}

#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub state: SessionState,
    pub mode: AcquisitionMode,
    pub timebase: TimebaseResult,
    pub window: Duration,
    pub ring_capacity: usize,
    pub block_len: usize,
    pub channels: [ChannelConfig; 2],
    pub effective_rate_hz: f64,
    pub samples_received: u64,
    pub dropped_samples: u64,
    pub captures_completed: u64,
    pub trigger: Option<(TriggerConfig, RealizedThreshold)>,
    pub recording: bool,
    pub acquisitions_saved: u64,
    pub condition: Option<Condition>,
}

pub struct AcquisitionEngine {
    config: EngineConfig,
    unit: UnitHandle,
    supported: Vec<VoltageRange>,
    max_samples: usize,
    channels: ChannelSet,
    trigger: TriggerConfigurator,
    timebase: TimebaseResult,
    state: SessionState,
    rings: [Option<Arc<RingBuffer>>; 2],
    /// Ranges the current buffers were filled with.
    buffer_ranges: [VoltageRange; 2],
    block_len: usize,
    status: Arc<BridgeStatus>,
    captures: Option<Receiver<Acquisition>>,
    latest: Option<Acquisition>,
    recorder: Recorder,
    last_snapshot: Option<Instant>,
    counter: Counter,
    last_received: u64,
    seen_overflows: u64,
    seen_discards: u64,
    condition: Option<Condition>,
}

impl AcquisitionEngine {
    /// Opens the device and applies `config`. Nothing is acquired until
    /// [`start`](Self::start).
    pub fn open(driver: SharedDriver, config: EngineConfig) -> Result<Self, EngineError> {
        let config = config.checked()?;
        let unit = UnitHandle::open(driver, config.resolution, config.device_timeout)?;
        let supported = unit.with(|d, _| Ok(d.supported_ranges().to_vec()))?;
        let max_samples = unit.with(|d, h| d.max_samples_per_segment(h))?;

        let channels = ChannelSet::new(config.channels);
        for channel in ChannelId::ALL {
            let wanted = *channels.get(channel);
            if !supported.contains(&wanted.range) {
                return Err(EngineError::InvalidRange(wanted.range.to_string()));
            }
            unit.with(|d, h| d.set_channel(h, channel, &wanted))?;
        }
        if !config.connect_delay.is_zero() {
            thread::sleep(config.connect_delay);
        }

        let timebase =
            unit.negotiate(config.sample_interval_ns, channels.enabled_count(), config.mode)?;

        let mut engine = Self {
            recorder: Recorder::new(config.recording.format),
            buffer_ranges: [channels.range(ChannelId::A), channels.range(ChannelId::B)],
            config,
            unit,
            supported,
            max_samples,
            channels,
            trigger: TriggerConfigurator::new(),
            timebase,
            state: SessionState::Idle,
            rings: [None, None],
            block_len: 0,
            status: Arc::new(BridgeStatus::new()),
            captures: None,
            latest: None,
            last_snapshot: None,
            counter: Counter::new(),
            last_received: 0,
            seen_overflows: 0,
            seen_discards: 0,
            condition: None,
        };
        engine.note_timebase(&timebase);
        if let Some(trigger) = engine.config.trigger {
            engine.apply_trigger(Some(trigger))?;
        }
        engine.allocate_buffers();
        info!(
            "engine ready: {} at {} ns ({:.1} Hz)",
            engine.config.mode,
            timebase.interval_ns,
            timebase.sample_rate_hz()
        );
        Ok(engine)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timebase(&self) -> TimebaseResult {
        self.timebase
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn max_adc(&self) -> i16 {
        self.unit.max_adc()
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }

    fn require_stopped(&self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle => Ok(()),
            other => Err(EngineError::InvalidState(other)),
        }
    }

    fn note_timebase(&mut self, tb: &TimebaseResult) {
        if tb.clamped_to_minimum {
            warn!("requested {} ns is below the device minimum", tb.requested_ns);
            self.condition = Some(Condition::MinimumTimebase {
                interval_ns: tb.interval_ns,
            });
        } else if tb.interval_ns != tb.requested_ns {
            self.condition = Some(Condition::IntervalAdjusted {
                requested_ns: tb.requested_ns,
                interval_ns: tb.interval_ns,
            });
        }
    }

    fn note_threshold(&mut self, realized: &RealizedThreshold) {
        if realized.clamped {
            warn!("trigger threshold saturated: {realized}");
            self.condition = Some(Condition::ThresholdClamped {
                counts: realized.counts,
                volts: realized.volts,
            });
        }
    }

    /// Fresh buffers for the current window, interval and channel set.
    /// Disabled channels get none.
    fn allocate_buffers(&mut self) {
        let window = self.config.window;
        match self.config.mode {
            AcquisitionMode::Streaming => {
                let capacity = self.timebase.ring_capacity(window);
                self.rings = ChannelId::ALL.map(|ch| {
                    self.channels
                        .is_enabled(ch)
                        .then(|| Arc::new(RingBuffer::new(capacity)))
                });
                self.block_len = 0;
                debug!("ring capacity {capacity} samples");
            }
            AcquisitionMode::Block => {
                self.rings = [None, None];
                self.block_len = self.timebase.block_len(window).min(self.max_samples).max(1);
                debug!("block length {} samples", self.block_len);
            }
        }
        self.buffer_ranges = ChannelId::ALL.map(|ch| self.channels.range(ch));
        self.latest = None;
    }

    fn release_buffers(&mut self) {
        self.rings = [None, None];
        self.captures = None;
        self.latest = None;
    }

    /// Applies a channel change. Only allowed while stopped.
    ///
    /// A change of the enabled set renegotiates the timebase, and a range
    /// change on the trigger source re-derives the trigger threshold; if any
    /// step is rejected nothing is applied.
    pub fn configure_channel(
        &mut self,
        channel: ChannelId,
        config: ChannelConfig,
    ) -> Result<(), EngineError> {
        self.require_stopped()?;
        self.channels.validate(&self.supported, channel, &config)?;
        let next_config = self.config.with_channel(channel, config)?;

        let mut candidate = self.channels.clone();
        candidate.commit(channel, config);
        let timebase = self.unit.negotiate(
            self.config.sample_interval_ns,
            candidate.enabled_count(),
            self.config.mode,
        )?;

        let armed = self.trigger.armed().copied();
        let retrigger = match armed {
            Some((trigger, _)) if trigger.source == channel => {
                if !config.enabled {
                    return Err(EngineError::InvalidConfig(format!(
                        "channel {channel} is the trigger source; disarm the trigger first"
                    )));
                }
                Some((
                    trigger,
                    TriggerConfigurator::prepare(&trigger, config.range, self.unit.max_adc()),
                ))
            }
            _ => None,
        };

        let previous = *self.channels.get(channel);
        self.unit.with(|d, h| d.set_channel(h, channel, &config))?;
        if let Some((_, (native, _))) = &retrigger {
            if let Err(e) = self.unit.with(|d, h| d.set_simple_trigger(h, Some(native))) {
                // put the channel back the way the device had it
                if let Err(undo) = self.unit.with(|d, h| d.set_channel(h, channel, &previous)) {
                    error!("could not restore channel {channel}: {undo}");
                }
                return Err(e);
            }
        }

        self.channels.commit(channel, config);
        self.config = next_config;
        self.timebase = timebase;
        if let Some((trigger, (_, realized))) = retrigger {
            info!("trigger threshold re-derived for {}: {realized}", config.range);
            self.trigger.commit(trigger, realized);
            self.note_threshold(&realized);
        }
        self.note_timebase(&timebase);
        self.allocate_buffers();
        info!(
            "channel {channel}: {} {} {}",
            if config.enabled { "on" } else { "off" },
            config.range,
            config.coupling
        );
        Ok(())
    }

    fn apply_trigger(&mut self, trigger: Option<TriggerConfig>) -> Result<(), EngineError> {
        let next_config = self.config.with_trigger(trigger)?;
        match trigger {
            Some(trigger) => {
                let range = self.channels.range(trigger.source);
                let (native, realized) =
                    TriggerConfigurator::prepare(&trigger, range, self.unit.max_adc());
                self.unit.with(|d, h| d.set_simple_trigger(h, Some(&native)))?;
                self.trigger.commit(trigger, realized);
                self.note_threshold(&realized);
                info!(
                    "trigger armed on {} {} at {realized}",
                    trigger.source, trigger.direction
                );
            }
            None => {
                self.unit.with(|d, h| d.set_simple_trigger(h, None))?;
                self.trigger.clear();
                info!("trigger disarmed");
            }
        }
        self.config = next_config;
        Ok(())
    }

    /// Runs `change` with the acquisition stopped, restarting afterwards if
    /// it was running.
    fn while_stopped<T>(
        &mut self,
        change: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        let was_running = self.state.is_running();
        if was_running {
            self.stop()?;
        }
        let result = change(self);
        if was_running {
            self.start()?;
        }
        result
    }

    /// Arms (or re-arms) the simple trigger. While running, the acquisition
    /// is stopped, re-armed and restarted.
    pub fn arm_trigger(&mut self, trigger: TriggerConfig) -> Result<RealizedThreshold, EngineError> {
        if self.state == SessionState::Closed {
            return Err(EngineError::InvalidState(self.state));
        }
        if !self.channels.is_enabled(trigger.source) {
            return Err(EngineError::InvalidConfig(format!(
                "trigger source {} is disabled",
                trigger.source
            )));
        }
        self.while_stopped(|engine| {
            engine.apply_trigger(Some(trigger))?;
            engine
                .trigger
                .armed()
                .map(|(_, realized)| *realized)
                .ok_or(EngineError::Driver(DriverStatus::OperationFailed))
        })
    }

    /// Disarms the trigger. A no-op when nothing is armed.
    pub fn disarm_trigger(&mut self) -> Result<(), EngineError> {
        if !self.trigger.is_armed() {
            return Ok(());
        }
        self.while_stopped(|engine| engine.apply_trigger(None))
    }

    pub fn trigger(&self) -> Option<&(TriggerConfig, RealizedThreshold)> {
        self.trigger.armed()
    }

    /// Negotiates a new sample interval and rebuilds the buffers. Returns the
    /// interval the hardware will actually use.
    pub fn reconfigure_interval(&mut self, requested_ns: f64) -> Result<TimebaseResult, EngineError> {
        self.require_stopped()?;
        let next_config = self.config.with_sample_interval(requested_ns)?;
        let timebase =
            self.unit
                .negotiate(requested_ns, self.channels.enabled_count(), self.config.mode)?;
        self.config = next_config;
        self.timebase = timebase;
        self.note_timebase(&timebase);
        self.allocate_buffers();
        info!("sample interval now {} ns", timebase.interval_ns);
        Ok(timebase)
    }

    /// Resizes the buffers for a new display window.
    pub fn reconfigure_window(&mut self, window: Duration) -> Result<(), EngineError> {
        self.require_stopped()?;
        self.config = self.config.with_window(window)?;
        self.allocate_buffers();
        info!("display window now {window:?}");
        Ok(())
    }

    /// Switches between streaming and rapid block. The timebase is
    /// renegotiated since streaming needs whole nanoseconds.
    pub fn set_mode(&mut self, mode: AcquisitionMode) -> Result<(), EngineError> {
        self.require_stopped()?;
        let next_config = self.config.with_mode(mode)?;
        let timebase = self.unit.negotiate(
            self.config.sample_interval_ns,
            self.channels.enabled_count(),
            mode,
        )?;
        self.config = next_config;
        self.note_timebase(&timebase);
        self.timebase = timebase;
        self.allocate_buffers();
        info!("mode now {mode}");
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), EngineError> {
        self.require_stopped()?;
        self.allocate_buffers();
        self.status = Arc::new(BridgeStatus::new());
        self.counter.reset();
        self.last_received = 0;
        self.seen_overflows = 0;
        self.seen_discards = 0;
        self.last_snapshot = None;

        let max_adc = f64::from(self.unit.max_adc());
        let scales = ChannelId::ALL.map(|ch| (self.channels.range(ch).volts() / max_adc) as f32);
        let enabled = ChannelId::ALL.map(|ch| self.channels.is_enabled(ch));
        let interval_ns = self.timebase.interval_ns;

        match self.config.mode {
            AcquisitionMode::Streaming => {
                let size = self.config.driver_buffer_size;
                for ch in ChannelId::ALL {
                    let len = if enabled[ch.index()] { size } else { 0 };
                    self.unit.with(|d, h| d.set_data_buffer(h, ch, len))?;
                }
                let bridge = CallbackBridge::streaming(
                    scales,
                    interval_ns,
                    self.rings.clone(),
                    self.trigger.is_armed(),
                    Arc::clone(&self.status),
                );
                // streaming negotiation yields whole nanoseconds within u32
                let whole_ns = interval_ns as u32;
                self.unit
                    .with(|d, h| d.run_streaming(h, whole_ns, size, Box::new(bridge)))?;
                self.state = SessionState::Streaming;
            }
            AcquisitionMode::Block => {
                let len = self.block_len;
                for ch in ChannelId::ALL {
                    let n = if enabled[ch.index()] { len } else { 0 };
                    self.unit.with(|d, h| d.set_data_buffer(h, ch, n))?;
                }
                let (tx, rx) = bounded(CAPTURE_QUEUE);
                let bridge = CallbackBridge::block(
                    scales,
                    interval_ns,
                    len,
                    enabled,
                    self.config.block_captures,
                    (tx, rx.clone()),
                    Arc::clone(&self.status),
                );
                let timebase = self.timebase.timebase;
                self.unit
                    .with(|d, h| d.run_block(h, timebase, len, Box::new(bridge)))?;
                self.captures = Some(rx);
                self.state = SessionState::Capturing;
            }
        }
        info!("acquisition started ({})", self.config.mode);
        Ok(())
    }

    /// Stops the acquisition and releases its buffers. Captures already
    /// completed are still recorded. A no-op when idle.
    pub fn stop(&mut self) -> Result<(), EngineError> {
        match self.state {
            SessionState::Idle => return Ok(()),
            SessionState::Closed => return Err(EngineError::InvalidState(self.state)),
            _ => {}
        }
        self.status.request_stop();
        let stopped = self.unit.with(|d, h| d.stop(h));
        self.state = SessionState::Idle;
        self.drain_captures();
        self.release_buffers();
        info!(
            "acquisition stopped after {} samples",
            self.status.samples_received()
        );
        stopped
    }

    fn drain_captures(&mut self) {
        let Some(rx) = self.captures.take() else {
            return;
        };
        for acquisition in rx.try_iter() {
            self.save(&acquisition);
            self.latest = Some(acquisition);
        }
        if self.state.is_running() {
            self.captures = Some(rx);
        }
    }

    fn save(&mut self, acquisition: &Acquisition) {
        if let Err(e) = self.recorder.record(acquisition) {
            error!("recording failed, stopping it: {e}");
            self.condition = Some(Condition::Recording(e.to_string()));
            if let Err(e) = self.recorder.stop() {
                error!("could not finish recording: {e}");
            }
        }
    }

    fn stream_snapshot(&self) -> Option<Acquisition> {
        aligned_snapshot(
            &self.rings,
            self.recorder.acquisitions_saved() + 1,
            self.timebase.interval_ns,
        )
    }

    /// Reports sampling overflow not yet seen by the caller.
    pub fn poll_faults(&mut self) -> Option<EngineError> {
        let events = self.status.overflow_events();
        if events > self.seen_overflows {
            self.seen_overflows = events;
            let dropped = self.status.dropped_samples();
            self.condition = Some(Condition::Overflow { dropped });
            return Some(EngineError::Overflow { dropped });
        }
        None
    }

    /// Consumer-side work for one refresh period. Returns a display frame
    /// unless a recording is in progress.
    pub fn tick(&mut self) -> Option<DisplayFrame> {
        if let Some(status) = self.status.take_power_event() {
            let ack = self.unit.with(|d, h| d.change_power_source(h, status));
            if let Err(e) = ack {
                error!("power source change not accepted: {e}");
            }
            self.condition = Some(Condition::PowerSourceChanged(status));
        }

        let received = self.status.samples_received();
        self.counter
            .increment(received.saturating_sub(self.last_received));
        self.last_received = received;
        self.poll_faults();

        let discarded = self.status.captures_discarded();
        if discarded > self.seen_discards {
            self.seen_discards = discarded;
            self.condition = Some(Condition::CapturesDiscarded(discarded));
        }

        self.drain_captures();

        if self.state == SessionState::Streaming && self.recorder.is_recording() {
            let due = self
                .last_snapshot
                .map_or(true, |t| t.elapsed() >= self.config.recording.snapshot_interval);
            // a lapped read is retried on the next tick
            if let Some(snapshot) = due.then(|| self.stream_snapshot()).flatten() {
                self.save(&snapshot);
                self.last_snapshot = Some(Instant::now());
            }
        }

        if self.state.is_running() && self.status.finished() {
            if let Err(e) = self.unit.with(|d, h| d.stop(h)) {
                warn!("driver stop after finish failed: {e}");
            }
            self.drain_captures();
            self.state = SessionState::Idle;
            self.captures = None;
            self.condition = Some(Condition::AcquisitionFinished);
            info!("acquisition finished on its own");
        }

        if self.recorder.is_recording() {
            return None;
        }
        Some(self.display_frame())
    }

    fn display_frame(&self) -> DisplayFrame {
        let dt = self.timebase.interval_ns * 1e-9;
        let max_points = self.config.max_points;
        let traces = ChannelId::ALL.map(|ch| {
            let full_scale = self.buffer_ranges[ch.index()].volts();
            if let Some(ring) = &self.rings[ch.index()] {
                let snap = ring.snapshot()?;
                Some(Trace {
                    channel: ch,
                    full_scale,
                    points: decimate(&snap.samples, dt, max_points),
                    generation: snap.generation,
                    torn: snap.torn,
                })
            } else {
                let acq = self.latest.as_ref()?;
                if !self.channels.is_enabled(ch) {
                    return None;
                }
                let row = acq.channel(ch).to_vec();
                Some(Trace {
                    channel: ch,
                    full_scale,
                    points: decimate(&row, dt, max_points),
                    generation: acq.sequence,
                    torn: false,
                })
            }
        });
        DisplayFrame {
            traces,
            window_s: self.config.window.as_secs_f64(),
        }
    }

    /// Best-effort copy of a channel's ring. `None` when the channel has no
    /// ring or the read was overrun.
    pub fn snapshot(&self, channel: ChannelId) -> Option<RingSnapshot> {
        self.rings[channel.index()].as_ref()?.snapshot()
    }

    pub fn ring_capacity(&self) -> usize {
        self.rings
            .iter()
            .flatten()
            .map(|r| r.capacity())
            .next()
            .unwrap_or(0)
    }

    /// Starts recording into `directory`, or the configured output directory.
    pub fn start_recording(&mut self, directory: Option<&Path>) -> Result<(), EngineError> {
        if self.state == SessionState::Closed {
            return Err(EngineError::InvalidState(self.state));
        }
        let directory = directory.unwrap_or(&self.config.recording.output_dir).to_path_buf();
        let frame_period = match self.config.mode {
            AcquisitionMode::Streaming => self.config.recording.snapshot_interval,
            AcquisitionMode::Block => self.config.refresh,
        };
        self.recorder.start(
            &directory,
            self.timebase.sample_rate_hz(),
            1.0 / frame_period.as_secs_f64(),
        )?;
        self.last_snapshot = None;
        Ok(())
    }

    /// Finishes the recording. Captures already completed are written first.
    pub fn stop_recording(&mut self) -> Result<Option<RecordingSummary>, EngineError> {
        self.drain_captures();
        self.recorder.stop()
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            state: self.state,
            mode: self.config.mode,
            timebase: self.timebase,
            window: self.config.window,
            ring_capacity: self.ring_capacity(),
            block_len: self.block_len,
            channels: [*self.channels.get(ChannelId::A), *self.channels.get(ChannelId::B)],
            effective_rate_hz: self.counter.rate(),
            samples_received: self.status.samples_received(),
            dropped_samples: self.status.dropped_samples(),
            captures_completed: self.status.captures_completed(),
            trigger: self.trigger.armed().copied(),
            recording: self.recorder.is_recording(),
            acquisitions_saved: self.recorder.acquisitions_saved(),
            condition: self.condition.clone(),
        }
    }

    /// Stops everything, finishes any recording and releases the device.
    pub fn close(&mut self) -> Result<(), EngineError> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let stopped = self.stop();
        let recorded = self.stop_recording();
        let closed = self.unit.close();
        self.state = SessionState::Closed;
        stopped?;
        recorded?;
        closed
    }
}

/// The enabled channels' latest samples, trimmed to a common length. `None`
/// if nothing was written yet or any ring was lapped during the copy.
fn aligned_snapshot(
    rings: &[Option<Arc<RingBuffer>>; 2],
    sequence: u64,
    interval_ns: f64,
) -> Option<Acquisition> {
    let mut snaps: [Option<RingSnapshot>; 2] = [None, None];
    for (slot, ring) in snaps.iter_mut().zip(rings) {
        if let Some(ring) = ring {
            *slot = Some(ring.snapshot()?);
        }
    }
    let len = snaps.iter().flatten().map(|s| s.samples.len()).min()?;
    if len == 0 {
        return None;
    }
    let rows = snaps.map(|snap| snap.map(|s| s.samples[s.samples.len() - len..].to_vec()));
    Some(Acquisition::from_rows(sequence, interval_ns, false, len, rows))
}

impl Drop for AcquisitionEngine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing engine on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sim::SimConfig, SimulatedDriver, Threshold, TriggerDirection};
    use std::sync::Mutex;

    fn engine(config: EngineConfig, sim: SimConfig) -> (Arc<Mutex<SimulatedDriver>>, AcquisitionEngine) {
        let sim = Arc::new(Mutex::new(SimulatedDriver::new(sim)));
        let driver: SharedDriver = sim.clone();
        let engine = AcquisitionEngine::open(driver, config).unwrap();
        (sim, engine)
    }

    fn quick() -> EngineConfig {
        EngineConfig {
            connect_delay: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn minimum_timebase_is_reported() {
        let config = EngineConfig {
            sample_interval_ns: 0.5,
            ..quick()
        };
        let (_, engine) = engine(config, SimConfig::burst(64));
        // 8-bit, two channels
        assert_eq!(engine.timebase().interval_ns, 2.0);
        assert_eq!(
            engine.condition().map(|c| c.to_string()),
            Some("minimum timebase applied: 2 ns".to_string())
        );
    }

    #[test]
    fn range_change_rederives_trigger() {
        let config = EngineConfig {
            resolution: crate::Resolution::Bits12,
            ..quick()
        };
        let (sim, mut engine) = engine(config, SimConfig::burst(64));
        let realized = engine
            .arm_trigger(TriggerConfig {
                source: ChannelId::A,
                threshold: Threshold::Volts(1.0),
                direction: TriggerDirection::Rising,
                auto_trigger_ms: 0,
            })
            .unwrap();
        assert_eq!(realized.counts, 16384);

        let v5 = ChannelConfig {
            range: VoltageRange::V5,
            ..ChannelConfig::default()
        };
        engine.configure_channel(ChannelId::A, v5).unwrap();
        let (_, rederived) = engine.trigger().copied().unwrap();
        assert_eq!(rederived.counts, 6553);
        assert_eq!(sim.lock().unwrap().trigger().unwrap().threshold_counts, 6553);
    }

    #[test]
    fn trigger_source_cannot_be_disabled() {
        let (_, mut engine) = engine(quick(), SimConfig::burst(64));
        engine
            .arm_trigger(crate::config::default_trigger(ChannelId::B))
            .unwrap();
        let off = ChannelConfig {
            enabled: false,
            ..ChannelConfig::default()
        };
        assert!(engine.configure_channel(ChannelId::B, off).is_err());
        assert!(engine.channels().is_enabled(ChannelId::B));
        engine.disarm_trigger().unwrap();
        engine.disarm_trigger().unwrap();
        engine.configure_channel(ChannelId::B, off).unwrap();
        assert!(engine.snapshot(ChannelId::B).is_none());
    }

    #[test]
    fn disabling_a_channel_renegotiates() {
        let config = EngineConfig {
            sample_interval_ns: 1.0,
            ..quick()
        };
        let (_, mut engine) = engine(config, SimConfig::burst(64));
        assert_eq!(engine.timebase().interval_ns, 2.0);
        let off = ChannelConfig {
            enabled: false,
            ..ChannelConfig::default()
        };
        engine.configure_channel(ChannelId::B, off).unwrap();
        assert_eq!(engine.timebase().interval_ns, 1.0);
    }

    #[test]
    fn window_sets_ring_capacity() {
        let (_, mut engine) = engine(quick(), SimConfig::burst(64));
        // 20 ms at 1000 ns
        assert_eq!(engine.ring_capacity(), 20_000);
        engine.reconfigure_window(Duration::from_micros(5)).unwrap();
        assert_eq!(engine.ring_capacity(), 10);
        assert!(engine.reconfigure_window(Duration::ZERO).is_err());
        assert_eq!(engine.ring_capacity(), 10);
    }

    #[test]
    fn mode_change_reports_adjusted_interval() {
        let config = EngineConfig {
            sample_interval_ns: 1003.0,
            ..quick()
        };
        let (_, mut engine) = engine(config, SimConfig::burst(64));
        engine
            .arm_trigger(TriggerConfig {
                source: ChannelId::A,
                threshold: Threshold::Volts(100.0),
                direction: TriggerDirection::Rising,
                auto_trigger_ms: 0,
            })
            .unwrap();
        assert!(matches!(
            engine.condition(),
            Some(Condition::ThresholdClamped { .. })
        ));

        engine.set_mode(AcquisitionMode::Block).unwrap();
        assert_eq!(
            engine.condition(),
            Some(&Condition::IntervalAdjusted {
                requested_ns: 1003.0,
                interval_ns: 1000.0
            })
        );
    }

    #[test]
    fn lapped_ring_yields_no_snapshot_rows() {
        let steady = Arc::new(RingBuffer::new(10));
        steady.push_batch([0.5f32; 10]);
        let busy = Arc::new(RingBuffer::new(10));
        let rings = [Some(Arc::clone(&steady)), Some(Arc::clone(&busy))];

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let writer = {
            let (busy, stop) = (Arc::clone(&busy), Arc::clone(&stop));
            std::thread::spawn(move || {
                let mut v = 0.0f32;
                while !stop.load(std::sync::atomic::Ordering::Relaxed) {
                    busy.push_batch([v; 10]);
                    v += 1.0;
                }
            })
        };

        for _ in 0..20_000 {
            if let Some(acq) = aligned_snapshot(&rings, 1, 1000.0) {
                for ch in ChannelId::ALL {
                    assert!(acq.channel(ch).iter().all(|v| !v.is_nan()));
                }
            }
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);
        writer.join().unwrap();

        let idle = [Some(steady), None];
        let acq = aligned_snapshot(&idle, 2, 1000.0).unwrap();
        assert_eq!(acq.samples.ncols(), 10);
        assert!(acq.channel(ChannelId::B).iter().all(|v| v.is_nan()));
    }

    #[test]
    fn condition_text() {
        assert_eq!(
            Condition::MinimumTimebase { interval_ns: 64.0 }.to_string(),
            "minimum timebase applied: 64 ns"
        );
        assert_eq!(
            Condition::ThresholdClamped {
                counts: 32767,
                volts: 2.0
            }
            .to_string(),
            "trigger threshold clamped to 32767 counts (2.000 V)"
        );
    }
}
