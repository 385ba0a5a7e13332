//! In-process digitizer used when no vendor library is loaded, and by tests.
//!
//! Timebases follow the ps5000a family tables. Samples come from a generator
//! thread that plays the role of the driver's callback thread: it owns the
//! overview buffers, writes into them, and invokes the registered sink.

use crate::{
    CallbackAction, ChannelConfig, ChannelId, Coupling, DataReady, DataSink, DeviceHandle,
    Driver, DriverStatus, OpenedUnit, OverviewBuffers, Resolution, SimpleTrigger,
    TimebaseSource, TriggerDirection, VoltageRange,
};
use log::{debug, info};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// ps5000a timebase table.
///
/// | resolution | timebase `n`        | interval            |
/// |------------|---------------------|---------------------|
/// | 8-bit      | 0..=2               | 2^n ns              |
/// | 8-bit      | n >= 3              | (n - 2) * 8 ns      |
/// | 12-bit     | 1..=3               | 2^(n - 1) * 2 ns    |
/// | 12-bit     | n >= 4              | (n - 3) * 16 ns     |
/// | 14/15-bit  | n >= 3              | (n - 2) * 8 ns      |
/// | 16-bit     | n >= 4              | (n - 3) * 16 ns     |
#[derive(Clone, Copy, Debug, Default)]
pub struct Ps5000aTimebase;

impl TimebaseSource for Ps5000aTimebase {
    fn minimum_timebase(
        &self,
        enabled_channels: usize,
        resolution: Resolution,
    ) -> Result<u32, DriverStatus> {
        match (resolution, enabled_channels) {
            (_, 0) | (_, 3..) => Err(DriverStatus::InvalidChannel),
            (Resolution::Bits8, 1) => Ok(0),
            (Resolution::Bits8, _) => Ok(1),
            (Resolution::Bits12, 1) => Ok(1),
            (Resolution::Bits12, _) => Ok(2),
            (Resolution::Bits14 | Resolution::Bits15, _) => Ok(3),
            (Resolution::Bits16, 1) => Ok(4),
            (Resolution::Bits16, _) => Err(DriverStatus::InvalidChannel),
        }
    }

    fn timebase_interval_ns(
        &self,
        timebase: u32,
        resolution: Resolution,
    ) -> Result<f64, DriverStatus> {
        let n = f64::from(timebase);
        match resolution {
            Resolution::Bits8 if timebase <= 2 => Ok(2f64.powf(n)),
            Resolution::Bits8 => Ok((n - 2.0) * 8.0),
            Resolution::Bits12 if timebase == 0 => Err(DriverStatus::InvalidTimebase),
            Resolution::Bits12 if timebase <= 3 => Ok(2f64.powf(n - 1.0) * 2.0),
            Resolution::Bits12 => Ok((n - 3.0) * 16.0),
            Resolution::Bits14 | Resolution::Bits15 if timebase < 3 => {
                Err(DriverStatus::InvalidTimebase)
            }
            Resolution::Bits14 | Resolution::Bits15 => Ok((n - 2.0) * 8.0),
            Resolution::Bits16 if timebase < 4 => Err(DriverStatus::InvalidTimebase),
            Resolution::Bits16 => Ok((n - 3.0) * 16.0),
        }
    }
}

/// How the generator thread paces its callbacks.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Pacing {
    /// Produce samples as fast as wall-clock time at the requested interval
    /// allows, checking every `poll`.
    RealTime { poll: Duration },
    /// One callback of `chunk_len` samples, then sleep `pause`.
    Burst { pause: Duration },
}

#[derive(Clone, Debug)]
pub struct SimConfig {
    pub pacing: Pacing,
    /// Upper bound on samples per callback.
    pub chunk_len: usize,
    pub signal_hz: f64,
    pub amplitude_v: f64,
    /// Added to channel A; removed by AC coupling.
    pub dc_offset_v: f64,
    pub noise_v: f64,
    pub seed: u64,
    pub open_delay: Duration,
    /// Returned by open instead of a handle.
    pub open_error: Option<DriverStatus>,
    /// Reported by a successful open; power-source codes need acknowledging.
    pub open_status: DriverStatus,
    pub reject_power_change: bool,
    /// Streaming auto-stops after this many samples.
    pub stream_limit: Option<u64>,
    /// Every n-th streaming callback carries the overflow flag.
    pub overflow_every: Option<usize>,
    /// The n-th streaming callback (0-based) reports a power-source change.
    pub power_event_at: Option<usize>,
    pub supported_ranges: Vec<VoltageRange>,
    pub max_samples_per_segment: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::RealTime {
                poll: Duration::from_millis(5),
            },
            chunk_len: 65_536,
            signal_hz: 1_000.0,
            amplitude_v: 1.5,
            dc_offset_v: 0.0,
            noise_v: 0.02,
            seed: 0x5eed,
            open_delay: Duration::ZERO,
            open_error: None,
            open_status: DriverStatus::Ok,
            reject_power_change: false,
            stream_limit: None,
            overflow_every: None,
            power_event_at: None,
            supported_ranges: VoltageRange::ALL.to_vec(),
            max_samples_per_segment: 64 * 1024 * 1024,
        }
    }
}

impl SimConfig {
    /// Fast, deterministic settings for tests: no pacing delay, no noise.
    pub fn burst(chunk_len: usize) -> Self {
        Self {
            pacing: Pacing::Burst {
                pause: Duration::from_millis(1),
            },
            chunk_len,
            noise_v: 0.0,
            ..Default::default()
        }
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct SimulatedDriver {
    config: SimConfig,
    handle: Option<DeviceHandle>,
    next_handle: i16,
    resolution: Resolution,
    channels: [ChannelConfig; 2],
    trigger: Option<SimpleTrigger>,
    buffer_lens: [usize; 2],
    worker: Option<Worker>,
    closes: Arc<AtomicUsize>,
}

impl SimulatedDriver {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            handle: None,
            next_handle: 1,
            resolution: Resolution::Bits8,
            channels: [ChannelConfig::default(); 2],
            trigger: None,
            buffer_lens: [0; 2],
            worker: None,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counts successful `close_unit` calls.
    pub fn close_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    pub fn trigger(&self) -> Option<SimpleTrigger> {
        self.trigger
    }

    pub fn channel(&self, channel: ChannelId) -> ChannelConfig {
        self.channels[channel.index()]
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }

    fn check_handle(&self, handle: DeviceHandle) -> Result<(), DriverStatus> {
        match self.handle {
            Some(open) if open == handle => Ok(()),
            _ => Err(DriverStatus::InvalidHandle),
        }
    }

    fn max_adc(&self) -> i16 {
        match self.resolution {
            Resolution::Bits8 => 32512,
            _ => 32767,
        }
    }

    fn generator(&self, interval_ns: f64) -> Generator {
        Generator {
            config: self.config.clone(),
            channels: self.channels,
            trigger: self.trigger,
            max_adc: self.max_adc(),
            interval_ns,
            rng: StdRng::seed_from_u64(self.config.seed),
            index: 0,
        }
    }

    /// Overview lengths for the enabled channels; every enabled channel must
    /// have a registered buffer of at least `needed` samples.
    fn overview_lens(&self, needed: usize) -> Result<[usize; 2], DriverStatus> {
        let mut lens = [0; 2];
        for channel in ChannelId::ALL {
            let i = channel.index();
            if self.channels[i].enabled {
                if self.buffer_lens[i] < needed.max(1) {
                    return Err(DriverStatus::InvalidParameter);
                }
                lens[i] = self.buffer_lens[i];
            }
        }
        Ok(lens)
    }

    fn spawn<F>(&mut self, body: F) -> Result<(), DriverStatus>
    where
        F: FnOnce(Arc<AtomicBool>) + Send + 'static,
    {
        if self.is_running() {
            return Err(DriverStatus::OperationFailed);
        }
        self.join_worker()?;
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("sim-driver".into())
            .spawn(move || body(flag))
            .map_err(|_| DriverStatus::MemoryFail)?;
        self.worker = Some(Worker { stop, thread });
        Ok(())
    }

    fn join_worker(&mut self) -> Result<(), DriverStatus> {
        if let Some(worker) = self.worker.take() {
            worker.stop.store(true, Ordering::SeqCst);
            worker
                .thread
                .join()
                .map_err(|_| DriverStatus::OperationFailed)?;
        }
        Ok(())
    }
}

impl Drop for SimulatedDriver {
    fn drop(&mut self) {
        let _ = self.join_worker();
    }
}

impl TimebaseSource for SimulatedDriver {
    fn minimum_timebase(
        &self,
        enabled_channels: usize,
        resolution: Resolution,
    ) -> Result<u32, DriverStatus> {
        Ps5000aTimebase.minimum_timebase(enabled_channels, resolution)
    }

    fn timebase_interval_ns(
        &self,
        timebase: u32,
        resolution: Resolution,
    ) -> Result<f64, DriverStatus> {
        Ps5000aTimebase.timebase_interval_ns(timebase, resolution)
    }
}

impl Driver for SimulatedDriver {
    fn open_unit(&mut self, resolution: Resolution) -> Result<OpenedUnit, DriverStatus> {
        if !self.config.open_delay.is_zero() {
            thread::sleep(self.config.open_delay);
        }
        if let Some(err) = self.config.open_error {
            return Err(err);
        }
        if self.handle.is_some() {
            return Err(DriverStatus::MaxUnitsOpened);
        }
        let handle = DeviceHandle(self.next_handle);
        self.next_handle += 1;
        self.handle = Some(handle);
        self.resolution = resolution;
        info!("simulated unit {} opened at {resolution}", handle.0);
        Ok(OpenedUnit {
            handle,
            power_status: self.config.open_status,
        })
    }

    fn close_unit(&mut self, handle: DeviceHandle) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        self.join_worker()?;
        self.handle = None;
        self.trigger = None;
        self.buffer_lens = [0; 2];
        self.closes.fetch_add(1, Ordering::SeqCst);
        info!("simulated unit {} closed", handle.0);
        Ok(())
    }

    fn change_power_source(
        &mut self,
        handle: DeviceHandle,
        status: DriverStatus,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        if !status.is_power_source_change() {
            return Err(DriverStatus::InvalidParameter);
        }
        if self.config.reject_power_change {
            return Err(DriverStatus::OperationFailed);
        }
        debug!("power source acknowledged: {status}");
        Ok(())
    }

    fn maximum_value(&self, handle: DeviceHandle) -> Result<i16, DriverStatus> {
        self.check_handle(handle)?;
        Ok(self.max_adc())
    }

    fn supported_ranges(&self) -> &[VoltageRange] {
        &self.config.supported_ranges
    }

    fn max_samples_per_segment(&self, handle: DeviceHandle) -> Result<usize, DriverStatus> {
        self.check_handle(handle)?;
        Ok(self.config.max_samples_per_segment)
    }

    fn set_channel(
        &mut self,
        handle: DeviceHandle,
        channel: ChannelId,
        config: &ChannelConfig,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        if !self.config.supported_ranges.contains(&config.range) {
            return Err(DriverStatus::InvalidVoltageRange);
        }
        self.channels[channel.index()] = *config;
        Ok(())
    }

    fn set_simple_trigger(
        &mut self,
        handle: DeviceHandle,
        trigger: Option<&SimpleTrigger>,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        if let Some(t) = trigger {
            if !self.channels[t.source.index()].enabled {
                return Err(DriverStatus::InvalidTriggerChannel);
            }
        }
        self.trigger = trigger.copied();
        Ok(())
    }

    fn set_data_buffer(
        &mut self,
        handle: DeviceHandle,
        channel: ChannelId,
        len: usize,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        self.buffer_lens[channel.index()] = len;
        Ok(())
    }

    fn run_streaming(
        &mut self,
        handle: DeviceHandle,
        interval_ns: u32,
        buffer_size: usize,
        mut sink: Box<dyn DataSink>,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        if interval_ns == 0 || buffer_size == 0 {
            return Err(DriverStatus::InvalidParameter);
        }
        let lens = self.overview_lens(buffer_size)?;
        let mut generator = self.generator(f64::from(interval_ns));
        info!("simulated streaming at {interval_ns} ns, buffer {buffer_size}");
        self.spawn(move |stop| {
            let mut overview = [vec![0i16; lens[0]], vec![0i16; lens[1]]];
            generator.stream(&stop, &mut overview, buffer_size, sink.as_mut());
        })
    }

    fn run_block(
        &mut self,
        handle: DeviceHandle,
        timebase: u32,
        samples: usize,
        mut sink: Box<dyn DataSink>,
    ) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        if samples == 0 || samples > self.config.max_samples_per_segment {
            return Err(DriverStatus::InvalidParameter);
        }
        let interval_ns = self.timebase_interval_ns(timebase, self.resolution)?;
        let lens = self.overview_lens(samples)?;
        let mut generator = self.generator(interval_ns);
        info!("simulated rapid block: timebase {timebase}, {samples} samples");
        self.spawn(move |stop| {
            let mut overview = [vec![0i16; lens[0]], vec![0i16; lens[1]]];
            generator.blocks(&stop, &mut overview, samples, sink.as_mut());
        })
    }

    fn stop(&mut self, handle: DeviceHandle) -> Result<(), DriverStatus> {
        self.check_handle(handle)?;
        self.join_worker()
    }
}

/// State owned by the generator thread.
struct Generator {
    config: SimConfig,
    channels: [ChannelConfig; 2],
    trigger: Option<SimpleTrigger>,
    max_adc: i16,
    interval_ns: f64,
    rng: StdRng,
    /// Index of the next sample on the simulated time axis.
    index: u64,
}

impl Generator {
    fn volts(&self, channel: ChannelId, index: u64) -> f64 {
        let t = index as f64 * self.interval_ns * 1e-9;
        let phase = TAU * self.config.signal_hz * t;
        let config = &self.channels[channel.index()];
        match channel {
            ChannelId::A => {
                let offset = match config.coupling {
                    Coupling::Dc => self.config.dc_offset_v,
                    Coupling::Ac => 0.0,
                };
                self.config.amplitude_v * phase.sin() + offset
            }
            ChannelId::B => {
                let level = self.config.amplitude_v / 2.0;
                if phase.sin() >= 0.0 {
                    level
                } else {
                    -level
                }
            }
        }
    }

    fn counts(&mut self, channel: ChannelId, index: u64) -> i16 {
        let mut v = self.volts(channel, index);
        if self.config.noise_v > 0.0 {
            v += self
                .rng
                .random_range(-self.config.noise_v..=self.config.noise_v);
        }
        let range = self.channels[channel.index()].range.volts();
        let max = f64::from(self.max_adc);
        (v / range * max).round().clamp(-max, max) as i16
    }

    fn crosses(&self, trigger: &SimpleTrigger, index: u64) -> bool {
        if index == 0 {
            return false;
        }
        let range = self.channels[trigger.source.index()].range.volts();
        let max = f64::from(self.max_adc);
        let level = f64::from(trigger.threshold_counts);
        let count = |i| (self.volts(trigger.source, i) / range * max).clamp(-max, max);
        let (prev, cur) = (count(index - 1), count(index));
        match trigger.direction {
            TriggerDirection::Rising => prev < level && cur >= level,
            TriggerDirection::Falling => prev > level && cur <= level,
        }
    }

    /// Writes `n` samples of every enabled channel at `offset`.
    fn fill(&mut self, overview: &mut [Vec<i16>; 2], offset: usize, n: usize) {
        for channel in ChannelId::ALL {
            if overview[channel.index()].is_empty() {
                continue;
            }
            for k in 0..n {
                let value = self.counts(channel, self.index + k as u64);
                overview[channel.index()][offset + k] = value;
            }
        }
        self.index += n as u64;
    }

    fn stream(
        &mut self,
        stop: &AtomicBool,
        overview: &mut [Vec<i16>; 2],
        buffer_size: usize,
        sink: &mut dyn DataSink,
    ) {
        let capacity = overview
            .iter()
            .map(Vec::len)
            .filter(|&l| l > 0)
            .min()
            .unwrap_or(0)
            .min(buffer_size);
        let started = Instant::now();
        let mut produced: u64 = 0;
        let mut offset = 0usize;
        let mut callbacks = 0usize;
        let mut triggered = false;

        while !stop.load(Ordering::SeqCst) {
            let (mut pending, mut overflow) = match self.config.pacing {
                Pacing::RealTime { poll } => {
                    thread::sleep(poll);
                    let due = (started.elapsed().as_nanos() as f64 / self.interval_ns) as u64;
                    let pending = due.saturating_sub(produced);
                    if pending > capacity as u64 {
                        // the host fell behind; the device drops what it cannot hold
                        let lost = pending - capacity as u64;
                        produced += lost;
                        self.index += lost;
                        (capacity as u64, true)
                    } else {
                        (pending, false)
                    }
                }
                Pacing::Burst { .. } => (self.config.chunk_len.min(capacity) as u64, false),
            };

            while pending > 0 && !stop.load(Ordering::SeqCst) {
                let mut n = pending.min(self.config.chunk_len.min(capacity) as u64) as usize;
                let mut done = false;
                if let Some(limit) = self.config.stream_limit {
                    let left = limit.saturating_sub(produced);
                    if left <= n as u64 {
                        n = left as usize;
                        done = true;
                    }
                }
                if offset + n > capacity {
                    offset = 0;
                }

                let first = self.index;
                self.fill(overview, offset, n);
                let mut fired = false;
                if let Some(trigger) = self.trigger {
                    if !triggered {
                        fired = (first..first + n as u64).any(|i| self.crosses(&trigger, i))
                            || (trigger.auto_trigger_ms > 0
                                && started.elapsed()
                                    >= Duration::from_millis(u64::from(trigger.auto_trigger_ms)));
                        triggered = fired;
                    }
                }
                if let Some(every) = self.config.overflow_every {
                    overflow |= every > 0 && callbacks % every == every - 1;
                }
                let status = match self.config.power_event_at {
                    Some(at) if at == callbacks => DriverStatus::PowerSupplyNotConnected,
                    _ => DriverStatus::Ok,
                };

                let ready = DataReady {
                    sample_count: n,
                    start_index: offset,
                    overflow,
                    triggered: fired,
                    done,
                    status,
                };
                let buffers = OverviewBuffers {
                    channels: [&overview[0][..], &overview[1][..]],
                };
                let action = sink.on_data(&ready, &buffers);

                callbacks += 1;
                produced += n as u64;
                offset += n;
                pending -= n as u64;
                overflow = false;

                if done {
                    info!("simulated streaming auto-stopped after {produced} samples");
                    return;
                }
                if action == CallbackAction::Stop {
                    return;
                }
            }

            if let Pacing::Burst { pause } = self.config.pacing {
                thread::sleep(pause);
            }
        }
    }

    /// Advances the time axis to the next trigger event. `None` means the
    /// run was stopped while waiting.
    fn wait_for_trigger(&mut self, stop: &AtomicBool, samples: usize) -> Option<bool> {
        let Some(trigger) = self.trigger else {
            return Some(false);
        };
        let armed_at = Instant::now();
        let auto = Duration::from_millis(u64::from(trigger.auto_trigger_ms));
        loop {
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            let search = (samples as u64).saturating_mul(4).max(1024);
            if let Some(hit) = (self.index..self.index + search).find(|&i| self.crosses(&trigger, i)) {
                self.index = hit;
                return Some(true);
            }
            self.index += search;
            if !auto.is_zero() && armed_at.elapsed() >= auto {
                return Some(false);
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn blocks(
        &mut self,
        stop: &AtomicBool,
        overview: &mut [Vec<i16>; 2],
        samples: usize,
        sink: &mut dyn DataSink,
    ) {
        let chunk = self.config.chunk_len.clamp(1, samples);
        let mut captures = 0usize;
        loop {
            let Some(triggered) = self.wait_for_trigger(stop, samples) else {
                return;
            };
            let started = Instant::now();
            let mut offset = 0;
            while offset < samples {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                let n = chunk.min(samples - offset);
                self.fill(overview, offset, n);
                let done = offset + n == samples;
                let ready = DataReady {
                    sample_count: n,
                    start_index: offset,
                    overflow: false,
                    triggered: triggered && offset == 0,
                    done,
                    status: DriverStatus::Ok,
                };
                let buffers = OverviewBuffers {
                    channels: [&overview[0][..], &overview[1][..]],
                };
                let action = sink.on_data(&ready, &buffers);
                offset += n;
                if action == CallbackAction::Stop {
                    debug!("sink stopped rapid block after {} captures", captures + 1);
                    return;
                }
            }
            captures += 1;

            match self.config.pacing {
                Pacing::RealTime { .. } => {
                    let span = Duration::from_nanos((samples as f64 * self.interval_ns) as u64);
                    if let Some(rest) = span.checked_sub(started.elapsed()) {
                        thread::sleep(rest);
                    }
                }
                Pacing::Burst { pause } => thread::sleep(pause),
            }
        }
    }
}
