//! The driver-callback side of the engine.
//!
//! A [`CallbackBridge`] is handed to the driver at run time and invoked on the
//! driver's thread. It decodes raw counts into volts, feeds the ring buffers
//! (streaming) or the block buffers (rapid block), and records anything that
//! goes wrong in [`BridgeStatus`] instead of returning it, since there is no
//! caller to return it to.

use crate::{
    Acquisition, BlockBuffer, CallbackAction, ChannelId, DataReady, DataSink, DriverStatus,
    OverviewBuffers, RingBuffer,
};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use log::{debug, warn};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// State shared between the callback thread (writer) and the consumer
/// (reader). Every field is a single atomic so neither side waits.
#[derive(Debug, Default)]
pub struct BridgeStatus {
    stop_requested: AtomicBool,
    finished: AtomicBool,
    samples_received: AtomicU64,
    overflow_events: AtomicU64,
    dropped_samples: AtomicU64,
    captures_completed: AtomicU64,
    captures_discarded: AtomicU64,
    /// Raw code of the last power-source change; 0 when none is pending.
    power_event: AtomicU32,
}

impl BridgeStatus {
    pub fn new() -> Self {
        Default::default()
    }

    /// Asks the callback to stop; observed on its next invocation.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// The driver reported that the run is over on its own.
    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn samples_received(&self) -> u64 {
        self.samples_received.load(Ordering::Relaxed)
    }

    pub fn overflow_events(&self) -> u64 {
        self.overflow_events.load(Ordering::Relaxed)
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }

    pub fn captures_completed(&self) -> u64 {
        self.captures_completed.load(Ordering::Relaxed)
    }

    /// Completed captures the consumer had no room for.
    pub fn captures_discarded(&self) -> u64 {
        self.captures_discarded.load(Ordering::Relaxed)
    }

    /// Returns and clears a pending power-source change.
    pub fn take_power_event(&self) -> Option<DriverStatus> {
        match self.power_event.swap(0, Ordering::AcqRel) {
            0 => None,
            code => Some(DriverStatus::from(code)),
        }
    }
}

enum Target {
    Stream {
        rings: [Option<Arc<RingBuffer>>; 2],
        /// Ring updates are held back until the first triggered callback.
        gated: bool,
    },
    Block {
        len: usize,
        buffers: [Option<BlockBuffer>; 2],
        triggered: bool,
        /// Captures after which the run ends; 0 runs until stopped.
        limit: u64,
        tx: Sender<Acquisition>,
        /// Lets the callback evict the oldest capture when the queue is full.
        rx: Receiver<Acquisition>,
    },
}

pub struct CallbackBridge {
    /// Volts per count, fixed when the run was armed.
    scales: [f32; 2],
    interval_ns: f64,
    target: Target,
    status: Arc<BridgeStatus>,
    started: Instant,
}

impl CallbackBridge {
    /// Bridge for a streaming run. A channel without a ring is disabled.
    pub fn streaming(
        scales: [f32; 2],
        interval_ns: f64,
        rings: [Option<Arc<RingBuffer>>; 2],
        trigger_armed: bool,
        status: Arc<BridgeStatus>,
    ) -> Self {
        Self {
            scales,
            interval_ns,
            target: Target::Stream {
                rings,
                gated: trigger_armed,
            },
            status,
            started: Instant::now(),
        }
    }

    /// Bridge for a rapid-block run of `len` samples per capture. `queue` is
    /// the hand-off channel the consumer drains.
    pub fn block(
        scales: [f32; 2],
        interval_ns: f64,
        len: usize,
        enabled: [bool; 2],
        limit: u64,
        queue: (Sender<Acquisition>, Receiver<Acquisition>),
        status: Arc<BridgeStatus>,
    ) -> Self {
        let (tx, rx) = queue;
        Self {
            scales,
            interval_ns,
            target: Target::Block {
                len,
                buffers: enabled.map(|on| on.then(|| BlockBuffer::new(len))),
                triggered: false,
                limit,
                tx,
                rx,
            },
            status,
            started: Instant::now(),
        }
    }

    fn record_overflow(&self) {
        let events = self.status.overflow_events.fetch_add(1, Ordering::Relaxed);
        if events == 0 {
            warn!("driver reported overflow; samples are being dropped");
        }
        let expected = self.started.elapsed().as_nanos() as f64 / self.interval_ns;
        let received = self.status.samples_received() as f64;
        let dropped = (expected - received).max(0.0) as u64;
        self.status
            .dropped_samples
            .fetch_max(dropped, Ordering::Relaxed);
    }
}

/// The `count` samples at `start` of a channel's overview buffer, or `None`
/// if the driver reported a region outside it.
fn region<'a>(
    buffers: &OverviewBuffers<'a>,
    channel: ChannelId,
    ready: &DataReady,
) -> Option<&'a [i16]> {
    buffers
        .channel(channel)
        .get(ready.start_index..ready.start_index + ready.sample_count)
}

impl DataSink for CallbackBridge {
    fn on_data(&mut self, ready: &DataReady, buffers: &OverviewBuffers<'_>) -> CallbackAction {
        if self.status.stop_requested() {
            return CallbackAction::Stop;
        }
        if ready.status.is_power_source_change() {
            warn!("device reports power source change: {}", ready.status);
            self.status
                .power_event
                .store(ready.status.code(), Ordering::Release);
        }

        let scales = self.scales;
        let mut action = CallbackAction::Continue;
        match &mut self.target {
            Target::Stream { rings, gated } => {
                if *gated && ready.triggered {
                    debug!("trigger fired, releasing ring updates");
                    *gated = false;
                }
                if !*gated {
                    for channel in ChannelId::ALL {
                        let Some(ring) = &rings[channel.index()] else {
                            continue;
                        };
                        if let Some(raw) = region(buffers, channel, ready) {
                            let scale = scales[channel.index()];
                            ring.push_batch(raw.iter().map(|&c| f32::from(c) * scale));
                        }
                    }
                }
                if ready.done {
                    self.status.finished.store(true, Ordering::Release);
                }
            }
            Target::Block {
                len,
                buffers: blocks,
                triggered,
                limit,
                tx,
                rx,
            } => {
                *triggered |= ready.triggered;
                for channel in ChannelId::ALL {
                    let Some(block) = &mut blocks[channel.index()] else {
                        continue;
                    };
                    if let Some(raw) = region(buffers, channel, ready) {
                        let scale = scales[channel.index()];
                        block.write_at(ready.start_index, raw.iter().map(|&c| f32::from(c) * scale));
                    }
                }

                if ready.done {
                    let sequence = self.status.captures_completed.fetch_add(1, Ordering::AcqRel) + 1;
                    // swap in fresh buffers for the next capture
                    let rows = blocks.each_mut().map(|slot| {
                        slot.as_mut()
                            .map(|b| std::mem::replace(b, BlockBuffer::new(*len)).into_samples())
                    });
                    let acquisition = Acquisition::from_rows(
                        sequence,
                        self.interval_ns,
                        std::mem::take(triggered),
                        *len,
                        rows,
                    );
                    let mut pending = acquisition;
                    loop {
                        match tx.try_send(pending) {
                            Ok(()) => {
                                debug!("capture {sequence} complete");
                                break;
                            }
                            Err(TrySendError::Full(back)) => {
                                // drop the oldest queued capture so the newest is kept
                                if rx.try_recv().is_ok() {
                                    self.status
                                        .captures_discarded
                                        .fetch_add(1, Ordering::Relaxed);
                                }
                                pending = back;
                            }
                            Err(TrySendError::Disconnected(_)) => {
                                self.status
                                    .captures_discarded
                                    .fetch_add(1, Ordering::Relaxed);
                                break;
                            }
                        }
                    }
                    if *limit > 0 && sequence >= *limit {
                        self.status.finished.store(true, Ordering::Release);
                        action = CallbackAction::Stop;
                    }
                }
            }
        }

        self.status
            .samples_received
            .fetch_add(ready.sample_count as u64, Ordering::Relaxed);
        if ready.overflow {
            self.record_overflow();
        }
        action
    }
}
