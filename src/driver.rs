//! The vendor driver boundary.
//!
//! The engine never talks to a native library directly. Everything it needs
//! from the digitizer goes through [`Driver`], and sample delivery comes back
//! through a [`DataSink`] that the driver invokes on a thread of its own.

use crate::{ChannelConfig, ChannelId, DriverStatus, TriggerDirection, VoltageRange};
use serde::Deserialize;
use std::{
    fmt,
    sync::{Arc, Mutex},
};

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(try_from = "u8")]
pub enum Resolution {
    Bits8,
    Bits12,
    Bits14,
    Bits15,
    Bits16,
}

impl Resolution {
    pub fn bits(self) -> u8 {
        match self {
            Resolution::Bits8 => 8,
            Resolution::Bits12 => 12,
            Resolution::Bits14 => 14,
            Resolution::Bits15 => 15,
            Resolution::Bits16 => 16,
        }
    }
}

impl TryFrom<u8> for Resolution {
    type Error = String;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(Resolution::Bits8),
            12 => Ok(Resolution::Bits12),
            14 => Ok(Resolution::Bits14),
            15 => Ok(Resolution::Bits15),
            16 => Ok(Resolution::Bits16),
            other => Err(format!("unsupported resolution: {other} bits")),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

#[derive(Deserialize, clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AcquisitionMode {
    Streaming,
    Block,
}

impl fmt::Display for AcquisitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquisitionMode::Streaming => write!(f, "streaming"),
            AcquisitionMode::Block => write!(f, "rapid block"),
        }
    }
}

/// Opaque native session identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub i16);

/// Result of a successful open. `power_status` is `Ok` unless the device
/// wants the host to acknowledge a power-source change.
#[derive(Clone, Copy, Debug)]
pub struct OpenedUnit {
    pub handle: DeviceHandle,
    pub power_status: DriverStatus,
}

/// Device-native form of a single-channel edge trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimpleTrigger {
    pub source: ChannelId,
    pub threshold_counts: i16,
    pub direction: TriggerDirection,
    /// 0 waits for a real trigger event forever.
    pub auto_trigger_ms: u32,
}

/// "N new samples are ready at offset O" as reported by the driver.
#[derive(Clone, Copy, Debug)]
pub struct DataReady {
    pub sample_count: usize,
    pub start_index: usize,
    /// The driver produced samples faster than they were collected.
    pub overflow: bool,
    /// The trigger condition was met inside this batch.
    pub triggered: bool,
    /// Block mode: the capture is complete. Streaming: the driver auto-stopped.
    pub done: bool,
    /// Anything other than `Ok` is a runtime condition raised by the device,
    /// e.g. a power-source change.
    pub status: DriverStatus,
}

/// Views into the driver-owned overview buffers registered through
/// [`Driver::set_data_buffer`]. A disabled channel has an empty slice.
pub struct OverviewBuffers<'a> {
    pub channels: [&'a [i16]; 2],
}

impl<'a> OverviewBuffers<'a> {
    pub fn channel(&self, channel: ChannelId) -> &'a [i16] {
        self.channels[channel.index()]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Receiver of driver notifications. Runs on the driver's thread and must
/// never block.
pub trait DataSink: Send {
    fn on_data(&mut self, ready: &DataReady, buffers: &OverviewBuffers<'_>) -> CallbackAction;
}

/// Timebase queries. Kept apart from [`Driver`] so negotiation can run
/// against any capability table.
pub trait TimebaseSource {
    fn minimum_timebase(
        &self,
        enabled_channels: usize,
        resolution: Resolution,
    ) -> Result<u32, DriverStatus>;

    fn timebase_interval_ns(&self, timebase: u32, resolution: Resolution)
        -> Result<f64, DriverStatus>;
}

pub trait Driver: TimebaseSource + Send {
    fn open_unit(&mut self, resolution: Resolution) -> Result<OpenedUnit, DriverStatus>;

    fn close_unit(&mut self, handle: DeviceHandle) -> Result<(), DriverStatus>;

    fn change_power_source(
        &mut self,
        handle: DeviceHandle,
        status: DriverStatus,
    ) -> Result<(), DriverStatus>;

    /// Full-scale ADC count for the current resolution.
    fn maximum_value(&self, handle: DeviceHandle) -> Result<i16, DriverStatus>;

    fn supported_ranges(&self) -> &[VoltageRange];

    fn max_samples_per_segment(&self, handle: DeviceHandle) -> Result<usize, DriverStatus>;

    fn set_channel(
        &mut self,
        handle: DeviceHandle,
        channel: ChannelId,
        config: &ChannelConfig,
    ) -> Result<(), DriverStatus>;

    /// `None` disables the trigger.
    fn set_simple_trigger(
        &mut self,
        handle: DeviceHandle,
        trigger: Option<&SimpleTrigger>,
    ) -> Result<(), DriverStatus>;

    fn set_data_buffer(
        &mut self,
        handle: DeviceHandle,
        channel: ChannelId,
        len: usize,
    ) -> Result<(), DriverStatus>;

    fn run_streaming(
        &mut self,
        handle: DeviceHandle,
        interval_ns: u32,
        buffer_size: usize,
        sink: Box<dyn DataSink>,
    ) -> Result<(), DriverStatus>;

    fn run_block(
        &mut self,
        handle: DeviceHandle,
        timebase: u32,
        samples: usize,
        sink: Box<dyn DataSink>,
    ) -> Result<(), DriverStatus>;

    /// Stops any running acquisition. Returns once the driver has stopped
    /// issuing callbacks.
    fn stop(&mut self, handle: DeviceHandle) -> Result<(), DriverStatus>;
}

pub type SharedDriver = Arc<Mutex<dyn Driver>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolution_from_bits() {
        assert_eq!(Resolution::try_from(12), Ok(Resolution::Bits12));
        assert!(Resolution::try_from(10).is_err());
        assert_eq!(Resolution::Bits16.to_string(), "16-bit");
    }
}
