mod bridge;
mod buffer;
mod channel;
pub mod config;
mod decimate;
mod driver;
mod engine;
mod error;
mod recorder;
pub mod sim;
mod status_code;
mod timebase;
mod trigger;
pub mod tui;
mod unit;
mod utils;

pub use bridge::{BridgeStatus, CallbackBridge};
pub use buffer::{BlockBuffer, RingBuffer, RingSnapshot};
pub use channel::{ChannelConfig, ChannelId, ChannelSet, Coupling, VoltageRange};
pub use config::{Conf, EngineConfig, RecordingConfig};
pub use decimate::{bucket_bounds, decimate, decimate_points, PlotPoint};
pub use driver::{
    AcquisitionMode, CallbackAction, DataReady, DataSink, DeviceHandle, Driver, OpenedUnit,
    OverviewBuffers, Resolution, SharedDriver, SimpleTrigger, TimebaseSource,
};
pub use engine::{
    AcquisitionEngine, Condition, DisplayFrame, EngineStatus, SessionState, Trace,
};
pub use error::EngineError;
pub use recorder::{
    read_acquisition, write_acquisition, Acquisition, Recorder, RecordingSummary, SampleFormat,
};
pub use sim::{SimConfig, SimulatedDriver};
pub use status_code::DriverStatus;
pub use timebase::{negotiate, TimebaseResult};
pub use trigger::{
    threshold_counts, RealizedThreshold, Threshold, TriggerConfig, TriggerConfigurator,
    TriggerDirection,
};
pub use unit::{call_with_timeout, UnitHandle};
pub use utils::Counter;
