use crate::{DriverStatus, Resolution, SessionState};
use std::{io, path::PathBuf, time::Duration};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(DriverStatus),

    #[error("no timebase supports {resolution} with {channels} enabled channel(s)")]
    UnsupportedTimebase {
        resolution: Resolution,
        channels: usize,
    },

    #[error("voltage range {0} is not supported by this device")]
    InvalidRange(String),

    #[error("sampling overflow: {dropped} samples dropped so far")]
    Overflow { dropped: u64 },

    #[error("recording destination {} is not writable: {source}", path.display())]
    DestinationUnwritable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device did not respond within {0:?}")]
    DeviceUnresponsive(Duration),

    #[error("driver call failed: {0}")]
    Driver(#[from] DriverStatus),

    #[error("operation not allowed while {0}")]
    InvalidState(SessionState),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed acquisition file: {0}")]
    Format(String),
}
