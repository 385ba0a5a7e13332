use std::fmt;

/// Status codes returned across the driver boundary.
///
/// Only the codes the engine reacts to get their own variant; anything else is
/// carried verbatim in `Unknown` so the external lookup layer can still name it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DriverStatus {
    Ok,
    MaxUnitsOpened,
    MemoryFail,
    NotFound,
    FwFail,
    OpenOperationInProgress,
    OperationFailed,
    NotResponding,
    InvalidHandle,
    InvalidParameter,
    InvalidTimebase,
    InvalidVoltageRange,
    InvalidChannel,
    InvalidTriggerChannel,
    StreamingFailed,
    BlockModeFailed,
    PowerSupplyConnected,
    PowerSupplyNotConnected,
    Unknown(u32),
}

impl From<u32> for DriverStatus {
    fn from(value: u32) -> Self {
        match value {
            0x00 => Self::Ok,
            0x01 => Self::MaxUnitsOpened,
            0x02 => Self::MemoryFail,
            0x03 => Self::NotFound,
            0x04 => Self::FwFail,
            0x05 => Self::OpenOperationInProgress,
            0x06 => Self::OperationFailed,
            0x07 => Self::NotResponding,
            0x0C => Self::InvalidHandle,
            0x0D => Self::InvalidParameter,
            0x0E => Self::InvalidTimebase,
            0x0F => Self::InvalidVoltageRange,
            0x10 => Self::InvalidChannel,
            0x11 => Self::InvalidTriggerChannel,
            0x14 => Self::StreamingFailed,
            0x15 => Self::BlockModeFailed,
            0x119 => Self::PowerSupplyConnected,
            0x11A => Self::PowerSupplyNotConnected,
            other => Self::Unknown(other),
        }
    }
}

impl DriverStatus {
    pub fn code(self) -> u32 {
        match self {
            Self::Ok => 0x00,
            Self::MaxUnitsOpened => 0x01,
            Self::MemoryFail => 0x02,
            Self::NotFound => 0x03,
            Self::FwFail => 0x04,
            Self::OpenOperationInProgress => 0x05,
            Self::OperationFailed => 0x06,
            Self::NotResponding => 0x07,
            Self::InvalidHandle => 0x0C,
            Self::InvalidParameter => 0x0D,
            Self::InvalidTimebase => 0x0E,
            Self::InvalidVoltageRange => 0x0F,
            Self::InvalidChannel => 0x10,
            Self::InvalidTriggerChannel => 0x11,
            Self::StreamingFailed => 0x14,
            Self::BlockModeFailed => 0x15,
            Self::PowerSupplyConnected => 0x119,
            Self::PowerSupplyNotConnected => 0x11A,
            Self::Unknown(code) => code,
        }
    }

    /// Power-source notifications are not failures: the device is usable once
    /// the host acknowledges the new supply state.
    pub fn is_power_source_change(self) -> bool {
        matches!(
            self,
            Self::PowerSupplyConnected | Self::PowerSupplyNotConnected
        )
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::PowerSupplyConnected => write!(f, "power supply connected (change required)"),
            Self::PowerSupplyNotConnected => write!(f, "power supply not connected"),
            Self::InvalidHandle => write!(f, "invalid handle"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::InvalidTimebase => write!(f, "invalid timebase"),
            other => write!(f, "status 0x{:08X} ({:?})", other.code(), other),
        }
    }
}

impl std::error::Error for DriverStatus {}
