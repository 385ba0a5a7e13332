use crate::EngineError;
use serde::Deserialize;
use std::{fmt, str::FromStr};

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChannelId {
    A,
    B,
}

impl ChannelId {
    pub const ALL: [ChannelId; 2] = [ChannelId::A, ChannelId::B];

    pub fn index(self) -> usize {
        match self {
            ChannelId::A => 0,
            ChannelId::B => 1,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::A => write!(f, "A"),
            ChannelId::B => write!(f, "B"),
        }
    }
}

/// Input ranges, ordered from most to least sensitive. Each is symmetric
/// around zero, so `volts()` is the magnitude of full scale.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "String")]
pub enum VoltageRange {
    Mv10,
    Mv20,
    Mv50,
    Mv100,
    Mv200,
    Mv500,
    V1,
    V2,
    V5,
    V10,
    V20,
}

impl VoltageRange {
    pub const ALL: [VoltageRange; 11] = [
        VoltageRange::Mv10,
        VoltageRange::Mv20,
        VoltageRange::Mv50,
        VoltageRange::Mv100,
        VoltageRange::Mv200,
        VoltageRange::Mv500,
        VoltageRange::V1,
        VoltageRange::V2,
        VoltageRange::V5,
        VoltageRange::V10,
        VoltageRange::V20,
    ];

    pub fn volts(self) -> f64 {
        match self {
            VoltageRange::Mv10 => 0.010,
            VoltageRange::Mv20 => 0.020,
            VoltageRange::Mv50 => 0.050,
            VoltageRange::Mv100 => 0.100,
            VoltageRange::Mv200 => 0.200,
            VoltageRange::Mv500 => 0.500,
            VoltageRange::V1 => 1.0,
            VoltageRange::V2 => 2.0,
            VoltageRange::V5 => 5.0,
            VoltageRange::V10 => 10.0,
            VoltageRange::V20 => 20.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            VoltageRange::Mv10 => "10mV",
            VoltageRange::Mv20 => "20mV",
            VoltageRange::Mv50 => "50mV",
            VoltageRange::Mv100 => "100mV",
            VoltageRange::Mv200 => "200mV",
            VoltageRange::Mv500 => "500mV",
            VoltageRange::V1 => "1V",
            VoltageRange::V2 => "2V",
            VoltageRange::V5 => "5V",
            VoltageRange::V10 => "10V",
            VoltageRange::V20 => "20V",
        }
    }

    /// Next range up, wrapping to the most sensitive one.
    pub fn next(self) -> Self {
        let idx = Self::ALL.iter().position(|r| *r == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }
}

impl fmt::Display for VoltageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "±{}", self.label())
    }
}

impl FromStr for VoltageRange {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted: String = s
            .trim()
            .trim_start_matches('±')
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        VoltageRange::ALL
            .into_iter()
            .find(|r| r.label().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| EngineError::InvalidRange(s.to_string()))
    }
}

impl TryFrom<String> for VoltageRange {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Coupling {
    Ac,
    Dc,
}

impl fmt::Display for Coupling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Coupling::Ac => write!(f, "AC"),
            Coupling::Dc => write!(f, "DC"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub enabled: bool,
    pub range: VoltageRange,
    pub coupling: Coupling,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            range: VoltageRange::V2,
            coupling: Coupling::Dc,
        }
    }
}

/// Per-channel configuration of one session, as last accepted by the device.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelSet {
    configs: [ChannelConfig; 2],
}

impl ChannelSet {
    pub fn new(configs: [ChannelConfig; 2]) -> Self {
        Self { configs }
    }

    pub fn get(&self, channel: ChannelId) -> &ChannelConfig {
        &self.configs[channel.index()]
    }

    pub fn range(&self, channel: ChannelId) -> VoltageRange {
        self.configs[channel.index()].range
    }

    pub fn is_enabled(&self, channel: ChannelId) -> bool {
        self.configs[channel.index()].enabled
    }

    pub fn enabled_count(&self) -> usize {
        self.configs.iter().filter(|c| c.enabled).count()
    }

    /// Checks a proposed change against the device's supported ranges without
    /// applying it.
    pub fn validate(
        &self,
        supported: &[VoltageRange],
        channel: ChannelId,
        config: &ChannelConfig,
    ) -> Result<(), EngineError> {
        if !supported.contains(&config.range) {
            return Err(EngineError::InvalidRange(config.range.to_string()));
        }
        let other = match channel {
            ChannelId::A => ChannelId::B,
            ChannelId::B => ChannelId::A,
        };
        if !config.enabled && !self.is_enabled(other) {
            return Err(EngineError::InvalidConfig(
                "at least one channel must stay enabled".into(),
            ));
        }
        Ok(())
    }

    /// Commits a change that has already been accepted by the device.
    pub fn commit(&mut self, channel: ChannelId, config: ChannelConfig) {
        self.configs[channel.index()] = config;
    }
}
