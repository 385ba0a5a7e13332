use crate::{
    AcquisitionMode, ChannelConfig, ChannelId, Coupling, EngineError, Resolution, SampleFormat,
    Threshold, TriggerConfig, TriggerDirection, VoltageRange,
};
use confique::Config;
use std::{path::Path, path::PathBuf, time::Duration};

pub const DEFAULT_CONFIG_FILE: &str = "scope_daq.toml";

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub acquisition: AcquisitionSettings,
    #[config(nested)]
    pub channels: ChannelSettings,
    #[config(nested)]
    pub trigger: TriggerSettings,
    #[config(nested)]
    pub recording: RecordingSettings,
}

#[derive(Config, Debug, Clone)]
pub struct AcquisitionSettings {
    /// "streaming" or "block"
    #[config(default = "streaming")]
    pub mode: AcquisitionMode,
    #[config(env = "SCOPE_DAQ_SAMPLE_INTERVAL_NS", default = 1000.0)]
    pub sample_interval_ns: f64,
    /// ADC resolution in bits: 8, 12, 14, 15 or 16
    #[config(default = 8)]
    pub resolution: u8,
    #[config(default = 200000)]
    pub driver_buffer_size: usize,
    #[config(env = "SCOPE_DAQ_WINDOW_MS", default = 20.0)]
    pub window_ms: f64,
    #[config(default = 20)]
    pub refresh_ms: u64,
    #[config(default = 6000)]
    pub max_points: usize,
    /// Settling time after the channels are configured
    #[config(default = 500)]
    pub connect_delay_ms: u64,
    /// Upper bound on open, close and timebase queries
    #[config(env = "SCOPE_DAQ_DEVICE_TIMEOUT_MS", default = 5000)]
    pub device_timeout_ms: u64,
    /// Rapid-block captures per run, 0 = until stopped
    #[config(default = 0)]
    pub block_captures: u64,
}

#[derive(Config, Debug, Clone)]
pub struct ChannelSettings {
    #[config(nested)]
    pub a: PerChannelSettings,
    #[config(nested)]
    pub b: PerChannelSettings,
}

#[derive(Config, Debug, Clone)]
pub struct PerChannelSettings {
    #[config(default = true)]
    pub enabled: bool,
    #[config(default = "2V")]
    pub range: VoltageRange,
    #[config(default = "dc")]
    pub coupling: Coupling,
}

#[derive(Config, Debug, Clone)]
pub struct TriggerSettings {
    #[config(default = false)]
    pub enabled: bool,
    #[config(default = "a")]
    pub source: ChannelId,
    /// "1.5V", "250mV", "10%" or raw counts
    #[config(default = "10%")]
    pub threshold: Threshold,
    #[config(default = "rising")]
    pub direction: TriggerDirection,
    /// 0 waits for a real trigger event
    #[config(default = 0)]
    pub auto_trigger_ms: u32,
}

#[derive(Config, Debug, Clone)]
pub struct RecordingSettings {
    #[config(env = "SCOPE_DAQ_OUTPUT_DIR", default = "recordings")]
    pub output_dir: String,
    /// Streaming snapshot period; defaults to the refresh period
    pub snapshot_interval_ms: Option<u64>,
    /// "f16", or "f32" for the legacy layout
    #[config(default = "f16")]
    pub format: SampleFormat,
}

impl Conf {
    /// Layers the environment over `path` (if it exists) over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, confique::Error> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        Conf::builder().env().file(path).load()
    }

    pub fn validate(&self) -> Result<EngineConfig, EngineError> {
        let acq = &self.acquisition;
        let channel = |c: &PerChannelSettings| ChannelConfig {
            enabled: c.enabled,
            range: c.range,
            coupling: c.coupling,
        };
        let trigger = self.trigger.enabled.then(|| TriggerConfig {
            source: self.trigger.source,
            threshold: self.trigger.threshold,
            direction: self.trigger.direction,
            auto_trigger_ms: self.trigger.auto_trigger_ms,
        });
        let refresh = Duration::from_millis(acq.refresh_ms);

        EngineConfig {
            mode: acq.mode,
            sample_interval_ns: acq.sample_interval_ns,
            resolution: Resolution::try_from(acq.resolution).map_err(EngineError::InvalidConfig)?,
            driver_buffer_size: acq.driver_buffer_size,
            window: duration_ms(acq.window_ms)?,
            refresh,
            max_points: acq.max_points,
            connect_delay: Duration::from_millis(acq.connect_delay_ms),
            device_timeout: Duration::from_millis(acq.device_timeout_ms),
            block_captures: acq.block_captures,
            channels: [channel(&self.channels.a), channel(&self.channels.b)],
            trigger,
            recording: RecordingConfig {
                output_dir: PathBuf::from(&self.recording.output_dir),
                snapshot_interval: self
                    .recording
                    .snapshot_interval_ms
                    .map_or(refresh, Duration::from_millis),
                format: self.recording.format,
            },
        }
        .checked()
    }
}

fn duration_ms(ms: f64) -> Result<Duration, EngineError> {
    Duration::try_from_secs_f64(ms / 1000.0)
        .map_err(|e| EngineError::InvalidConfig(format!("bad duration {ms} ms: {e}")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    pub snapshot_interval: Duration,
    pub format: SampleFormat,
}

/// Validated settings for one engine session. Never mutated in place; the
/// `with_*` methods return a new validated value.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub mode: AcquisitionMode,
    pub sample_interval_ns: f64,
    pub resolution: Resolution,
    pub driver_buffer_size: usize,
    pub window: Duration,
    pub refresh: Duration,
    pub max_points: usize,
    pub connect_delay: Duration,
    pub device_timeout: Duration,
    pub block_captures: u64,
    pub channels: [ChannelConfig; 2],
    pub trigger: Option<TriggerConfig>,
    pub recording: RecordingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::Streaming,
            sample_interval_ns: 1000.0,
            resolution: Resolution::Bits8,
            driver_buffer_size: 200_000,
            window: Duration::from_millis(20),
            refresh: Duration::from_millis(20),
            max_points: 6000,
            connect_delay: Duration::from_millis(500),
            device_timeout: Duration::from_secs(5),
            block_captures: 0,
            channels: [ChannelConfig::default(); 2],
            trigger: None,
            recording: RecordingConfig {
                output_dir: PathBuf::from("recordings"),
                snapshot_interval: Duration::from_millis(20),
                format: SampleFormat::F16,
            },
        }
    }
}

impl EngineConfig {
    pub fn checked(self) -> Result<Self, EngineError> {
        let bad = |msg: String| Err(EngineError::InvalidConfig(msg));
        if !self.sample_interval_ns.is_finite() || self.sample_interval_ns <= 0.0 {
            return bad(format!(
                "sample interval must be positive, got {} ns",
                self.sample_interval_ns
            ));
        }
        if self.window.is_zero() {
            return bad("display window must be longer than zero".into());
        }
        if self.refresh.is_zero() || self.recording.snapshot_interval.is_zero() {
            return bad("refresh and snapshot periods must be longer than zero".into());
        }
        if self.driver_buffer_size == 0 {
            return bad("driver buffer size must be at least one sample".into());
        }
        if self.max_points < 2 {
            return bad(format!("max_points must be at least 2, got {}", self.max_points));
        }
        if self.channels.iter().all(|c| !c.enabled) {
            return bad("at least one channel must be enabled".into());
        }
        if let Some(trigger) = &self.trigger {
            if !self.channels[trigger.source.index()].enabled {
                return bad(format!("trigger source {} is disabled", trigger.source));
            }
        }
        Ok(self)
    }

    pub fn with_sample_interval(&self, ns: f64) -> Result<Self, EngineError> {
        Self {
            sample_interval_ns: ns,
            ..self.clone()
        }
        .checked()
    }

    pub fn with_window(&self, window: Duration) -> Result<Self, EngineError> {
        Self {
            window,
            ..self.clone()
        }
        .checked()
    }

    pub fn with_mode(&self, mode: AcquisitionMode) -> Result<Self, EngineError> {
        Self {
            mode,
            ..self.clone()
        }
        .checked()
    }

    pub fn with_channel(&self, channel: ChannelId, config: ChannelConfig) -> Result<Self, EngineError> {
        let mut next = self.clone();
        next.channels[channel.index()] = config;
        next.checked()
    }

    pub fn with_trigger(&self, trigger: Option<TriggerConfig>) -> Result<Self, EngineError> {
        Self {
            trigger,
            ..self.clone()
        }
        .checked()
    }
}

/// Trigger used when the user toggles the trigger on without configuring
/// one: 10 % of the source range, rising.
pub fn default_trigger(source: ChannelId) -> TriggerConfig {
    TriggerConfig {
        source,
        threshold: Threshold::Fraction(0.1),
        direction: TriggerDirection::Rising,
        auto_trigger_ms: 0,
    }
}
