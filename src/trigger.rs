use crate::{ChannelId, EngineError, SimpleTrigger, VoltageRange};
use serde::Deserialize;
use std::{fmt, str::FromStr};

#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerDirection {
    Rising,
    Falling,
}

impl fmt::Display for TriggerDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerDirection::Rising => write!(f, "rising"),
            TriggerDirection::Falling => write!(f, "falling"),
        }
    }
}

/// A trigger level in one of the forms a user can type it.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq)]
#[serde(try_from = "String")]
pub enum Threshold {
    Volts(f64),
    /// Fraction of the source channel's full scale, 1.0 = +full scale.
    Fraction(f64),
    /// Raw ADC counts.
    Counts(i32),
}

impl Threshold {
    /// Threshold expressed in volts for the given range.
    pub fn volts(self, range: VoltageRange, max_adc: i16) -> f64 {
        match self {
            Threshold::Volts(v) => v,
            Threshold::Fraction(f) => f * range.volts(),
            Threshold::Counts(c) => f64::from(c) / f64::from(max_adc) * range.volts(),
        }
    }
}

/// Accepts `1.5V`, `250mV`, `10%` or a bare integer count.
impl FromStr for Threshold {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad = || EngineError::InvalidConfig(format!("unrecognised trigger threshold {s:?}"));
        let lower = s.to_ascii_lowercase();
        if let Some(pct) = lower.strip_suffix('%') {
            let pct: f64 = pct.trim().parse().map_err(|_| bad())?;
            Ok(Threshold::Fraction(pct / 100.0))
        } else if let Some(mv) = lower.strip_suffix("mv") {
            let mv: f64 = mv.trim().parse().map_err(|_| bad())?;
            Ok(Threshold::Volts(mv / 1000.0))
        } else if let Some(v) = lower.strip_suffix('v') {
            Ok(Threshold::Volts(v.trim().parse().map_err(|_| bad())?))
        } else {
            Ok(Threshold::Counts(lower.parse().map_err(|_| bad())?))
        }
    }
}

impl TryFrom<String> for Threshold {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TriggerConfig {
    pub source: ChannelId,
    pub threshold: Threshold,
    pub direction: TriggerDirection,
    pub auto_trigger_ms: u32,
}

/// The threshold the device actually got.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RealizedThreshold {
    pub counts: i16,
    pub volts: f64,
    /// The requested level was outside the representable range and saturated.
    pub clamped: bool,
}

impl fmt::Display for RealizedThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.4} V ({} counts)", self.volts, self.counts)?;
        if self.clamped {
            write!(f, " [clamped]")?;
        }
        Ok(())
    }
}

/// `count = round(volts / range * max_adc)`, saturated to `±max_adc`.
pub fn threshold_counts(threshold: Threshold, range: VoltageRange, max_adc: i16) -> RealizedThreshold {
    let max = i64::from(max_adc);
    let raw = match threshold {
        Threshold::Counts(c) => i64::from(c),
        other => {
            let scaled = other.volts(range, max_adc) / range.volts() * f64::from(max_adc);
            if scaled.is_nan() {
                0
            } else {
                // float-to-int casts saturate, so infinities land outside ±max
                scaled.round() as i64
            }
        }
    };
    let counts = raw.clamp(-max, max);
    RealizedThreshold {
        counts: counts as i16,
        volts: counts as f64 / f64::from(max_adc) * range.volts(),
        clamped: counts != raw,
    }
}

/// Holds the one simple trigger a session may have armed.
#[derive(Debug, Default)]
pub struct TriggerConfigurator {
    armed: Option<(TriggerConfig, RealizedThreshold)>,
}

impl TriggerConfigurator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn armed(&self) -> Option<&(TriggerConfig, RealizedThreshold)> {
        self.armed.as_ref()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Computes the device form of `config` for the given source range.
    /// Nothing changes until [`commit`](Self::commit) is called.
    pub fn prepare(
        config: &TriggerConfig,
        range: VoltageRange,
        max_adc: i16,
    ) -> (SimpleTrigger, RealizedThreshold) {
        let realized = threshold_counts(config.threshold, range, max_adc);
        let native = SimpleTrigger {
            source: config.source,
            threshold_counts: realized.counts,
            direction: config.direction,
            auto_trigger_ms: config.auto_trigger_ms,
        };
        (native, realized)
    }

    pub fn commit(&mut self, config: TriggerConfig, realized: RealizedThreshold) {
        self.armed = Some((config, realized));
    }

    pub fn clear(&mut self) {
        self.armed = None;
    }
}
