use crate::{AcquisitionMode, EngineError, Resolution, TimebaseSource};
use std::time::Duration;

/// Outcome of negotiating a requested sample interval with the device.
///
/// `interval_ns` is what the hardware will actually do; callers must use it
/// rather than the request.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimebaseResult {
    pub requested_ns: f64,
    pub interval_ns: f64,
    pub timebase: u32,
    /// The request was faster than the device can sample and the minimum
    /// interval was substituted.
    pub clamped_to_minimum: bool,
}

impl TimebaseResult {
    pub fn sample_rate_hz(&self) -> f64 {
        1e9 / self.interval_ns
    }

    /// Ring capacity covering `window`, never below 10 samples.
    pub fn ring_capacity(&self, window: Duration) -> usize {
        let samples = (window.as_nanos() as f64 / self.interval_ns).round() as usize;
        samples.max(10)
    }

    /// Block length covering `window`.
    pub fn block_len(&self, window: Duration) -> usize {
        let samples = (window.as_nanos() as f64 / self.interval_ns).ceil() as usize;
        samples.max(1)
    }
}

/// Finds the achievable interval nearest to `requested_ns`.
///
/// Requests below the minimum for this resolution and channel count are
/// silently raised to the minimum. On a tie the slower interval wins, so the
/// realized value never undershoots the request when two ticks are equidistant.
pub fn negotiate<S>(
    source: &S,
    requested_ns: f64,
    resolution: Resolution,
    enabled_channels: usize,
    mode: AcquisitionMode,
) -> Result<TimebaseResult, EngineError>
where
    S: TimebaseSource + ?Sized,
{
    if !requested_ns.is_finite() || requested_ns <= 0.0 {
        return Err(EngineError::InvalidConfig(format!(
            "sample interval must be positive, got {requested_ns} ns"
        )));
    }
    let unsupported = || EngineError::UnsupportedTimebase {
        resolution,
        channels: enabled_channels,
    };

    let min_tb = source
        .minimum_timebase(enabled_channels, resolution)
        .map_err(|_| unsupported())?;
    let min_ns = source
        .timebase_interval_ns(min_tb, resolution)
        .map_err(|_| unsupported())?;

    let (timebase, interval_ns) = if requested_ns <= min_ns {
        (min_tb, min_ns)
    } else {
        nearest_timebase(source, requested_ns, resolution, min_tb, min_ns)
    };

    let interval_ns = match mode {
        // run-streaming takes a whole number of nanoseconds
        AcquisitionMode::Streaming => {
            let whole = interval_ns.ceil();
            if whole > f64::from(u32::MAX) {
                return Err(unsupported());
            }
            whole
        }
        AcquisitionMode::Block => interval_ns,
    };

    Ok(TimebaseResult {
        requested_ns,
        interval_ns,
        timebase,
        clamped_to_minimum: requested_ns < min_ns,
    })
}

/// Binary search over timebase indices. Intervals grow with the index; an
/// index the driver rejects counts as infinitely slow.
fn nearest_timebase<S>(
    source: &S,
    requested_ns: f64,
    resolution: Resolution,
    min_tb: u32,
    min_ns: f64,
) -> (u32, f64)
where
    S: TimebaseSource + ?Sized,
{
    let interval = |tb: u32| source.timebase_interval_ns(tb, resolution).ok();

    if let Some(max_ns) = interval(u32::MAX) {
        if max_ns < requested_ns {
            return (u32::MAX, max_ns);
        }
    }

    let (mut lo, mut lo_ns) = (min_tb, min_ns);
    let mut hi = u32::MAX;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        match interval(mid) {
            Some(ns) if ns < requested_ns => {
                lo = mid;
                lo_ns = ns;
            }
            _ => hi = mid,
        }
    }

    match interval(hi) {
        Some(hi_ns) if hi_ns - requested_ns <= requested_ns - lo_ns => (hi, hi_ns),
        _ => (lo, lo_ns),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::Ps5000aTimebase;

    #[test]
    fn below_minimum_is_raised_to_minimum() {
        let table = Ps5000aTimebase;
        for (resolution, channels, min_ns) in [
            (Resolution::Bits8, 1, 1.0),
            (Resolution::Bits8, 2, 2.0),
            (Resolution::Bits12, 2, 4.0),
            (Resolution::Bits14, 2, 8.0),
            (Resolution::Bits15, 2, 8.0),
            (Resolution::Bits16, 1, 16.0),
        ] {
            for requested in [0.1, 0.5, min_ns * 0.9] {
                let r = negotiate(
                    &table,
                    requested,
                    resolution,
                    channels,
                    AcquisitionMode::Block,
                )
                .unwrap();
                assert!(r.interval_ns >= min_ns, "{resolution}: {r:?}");
                assert!(r.clamped_to_minimum);
            }
        }
    }

    #[test]
    fn negotiation_is_deterministic() {
        let table = Ps5000aTimebase;
        let first = negotiate(&table, 1234.0, Resolution::Bits12, 2, AcquisitionMode::Block);
        for _ in 0..5 {
            let again =
                negotiate(&table, 1234.0, Resolution::Bits12, 2, AcquisitionMode::Block);
            assert_eq!(first.as_ref().unwrap(), again.as_ref().unwrap());
        }
    }

    #[test]
    fn returns_nearest_tick() {
        let table = Ps5000aTimebase;
        // 8-bit ticks above 4 ns are multiples of 8 ns
        let r = negotiate(&table, 1003.0, Resolution::Bits8, 2, AcquisitionMode::Block).unwrap();
        assert_eq!(r.interval_ns, 1000.0);
        let r = negotiate(&table, 1005.0, Resolution::Bits8, 2, AcquisitionMode::Block).unwrap();
        assert_eq!(r.interval_ns, 1008.0);
        // equidistant picks the slower tick
        let r = negotiate(&table, 1004.0, Resolution::Bits8, 2, AcquisitionMode::Block).unwrap();
        assert_eq!(r.interval_ns, 1008.0);
        assert!(!r.clamped_to_minimum);
    }

    #[test]
    fn twenty_millisecond_interval_at_twelve_bits() {
        let table = Ps5000aTimebase;
        let r = negotiate(
            &table,
            20_000_000.0,
            Resolution::Bits12,
            1,
            AcquisitionMode::Streaming,
        )
        .unwrap();
        assert!(r.interval_ns >= 20_000_000.0);
        assert_eq!(r.interval_ns, 20_000_000.0);
        assert_eq!(r.ring_capacity(Duration::from_secs(5)), 250);
    }

    #[test]
    fn two_channels_at_sixteen_bits_is_unsupported() {
        let table = Ps5000aTimebase;
        let err = negotiate(&table, 100.0, Resolution::Bits16, 2, AcquisitionMode::Block)
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedTimebase { channels: 2, .. }
        ));
    }

    #[test]
    fn rejects_non_positive_request() {
        let table = Ps5000aTimebase;
        assert!(negotiate(&table, 0.0, Resolution::Bits8, 1, AcquisitionMode::Block).is_err());
        assert!(negotiate(&table, f64::NAN, Resolution::Bits8, 1, AcquisitionMode::Block).is_err());
    }

    #[test]
    fn ring_capacity_has_a_floor() {
        let r = TimebaseResult {
            requested_ns: 1000.0,
            interval_ns: 1000.0,
            timebase: 127,
            clamped_to_minimum: false,
        };
        assert_eq!(r.ring_capacity(Duration::from_micros(2)), 10);
        assert_eq!(r.ring_capacity(Duration::from_millis(20)), 20_000);
        assert_eq!(r.block_len(Duration::from_nanos(2500)), 3);
    }
}
