use crate::{
    negotiate, AcquisitionMode, DeviceHandle, Driver, DriverStatus, EngineError, Resolution,
    SharedDriver, TimebaseResult,
};
use crossbeam_channel::{bounded, RecvTimeoutError, SendError};
use log::{info, warn};
use std::{sync::Arc, thread, time::Duration};

/// Runs `call` against the driver on a helper thread and waits at most
/// `timeout` for it.
///
/// The call itself cannot be cancelled. On expiry it keeps the driver locked
/// until it returns, so later calls queue behind it.
pub fn call_with_timeout<T, F>(
    driver: &SharedDriver,
    timeout: Duration,
    call: F,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Driver) -> Result<T, EngineError> + Send + 'static,
{
    call_with_timeout_or(driver, timeout, call, |_, _| {})
}

/// Like [`call_with_timeout`], but a value produced after the caller gave up
/// is handed to `abandon` while the driver is still locked.
pub fn call_with_timeout_or<T, F, A>(
    driver: &SharedDriver,
    timeout: Duration,
    call: F,
    abandon: A,
) -> Result<T, EngineError>
where
    T: Send + 'static,
    F: FnOnce(&mut dyn Driver) -> Result<T, EngineError> + Send + 'static,
    A: FnOnce(&mut dyn Driver, T) + Send + 'static,
{
    // rendezvous: a send succeeds only if the caller is still waiting
    let (tx, rx) = bounded(0);
    let driver = Arc::clone(driver);
    thread::Builder::new()
        .name("driver-call".into())
        .spawn(move || {
            let Ok(mut guard) = driver.lock() else {
                let _ = tx.send(Err(EngineError::Driver(DriverStatus::OperationFailed)));
                return;
            };
            let result = call(&mut *guard);
            if let Err(SendError(Ok(late))) = tx.send(result) {
                abandon(&mut *guard, late);
            }
        })?;

    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(RecvTimeoutError::Timeout) => Err(EngineError::DeviceUnresponsive(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(EngineError::Driver(DriverStatus::OperationFailed))
        }
    }
}

/// One opened device session. The native handle is released exactly once,
/// by [`close`](UnitHandle::close) or on drop.
pub struct UnitHandle {
    driver: SharedDriver,
    handle: Option<DeviceHandle>,
    resolution: Resolution,
    max_adc: i16,
    timeout: Duration,
}

impl UnitHandle {
    pub fn open(
        driver: SharedDriver,
        resolution: Resolution,
        timeout: Duration,
    ) -> Result<Self, EngineError> {
        let opened = move |d: &mut dyn Driver| -> Result<(DeviceHandle, i16), EngineError> {
            let unit = d
                .open_unit(resolution)
                .map_err(EngineError::DeviceUnavailable)?;
            let finish = |d: &mut dyn Driver| -> Result<i16, DriverStatus> {
                match unit.power_status {
                    DriverStatus::Ok => {}
                    status if status.is_power_source_change() => {
                        info!("acknowledging power source: {status}");
                        d.change_power_source(unit.handle, status)?;
                    }
                    status => return Err(status),
                }
                d.maximum_value(unit.handle)
            };
            match finish(&mut *d) {
                Ok(max_adc) => Ok((unit.handle, max_adc)),
                Err(status) => {
                    if let Err(close) = d.close_unit(unit.handle) {
                        warn!("closing unit {} after failed open: {close}", unit.handle.0);
                    }
                    Err(EngineError::DeviceUnavailable(status))
                }
            }
        };
        let late = move |d: &mut dyn Driver, (handle, _): (DeviceHandle, i16)| {
            warn!("unit {} opened after {timeout:?}, closing it", handle.0);
            if let Err(status) = d.close_unit(handle) {
                warn!("closing late unit {} failed: {status}", handle.0);
            }
        };
        let (handle, max_adc) = call_with_timeout_or(&driver, timeout, opened, late)?;
        info!("opened unit {} at {resolution}, full scale {max_adc} counts", handle.0);
        Ok(Self {
            driver,
            handle: Some(handle),
            resolution,
            max_adc,
            timeout,
        })
    }

    pub fn handle(&self) -> Result<DeviceHandle, EngineError> {
        self.handle
            .ok_or(EngineError::Driver(DriverStatus::InvalidHandle))
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Full-scale ADC count reported by the device at open.
    pub fn max_adc(&self) -> i16 {
        self.max_adc
    }

    /// Runs a short driver call on the current thread.
    pub fn with<T>(
        &self,
        call: impl FnOnce(&mut dyn Driver, DeviceHandle) -> Result<T, DriverStatus>,
    ) -> Result<T, EngineError> {
        let handle = self.handle()?;
        let mut driver = self
            .driver
            .lock()
            .map_err(|_| EngineError::Driver(DriverStatus::OperationFailed))?;
        Ok(call(&mut *driver, handle)?)
    }

    pub fn negotiate(
        &self,
        requested_ns: f64,
        enabled_channels: usize,
        mode: AcquisitionMode,
    ) -> Result<TimebaseResult, EngineError> {
        self.handle()?;
        let resolution = self.resolution;
        call_with_timeout(&self.driver, self.timeout, move |d| {
            negotiate(&*d, requested_ns, resolution, enabled_channels, mode)
        })
    }

    /// Stops any acquisition and releases the native handle. Calling it again
    /// is a no-op.
    pub fn close(&mut self) -> Result<(), EngineError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        info!("closing unit {}", handle.0);
        call_with_timeout(&self.driver, self.timeout, move |d| {
            if let Err(status) = d.stop(handle) {
                warn!("stop before close failed: {status}");
            }
            Ok(d.close_unit(handle)?)
        })
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("closing unit on drop failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedDriver};
    use std::sync::{atomic::Ordering, Mutex};

    fn shared(config: SimConfig) -> (Arc<Mutex<SimulatedDriver>>, SharedDriver) {
        let sim = Arc::new(Mutex::new(SimulatedDriver::new(config)));
        let driver: SharedDriver = sim.clone();
        (sim, driver)
    }

    #[test]
    fn close_releases_handle_exactly_once() {
        let (sim, driver) = shared(SimConfig::burst(16));
        let closes = sim.lock().unwrap().close_counter();
        let mut unit = UnitHandle::open(driver, Resolution::Bits8, Duration::from_secs(1)).unwrap();
        assert_eq!(unit.max_adc(), 32512);
        unit.close().unwrap();
        unit.close().unwrap();
        drop(unit);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_closes_an_open_unit() {
        let (sim, driver) = shared(SimConfig::burst(16));
        let closes = sim.lock().unwrap().close_counter();
        drop(UnitHandle::open(driver, Resolution::Bits12, Duration::from_secs(1)).unwrap());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn power_source_change_is_acknowledged() {
        let config = SimConfig {
            open_status: DriverStatus::PowerSupplyNotConnected,
            ..SimConfig::burst(16)
        };
        let (_, driver) = shared(config);
        let unit = UnitHandle::open(driver, Resolution::Bits12, Duration::from_secs(1)).unwrap();
        assert!(unit.is_open());
        assert_eq!(unit.max_adc(), 32767);
    }

    #[test]
    fn refused_power_change_makes_device_unavailable() {
        let config = SimConfig {
            open_status: DriverStatus::PowerSupplyConnected,
            reject_power_change: true,
            ..SimConfig::burst(16)
        };
        let (sim, driver) = shared(config);
        let closes = sim.lock().unwrap().close_counter();
        let err = UnitHandle::open(driver, Resolution::Bits8, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::DeviceUnavailable(DriverStatus::OperationFailed)
        ));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn open_failure_is_device_unavailable() {
        let config = SimConfig {
            open_error: Some(DriverStatus::NotFound),
            ..SimConfig::burst(16)
        };
        let (_, driver) = shared(config);
        let err = UnitHandle::open(driver, Resolution::Bits8, Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            EngineError::DeviceUnavailable(DriverStatus::NotFound)
        ));
    }

    #[test]
    fn slow_open_reports_unresponsive() {
        let config = SimConfig {
            open_delay: Duration::from_millis(300),
            ..SimConfig::burst(16)
        };
        let (_, driver) = shared(config);
        let err = UnitHandle::open(driver, Resolution::Bits8, Duration::from_millis(20))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DeviceUnresponsive(_)));
    }

    /// Waits for the simulator's close count to reach `n`.
    fn wait_for_closes(closes: &std::sync::atomic::AtomicUsize, n: usize) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while closes.load(Ordering::SeqCst) < n {
            assert!(std::time::Instant::now() < deadline, "unit was never closed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn late_open_is_closed_and_retry_succeeds() {
        let config = SimConfig {
            open_delay: Duration::from_millis(200),
            ..SimConfig::burst(16)
        };
        let (sim, driver) = shared(config);
        let closes = sim.lock().unwrap().close_counter();
        let err = UnitHandle::open(driver.clone(), Resolution::Bits8, Duration::from_millis(20))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DeviceUnresponsive(_)));

        wait_for_closes(&closes, 1);
        let mut unit = UnitHandle::open(driver, Resolution::Bits8, Duration::from_secs(2)).unwrap();
        assert!(unit.is_open());
        unit.close().unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn blocked_negotiation_reports_unresponsive() {
        let (sim, driver) = shared(SimConfig::burst(16));
        let unit = UnitHandle::open(driver, Resolution::Bits8, Duration::from_millis(50)).unwrap();
        let guard = sim.lock().unwrap();
        let err = unit
            .negotiate(1000.0, 2, AcquisitionMode::Streaming)
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::DeviceUnresponsive(_)));
        drop(guard);
        assert_eq!(
            unit.negotiate(1000.0, 2, AcquisitionMode::Streaming)
                .unwrap()
                .interval_ns,
            1000.0
        );
    }

    #[test]
    fn blocked_close_reports_unresponsive_and_still_releases() {
        let (sim, driver) = shared(SimConfig::burst(16));
        let closes = sim.lock().unwrap().close_counter();
        let mut unit =
            UnitHandle::open(driver, Resolution::Bits8, Duration::from_millis(50)).unwrap();
        let guard = sim.lock().unwrap();
        let err = unit.close().err().unwrap();
        assert!(matches!(err, EngineError::DeviceUnresponsive(_)));
        assert!(!unit.is_open());
        drop(guard);

        wait_for_closes(&closes, 1);
        unit.close().unwrap();
        drop(unit);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
