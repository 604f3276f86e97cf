use std::time::Duration;

use tracing::{debug, error, warn};

use crate::{
    modbus::{Device, ModbusTransport, MAX_CONSECUTIVE_FAILURES},
    poller,
    shutdown::Shutdown,
};

#[derive(Clone, Debug)]
pub struct CycleOptions {
    /// Pause between two reads, giving the bus and the device time to settle.
    pub interval: Duration,
    /// Disable pollers that keep failing.
    pub autoremove: bool,
}

impl Default for CycleOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            autoremove: false,
        }
    }
}

/// Outcome of one pass over every device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reads: usize,
    pub failures: usize,
    /// Set when shutdown cut the cycle short.
    pub interrupted: bool,
}

/// Runs one poll cycle: every enabled poller of every device, in
/// declaration order, over a connection opened for the cycle.
///
/// A failing read only affects its own poller. Shutdown is checked before
/// each read and during the settle pause; an in-flight read is always
/// allowed to finish.
pub async fn poll_cycle<T>(
    devices: &mut [Device],
    transport: &mut T,
    shutdown: &mut Shutdown,
    options: &CycleOptions,
) -> CycleReport
where
    T: ModbusTransport + ?Sized,
{
    let mut report = CycleReport::default();

    if let Err(error) = transport.connect().await {
        // Counted per poller below, as each read fails on its own.
        warn!(%error, "Unable to connect to the Modbus network");
    }

    'devices: for device in devices.iter_mut() {
        for index in 0..device.pollers.len() {
            if device.pollers[index].disabled {
                continue;
            }
            if report.reads > 0 && !shutdown.sleep(options.interval).await {
                report.interrupted = true;
                break 'devices;
            }
            if shutdown.is_shutdown() {
                report.interrupted = true;
                break 'devices;
            }

            report.reads += 1;
            if !poller::poll(device, index, transport).await {
                report.failures += 1;
                disable_if_failing(device, index, options.autoremove);
            }
        }
    }

    transport.close().await;
    debug!(?report, "Poll cycle finished");
    report
}

fn disable_if_failing(device: &mut Device, index: usize, autoremove: bool) {
    let poller = &mut device.pollers[index];
    if autoremove && poller.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
        poller.disabled = true;
        error!(
            device = %device.name,
            function = %poller.function,
            start = poller.start_address,
            failures = poller.consecutive_failures,
            "Poller disabled after repeated failures"
        );
    }
}

#[cfg(test)]
use crate::modbus::{
    transport::fake::{Call, FakeTransport},
    EndianMode, FunctionCode, Poller, RawData,
};
#[cfg(test)]
use pretty_assertions::assert_eq;
#[cfg(test)]
use tokio::sync::broadcast;

#[cfg(test)]
fn devices() -> Vec<Device> {
    let mut a = Device::new("a", 1);
    a.pollers.push(Poller::new(FunctionCode::ReadHoldingRegisters, 0, 2, EndianMode::BigBig));
    a.pollers.push(Poller::new(FunctionCode::ReadCoils, 0, 8, EndianMode::BigBig));
    let mut b = Device::new("b", 2);
    b.pollers.push(Poller::new(FunctionCode::ReadInputRegisters, 5, 1, EndianMode::BigBig));
    vec![a, b]
}

#[cfg(test)]
fn immediate() -> CycleOptions {
    CycleOptions {
        interval: Duration::ZERO,
        autoremove: true,
    }
}

#[tokio::test]
async fn every_poller_is_read_once_per_cycle() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = devices();
    let mut transport = FakeTransport::default()
        .respond(Ok(RawData::Words(vec![1, 2])))
        .respond(Ok(RawData::Bits(vec![true; 8])))
        .respond(Ok(RawData::Words(vec![3])));

    let report = poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;

    assert_eq!(
        report,
        CycleReport {
            reads: 3,
            failures: 0,
            interrupted: false
        }
    );
    assert_eq!(
        transport.calls,
        vec![
            Call::Connect,
            Call::Read(1, FunctionCode::ReadHoldingRegisters, 0, 2),
            Call::Read(1, FunctionCode::ReadCoils, 0, 8),
            Call::Read(2, FunctionCode::ReadInputRegisters, 5, 1),
            Call::Close,
        ]
    );
}

#[tokio::test]
async fn failures_are_local_to_their_poller() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = devices();
    let mut transport = FakeTransport::default()
        .respond(Err(crate::modbus::TransportError::Timeout))
        .respond(Ok(RawData::Bits(vec![true; 8])))
        .respond(Ok(RawData::Words(vec![3])));

    let report = poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;

    assert_eq!((report.reads, report.failures), (3, 1));
    assert_eq!(devices[0].error_count, 1);
    assert_eq!(devices[1].error_count, 0);
    assert!(devices[1].last_poll_success);
}

#[tokio::test]
async fn three_failures_disable_a_poller_with_autoremove() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = vec![devices().remove(1)];
    // No scripted responses: every read fails.
    let mut transport = FakeTransport::default();

    for _ in 0..3 {
        poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;
    }
    assert!(devices[0].pollers[0].disabled);
    assert_eq!(transport.reads(), 3);

    for _ in 0..5 {
        let report = poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;
        assert_eq!(report.reads, 0);
    }
    assert_eq!(transport.reads(), 3);
}

#[tokio::test]
async fn failing_pollers_stay_enabled_without_autoremove() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = vec![devices().remove(1)];
    let mut transport = FakeTransport::default();
    let options = CycleOptions {
        interval: Duration::ZERO,
        autoremove: false,
    };

    for _ in 0..10 {
        poll_cycle(&mut devices, &mut transport, &mut shutdown, &options).await;
    }
    assert!(!devices[0].pollers[0].disabled);
    assert_eq!(devices[0].pollers[0].consecutive_failures, 10);
    assert_eq!(transport.reads(), 10);
}

#[tokio::test]
async fn a_success_resets_the_failure_streak() {
    let (_tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = vec![devices().remove(1)];
    let mut transport = FakeTransport::default()
        .respond(Err(crate::modbus::TransportError::Timeout))
        .respond(Err(crate::modbus::TransportError::Timeout))
        .respond(Ok(RawData::Words(vec![3])))
        .respond(Err(crate::modbus::TransportError::Timeout))
        .respond(Err(crate::modbus::TransportError::Timeout));

    for _ in 0..5 {
        poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;
    }
    assert!(!devices[0].pollers[0].disabled);
    assert_eq!(devices[0].pollers[0].consecutive_failures, 2);
}

#[tokio::test]
async fn shutdown_skips_remaining_pollers_and_still_closes() {
    let (tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let mut devices = devices();
    let mut transport = FakeTransport::default();
    tx.send(()).unwrap();

    let report = poll_cycle(&mut devices, &mut transport, &mut shutdown, &immediate()).await;

    assert!(report.interrupted);
    assert_eq!(report.reads, 0);
    assert_eq!(transport.calls, vec![Call::Connect, Call::Close]);
}

#[tokio::test(start_paused = true)]
async fn settle_pause_is_interruptible() {
    let (tx, rx) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(rx);
    let options = CycleOptions {
        interval: Duration::from_secs(3600),
        autoremove: false,
    };

    let cycle = tokio::spawn(async move {
        let mut devices = devices();
        let mut transport = FakeTransport::default().respond(Ok(RawData::Words(vec![1, 2])));
        let report = poll_cycle(&mut devices, &mut transport, &mut shutdown, &options).await;
        (report, transport.reads())
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    tx.send(()).unwrap();

    let (report, reads) = cycle.await.unwrap();
    assert!(report.interrupted);
    assert_eq!(reads, 1);
}
